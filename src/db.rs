use indoc::indoc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::domain::{TableRef, quote_ident};
use crate::error::BcdataError;

/// PostgreSQL's identifier length limit in bytes.
pub const MAX_IDENT_LEN: usize = 63;

pub trait Database {
    fn schema_exists(&self, schema: &str) -> Result<bool, BcdataError>;
    fn create_schema(&self, schema: &str) -> Result<(), BcdataError>;
    fn table_exists(&self, table: &TableRef) -> Result<bool, BcdataError>;
    fn create_table_like(&self, template: &TableRef, table: &TableRef) -> Result<(), BcdataError>;
    fn append(
        &self,
        source: &TableRef,
        destination: &TableRef,
        skip_column: Option<&str>,
    ) -> Result<u64, BcdataError>;
    fn drop_table(&self, table: &TableRef) -> Result<(), BcdataError>;
    fn set_logged(&self, table: &TableRef) -> Result<(), BcdataError>;
    fn create_spatial_index(&self, table: &TableRef, column: &str) -> Result<(), BcdataError>;
    fn regenerate_primary_key(&self, table: &TableRef, column: &str) -> Result<(), BcdataError>;
    fn row_count(&self, table: &TableRef) -> Result<u64, BcdataError>;
}

pub struct PgDatabase {
    runtime: Runtime,
    pool: PgPool,
}

impl PgDatabase {
    pub fn connect(database_url: &str) -> Result<Self, BcdataError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| BcdataError::database("runtime", err))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(1)
                    .connect(database_url),
            )
            .map_err(|err| BcdataError::database("connect", err))?;
        Ok(Self { runtime, pool })
    }

    fn execute(&self, context: &str, sql: &str) -> Result<u64, BcdataError> {
        debug!(sql, "executing");
        self.runtime
            .block_on(sqlx::raw_sql(sql).execute(&self.pool))
            .map(|result| result.rows_affected())
            .map_err(|err| BcdataError::database(context, err))
    }

    fn columns(&self, table: &TableRef) -> Result<Vec<String>, BcdataError> {
        let query = indoc! {"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
        "};
        self.runtime
            .block_on(
                sqlx::query_scalar::<_, String>(query)
                    .bind(&table.schema)
                    .bind(&table.table)
                    .fetch_all(&self.pool),
            )
            .map_err(|err| BcdataError::database(format!("columns of {table}"), err))
    }
}

impl Database for PgDatabase {
    fn schema_exists(&self, schema: &str) -> Result<bool, BcdataError> {
        let query = indoc! {"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.schemata WHERE schema_name = $1
            )
        "};
        self.runtime
            .block_on(
                sqlx::query_scalar::<_, bool>(query)
                    .bind(schema)
                    .fetch_one(&self.pool),
            )
            .map_err(|err| BcdataError::database(format!("schema {schema}"), err))
    }

    fn create_schema(&self, schema: &str) -> Result<(), BcdataError> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
        self.execute(&format!("create schema {schema}"), &sql)
            .map(|_| ())
    }

    fn table_exists(&self, table: &TableRef) -> Result<bool, BcdataError> {
        let query = indoc! {"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
        "};
        self.runtime
            .block_on(
                sqlx::query_scalar::<_, bool>(query)
                    .bind(&table.schema)
                    .bind(&table.table)
                    .fetch_one(&self.pool),
            )
            .map_err(|err| BcdataError::database(format!("table {table}"), err))
    }

    fn create_table_like(&self, template: &TableRef, table: &TableRef) -> Result<(), BcdataError> {
        let sql = format!(
            "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING ALL)",
            table.quoted(),
            template.quoted()
        );
        self.execute(&format!("create {table}"), &sql).map(|_| ())
    }

    fn append(
        &self,
        source: &TableRef,
        destination: &TableRef,
        skip_column: Option<&str>,
    ) -> Result<u64, BcdataError> {
        let columns = self
            .columns(destination)?
            .into_iter()
            .filter(|column| Some(column.as_str()) != skip_column)
            .map(|column| quote_ident(&column))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) SELECT {columns} FROM {}",
            destination.quoted(),
            source.quoted()
        );
        self.execute(&format!("merge {source} into {destination}"), &sql)
    }

    fn drop_table(&self, table: &TableRef) -> Result<(), BcdataError> {
        let sql = format!("DROP TABLE IF EXISTS {}", table.quoted());
        self.execute(&format!("drop {table}"), &sql).map(|_| ())
    }

    fn set_logged(&self, table: &TableRef) -> Result<(), BcdataError> {
        let sql = format!("ALTER TABLE {} SET LOGGED", table.quoted());
        self.execute(&format!("set logged {table}"), &sql)
            .map(|_| ())
    }

    fn create_spatial_index(&self, table: &TableRef, column: &str) -> Result<(), BcdataError> {
        let name = truncate_ident(&format!("{}_{}_geom_idx", table.table, column), "");
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIST ({})",
            quote_ident(&name),
            table.quoted(),
            quote_ident(column)
        );
        self.execute(&format!("index {table}"), &sql).map(|_| ())
    }

    fn regenerate_primary_key(&self, table: &TableRef, column: &str) -> Result<(), BcdataError> {
        let sql = format!(
            "ALTER TABLE {table} DROP COLUMN IF EXISTS {column}; \
             ALTER TABLE {table} ADD COLUMN {column} SERIAL PRIMARY KEY",
            table = table.quoted(),
            column = quote_ident(column)
        );
        self.execute(&format!("primary key of {table}"), &sql)
            .map(|_| ())
    }

    fn row_count(&self, table: &TableRef) -> Result<u64, BcdataError> {
        let sql = format!("SELECT count(*) FROM {}", table.quoted());
        let count = self
            .runtime
            .block_on(sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.pool))
            .map_err(|err| BcdataError::database(format!("count {table}"), err))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

pub fn truncate_ident(base: &str, suffix: &str) -> String {
    let mut limit = MAX_IDENT_LEN.saturating_sub(suffix.len()).min(base.len());
    while !base.is_char_boundary(limit) {
        limit -= 1;
    }
    format!("{}{suffix}", &base[..limit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_suffix() {
        let base = "a".repeat(70);
        let name = truncate_ident(&base, "_0001");
        assert_eq!(name.len(), MAX_IDENT_LEN);
        assert!(name.ends_with("a_0001"));
    }

    #[test]
    fn short_names_untouched() {
        assert_eq!(truncate_ident("airports", "_0002"), "airports_0002");
    }
}
