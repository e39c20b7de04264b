use std::io::{self, Write};

use serde::Serialize;

use crate::app::{DumpResult, InfoResult, ListResult};
use crate::bulk::LoadReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for name in &result.datasets {
            writeln!(stdout, "{name}")?;
        }
        Ok(())
    }

    pub fn print_info(result: &InfoResult, indent: Option<usize>) -> io::Result<()> {
        Self::print_json(result, indent)
    }

    pub fn print_dump(result: &DumpResult) -> io::Result<()> {
        Self::print_json(result, Some(2))
    }

    pub fn print_load(result: &LoadReport) -> io::Result<()> {
        Self::print_json(result, Some(2))
    }

    fn print_json<T: Serialize>(value: &T, indent: Option<usize>) -> io::Result<()> {
        let json = to_json(value, indent).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub fn to_json<T: Serialize>(value: &T, indent: Option<usize>) -> serde_json::Result<String> {
    let Some(indent) = indent else {
        return serde_json::to_string(value);
    };
    let indent = " ".repeat(indent);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
