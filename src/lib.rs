pub mod app;
pub mod bulk;
pub mod catalog;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod http;
pub mod loader;
pub mod output;
pub mod planner;
pub mod pool;
pub mod wfs;
