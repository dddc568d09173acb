mod cache;
mod config;
mod db;
mod error;

pub use cache::Cache;
pub use config::{Config, DEFAULT_TTL};
pub use db::Db;
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
