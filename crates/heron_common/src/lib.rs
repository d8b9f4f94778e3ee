pub mod config;
pub mod datum;
pub mod error;
pub mod logging;
pub mod schema;
pub mod shutdown;
pub mod table_name;
pub mod types;
