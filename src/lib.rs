pub mod bulk;
pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use error::{Result, StewardError};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
