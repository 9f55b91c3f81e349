pub mod config;
pub mod error;
pub mod query;
pub mod safety;
pub mod types;

pub use config::AskConfig;
pub use error::{AskError, Result};
pub use query::*;
pub use safety::{GuardDecision, SqlGuard};
pub use types::*;
