//! Conversational query pipeline for askdb.
//!
//! Turns natural-language questions into read-only SQL against one database,
//! using earlier turns of the conversation to resolve follow-ups such as
//! "what about 2020?". Deterministic rules run first; a language model is an
//! optional fallback behind [`model::ModelGateway`].

pub mod chart;
pub mod classifier;
pub mod connector;
pub mod context;
pub mod dialect;
pub mod error;
mod extract;
pub mod generator;
pub mod model;
pub mod processor;
pub mod resolver;
pub mod sqlite_connector;
pub mod text;

pub use chart::{chart_hint, ChartPayload};
pub use classifier::{Classification, QueryClassifier};
pub use connector::{DatabaseConnector, DynDatabaseConnector, MockConnector};
pub use context::{ContextManager, ContextWindow};
pub use dialect::{DatabaseFamily, Dialect};
pub use error::{ConnectorError, ModelError, QueryError};
pub use generator::{GeneratedQuery, SqlGenerator, SqlSource};
pub use model::{Completion, DynLanguageModel, LanguageModel, MockLanguageModel, ModelGateway};
pub use processor::{ContextAwareQueryProcessor, QueryOutcome};
pub use resolver::{ReferenceResolver, Resolution};
pub use sqlite_connector::SqliteConnector;
