//! Error types for the query pipeline.

use askdb_core::error::AskError;
use askdb_core::types::FailureKind;

/// Errors that abort a turn.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("utterance cannot be empty")]
    EmptyUtterance,
    #[error("utterance exceeds maximum length of {0} characters")]
    UtteranceTooLong(usize),
    #[error("unknown table or column: {term}")]
    SchemaMismatch { term: String },
    #[error("tables {left} and {right} are not related by a foreign key")]
    UnrelatedTables { left: String, right: String },
    #[error("could not tell which table the question is about")]
    NoSubject,
    #[error("only read-only queries are allowed: {fragment}")]
    SecurityViolation { fragment: String },
    #[error("query failed: {0}")]
    Execution(String),
    #[error("query timed out after {0} seconds")]
    Timeout(u64),
    #[error("language model error: {0}")]
    Model(#[from] ModelError),
    #[error("storage error: {0}")]
    Storage(#[from] AskError),
    /// A turn failed and its failure record could not be written either.
    #[error("{error} (failed turn not recorded: {reason})")]
    Unrecorded {
        error: Box<QueryError>,
        reason: String,
    },
}

impl QueryError {
    /// Failure kind recorded on the turn.
    pub fn kind(&self) -> FailureKind {
        match self {
            QueryError::EmptyUtterance | QueryError::UtteranceTooLong(_) => {
                FailureKind::InvalidInput
            }
            QueryError::SchemaMismatch { .. }
            | QueryError::UnrelatedTables { .. }
            | QueryError::NoSubject => FailureKind::SchemaMismatch,
            QueryError::SecurityViolation { .. } => FailureKind::SecurityViolation,
            QueryError::Execution(_) | QueryError::Storage(_) => FailureKind::Execution,
            QueryError::Timeout(_) => FailureKind::Timeout,
            QueryError::Model(_) => FailureKind::Model,
            QueryError::Unrecorded { error, .. } => error.kind(),
        }
    }

    /// False when the failed turn is missing from the session history.
    pub fn persisted(&self) -> bool {
        !matches!(self, QueryError::Unrecorded { .. })
    }

    /// The error that stopped the turn, without the recording failure.
    pub fn cause(&self) -> &QueryError {
        match self {
            QueryError::Unrecorded { error, .. } => error.cause(),
            other => other,
        }
    }

    /// Short explanation suitable for showing to the person asking.
    pub fn user_message(&self) -> String {
        match self {
            QueryError::SchemaMismatch { term } => format!(
                "I couldn't find anything called '{term}' in this database. \
                 Try asking which tables are available."
            ),
            QueryError::UnrelatedTables { left, right } => {
                format!("I don't know how '{left}' and '{right}' are connected.")
            }
            QueryError::NoSubject => {
                "I couldn't work out which table you mean. Try naming it.".to_string()
            }
            QueryError::SecurityViolation { .. } => {
                "I can only run read-only queries; that request would change data.".to_string()
            }
            QueryError::Timeout(secs) => {
                format!("The query took longer than {secs} seconds. Try narrowing it down.")
            }
            QueryError::Execution(msg) => format!("The database reported an error: {msg}"),
            QueryError::Model(_) => {
                "The language model is unavailable right now. Try rephrasing.".to_string()
            }
            QueryError::Storage(_) => "Session history could not be read.".to_string(),
            QueryError::EmptyUtterance | QueryError::UtteranceTooLong(_) => self.to_string(),
            QueryError::Unrecorded { error, .. } => format!(
                "{} This question could not be saved to the session history.",
                error.user_message()
            ),
        }
    }
}

/// Errors from a database connector.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    #[error("statement rejected, '{keyword}' is not allowed")]
    ReadOnlyViolation { keyword: String, fragment: String },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {0}")]
    Query(String),
}

/// Errors from a language model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Worth retrying once.
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model timed out after {0} seconds")]
    Timeout(u64),
    #[error("model confidence {confidence:.2} below {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::SchemaMismatch {
            term: "foobar".into(),
        };
        assert_eq!(err.to_string(), "unknown table or column: foobar");

        let err = QueryError::UtteranceTooLong(1000);
        assert_eq!(
            err.to_string(),
            "utterance exceeds maximum length of 1000 characters"
        );

        let err = QueryError::SecurityViolation {
            fragment: "delete".into(),
        };
        assert!(err.to_string().contains("delete"));
    }

    #[test]
    fn test_failure_kinds() {
        assert_eq!(QueryError::EmptyUtterance.kind(), FailureKind::InvalidInput);
        assert_eq!(QueryError::NoSubject.kind(), FailureKind::SchemaMismatch);
        assert_eq!(QueryError::Timeout(5).kind(), FailureKind::Timeout);
        assert_eq!(
            QueryError::Model(ModelError::Unavailable("x".into())).kind(),
            FailureKind::Model
        );
        assert_eq!(
            QueryError::Execution("no such column".into()).kind(),
            FailureKind::Execution
        );
    }

    #[test]
    fn test_from_ask_error() {
        let err: QueryError = AskError::Storage("disk full".into()).into();
        assert!(matches!(err, QueryError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_user_message_names_term() {
        let err = QueryError::SchemaMismatch {
            term: "foobar".into(),
        };
        assert!(err.user_message().contains("'foobar'"));
    }

    #[test]
    fn test_unrecorded_keeps_stage_error() {
        let err = QueryError::Unrecorded {
            error: Box::new(QueryError::Timeout(30)),
            reason: "disk full".into(),
        };
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(!err.persisted());
        assert!(matches!(err.cause(), QueryError::Timeout(30)));
        assert!(err.to_string().contains("disk full"));
        assert!(err.user_message().contains("could not be saved"));
        assert!(QueryError::NoSubject.persisted());
    }

    #[test]
    fn test_model_error_transient() {
        assert!(ModelError::Transient("503".into()).is_transient());
        assert!(!ModelError::Timeout(3).is_transient());
    }
}
