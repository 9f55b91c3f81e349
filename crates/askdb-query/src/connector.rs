//! Database connector capability.
//!
//! A connector executes read-only SQL and reports the schema of the database
//! it is bound to. Every connector runs statements through
//! [`ensure_read_only`] itself, independently of the generator's gate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use askdb_core::safety::{GuardDecision, SqlGuard};
use askdb_core::types::{DatabaseDescriptor, SchemaDescriptor, TabularResult};

use crate::error::ConnectorError;

/// Read-only access to one database.
pub trait DatabaseConnector: Send + Sync {
    /// Run a single read-only statement.
    fn execute_query(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<TabularResult, ConnectorError>> + Send;

    /// Tables, columns and foreign keys.
    fn get_schema(&self) -> impl Future<Output = Result<SchemaDescriptor, ConnectorError>> + Send;

    fn test_connection(&self) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Family and label. Never includes connection strings or credentials.
    fn descriptor(&self) -> DatabaseDescriptor;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`DatabaseConnector`] for dynamic dispatch.
pub trait DynDatabaseConnector: Send + Sync {
    fn execute_query_boxed<'a>(
        &'a self,
        sql: &'a str,
    ) -> BoxFuture<'a, Result<TabularResult, ConnectorError>>;

    fn get_schema_boxed(&self) -> BoxFuture<'_, Result<SchemaDescriptor, ConnectorError>>;

    fn test_connection_boxed(&self) -> BoxFuture<'_, Result<(), ConnectorError>>;

    fn descriptor(&self) -> DatabaseDescriptor;
}

impl<T: DatabaseConnector> DynDatabaseConnector for T {
    fn execute_query_boxed<'a>(
        &'a self,
        sql: &'a str,
    ) -> BoxFuture<'a, Result<TabularResult, ConnectorError>> {
        Box::pin(self.execute_query(sql))
    }

    fn get_schema_boxed(&self) -> BoxFuture<'_, Result<SchemaDescriptor, ConnectorError>> {
        Box::pin(self.get_schema())
    }

    fn test_connection_boxed(&self) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(self.test_connection())
    }

    fn descriptor(&self) -> DatabaseDescriptor {
        DatabaseConnector::descriptor(self)
    }
}

/// Reject anything that is not a single read-only statement.
pub fn ensure_read_only(sql: &str) -> Result<(), ConnectorError> {
    match SqlGuard::new().check(sql) {
        GuardDecision::Allow => Ok(()),
        GuardDecision::Deny { keyword, fragment } => {
            Err(ConnectorError::ReadOnlyViolation { keyword, fragment })
        }
    }
}

// =============================================================================
// Mock
// =============================================================================

/// In-memory connector for tests: a fixed schema, canned results keyed by
/// SQL text, and a log of executed statements.
#[derive(Debug)]
pub struct MockConnector {
    descriptor: DatabaseDescriptor,
    schema: SchemaDescriptor,
    results: HashMap<String, TabularResult>,
    default_result: TabularResult,
    failure: Option<ConnectorError>,
    delay: Option<Duration>,
    schema_delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(schema: SchemaDescriptor) -> Self {
        Self {
            descriptor: DatabaseDescriptor::new("sqlite", "mock"),
            schema,
            results: HashMap::new(),
            default_result: TabularResult::default(),
            failure: None,
            delay: None,
            schema_delay: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_family(mut self, family: &str) -> Self {
        self.descriptor.family = family.to_string();
        self
    }

    /// Result returned when exactly `sql` is executed.
    pub fn with_result(mut self, sql: &str, result: TabularResult) -> Self {
        self.results.insert(sql.to_string(), result);
        self
    }

    /// Result returned for any statement without a canned result.
    pub fn with_default_result(mut self, result: TabularResult) -> Self {
        self.default_result = result;
        self
    }

    /// Fail every execution with `error`.
    pub fn with_failure(mut self, error: ConnectorError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep for `delay` before returning the schema.
    pub fn with_schema_delay(mut self, delay: Duration) -> Self {
        self.schema_delay = Some(delay);
        self
    }

    /// Statements that passed the read-only check, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl DatabaseConnector for MockConnector {
    async fn execute_query(&self, sql: &str) -> Result<TabularResult, ConnectorError> {
        ensure_read_only(sql)?;
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self
            .results
            .get(sql)
            .cloned()
            .unwrap_or_else(|| self.default_result.clone()))
    }

    async fn get_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        if let Some(delay) = self.schema_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.schema.clone())
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        match &self.failure {
            Some(ConnectorError::Connection(msg)) => Err(ConnectorError::Connection(msg.clone())),
            _ => Ok(()),
        }
    }

    fn descriptor(&self) -> DatabaseDescriptor {
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use askdb_core::types::{CellValue, ColumnSummary, ColumnType};

    fn make_result() -> TabularResult {
        TabularResult::new(
            vec![ColumnSummary::new("n", ColumnType::Integer)],
            vec![vec![CellValue::Integer(1)]],
        )
    }

    #[test]
    fn test_ensure_read_only() {
        assert!(ensure_read_only("SELECT * FROM sales").is_ok());
        let err = ensure_read_only("DELETE FROM sales").unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::ReadOnlyViolation { ref keyword, .. } if keyword == "delete"
        ));
    }

    #[tokio::test]
    async fn test_mock_returns_canned_result() {
        let mock = MockConnector::new(SchemaDescriptor::default())
            .with_result("SELECT 1", make_result());
        let result = mock.execute_query("SELECT 1").await.unwrap();
        assert_eq!(result.row_count(), 1);
        let other = mock.execute_query("SELECT 2").await.unwrap();
        assert_eq!(other.row_count(), 0);
        assert_eq!(mock.executed(), vec!["SELECT 1", "SELECT 2"]);
    }

    #[tokio::test]
    async fn test_mock_rejects_writes_before_recording() {
        let mock = MockConnector::new(SchemaDescriptor::default());
        assert!(mock.execute_query("DROP TABLE sales").await.is_err());
        assert!(mock.executed().is_empty());
    }

    #[tokio::test]
    async fn test_dyn_dispatch() {
        let conn: Arc<dyn DynDatabaseConnector> = Arc::new(
            MockConnector::new(SchemaDescriptor::default()).with_family("postgresql"),
        );
        assert_eq!(conn.descriptor().family, "postgresql");
        assert!(conn.test_connection_boxed().await.is_ok());
        assert!(conn.get_schema_boxed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let mock = MockConnector::new(SchemaDescriptor::default())
            .with_failure(ConnectorError::Query("no such column: x".into()));
        let err = mock.execute_query("SELECT x FROM t").await.unwrap_err();
        assert!(err.to_string().contains("no such column"));
    }
}
