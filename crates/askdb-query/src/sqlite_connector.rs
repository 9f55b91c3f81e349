//! SQLite connector.
//!
//! Opens the database file read-only and runs every statement on the blocking
//! pool. Result column types are inferred from the values returned, since
//! SQLite only carries declared types on table columns.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use askdb_core::types::{
    CellValue, ColumnInfo, ColumnSummary, ColumnType, DatabaseDescriptor, KeyRole,
    SchemaDescriptor, TableSchema, TabularResult,
};

use crate::connector::{ensure_read_only, DatabaseConnector};
use crate::error::ConnectorError;

pub struct SqliteConnector {
    conn: Arc<Mutex<Connection>>,
    label: String,
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector")
            .field("label", &self.label)
            .finish()
    }
}

impl SqliteConnector {
    /// Open an existing database file read-only.
    pub fn open(path: &Path) -> Result<Self, ConnectorError> {
        if !path.exists() {
            return Err(ConnectorError::Connection(format!(
                "database file not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ConnectorError::Connection(e.to_string()))?;

        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sqlite".to_string());
        info!(database = %label, "SQLite database opened read-only");
        Ok(Self::from_connection(conn, label))
    }

    /// Wrap an already open connection. Statements still pass the read-only check.
    pub fn from_connection(conn: Connection, label: impl Into<String>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            label: label.into(),
        }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, ConnectorError>
    where
        F: FnOnce(&Connection) -> Result<T, ConnectorError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| ConnectorError::Connection(format!("connection lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| ConnectorError::Query(format!("query task failed: {e}")))?
    }
}

impl DatabaseConnector for SqliteConnector {
    async fn execute_query(&self, sql: &str) -> Result<TabularResult, ConnectorError> {
        ensure_read_only(sql)?;
        let sql = sql.to_string();
        let result = self.blocking(move |conn| run_query(conn, &sql)).await?;
        debug!(rows = result.row_count(), "SQLite query finished");
        Ok(result)
    }

    async fn get_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        self.blocking(read_schema).await
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| ConnectorError::Connection(e.to_string()))
        })
        .await
    }

    fn descriptor(&self) -> DatabaseDescriptor {
        DatabaseDescriptor::new("sqlite", self.label.clone())
    }
}

// =============================================================================
// Queries
// =============================================================================

fn query_err(e: rusqlite::Error) -> ConnectorError {
    ConnectorError::Query(e.to_string())
}

fn run_query(conn: &Connection, sql: &str) -> Result<TabularResult, ConnectorError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let width = names.len();

    let mut rows = stmt.query([]).map_err(query_err)?;
    let mut out: Vec<Vec<CellValue>> = Vec::new();
    while let Some(row) = rows.next().map_err(query_err)? {
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(cell_value(row.get_ref(i).map_err(query_err)?));
        }
        out.push(cells);
    }

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| ColumnSummary::new(name, infer_type(out.iter().map(|r| &r[i]))))
        .collect();
    Ok(TabularResult::new(columns, out))
}

fn cell_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(v) => CellValue::Integer(v),
        ValueRef::Real(v) => CellValue::Float(v),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Text(format!("<{} bytes>", bytes.len())),
    }
}

/// Logical type of a result column from its non-null values.
fn infer_type<'a>(values: impl Iterator<Item = &'a CellValue>) -> ColumnType {
    let mut inferred = ColumnType::Unknown;
    for value in values {
        let this = match value {
            CellValue::Null => continue,
            CellValue::Integer(_) => ColumnType::Integer,
            CellValue::Float(_) => ColumnType::Float,
            CellValue::Bool(_) => ColumnType::Boolean,
            CellValue::Text(s) => text_type(s),
        };
        inferred = match (inferred, this) {
            (ColumnType::Unknown, t) => t,
            (a, b) if a == b => a,
            (ColumnType::Integer, ColumnType::Float) | (ColumnType::Float, ColumnType::Integer) => {
                ColumnType::Float
            }
            (ColumnType::Date, ColumnType::DateTime) | (ColumnType::DateTime, ColumnType::Date) => {
                ColumnType::DateTime
            }
            _ => return ColumnType::Text,
        };
    }
    inferred
}

fn text_type(s: &str) -> ColumnType {
    let s = s.trim();
    if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
        return ColumnType::Date;
    }
    let datetime = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];
    if datetime
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok())
    {
        return ColumnType::DateTime;
    }
    ColumnType::Text
}

// =============================================================================
// Schema
// =============================================================================

fn read_schema(conn: &Connection) -> Result<SchemaDescriptor, ConnectorError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(query_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        tables.push(read_table(conn, &name)?);
    }

    // Foreign keys that omit the parent column refer to its primary key.
    let primary_keys: Vec<(String, String)> = tables
        .iter()
        .filter_map(|t| {
            t.columns
                .iter()
                .find(|c| c.key_role == KeyRole::PrimaryKey)
                .map(|c| (t.name.clone(), c.name.clone()))
        })
        .collect();
    for table in &mut tables {
        for column in &mut table.columns {
            if let KeyRole::ForeignKey { table: parent, column: parent_col } = &mut column.key_role {
                if parent_col.is_empty() {
                    let parent = parent.as_str();
                    *parent_col = primary_keys
                        .iter()
                        .find(|(t, _)| t.eq_ignore_ascii_case(parent))
                        .map(|(_, c)| c.clone())
                        .unwrap_or_else(|| "rowid".to_string());
                }
            }
        }
    }

    debug!(tables = tables.len(), "SQLite schema read");
    Ok(SchemaDescriptor::new(tables))
}

fn read_table(conn: &Connection, name: &str) -> Result<TableSchema, ConnectorError> {
    let quoted = name.replace('"', "\"\"");

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{quoted}\")"))
        .map_err(query_err)?;
    let mut columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let declared: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
            let not_null: bool = row.get(3)?;
            let pk: i64 = row.get(5)?;
            Ok((name, declared, not_null, pk))
        })
        .map_err(query_err)?
        .map(|r| {
            r.map(|(name, declared, not_null, pk)| {
                let column = ColumnInfo::new(name, declared);
                let column = if not_null { column.not_null() } else { column };
                if pk > 0 {
                    column.primary_key()
                } else {
                    column
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;

    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_list(\"{quoted}\")"))
        .map_err(query_err)?;
    let keys = stmt
        .query_map([], |row| {
            let parent: String = row.get(2)?;
            let from: String = row.get(3)?;
            let to: Option<String> = row.get(4)?;
            Ok((parent, from, to.unwrap_or_default()))
        })
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;

    for (parent, from, to) in keys {
        if let Some(column) = columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&from)) {
            column.key_role = KeyRole::ForeignKey {
                table: parent,
                column: to,
            };
        }
    }

    Ok(TableSchema::new(name, columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_db() -> (TempDir, SqliteConnector) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, joined TEXT);
             CREATE TABLE orders (
                 id INTEGER PRIMARY KEY,
                 customer_id INTEGER REFERENCES customers,
                 total REAL
             );
             INSERT INTO customers VALUES (1, 'Ada', '2020-01-05'), (2, 'Grace', '2021-03-09');
             INSERT INTO orders VALUES (1, 1, 10.5), (2, 1, 4), (3, 2, NULL);",
        )
        .unwrap();
        drop(conn);
        let connector = SqliteConnector::open(&path).unwrap();
        (dir, connector)
    }

    #[tokio::test]
    async fn test_execute_infers_types() {
        let (_dir, db) = make_db();
        let result = db
            .execute_query("SELECT name, joined FROM customers ORDER BY id")
            .await
            .unwrap();
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.columns[0].column_type, ColumnType::Text);
        assert_eq!(result.columns[1].column_type, ColumnType::Date);
        assert_eq!(result.rows[0][0], CellValue::Text("Ada".into()));

        let totals = db.execute_query("SELECT total FROM orders").await.unwrap();
        assert_eq!(totals.columns[0].column_type, ColumnType::Float);
    }

    #[tokio::test]
    async fn test_rejects_writes() {
        let (_dir, db) = make_db();
        let err = db.execute_query("DELETE FROM customers").await.unwrap_err();
        assert!(matches!(err, ConnectorError::ReadOnlyViolation { .. }));
        let err = db
            .execute_query("SELECT 1; DROP TABLE customers")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ReadOnlyViolation { .. }));
    }

    #[tokio::test]
    async fn test_schema_with_foreign_keys() {
        let (_dir, db) = make_db();
        let schema = db.get_schema().await.unwrap();
        assert_eq!(schema.table_names().collect::<Vec<_>>(), vec!["customers", "orders"]);

        let customers = schema.table("customers").unwrap();
        assert_eq!(customers.column("id").unwrap().key_role, KeyRole::PrimaryKey);
        assert!(!customers.column("name").unwrap().nullable);

        let fk = schema.foreign_key_between("customers", "orders").unwrap();
        assert_eq!(fk.1, "customer_id");
        assert_eq!(fk.3, "id");
    }

    #[tokio::test]
    async fn test_connection_and_descriptor() {
        let (_dir, db) = make_db();
        assert!(db.test_connection().await.is_ok());
        let descriptor = DatabaseConnector::descriptor(&db);
        assert_eq!(descriptor.family, "sqlite");
        assert_eq!(descriptor.label, "shop.db");
    }

    #[tokio::test]
    async fn test_sql_errors_are_query_errors() {
        let (_dir, db) = make_db();
        let err = db.execute_query("SELECT nope FROM customers").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Query(_)));
    }

    #[test]
    fn test_open_missing_file() {
        let err = SqliteConnector::open(Path::new("/definitely/not/here.db")).unwrap_err();
        assert!(matches!(err, ConnectorError::Connection(_)));
    }

    #[test]
    fn test_infer_type_mixed() {
        let values = [CellValue::Integer(1), CellValue::Null, CellValue::Float(2.5)];
        assert_eq!(infer_type(values.iter()), ColumnType::Float);
        let values = [CellValue::Integer(1), CellValue::Text("x".into())];
        assert_eq!(infer_type(values.iter()), ColumnType::Text);
        assert_eq!(infer_type([CellValue::Null].iter()), ColumnType::Unknown);
    }
}
