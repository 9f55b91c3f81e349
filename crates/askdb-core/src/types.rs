use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::ResolvedQuerySpec;

// =============================================================================
// Enums
// =============================================================================

/// Category a resolved utterance falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    /// Asks for rows or aggregates from the data.
    Data,
    /// Asks about the shape of the database (tables, columns).
    Schema,
    /// Anything else: greetings, help, questions about the assistant.
    General,
    /// Refines the structure of an earlier data turn.
    FollowUp,
}

impl QueryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Data => "data",
            QueryClass::Schema => "schema",
            QueryClass::General => "general",
            QueryClass::FollowUp => "followup",
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(QueryClass::Data),
            "schema" => Ok(QueryClass::Schema),
            "general" => Ok(QueryClass::General),
            "followup" | "follow_up" => Ok(QueryClass::FollowUp),
            other => Err(format!("unknown query class: {other}")),
        }
    }
}

/// Logical type of a column, normalized across database families.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    DateTime,
    #[default]
    Unknown,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::DateTime)
    }

    /// Map a declared SQL type (`VARCHAR(40)`, `NUMERIC`, `timestamp`) onto a
    /// logical type. Follows SQLite affinity rules for anything unrecognized.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return ColumnType::Unknown;
        }
        if upper.starts_with("BOOL") {
            return ColumnType::Boolean;
        }
        if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
            return ColumnType::DateTime;
        }
        if upper == "DATE" || upper.starts_with("DATE ") {
            return ColumnType::Date;
        }
        if upper.contains("INT") {
            return ColumnType::Integer;
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            return ColumnType::Text;
        }
        if upper.contains("REAL")
            || upper.contains("FLOA")
            || upper.contains("DOUB")
            || upper.contains("NUMERIC")
            || upper.contains("DECIMAL")
        {
            return ColumnType::Float;
        }
        ColumnType::Unknown
    }
}

/// Visualization suggested for a result set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartHint {
    Bar,
    Line,
    Histogram,
    #[default]
    Table,
}

impl ChartHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartHint::Bar => "bar",
            ChartHint::Line => "line",
            ChartHint::Histogram => "histogram",
            ChartHint::Table => "table",
        }
    }
}

impl fmt::Display for ChartHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a turn failed. Failed turns are kept in history but never used as context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    SchemaMismatch,
    SecurityViolation,
    Execution,
    Timeout,
    Model,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::SchemaMismatch => "schema_mismatch",
            FailureKind::SecurityViolation => "security_violation",
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Model => "model",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Newtype Wrappers - Identity
// =============================================================================

/// Unique identifier for a conversation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

/// Unique identifier for a single turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Key role a column plays in its table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum KeyRole {
    #[default]
    None,
    PrimaryKey,
    ForeignKey { table: String, column: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub key_role: KeyRole,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let declared_type = declared_type.into();
        Self {
            name: name.into(),
            column_type: ColumnType::from_declared(&declared_type),
            declared_type,
            nullable: true,
            key_role: KeyRole::None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.key_role = KeyRole::PrimaryKey;
        self.nullable = false;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.key_role = KeyRole::ForeignKey {
            table: table.into(),
            column: column.into(),
        };
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Tables and their ordered columns, as reported by a connector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableSchema>,
}

impl SchemaDescriptor {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive table lookup.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.column(column).is_some())
            .unwrap_or(false)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Every table and column name, lowercased. Used for relevance scoring.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        for table in &self.tables {
            out.push(table.name.to_lowercase());
            for column in &table.columns {
                out.push(column.name.to_lowercase());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Foreign key linking `a` and `b` in either direction, as
    /// `(from_table, from_column, to_table, to_column)`.
    pub fn foreign_key_between(&self, a: &str, b: &str) -> Option<(String, String, String, String)> {
        for (from, to) in [(a, b), (b, a)] {
            let Some(table) = self.table(from) else {
                continue;
            };
            for column in &table.columns {
                if let KeyRole::ForeignKey {
                    table: ref_table,
                    column: ref_column,
                } = &column.key_role
                {
                    if ref_table.eq_ignore_ascii_case(to) {
                        return Some((
                            table.name.clone(),
                            column.name.clone(),
                            ref_table.clone(),
                            ref_column.clone(),
                        ));
                    }
                }
            }
        }
        None
    }
}

/// Identity of the database a session is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    /// Dialect family name: "sqlite", "postgresql", "mysql" or anything else.
    pub family: String,
    /// Human-readable label, never a connection string.
    pub label: String,
}

impl DatabaseDescriptor {
    pub fn new(family: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            label: label.into(),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// A single cell in a tabular result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl CellValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Bool(v) => write!(f, "{v}"),
            CellValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSummary {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Rows returned by a connector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<ColumnSummary>,
    pub rows: Vec<Vec<CellValue>>,
}

impl TabularResult {
    pub fn new(columns: Vec<ColumnSummary>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            row_count: self.rows.len(),
            columns: self.columns.clone(),
        }
    }
}

/// What a turn remembers about its result: shape only, never the rows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: usize,
    pub columns: Vec<ColumnSummary>,
}

// =============================================================================
// Conversation Entities
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TurnFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One utterance and everything derived from it. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub raw_utterance: String,
    pub resolved_utterance: String,
    pub classification: QueryClass,
    pub generated_sql: Option<String>,
    pub query_spec: Option<ResolvedQuerySpec>,
    pub result_summary: Option<ResultSummary>,
    pub chart_hint: Option<ChartHint>,
    pub failure: Option<TurnFailure>,
}

impl Turn {
    /// Start a turn for `raw_utterance`; the pipeline fills in the rest.
    pub fn new(session_id: SessionId, raw_utterance: impl Into<String>) -> Self {
        let raw_utterance = raw_utterance.into();
        Self {
            turn_id: TurnId::new(),
            session_id,
            timestamp: Utc::now(),
            resolved_utterance: raw_utterance.clone(),
            raw_utterance,
            classification: QueryClass::General,
            generated_sql: None,
            query_spec: None,
            result_summary: None,
            chart_hint: None,
            failure: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// A conversation bound to one database. Mutated only by appending turns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub turns: Vec<Turn>,
    pub database: DatabaseDescriptor,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId, database: DatabaseDescriptor) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            turns: Vec::new(),
            database,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn successful_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| !t.is_failed())
    }
}

/// Listing entry for a stored session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub database: DatabaseDescriptor,
    pub turn_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            TableSchema::new(
                "customers",
                vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("name", "TEXT"),
                ],
            ),
            TableSchema::new(
                "orders",
                vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("customer_id", "INTEGER").references("customers", "id"),
                    ColumnInfo::new("total", "REAL"),
                ],
            ),
        ])
    }

    #[test]
    fn test_query_class_serialization() {
        let json = serde_json::to_string(&QueryClass::FollowUp).unwrap();
        assert_eq!(json, "\"follow_up\"");
        let back: QueryClass = serde_json::from_str(&json).unwrap();
        assert_eq!(back, QueryClass::FollowUp);
    }

    #[test]
    fn test_query_class_display_and_parse() {
        assert_eq!(QueryClass::FollowUp.to_string(), "followup");
        assert_eq!("schema".parse::<QueryClass>().unwrap(), QueryClass::Schema);
        assert!("bogus".parse::<QueryClass>().is_err());
    }

    #[test]
    fn test_column_type_from_declared() {
        assert_eq!(ColumnType::from_declared("INTEGER"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("bigint"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("VARCHAR(40)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("NUMERIC(10,2)"), ColumnType::Float);
        assert_eq!(ColumnType::from_declared("DATE"), ColumnType::Date);
        assert_eq!(ColumnType::from_declared("timestamp"), ColumnType::DateTime);
        assert_eq!(ColumnType::from_declared("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Unknown);
    }

    #[test]
    fn test_schema_lookup_is_case_insensitive() {
        let schema = make_schema();
        assert!(schema.table("Customers").is_some());
        assert!(schema.has_column("ORDERS", "Total"));
        assert!(!schema.has_column("orders", "missing"));
    }

    #[test]
    fn test_foreign_key_between_either_direction() {
        let schema = make_schema();
        let fk = schema.foreign_key_between("customers", "orders").unwrap();
        assert_eq!(
            fk,
            (
                "orders".to_string(),
                "customer_id".to_string(),
                "customers".to_string(),
                "id".to_string()
            )
        );
        assert!(schema.foreign_key_between("customers", "customers").is_none());
    }

    #[test]
    fn test_schema_identifiers_are_lowercase_and_unique() {
        let ids = make_schema().identifiers();
        assert!(ids.contains(&"customer_id".to_string()));
        assert_eq!(ids.iter().filter(|i| *i == "id").count(), 1);
    }

    #[test]
    fn test_cell_value_untagged_json() {
        let row = vec![
            CellValue::Null,
            CellValue::Integer(3),
            CellValue::Float(1.5),
            CellValue::Text("x".into()),
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, "[null,3,1.5,\"x\"]");
    }

    #[test]
    fn test_turn_defaults() {
        let session = SessionId::new();
        let turn = Turn::new(session, "show sales");
        assert_eq!(turn.resolved_utterance, "show sales");
        assert!(!turn.is_failed());
        assert!(turn.generated_sql.is_none());
    }

    #[test]
    fn test_session_successful_turns_skip_failures() {
        let mut session = Session::new(SessionId::new(), DatabaseDescriptor::new("sqlite", "t"));
        let ok = Turn::new(session.session_id, "a");
        let mut bad = Turn::new(session.session_id, "b");
        bad.failure = Some(TurnFailure::new(FailureKind::Execution, "boom"));
        session.turns.push(ok);
        session.turns.push(bad);
        assert_eq!(session.successful_turns().count(), 1);
        assert_eq!(session.last_turn().unwrap().raw_utterance, "b");
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_tabular_result_summary() {
        let result = TabularResult::new(
            vec![ColumnSummary::new("n", ColumnType::Integer)],
            vec![vec![CellValue::Integer(1)], vec![CellValue::Integer(2)]],
        );
        let summary = result.summary();
        assert_eq!(summary.row_count, 2);
        assert_eq!(summary.columns[0].name, "n");
    }
}
