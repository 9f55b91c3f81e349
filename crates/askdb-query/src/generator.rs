//! SQL generation.
//!
//! Rules run first: the utterance is mapped onto a [`ResolvedQuerySpec`]
//! (fresh, or as a delta on the nearest prior data turn), the spec is checked
//! against the schema and rendered in the session's dialect. A language model
//! is consulted only when the rules find no subject at all. Whatever produced
//! the SQL, it passes the read-only gate before it is returned.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use askdb_core::config::GeneratorConfig;
use askdb_core::query::{
    AggregateFn, ChartRequest, ColumnRef, CompareOp, Expr, Join, OrderBy, Predicate, QueryKind,
    ResolvedQuerySpec,
};
use askdb_core::safety::{mutating_verb, GuardDecision, SqlGuard};
use askdb_core::types::{KeyRole, QueryClass, SchemaDescriptor};

use crate::classifier::Classification;
use crate::context::ContextWindow;
use crate::dialect::Dialect;
use crate::error::QueryError;
use crate::extract::{Extraction, Extractor};
use crate::model::{extract_sql, ModelGateway};
use crate::text::{is_stop_word, tokenize, IdentifierMatcher};

/// Where the SQL text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    Rules,
    Model,
}

/// A statement ready to run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedQuery {
    /// Structured form; `None` when a model wrote the SQL.
    pub spec: Option<ResolvedQuerySpec>,
    pub sql: String,
    pub source: SqlSource,
    /// A follow-up named a new table and was treated as a fresh question.
    pub demoted: bool,
    pub warnings: Vec<String>,
}

/// Words that ask about structure rather than name a table.
const SCHEMA_WORDS: &[&str] = &[
    "table", "tables", "column", "columns", "schema", "schemas", "structure", "describe",
    "field", "fields", "list", "show", "database", "available", "there", "what", "which",
];

static TABLE_REFS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:from|join)\s+("[^"]+"|`[^`]+`|[A-Za-z_][\w.]*)"#)
        .expect("Invalid table reference regex")
});

#[derive(Debug, Clone)]
pub struct SqlGenerator {
    dialect: Dialect,
    matcher: IdentifierMatcher,
    config: GeneratorConfig,
    guard: SqlGuard,
}

impl SqlGenerator {
    pub fn new(dialect: Dialect, config: GeneratorConfig) -> Self {
        Self {
            matcher: IdentifierMatcher::new(config.similarity_threshold),
            dialect,
            config,
            guard: SqlGuard::new(),
        }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Generate SQL, falling back to `model` when the rules find no subject.
    pub async fn generate(
        &self,
        utterance: &str,
        classification: &Classification,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
        model: Option<&ModelGateway>,
    ) -> Result<GeneratedQuery, QueryError> {
        match self.generate_rules(utterance, classification, window, schema) {
            Err(QueryError::NoSubject) => match model {
                Some(model) if classification.class != QueryClass::Schema => {
                    info!("No subject found by rules, asking the language model");
                    self.generate_with_model(utterance, window, schema, model).await
                }
                _ => Err(QueryError::NoSubject),
            },
            other => other,
        }
    }

    /// Deterministic generation only.
    pub fn generate_rules(
        &self,
        utterance: &str,
        classification: &Classification,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
    ) -> Result<GeneratedQuery, QueryError> {
        if let Some(verb) = mutating_verb(utterance) {
            warn!(verb = %verb, "Mutating verb in utterance");
            return Err(QueryError::SecurityViolation { fragment: verb });
        }

        let mut warnings = Vec::new();
        if let Some(warning) = self.dialect.compatibility_warning() {
            warnings.push(warning.to_string());
        }

        let mut demoted = false;
        let spec = match classification.class {
            QueryClass::Schema => self.schema_spec(utterance, schema),
            QueryClass::FollowUp => {
                match self.followup_spec(utterance, window, schema, &mut warnings)? {
                    Some(spec) => spec,
                    None => {
                        demoted = window.nearest_rows_spec().is_some();
                        self.fresh_spec(utterance, schema, &mut warnings)?
                    }
                }
            }
            QueryClass::Data => self.fresh_spec(utterance, schema, &mut warnings)?,
            QueryClass::General => return Err(QueryError::NoSubject),
        };

        if spec.is_rows() {
            validate_identifiers(&spec, schema)?;
        }
        let sql = self.render(&spec);
        self.gate(&sql)?;

        debug!(sql = %sql, demoted, "Generated SQL from rules");
        Ok(GeneratedQuery {
            spec: Some(spec),
            sql,
            source: SqlSource::Rules,
            demoted,
            warnings,
        })
    }

    /// Reject anything but a single read-only statement.
    pub fn gate(&self, sql: &str) -> Result<(), QueryError> {
        match self.guard.check(sql) {
            GuardDecision::Allow => Ok(()),
            GuardDecision::Deny { keyword, fragment } => {
                warn!(keyword = %keyword, "Generated SQL rejected by read-only gate");
                Err(QueryError::SecurityViolation { fragment })
            }
        }
    }

    // ---- Schema questions ----

    fn schema_spec(&self, utterance: &str, schema: &SchemaDescriptor) -> ResolvedQuerySpec {
        let table = tokenize(utterance)
            .into_iter()
            .filter(|w| !is_stop_word(w) && !SCHEMA_WORDS.contains(&w.as_str()))
            .find_map(|w| self.matcher.match_table(&w, schema).map(str::to_string));
        match table {
            Some(table) => ResolvedQuerySpec::describe_table(table),
            None => ResolvedQuerySpec::list_tables(),
        }
    }

    // ---- Fresh synthesis ----

    fn fresh_spec(
        &self,
        utterance: &str,
        schema: &SchemaDescriptor,
        warnings: &mut Vec<String>,
    ) -> Result<ResolvedQuerySpec, QueryError> {
        let extraction = Extractor::new(schema, &self.matcher).extract(utterance, &[])?;
        self.assemble(Parts::from_extraction(extraction), schema, warnings)
    }

    // ---- Follow-ups ----

    /// `Ok(None)` when there is no base or the delta names a table the base
    /// does not use; the caller falls back to fresh synthesis.
    fn followup_spec(
        &self,
        utterance: &str,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
        warnings: &mut Vec<String>,
    ) -> Result<Option<ResolvedQuerySpec>, QueryError> {
        let Some((turn, base)) = window.nearest_rows_spec() else {
            return Ok(None);
        };

        let delta = Extractor::new(schema, &self.matcher).extract(utterance, &base.tables)?;
        if let Some(table) = delta.tables.iter().find(|t| !base.has_table(t)) {
            info!(table = %table, "Follow-up names a new table, treating as a fresh question");
            warnings.push(format!(
                "'{table}' was not part of the previous query, so this was answered as a new question."
            ));
            return Ok(None);
        }

        debug!(base_turn = %turn.turn_id, "Applying follow-up delta");
        let mut parts = Parts::from_spec(base);
        parts.apply_delta(delta);
        self.assemble(parts, schema, warnings).map(Some)
    }

    // ---- Assembly ----

    fn assemble(
        &self,
        mut parts: Parts,
        schema: &SchemaDescriptor,
        warnings: &mut Vec<String>,
    ) -> Result<ResolvedQuerySpec, QueryError> {
        let Some(primary) = parts.tables.first().cloned() else {
            return Err(QueryError::NoSubject);
        };

        let mut joined: Vec<String> = vec![primary.clone()];
        joined.extend(parts.joins.iter().map(|j| j.table.clone()));
        for table in parts.tables.iter().skip(1) {
            if joined.iter().any(|t| t.eq_ignore_ascii_case(table)) {
                continue;
            }
            let link = joined
                .iter()
                .find_map(|t| schema.foreign_key_between(t, table))
                .ok_or_else(|| QueryError::UnrelatedTables {
                    left: primary.clone(),
                    right: table.clone(),
                })?;
            let (from_table, from_column, to_table, to_column) = link;
            parts.joins.push(Join {
                table: table.clone(),
                left: ColumnRef::new(from_table, from_column),
                right: ColumnRef::new(to_table, to_column),
            });
            joined.push(table.clone());
        }

        if !parts.group_by.is_empty() && parts.aggregates.is_empty() {
            parts.aggregates.push(Expr::Aggregate {
                func: AggregateFn::Count,
                arg: None,
            });
        }
        let projections = if parts.aggregates.is_empty() {
            parts.columns
        } else {
            // Plain columns next to aggregates become grouping keys.
            for column in parts.columns {
                if !parts.group_by.contains(&column) {
                    parts.group_by.push(column);
                }
            }
            let mut out = parts.group_by.clone();
            out.extend(parts.aggregates);
            out
        };

        let mut limit = parts.limit.or(self.config.default_row_limit);
        if let Some(requested) = limit {
            if requested > self.config.max_row_limit {
                warnings.push(format!(
                    "Requested {requested} rows; returning at most {}.",
                    self.config.max_row_limit
                ));
                limit = Some(self.config.max_row_limit);
            }
        }

        Ok(ResolvedQuerySpec {
            kind: QueryKind::Rows,
            tables: joined,
            joins: parts.joins,
            projections,
            filters: parts.filters,
            group_by: parts.group_by,
            order_by: parts.order_by,
            limit,
            offset: parts.offset,
            chart_request: parts.chart,
        })
    }

    // ---- Rendering ----

    /// Render `spec` in this generator's dialect.
    pub fn render(&self, spec: &ResolvedQuerySpec) -> String {
        match &spec.kind {
            QueryKind::ListTables => return self.dialect.list_tables_sql(),
            QueryKind::DescribeTable { table } => return self.dialect.describe_table_sql(table),
            QueryKind::Rows => {}
        }

        let qualify = !spec.joins.is_empty();
        let r = Renderer {
            dialect: &self.dialect,
            qualify,
        };

        let select = if spec.projections.is_empty() {
            "*".to_string()
        } else {
            spec.projections
                .iter()
                .map(|e| match alias(e) {
                    Some(alias) => format!("{} AS {}", r.expr(e), self.dialect.quote_ident(&alias)),
                    None => r.expr(e),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {select} FROM {}", r.table(spec.primary_table().unwrap_or("")));
        for join in &spec.joins {
            sql.push_str(&format!(
                " JOIN {} ON {} = {}",
                r.table(&join.table),
                r.column(&join.left),
                r.column(&join.right)
            ));
        }
        if !spec.filters.is_empty() {
            let preds: Vec<String> = spec.filters.iter().map(|p| r.predicate(p)).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&preds.join(" AND "));
        }
        if !spec.group_by.is_empty() {
            let groups: Vec<String> = spec.group_by.iter().map(|e| r.expr(e)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
        if !spec.order_by.is_empty() {
            let orders: Vec<String> = spec.order_by.iter().map(|o| r.order(o)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }
        let window = self.dialect.limit_clause(spec.limit, spec.offset);
        if !window.is_empty() {
            sql.push(' ');
            sql.push_str(&window);
        }
        sql
    }

    // ---- Model fallback ----

    async fn generate_with_model(
        &self,
        utterance: &str,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
        model: &ModelGateway,
    ) -> Result<GeneratedQuery, QueryError> {
        let context = window.transcript();
        let prompt = self
            .dialect
            .prompt(&schema_summary(schema), &context, utterance);
        let completion = model.complete(&prompt, &context).await?;
        let sql = extract_sql(&completion.text).ok_or(QueryError::NoSubject)?;

        for caps in TABLE_REFS.captures_iter(&sql) {
            let raw = caps[1].trim_matches(|c| c == '"' || c == '`');
            let name = raw.rsplit('.').next().unwrap_or(raw);
            if schema.table(name).is_none() {
                return Err(QueryError::SchemaMismatch {
                    term: name.to_string(),
                });
            }
        }
        self.gate(&sql)?;

        info!(confidence = completion.confidence, "Generated SQL from language model");
        let mut warnings = Vec::new();
        if let Some(warning) = self.dialect.compatibility_warning() {
            warnings.push(warning.to_string());
        }
        Ok(GeneratedQuery {
            spec: None,
            sql,
            source: SqlSource::Model,
            demoted: false,
            warnings,
        })
    }
}

/// Plain-text schema listing used in model prompts.
pub fn schema_summary(schema: &SchemaDescriptor) -> String {
    let mut out = String::new();
    for table in &schema.tables {
        out.push_str(&format!("Table: {}\n", table.name));
        for column in &table.columns {
            let key = match &column.key_role {
                KeyRole::PrimaryKey => " (PK)".to_string(),
                KeyRole::ForeignKey { table, column } => format!(" (FK -> {table}.{column})"),
                KeyRole::None => String::new(),
            };
            out.push_str(&format!(
                "  - {}: {}{}\n",
                column.name, column.declared_type, key
            ));
        }
    }
    out
}

// =============================================================================
// Spec parts
// =============================================================================

/// A spec taken apart so a follow-up can replace individual clauses.
#[derive(Debug, Default)]
struct Parts {
    tables: Vec<String>,
    joins: Vec<Join>,
    /// Non-aggregate projections.
    columns: Vec<Expr>,
    aggregates: Vec<Expr>,
    filters: Vec<Predicate>,
    group_by: Vec<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    chart: Option<ChartRequest>,
}

impl Parts {
    fn from_extraction(ex: Extraction) -> Self {
        let mut tables = ex.tables;
        for t in ex.group_tables {
            if !tables.iter().any(|x| x.eq_ignore_ascii_case(&t)) {
                tables.push(t);
            }
        }
        Self {
            tables,
            joins: Vec::new(),
            columns: ex.projections,
            aggregates: ex.aggregates,
            filters: ex.filters,
            group_by: ex.group_by,
            order_by: ex.order_by,
            limit: ex.limit,
            offset: ex.offset,
            chart: ex.chart,
        }
    }

    fn from_spec(spec: &ResolvedQuerySpec) -> Self {
        let (aggregates, plain): (Vec<Expr>, Vec<Expr>) = spec
            .projections
            .iter()
            .cloned()
            .partition(Expr::is_aggregate);
        Self {
            tables: spec.tables.clone(),
            joins: spec.joins.clone(),
            columns: plain
                .into_iter()
                .filter(|e| !spec.group_by.contains(e))
                .collect(),
            aggregates,
            filters: spec.filters.clone(),
            group_by: spec.group_by.clone(),
            order_by: spec.order_by.clone(),
            limit: spec.limit,
            offset: spec.offset,
            chart: spec.chart_request,
        }
    }

    /// Filters replace same-target filters; every other clause the delta
    /// mentions replaces the base's clause wholesale.
    fn apply_delta(&mut self, delta: Extraction) {
        for filter in delta.filters {
            self.filters.retain(|f| {
                !(f.expr.same_target(&filter.expr) && same_direction(f.op, filter.op))
            });
            self.filters.push(filter);
        }
        if !delta.aggregates.is_empty() {
            self.aggregates = delta.aggregates;
            if delta.projections.is_empty() && delta.group_by.is_empty() {
                self.columns.clear();
            }
        }
        if !delta.projections.is_empty() {
            self.columns = delta.projections;
        }
        if !delta.group_by.is_empty() {
            self.group_by = delta.group_by;
            for t in delta.group_tables {
                if !self.tables.iter().any(|x| x.eq_ignore_ascii_case(&t)) {
                    self.tables.push(t);
                }
            }
        }
        if !delta.order_by.is_empty() {
            self.order_by = delta.order_by;
        }
        if delta.limit.is_some() {
            self.limit = delta.limit;
        }
        if delta.offset.is_some() {
            self.offset = delta.offset;
        }
        if delta.chart.is_some() {
            self.chart = delta.chart;
        }
    }
}

/// Lower and upper bounds on one column coexist; anything else replaces.
fn same_direction(a: CompareOp, b: CompareOp) -> bool {
    let lower = |op: CompareOp| matches!(op, CompareOp::Gt | CompareOp::Gte);
    let upper = |op: CompareOp| matches!(op, CompareOp::Lt | CompareOp::Lte);
    !((lower(a) && upper(b)) || (upper(a) && lower(b)))
}

fn validate_identifiers(spec: &ResolvedQuerySpec, schema: &SchemaDescriptor) -> Result<(), QueryError> {
    for table in &spec.tables {
        if schema.table(table).is_none() {
            return Err(QueryError::SchemaMismatch { term: table.clone() });
        }
    }
    for column in spec.column_refs() {
        if !schema.has_column(&column.table, &column.column) {
            return Err(QueryError::SchemaMismatch {
                term: column.column.clone(),
            });
        }
    }
    Ok(())
}

/// Output column name for computed projections.
fn alias(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column(_) => None,
        Expr::DatePart { part, .. } => Some(part.as_str().to_string()),
        Expr::Aggregate { arg: None, .. } => Some("count_all".to_string()),
        Expr::Aggregate {
            func,
            arg: Some(arg),
        } => Some(format!(
            "{}_{}",
            func.sql_name().to_ascii_lowercase(),
            arg.column.to_ascii_lowercase()
        )),
        Expr::Concat { parts } => Some(
            parts
                .iter()
                .map(|p| p.column.to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join("_"),
        ),
    }
}

struct Renderer<'a> {
    dialect: &'a Dialect,
    qualify: bool,
}

impl Renderer<'_> {
    fn table(&self, name: &str) -> String {
        self.dialect.quote_ident(name)
    }

    fn column(&self, c: &ColumnRef) -> String {
        if self.qualify {
            format!(
                "{}.{}",
                self.dialect.quote_ident(&c.table),
                self.dialect.quote_ident(&c.column)
            )
        } else {
            self.dialect.quote_ident(&c.column)
        }
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Column(c) => self.column(c),
            Expr::DatePart { part, column } => self.dialect.date_part(*part, &self.column(column)),
            Expr::Aggregate { func, arg: None } => match func {
                AggregateFn::Count => "COUNT(*)".to_string(),
                other => format!("{}(*)", other.sql_name()),
            },
            Expr::Aggregate {
                func,
                arg: Some(arg),
            } => format!("{}({})", func.sql_name(), self.column(arg)),
            Expr::Concat { parts } => {
                let parts: Vec<String> = parts.iter().map(|p| self.column(p)).collect();
                self.dialect.concat(&parts)
            }
        }
    }

    fn predicate(&self, p: &Predicate) -> String {
        let op = match p.op {
            CompareOp::Like => self.dialect.like_operator(),
            other => other.symbol(),
        };
        format!("{} {} {}", self.expr(&p.expr), op, p.value)
    }

    fn order(&self, o: &OrderBy) -> String {
        if o.descending {
            format!("{} DESC", self.expr(&o.expr))
        } else {
            self.expr(&o.expr)
        }
    }
}
