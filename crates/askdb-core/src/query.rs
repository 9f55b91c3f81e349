//! Structured form of a data request, independent of any SQL dialect.
//!
//! A [`ResolvedQuerySpec`] is what the generator builds from an utterance and
//! what a follow-up turn edits. It renders back to a canonical English
//! paraphrase via [`ResolvedQuerySpec::describe`], which the resolver uses to
//! rewrite elliptical follow-ups into self-contained requests.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum QueryKind {
    #[default]
    Rows,
    ListTables,
    DescribeTable { table: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Month,
    Day,
}

impl DatePart {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatePart::Year => "year",
            DatePart::Month => "month",
            DatePart::Day => "day",
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "year" | "years" => Some(DatePart::Year),
            "month" | "months" => Some(DatePart::Month),
            "day" | "days" => Some(DatePart::Day),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }

    pub fn word(&self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "average",
            AggregateFn::Min => "minimum",
            AggregateFn::Max => "maximum",
        }
    }
}

/// A projected, filtered, grouped or ordered expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "expr")]
pub enum Expr {
    Column(ColumnRef),
    DatePart { part: DatePart, column: ColumnRef },
    /// `arg: None` counts rows.
    Aggregate { func: AggregateFn, arg: Option<ColumnRef> },
    Concat { parts: Vec<ColumnRef> },
}

impl Expr {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::new(table, column))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. })
    }

    /// Columns this expression reads.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        match self {
            Expr::Column(c) => vec![c],
            Expr::DatePart { column, .. } => vec![column],
            Expr::Aggregate { arg, .. } => arg.iter().collect(),
            Expr::Concat { parts } => parts.iter().collect(),
        }
    }

    /// Two expressions constrain the same thing when they read the same
    /// column the same way (a new `year=2020` replaces an old `year=2019`).
    pub fn same_target(&self, other: &Expr) -> bool {
        match (self, other) {
            (Expr::Column(a), Expr::Column(b)) => a.column.eq_ignore_ascii_case(&b.column),
            (
                Expr::DatePart { part: pa, column: a },
                Expr::DatePart { part: pb, column: b },
            ) => pa == pb && a.column.eq_ignore_ascii_case(&b.column),
            _ => self == other,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => f.write_str(&c.column),
            Expr::DatePart { part, column } => write!(f, "{}({})", part.as_str(), column.column),
            Expr::Aggregate { func, arg: None } => write!(f, "{} of rows", func.word()),
            Expr::Aggregate {
                func,
                arg: Some(arg),
            } => write!(f, "{} of {}", func.word(), arg.column),
            Expr::Concat { parts } => {
                let names: Vec<&str> = parts.iter().map(|p| p.column.as_str()).collect();
                f.write_str(&names.join(" combined with "))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Like => " like ",
        }
    }

    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "=" | "==" => Some(CompareOp::Eq),
            "!=" | "<>" => Some(CompareOp::NotEq),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Gte),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Lte),
            "like" | "LIKE" => Some(CompareOp::Like),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    /// Parse a bare token: integers, then floats, otherwise text with
    /// surrounding quotes removed.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return Literal::Integer(v);
        }
        if trimmed.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(v) = trimmed.parse::<f64>() {
                return Literal::Float(v);
            }
        }
        Literal::Text(
            trimmed
                .trim_matches(|c| c == '\'' || c == '"')
                .to_string(),
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Literal::Integer(_) | Literal::Float(_))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub expr: Expr,
    pub op: CompareOp,
    pub value: Literal,
}

impl Predicate {
    pub fn new(expr: Expr, op: CompareOp, value: Literal) -> Self {
        Self { expr, op, value }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub table: String,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

/// Chart type explicitly asked for in the utterance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartRequest {
    Bar,
    Line,
    Histogram,
    Table,
}

impl ChartRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartRequest::Bar => "bar",
            ChartRequest::Line => "line",
            ChartRequest::Histogram => "histogram",
            ChartRequest::Table => "table",
        }
    }
}

/// Dialect-independent description of one SELECT (or metadata lookup).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuerySpec {
    pub kind: QueryKind,
    /// First entry is the driving table; the rest are reached through `joins`.
    pub tables: Vec<String>,
    #[serde(default)]
    pub joins: Vec<Join>,
    /// Empty projects every column.
    #[serde(default)]
    pub projections: Vec<Expr>,
    #[serde(default)]
    pub filters: Vec<Predicate>,
    #[serde(default)]
    pub group_by: Vec<Expr>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub chart_request: Option<ChartRequest>,
}

impl ResolvedQuerySpec {
    pub fn rows(table: impl Into<String>) -> Self {
        Self {
            tables: vec![table.into()],
            ..Self::default()
        }
    }

    pub fn list_tables() -> Self {
        Self {
            kind: QueryKind::ListTables,
            ..Self::default()
        }
    }

    pub fn describe_table(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            kind: QueryKind::DescribeTable {
                table: table.clone(),
            },
            tables: vec![table],
            ..Self::default()
        }
    }

    pub fn is_rows(&self) -> bool {
        self.kind == QueryKind::Rows
    }

    pub fn primary_table(&self) -> Option<&str> {
        self.tables.first().map(String::as_str)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.eq_ignore_ascii_case(name))
    }

    /// Every column reference in the spec, in clause order.
    pub fn column_refs(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        for join in &self.joins {
            out.push(&join.left);
            out.push(&join.right);
        }
        for expr in &self.projections {
            out.extend(expr.columns());
        }
        for pred in &self.filters {
            out.extend(pred.expr.columns());
        }
        for expr in &self.group_by {
            out.extend(expr.columns());
        }
        for order in &self.order_by {
            out.extend(order.expr.columns());
        }
        out
    }

    /// Lowercased table and column names, deduplicated.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out: Vec<String> = self.tables.iter().map(|t| t.to_lowercase()).collect();
        out.extend(self.column_refs().iter().map(|c| c.column.to_lowercase()));
        out.sort();
        out.dedup();
        out
    }

    /// Literal values used in filters, as display strings without quotes.
    pub fn literals(&self) -> Vec<String> {
        self.filters
            .iter()
            .map(|p| match &p.value {
                Literal::Text(s) => s.to_lowercase(),
                other => other.to_string(),
            })
            .collect()
    }

    /// The first filter on a date part or a temporal-looking column.
    pub fn temporal_filter(&self) -> Option<&Predicate> {
        self.filters.iter().find(|p| match &p.expr {
            Expr::DatePart { .. } => true,
            Expr::Column(c) => is_temporal_name(&c.column) && p.value.is_numeric(),
            _ => false,
        })
    }

    /// Replace any filter constraining the same target as `pred`, or append it.
    pub fn upsert_filter(&mut self, pred: Predicate) {
        self.filters.retain(|p| !p.expr.same_target(&pred.expr));
        self.filters.push(pred);
    }

    /// Canonical English paraphrase, e.g.
    /// `sum of amount from sales for year=2020 by region sorted by amount descending limit 5`.
    pub fn describe(&self) -> String {
        match &self.kind {
            QueryKind::ListTables => return "list tables".to_string(),
            QueryKind::DescribeTable { table } => return format!("describe table {table}"),
            QueryKind::Rows => {}
        }

        let from = self.tables.join(" and ");
        let mut out = if self.projections.is_empty() {
            format!("{from} data")
        } else {
            let exprs: Vec<String> = self.projections.iter().map(|e| e.to_string()).collect();
            format!("{} from {}", exprs.join(" and "), from)
        };

        if !self.filters.is_empty() {
            let preds: Vec<String> = self
                .filters
                .iter()
                .map(|p| format!("{}{}{}", p.expr, p.op.symbol(), p.value))
                .collect();
            out.push_str(" for ");
            out.push_str(&preds.join(" and "));
        }
        if !self.group_by.is_empty() {
            let groups: Vec<String> = self.group_by.iter().map(|e| e.to_string()).collect();
            out.push_str(" by ");
            out.push_str(&groups.join(" and "));
        }
        if let Some(order) = self.order_by.first() {
            out.push_str(&format!(
                " sorted by {} {}",
                order.expr,
                if order.descending {
                    "descending"
                } else {
                    "ascending"
                }
            ));
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!(" limit {limit}"));
        }
        if let Some(offset) = self.offset {
            out.push_str(&format!(" offset {offset}"));
        }
        if let Some(chart) = self.chart_request {
            out.push_str(&format!(" as a {} chart", chart.as_str()));
        }
        out
    }
}

/// Column names that read as calendar values even when stored as integers.
pub fn is_temporal_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "year" | "month" | "day" | "date" | "week" | "quarter"
    ) || lower.ends_with("_year")
        || lower.ends_with("_month")
        || lower.ends_with("_date")
        || lower.ends_with("_at")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sales_spec() -> ResolvedQuerySpec {
        let mut spec = ResolvedQuerySpec::rows("sales");
        spec.filters.push(Predicate::new(
            Expr::column("sales", "year"),
            CompareOp::Eq,
            Literal::Integer(2019),
        ));
        spec
    }

    #[test]
    fn test_describe_star_with_filter() {
        assert_eq!(make_sales_spec().describe(), "sales data for year=2019");
    }

    #[test]
    fn test_describe_full_shape() {
        let mut spec = make_sales_spec();
        spec.projections = vec![
            Expr::column("sales", "region"),
            Expr::Aggregate {
                func: AggregateFn::Sum,
                arg: Some(ColumnRef::new("sales", "amount")),
            },
        ];
        spec.group_by = vec![Expr::column("sales", "region")];
        spec.order_by = vec![OrderBy {
            expr: Expr::column("sales", "amount"),
            descending: true,
        }];
        spec.limit = Some(5);
        spec.chart_request = Some(ChartRequest::Bar);
        assert_eq!(
            spec.describe(),
            "region and sum of amount from sales for year=2019 by region \
             sorted by amount descending limit 5 as a bar chart"
        );
    }

    #[test]
    fn test_describe_metadata() {
        assert_eq!(ResolvedQuerySpec::list_tables().describe(), "list tables");
        assert_eq!(
            ResolvedQuerySpec::describe_table("orders").describe(),
            "describe table orders"
        );
    }

    #[test]
    fn test_text_literal_is_quoted_and_escaped() {
        assert_eq!(Literal::Text("O'Neil".into()).to_string(), "'O''Neil'");
        assert_eq!(Literal::parse("'North'"), Literal::Text("North".into()));
        assert_eq!(Literal::parse("42"), Literal::Integer(42));
        assert_eq!(Literal::parse("4.5"), Literal::Float(4.5));
    }

    #[test]
    fn test_upsert_filter_replaces_same_column() {
        let mut spec = make_sales_spec();
        spec.upsert_filter(Predicate::new(
            Expr::column("sales", "year"),
            CompareOp::Eq,
            Literal::Integer(2020),
        ));
        assert_eq!(spec.filters.len(), 1);
        assert_eq!(spec.filters[0].value, Literal::Integer(2020));

        spec.upsert_filter(Predicate::new(
            Expr::column("sales", "region"),
            CompareOp::Eq,
            Literal::Text("west".into()),
        ));
        assert_eq!(spec.filters.len(), 2);
    }

    #[test]
    fn test_identifiers_and_literals() {
        let spec = make_sales_spec();
        assert_eq!(spec.identifiers(), vec!["sales", "year"]);
        assert_eq!(spec.literals(), vec!["2019"]);
    }

    #[test]
    fn test_temporal_filter_detection() {
        let spec = make_sales_spec();
        assert!(spec.temporal_filter().is_some());

        let mut other = ResolvedQuerySpec::rows("customers");
        other.filters.push(Predicate::new(
            Expr::column("customers", "name"),
            CompareOp::Eq,
            Literal::Text("x".into()),
        ));
        assert!(other.temporal_filter().is_none());
    }

    #[test]
    fn test_spec_json_roundtrip_keeps_kind() {
        let spec = ResolvedQuerySpec::describe_table("orders");
        let json = serde_json::to_string(&spec).unwrap();
        let back: ResolvedQuerySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
