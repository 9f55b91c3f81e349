//! Rule-based extraction of query structure from an utterance.
//!
//! Works in three passes over a masked copy of the utterance: clause cues
//! (chart, limit, ordering, filters, grouping, aggregates, projections) are
//! captured and blanked out, the remaining words are scanned for table
//! names, and finally the captured terms are resolved against the schema.

use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use askdb_core::query::{
    AggregateFn, ChartRequest, ColumnRef, CompareOp, DatePart, Expr, Literal, OrderBy, Predicate,
};
use askdb_core::types::{ColumnType, KeyRole, SchemaDescriptor, TableSchema};
use askdb_core::is_temporal_name;

use crate::error::QueryError;
use crate::text::{is_stop_word, same_word, IdentifierMatcher};

// =============================================================================
// Compiled regex sets
// =============================================================================

struct ExtractPatterns {
    chart_as: Regex,
    chart_kind: Regex,
    histogram: Regex,
    limit: Regex,
    offset: Regex,
    order: Regex,
    direction: Regex,
    between: Regex,
    symbolic: Regex,
    comparison: Regex,
    like: Regex,
    equals: Regex,
    year: Regex,
    group: Regex,
    concat: Regex,
    aggregate: Regex,
    projection: Regex,
    quoted: Regex,
    cues: Vec<Regex>,
    word: Regex,
    date_call: Regex,
}

const IDENT: &str = r"[a-z_][a-z0-9_]*(?:\([a-z_][a-z0-9_]*\))?";
const VALUE: &str = r#"'(?:[^']|'')*'|"[^"]*"|-?[a-z0-9_.\-]+"#;
const NUMBER: &str = r"-?\d+(?:\.\d+)?";

static PATTERNS: LazyLock<ExtractPatterns> = LazyLock::new(|| {
    let mk = |pat: String| Regex::new(&pat).expect("Invalid extraction regex");

    ExtractPatterns {
        chart_as: mk(r"(?i)\b(?:as|in)\s+an?\s+(bar|line|histogram|table)(?:\s+(?:chart|graph|plot))?\b".into()),
        chart_kind: mk(r"(?i)\b(bar|line)\s+(?:chart|graph|plot)s?\b".into()),
        histogram: mk(r"(?i)\bhistogram\b".into()),
        limit: mk(r"(?i)\b(top|bottom|first|limit)\s+(\d+)\b".into()),
        offset: mk(r"(?i)\b(?:offset|skip)\s+(\d+)\b".into()),
        order: mk(format!(
            r"(?i)\b(?:sort|sorted|order|ordered)\s+(?:it\s+|them\s+|the\s+results?\s+)?by\s+(?:the\s+)?(?:(count|sum|total|average|avg|minimum|min|maximum|max)\s+of\s+)?({IDENT})(?:\s+(asc|ascending|desc|descending))?"
        )),
        direction: mk(r"(?i)\b(?:in\s+)?(ascending|descending)(?:\s+order)?\b".into()),
        between: mk(format!(
            r"(?i)\b({IDENT})\s+(?:is\s+)?between\s+({NUMBER})\s+and\s+({NUMBER})\b"
        )),
        symbolic: mk(format!(r"(?i)\b({IDENT})\s*(>=|<=|!=|<>|==|=|>|<)\s*({VALUE})")),
        comparison: mk(format!(
            r"(?i)\b([a-z_][a-z0-9_]*)\s+(?:is\s+|are\s+|was\s+)?(greater\s+than|more\s+than|higher\s+than|larger\s+than|bigger\s+than|above|over|at\s+least|less\s+than|lower\s+than|fewer\s+than|smaller\s+than|below|under|at\s+most)\s+({NUMBER})\b"
        )),
        like: mk(format!(
            r#"(?i)\b([a-z_][a-z0-9_]*)\s+(like|contains|containing|includes|including|starting\s+with|ending\s+with)\s+('(?:[^']|'')*'|"[^"]*"|[a-z0-9_%\-]+)"#
        )),
        equals: mk(format!(
            r"(?i)\b(?:where|with|whose|having)\s+(?:the\s+)?([a-z_][a-z0-9_]*)\s+(?:is|equals|equal\s+to|of)\s+({VALUE})"
        )),
        year: mk(r"(?i)\b(?:(?:in|for|during|from|of)\s+(?:the\s+)?(?:year\s+)?|year\s+)((?:19|20)\d{2})\b".into()),
        group: mk(format!(
            r"(?i)\b(?:grouped\s+by|group\s+by|broken\s+down\s+by|for\s+each|for\s+every|by|per|each)\s+(?:the\s+|each\s+)?({IDENT})(?:\s+and\s+({IDENT}))?"
        )),
        concat: mk(r"(?i)\b([a-z_][a-z0-9_]*)\s+combined\s+with\s+([a-z_][a-z0-9_]*)".into()),
        aggregate: mk(r"(?i)\b(how\s+many|number\s+of|count(?:\s+of)?|sum(?:\s+of)?|total(?:\s+of)?|average(?:\s+of)?|avg(?:\s+of)?|mean(?:\s+of)?|maximum(?:\s+of)?|max(?:\s+of)?|highest|largest|minimum(?:\s+of)?|min(?:\s+of)?|lowest|smallest)\b(?:\s+(?:the|all|my))?(?:\s+([a-z_][a-z0-9_]*))?(?:\s+([a-z_][a-z0-9_]*))?".into()),
        projection: mk(format!(
            r"(?i)(?:^\s*|\b(?:show|list|get|display|give|find|select|fetch|return|what\s+are)\s+(?:me\s+)?(?:the\s+|all\s+)?)((?:{IDENT})(?:\s*(?:,|and)\s*(?:{IDENT}))*)(?:\s*(?:,|and))?\s+(?:from|of|for|in)\s+(?:the\s+|all\s+)?([a-z_][a-z0-9_]*)"
        )),
        quoted: mk(r#"'(?:[^']|'')*'|"[^"]*""#.into()),
        cues: vec![
            mk(r"(?i)\b(?:show|list|get|display|give|find|select|fetch|see|visualize|plot|chart|analyze|analyse)\s+(?:me\s+)?(?:(?:all|the|every|of|my)\s+)*([a-z_][a-z0-9_]*)".into()),
            mk(r"(?i)\bfrom\s+(?:the\s+)?([a-z_][a-z0-9_]*)".into()),
            mk(r"(?i)\b([a-z_][a-z0-9_]*)\s+(?:table|data|records|rows|entries)\b".into()),
        ],
        word: mk(r"(?i)[a-z_][a-z0-9_]*".into()),
        date_call: mk(r"^(year|month|day)\(([a-z_][a-z0-9_]*)\)$".into()),
    }
});

/// Words that steer extraction but never name a table or column.
const KEYWORDS: &[&str] = &[
    "chart", "graph", "plot", "bar", "line", "histogram", "table", "tables", "top", "bottom",
    "limit", "offset", "first", "sorted", "sort", "order", "ordered", "where", "count", "number",
    "total", "sum", "average", "avg", "mean", "max", "min", "maximum", "minimum", "highest",
    "lowest", "largest", "smallest", "many", "much", "everything", "result", "results", "more",
    "less", "greater", "between", "like", "containing", "combined", "ascending", "descending",
    "asc", "desc", "visualize", "analyze", "analyse", "info", "information", "details", "over",
    "under", "above", "below", "there", "whole", "entire", "everyone", "anything", "year",
    "month", "day", "select", "fetch", "return", "have", "has", "had", "group", "grouped",
];

fn is_filler(word: &str) -> bool {
    is_stop_word(word) || KEYWORDS.contains(&word)
}

/// Date-part names are keywords for table scanning but still name a filter
/// subject ("year=2020").
fn is_predicate_term(word: &str) -> bool {
    !is_filler(word) || DatePart::parse(word).is_some()
}

// =============================================================================
// Extraction
// =============================================================================

/// Structure found in an utterance, resolved against a schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Tables named in the utterance, in order of appearance.
    pub tables: Vec<String>,
    /// Tables reached only through a grouping term; joined on a foreign key.
    pub group_tables: Vec<String>,
    /// Plain column, date-part and concatenation projections.
    pub projections: Vec<Expr>,
    pub aggregates: Vec<Expr>,
    pub filters: Vec<Predicate>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub chart: Option<ChartRequest>,
}

impl Extraction {
    /// Whether anything beyond table names was found.
    pub fn has_clauses(&self) -> bool {
        !(self.projections.is_empty()
            && self.aggregates.is_empty()
            && self.filters.is_empty()
            && self.group_by.is_empty()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
            && self.chart.is_none())
    }
}

struct RawFilter {
    term: String,
    op: CompareOp,
    value: Literal,
}

struct RawAggregate {
    pos: usize,
    func: AggregateFn,
    /// Table named as the aggregate's argument ("count of orders").
    table: Option<String>,
    words: Vec<String>,
}

struct RawOrder {
    func: Option<AggregateFn>,
    term: String,
    descending: Option<bool>,
}

#[derive(Default)]
struct Captured {
    mentions: Vec<(usize, String)>,
    filters: Vec<RawFilter>,
    aggregates: Vec<RawAggregate>,
    groups: Vec<(String, Option<String>)>,
    orders: Vec<RawOrder>,
    concats: Vec<(String, String)>,
    projections: Vec<ColumnRef>,
    top: Option<bool>,
    limit: Option<u64>,
    offset: Option<u64>,
    chart: Option<ChartRequest>,
    direction: Option<bool>,
}

/// Maps utterances onto query structure for one schema.
pub struct Extractor<'a> {
    schema: &'a SchemaDescriptor,
    matcher: &'a IdentifierMatcher,
}

impl<'a> Extractor<'a> {
    pub fn new(schema: &'a SchemaDescriptor, matcher: &'a IdentifierMatcher) -> Self {
        Self { schema, matcher }
    }

    /// Extract structure from `utterance`.
    ///
    /// `context_tables` are tables already in play (a follow-up's base); their
    /// columns are in scope even when the utterance does not name them.
    pub fn extract(
        &self,
        utterance: &str,
        context_tables: &[String],
    ) -> Result<Extraction, QueryError> {
        let mut text = utterance.to_string();
        let mut cap = Captured::default();

        self.capture_clauses(&mut text, &mut cap);
        self.scan_tables(&mut text, &mut cap)?;
        self.resolve(cap, context_tables)
    }

    // ---- Pass 1: clause cues ----

    fn capture_clauses(&self, text: &mut String, cap: &mut Captured) {
        let p = &*PATTERNS;

        let chart = p
            .chart_as
            .captures(text.as_str())
            .or_else(|| p.chart_kind.captures(text.as_str()))
            .map(|c| (span(&c), chart_request(&c[1])))
            .or_else(|| {
                p.histogram
                    .find(text.as_str())
                    .map(|m| (m.range(), Some(ChartRequest::Histogram)))
            });
        if let Some((range, request)) = chart {
            cap.chart = request;
            mask(text, range);
        }

        for (range, c) in captures(&p.limit, text.as_str()) {
            let n: u64 = c[1].parse().unwrap_or(0);
            match c[0].to_lowercase().as_str() {
                "top" => cap.top = Some(true),
                "bottom" => cap.top = Some(false),
                _ => {}
            }
            cap.limit = Some(n);
            mask(text, range);
        }
        for (range, c) in captures(&p.offset, text.as_str()) {
            cap.offset = c[0].parse().ok();
            mask(text, range);
        }

        for (range, c) in captures(&p.order, text.as_str()) {
            cap.orders.push(RawOrder {
                func: c.get(0).and_then(|m| aggregate_word(m)),
                term: c[1].to_lowercase(),
                descending: c.get(2).map(|m| m.to_lowercase().starts_with("desc")),
            });
            mask(text, range);
        }
        let direction = p
            .direction
            .captures(text.as_str())
            .map(|c| (span(&c), c[1].eq_ignore_ascii_case("descending")));
        if let Some((range, descending)) = direction {
            cap.direction = Some(descending);
            mask(text, range);
        }

        for (range, c) in captures(&p.between, text.as_str()) {
            let term = c[0].to_lowercase();
            cap.filters.push(RawFilter {
                term: term.clone(),
                op: CompareOp::Gte,
                value: Literal::parse(&c[1]),
            });
            cap.filters.push(RawFilter {
                term,
                op: CompareOp::Lte,
                value: Literal::parse(&c[2]),
            });
            mask(text, range);
        }
        for (range, c) in captures(&p.symbolic, text.as_str()) {
            let term = c[0].to_lowercase();
            let Some(op) = CompareOp::parse(&c[1]) else {
                continue;
            };
            if !is_predicate_term(&term) {
                continue;
            }
            cap.filters.push(RawFilter {
                term,
                op,
                value: parse_value(&c[2]),
            });
            mask(text, range);
        }
        for (range, c) in captures(&p.comparison, text.as_str()) {
            let term = c[0].to_lowercase();
            if !is_predicate_term(&term) {
                continue;
            }
            cap.filters.push(RawFilter {
                term,
                op: comparison_op(&c[1]),
                value: Literal::parse(&c[2]),
            });
            mask(text, range);
        }
        for (range, c) in captures(&p.like, text.as_str()) {
            let term = c[0].to_lowercase();
            if !is_predicate_term(&term) {
                continue;
            }
            let raw = match parse_value(&c[2]) {
                Literal::Text(s) => s,
                other => other.to_string(),
            };
            let pattern = like_pattern(&c[1].to_lowercase(), &raw);
            cap.filters.push(RawFilter {
                term,
                op: CompareOp::Like,
                value: Literal::Text(pattern),
            });
            mask(text, range);
        }
        for (range, c) in captures(&p.equals, text.as_str()) {
            let term = c[0].to_lowercase();
            if !is_predicate_term(&term) {
                continue;
            }
            cap.filters.push(RawFilter {
                term,
                op: CompareOp::Eq,
                value: parse_value(&c[1]),
            });
            mask(text, range);
        }
        for (range, c) in captures(&p.year, text.as_str()) {
            cap.filters.push(RawFilter {
                term: "year".to_string(),
                op: CompareOp::Eq,
                value: Literal::parse(&c[0]),
            });
            mask(text, range);
        }

        for (range, c) in captures(&p.group, text.as_str()) {
            let first = c[0].to_lowercase();
            if is_stop_word(&first) {
                continue;
            }
            let second = c.get(1).map(|s| s.to_lowercase());
            cap.groups.push((first, second));
            mask(text, range);
        }

        for (range, c) in captures(&p.concat, text.as_str()) {
            cap.concats.push((c[0].to_lowercase(), c[1].to_lowercase()));
            mask(text, range);
        }

        for (range, c) in captures(&p.aggregate, text.as_str()) {
            let Some(func) = aggregate_word(&c[0]) else {
                continue;
            };
            let mut words: Vec<String> = Vec::new();
            let mut end = range.start + c[0].len();
            for w in [c.get(1), c.get(2)].into_iter().flatten() {
                let lower = w.to_lowercase();
                if is_stop_word(&lower) {
                    break;
                }
                words.push(lower);
            }
            let mut table = None;
            if let Some(first) = words.first() {
                if let Some(t) = self.matcher.match_table(first, self.schema) {
                    table = Some(t.to_string());
                    cap.mentions.push((range.start, t.to_string()));
                }
            }
            // The first argument word is always consumed; the second only
            // when it completes a column name.
            if !words.is_empty() {
                end = range.start + c.len_through(1);
            }
            cap.aggregates.push(RawAggregate {
                pos: range.start,
                func,
                table,
                words,
            });
            mask(text, range.start..end);
        }

        for (range, c) in captures(&p.projection, text.as_str()) {
            let Some(table_name) = self.matcher.match_table(&c[1], self.schema) else {
                continue;
            };
            let Some(table) = self.schema.table(table_name) else {
                continue;
            };
            let items = split_items(&c[0]);
            if items.is_empty() || items.iter().any(|i| is_filler(i)) {
                continue;
            }
            let resolved: Option<Vec<ColumnRef>> = items
                .iter()
                .map(|item| {
                    self.matcher
                        .match_column(item, table)
                        .map(|col| ColumnRef::new(table.name.clone(), col))
                })
                .collect();
            if let Some(cols) = resolved {
                cap.mentions.push((range.start, table.name.clone()));
                cap.projections.extend(cols);
                mask(text, range);
            }
        }
    }

    // ---- Pass 2: table names and subject cues ----

    fn scan_tables(&self, text: &mut String, cap: &mut Captured) -> Result<(), QueryError> {
        let p = &*PATTERNS;
        let quoted: Vec<Range<usize>> = p.quoted.find_iter(text.as_str()).map(|m| m.range()).collect();
        for range in quoted {
            mask(text, range);
        }

        for re in &p.cues {
            for c in re.captures_iter(text.as_str()) {
                let Some(m) = c.get(1) else { continue };
                let word = m.as_str().to_lowercase();
                if is_filler(&word) {
                    continue;
                }
                if let Some(t) = self.matcher.match_table(&word, self.schema) {
                    cap.mentions.push((m.start(), t.to_string()));
                } else if !self.is_any_column(&word) {
                    return Err(QueryError::SchemaMismatch { term: word });
                }
            }
        }

        let words: Vec<(usize, String)> = p
            .word
            .find_iter(text.as_str())
            .map(|m| (m.start(), m.as_str().to_lowercase()))
            .collect();
        let mut i = 0;
        while i < words.len() {
            let (pos, word) = &words[i];
            if is_filler(word) {
                i += 1;
                continue;
            }
            if let Some((_, next)) = words.get(i + 1) {
                let joined = format!("{word}_{next}");
                if !is_filler(next) {
                    if let Some(t) = self.schema.table_names().find(|t| same_word(t, &joined)) {
                        cap.mentions.push((*pos, t.to_string()));
                        i += 2;
                        continue;
                    }
                }
            }
            let names_table = self.schema.table_names().any(|t| same_word(t, word));
            if names_table || !self.is_exact_column(word) {
                if let Some(t) = self.matcher.match_table(word, self.schema) {
                    cap.mentions.push((*pos, t.to_string()));
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn is_exact_column(&self, word: &str) -> bool {
        self.schema.tables.iter().any(|t| t.column(word).is_some())
    }

    fn is_any_column(&self, word: &str) -> bool {
        let all: Vec<&TableSchema> = self.schema.tables.iter().collect();
        self.matcher.match_column_in(word, &all).is_some()
    }

    // ---- Pass 3: resolution ----

    fn resolve(&self, cap: Captured, context_tables: &[String]) -> Result<Extraction, QueryError> {
        let mut mentions = cap.mentions;
        mentions.sort_by_key(|(pos, _)| *pos);
        let mut tables: Vec<String> = Vec::new();
        for (_, t) in mentions {
            if !tables.iter().any(|x| x.eq_ignore_ascii_case(&t)) {
                tables.push(t);
            }
        }

        // No table named and none in play: the table resolving most terms decides.
        if tables.is_empty() && context_tables.is_empty() {
            let terms: Vec<&str> = cap
                .filters
                .iter()
                .map(|f| f.term.as_str())
                .chain(cap.aggregates.iter().flat_map(|a| a.words.iter().map(String::as_str)))
                .chain(cap.groups.iter().map(|g| g.0.as_str()))
                .chain(cap.orders.iter().map(|o| o.term.as_str()))
                .chain(cap.concats.iter().map(|c| c.0.as_str()))
                .collect();
            let mut best: Option<(&TableSchema, usize)> = None;
            for table in &self.schema.tables {
                let hits = terms
                    .iter()
                    .filter(|t| self.resolve_expr(t, &[table]).is_some())
                    .count();
                if hits > 0 && best.map(|(_, n)| hits > n).unwrap_or(true) {
                    best = Some((table, hits));
                }
            }
            match best {
                Some((table, _)) => tables.push(table.name.clone()),
                None => {
                    if let Some(term) = terms.iter().find(|t| !is_filler(t)) {
                        return Err(QueryError::SchemaMismatch {
                            term: term.to_string(),
                        });
                    }
                }
            }
        }

        let mut scope_names: Vec<String> = tables.clone();
        for t in context_tables {
            if !scope_names.iter().any(|x| x.eq_ignore_ascii_case(t)) {
                scope_names.push(t.clone());
            }
        }
        let scope: Vec<&TableSchema> = scope_names
            .iter()
            .filter_map(|n| self.schema.table(n))
            .collect();
        if scope.is_empty() {
            return Err(QueryError::NoSubject);
        }
        let primary = scope[0];

        let mut out = Extraction {
            limit: cap.limit,
            offset: cap.offset,
            chart: cap.chart,
            projections: cap.projections.into_iter().map(Expr::Column).collect(),
            ..Extraction::default()
        };

        for f in cap.filters {
            let expr = self
                .resolve_expr(&f.term, &scope)
                .ok_or_else(|| QueryError::SchemaMismatch {
                    term: f.term.clone(),
                })?;
            out.filters.push(Predicate::new(expr, f.op, f.value));
        }

        for (a, b) in cap.concats {
            let mut parts = Vec::new();
            for term in [a, b] {
                match self.resolve_expr(&term, &scope) {
                    Some(Expr::Column(c)) => parts.push(c),
                    _ => return Err(QueryError::SchemaMismatch { term }),
                }
            }
            out.projections.push(Expr::Concat { parts });
        }

        let mut aggregates = cap.aggregates;
        aggregates.sort_by_key(|a| a.pos);
        for agg in aggregates {
            out.aggregates.push(self.resolve_aggregate(&agg, &scope)?);
        }

        for (first, second) in cap.groups {
            let expr = self.resolve_group(&first, primary, &scope, &mut out.group_tables)?;
            out.group_by.push(expr);
            if let Some(second) = second {
                if let Ok(expr) = self.resolve_group(&second, primary, &scope, &mut out.group_tables)
                {
                    out.group_by.push(expr);
                }
            }
        }

        for order in cap.orders {
            let expr = self.resolve_order(&order, &scope, &out.aggregates)?;
            out.order_by.push(OrderBy {
                expr,
                descending: order.descending.or(cap.direction).unwrap_or(false),
            });
        }

        if let Some(top) = cap.top {
            if out.order_by.is_empty() {
                let target = self.top_target(&mut out, primary);
                if let Some(expr) = target {
                    out.order_by.push(OrderBy {
                        expr,
                        descending: top,
                    });
                }
            }
        }

        out.tables = tables;
        if out.tables.is_empty() {
            if let Some(first) = context_tables.first() {
                out.tables.push(first.clone());
            }
        }
        Ok(out)
    }

    /// Resolve a column-like term: `part(column)`, a column in scope, or a
    /// bare date part applied to a temporal column.
    fn resolve_expr(&self, term: &str, scope: &[&TableSchema]) -> Option<Expr> {
        if let Some(c) = PATTERNS.date_call.captures(term) {
            let part = DatePart::parse(&c[1])?;
            let (table, column) = self.matcher.match_column_in(&c[2], scope)?;
            return Some(Expr::DatePart {
                part,
                column: ColumnRef::new(table, column),
            });
        }
        if is_filler(term) && DatePart::parse(term).is_none() {
            return None;
        }
        if let Some((table, column)) = self.matcher.match_column_in(term, scope) {
            return Some(Expr::column(table, column));
        }
        let part = DatePart::parse(term)?;
        temporal_column(scope).map(|column| Expr::DatePart { part, column })
    }

    fn resolve_aggregate(
        &self,
        agg: &RawAggregate,
        scope: &[&TableSchema],
    ) -> Result<Expr, QueryError> {
        let arg = if let Some(table) = &agg.table {
            let table = self.schema.table(table).ok_or(QueryError::NoSubject)?;
            match agg.func {
                AggregateFn::Count => None,
                _ => {
                    let named = agg
                        .words
                        .get(1)
                        .and_then(|w| self.matcher.match_column(w, table))
                        .map(|c| ColumnRef::new(table.name.clone(), c));
                    match named.or_else(|| default_measure(table)) {
                        Some(col) => Some(col),
                        None => {
                            return Err(QueryError::SchemaMismatch {
                                term: agg.func.word().to_string(),
                            })
                        }
                    }
                }
            }
        } else if agg.words.is_empty() {
            match agg.func {
                AggregateFn::Count => None,
                _ => Some(scope.iter().find_map(|t| default_measure(t)).ok_or_else(|| {
                    QueryError::SchemaMismatch {
                        term: agg.func.word().to_string(),
                    }
                })?),
            }
        } else {
            let joined = agg.words.join("_");
            let hit = (agg.words.len() > 1)
                .then(|| self.resolve_expr(&joined, scope))
                .flatten()
                .or_else(|| self.resolve_expr(&agg.words[0], scope));
            match hit {
                Some(Expr::Column(c)) => Some(c),
                _ => {
                    return Err(QueryError::SchemaMismatch {
                        term: agg.words[0].clone(),
                    })
                }
            }
        };
        Ok(Expr::Aggregate {
            func: agg.func,
            arg,
        })
    }

    fn resolve_group(
        &self,
        term: &str,
        primary: &TableSchema,
        scope: &[&TableSchema],
        group_tables: &mut Vec<String>,
    ) -> Result<Expr, QueryError> {
        if PATTERNS.date_call.is_match(term) {
            return self
                .resolve_expr(term, scope)
                .ok_or_else(|| QueryError::SchemaMismatch { term: term.into() });
        }
        for table in scope {
            if let Some(col) = table.column(term) {
                return Ok(Expr::column(table.name.clone(), col.name.clone()));
            }
        }
        if let Some(part) = DatePart::parse(term) {
            if let Some(column) = temporal_column(scope) {
                return Ok(Expr::DatePart { part, column });
            }
        }
        if let Some(table_name) = self.matcher.match_table(term, self.schema) {
            if let Some(table) = self.schema.table(table_name) {
                let in_scope = scope.iter().any(|t| t.name == table.name);
                let related = self
                    .schema
                    .foreign_key_between(&primary.name, &table.name)
                    .is_some();
                if !in_scope && related {
                    group_tables.push(table.name.clone());
                }
                if in_scope || related {
                    if let Some(label) = label_column(table) {
                        return Ok(Expr::Column(label));
                    }
                }
            }
        }
        self.resolve_expr(term, scope)
            .ok_or_else(|| QueryError::SchemaMismatch { term: term.into() })
    }

    fn resolve_order(
        &self,
        order: &RawOrder,
        scope: &[&TableSchema],
        aggregates: &[Expr],
    ) -> Result<Expr, QueryError> {
        if let Some(func) = order.func {
            let arg = if is_filler(&order.term) {
                None
            } else {
                match self.resolve_expr(&order.term, scope) {
                    Some(Expr::Column(c)) => Some(c),
                    _ => {
                        return Err(QueryError::SchemaMismatch {
                            term: order.term.clone(),
                        })
                    }
                }
            };
            return Ok(Expr::Aggregate { func, arg });
        }
        if let (Some(_), Some(first)) = (aggregate_word(&order.term), aggregates.first()) {
            if self.resolve_expr(&order.term, scope).is_none() {
                return Ok(first.clone());
            }
        }
        let expr = self
            .resolve_expr(&order.term, scope)
            .ok_or_else(|| QueryError::SchemaMismatch {
                term: order.term.clone(),
            })?;
        // Ordering by a column that is being aggregated means ordering by the aggregate.
        if let Expr::Column(col) = &expr {
            if let Some(agg) = aggregates.iter().find(
                |a| matches!(a, Expr::Aggregate { arg: Some(arg), .. } if arg == col),
            ) {
                return Ok(agg.clone());
            }
        }
        Ok(expr)
    }

    /// Target for "top N" / "bottom N" without an explicit ordering.
    fn top_target(&self, out: &mut Extraction, primary: &TableSchema) -> Option<Expr> {
        // "top 5 customers by amount": a numeric grouping term is really the ranking.
        let numeric_group = out.group_by.iter().position(|g| match g {
            Expr::Column(c) => self
                .schema
                .table(&c.table)
                .and_then(|t| t.column(&c.column))
                .map(|info| is_measure(info.column_type, &info.name, &info.key_role))
                .unwrap_or(false),
            _ => false,
        });
        if let Some(idx) = numeric_group {
            let expr = out.group_by.remove(idx);
            if let Expr::Column(col) = &expr {
                if let Some(agg) = out.aggregates.iter().find(
                    |a| matches!(a, Expr::Aggregate { arg: Some(arg), .. } if arg == col),
                ) {
                    return Some(agg.clone());
                }
            }
            return Some(expr);
        }
        if let Some(first) = out.aggregates.first() {
            return Some(first.clone());
        }
        default_measure(primary).map(Expr::Column)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn mask(text: &mut String, range: Range<usize>) {
    let blank = " ".repeat(range.len());
    text.replace_range(range, &blank);
}

fn span(c: &Captures<'_>) -> Range<usize> {
    c.get(0).map(|m| m.range()).unwrap_or(0..0)
}

/// Owned captures of every match, with group 0 dropped so that `c[0]` is the
/// first capture group.
struct Groups {
    groups: Vec<Option<(Range<usize>, String)>>,
    start: usize,
}

impl Groups {
    fn get(&self, idx: usize) -> Option<&str> {
        self.groups
            .get(idx)
            .and_then(|g| g.as_ref())
            .map(|(_, s)| s.as_str())
    }

    /// Length of the match up to the end of group `idx` (or the whole first
    /// group when `idx` is absent).
    fn len_through(&self, idx: usize) -> usize {
        self.groups
            .get(idx)
            .and_then(|g| g.as_ref())
            .or_else(|| self.groups.first().and_then(|g| g.as_ref()))
            .map(|(r, _)| r.end - self.start)
            .unwrap_or(0)
    }
}

impl std::ops::Index<usize> for Groups {
    type Output = str;

    fn index(&self, idx: usize) -> &str {
        self.get(idx).unwrap_or("")
    }
}

fn captures(re: &Regex, text: &str) -> Vec<(Range<usize>, Groups)> {
    re.captures_iter(text)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let groups = (1..c.len())
                .map(|i| c.get(i).map(|m| (m.range(), m.as_str().to_string())))
                .collect();
            Some((
                whole.range(),
                Groups {
                    groups,
                    start: whole.start(),
                },
            ))
        })
        .collect()
}

fn chart_request(word: &str) -> Option<ChartRequest> {
    match word.to_lowercase().as_str() {
        "bar" => Some(ChartRequest::Bar),
        "line" => Some(ChartRequest::Line),
        "histogram" => Some(ChartRequest::Histogram),
        "table" => Some(ChartRequest::Table),
        _ => None,
    }
}

fn aggregate_word(phrase: &str) -> Option<AggregateFn> {
    let lower = phrase.to_lowercase();
    let head = lower.split_whitespace().next().unwrap_or("");
    match head {
        "how" | "number" | "count" => Some(AggregateFn::Count),
        "sum" | "total" => Some(AggregateFn::Sum),
        "average" | "avg" | "mean" => Some(AggregateFn::Avg),
        "maximum" | "max" | "highest" | "largest" => Some(AggregateFn::Max),
        "minimum" | "min" | "lowest" | "smallest" => Some(AggregateFn::Min),
        _ => None,
    }
}

fn comparison_op(phrase: &str) -> CompareOp {
    let lower = phrase.to_lowercase();
    if lower.contains("least") {
        CompareOp::Gte
    } else if lower.contains("most") {
        CompareOp::Lte
    } else if ["less", "lower", "fewer", "smaller", "below", "under"]
        .iter()
        .any(|w| lower.starts_with(w))
    {
        CompareOp::Lt
    } else {
        CompareOp::Gt
    }
}

fn like_pattern(verb: &str, value: &str) -> String {
    if value.contains('%') || verb == "like" {
        return value.to_string();
    }
    if verb.starts_with("starting") {
        format!("{value}%")
    } else if verb.starts_with("ending") {
        format!("%{value}")
    } else {
        format!("%{value}%")
    }
}

/// Parse a filter value. Quoted values are always text.
fn parse_value(raw: &str) -> Literal {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Literal::Text(raw[1..raw.len() - 1].replace("''", "'"));
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Literal::Text(raw[1..raw.len() - 1].to_string());
    }
    Literal::parse(raw)
}

fn split_items(list: &str) -> Vec<String> {
    list.split(',')
        .flat_map(|part| part.split(" and "))
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_key(role: &KeyRole, name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !matches!(role, KeyRole::None) || lower == "id" || lower.ends_with("_id")
}

fn is_measure(column_type: ColumnType, name: &str, role: &KeyRole) -> bool {
    column_type.is_numeric() && !is_key(role, name) && !is_temporal_name(name)
}

/// First numeric, non-key, non-calendar column of `table`.
pub(crate) fn default_measure(table: &TableSchema) -> Option<ColumnRef> {
    table
        .columns
        .iter()
        .find(|c| is_measure(c.column_type, &c.name, &c.key_role))
        .map(|c| ColumnRef::new(table.name.clone(), c.name.clone()))
}

/// Column that names a row for display: first text non-key column, else the
/// first non-key column, else the first column.
pub(crate) fn label_column(table: &TableSchema) -> Option<ColumnRef> {
    table
        .columns
        .iter()
        .find(|c| c.column_type == ColumnType::Text && !is_key(&c.key_role, &c.name))
        .or_else(|| table.columns.iter().find(|c| !is_key(&c.key_role, &c.name)))
        .or_else(|| table.columns.first())
        .map(|c| ColumnRef::new(table.name.clone(), c.name.clone()))
}

/// First date or timestamp column in scope, by declared type or by name.
fn temporal_column(scope: &[&TableSchema]) -> Option<ColumnRef> {
    let by_type = scope.iter().find_map(|t| {
        t.columns
            .iter()
            .find(|c| c.column_type.is_temporal())
            .map(|c| ColumnRef::new(t.name.clone(), c.name.clone()))
    });
    by_type.or_else(|| {
        scope.iter().find_map(|t| {
            t.columns
                .iter()
                .find(|c| {
                    let lower = c.name.to_ascii_lowercase();
                    lower == "date" || lower.ends_with("_date") || lower.ends_with("_at")
                })
                .map(|c| ColumnRef::new(t.name.clone(), c.name.clone()))
        })
    })
}
