//! Reference resolution.
//!
//! Rewrites referential, elliptical and relative-time language into a
//! self-contained request using the nearest qualifying turn of the context
//! window as antecedent.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use askdb_core::query::{
    AggregateFn, ColumnRef, CompareOp, DatePart, Expr, Literal, Predicate, QueryKind,
    ResolvedQuerySpec,
};
use askdb_core::types::{SchemaDescriptor, TurnId};

use crate::context::ContextWindow;
use crate::text::{is_stop_word, same_word, tokenize};

// =============================================================================
// Compiled regex sets
// =============================================================================

struct ReferencePatterns {
    temporal: Regex,
    what_about: Regex,
    instead: Regex,
    anaphora: Regex,
    demonstrative: Regex,
    verb_anaphor: Regex,
    predicate: Regex,
    date_call: Regex,
}

static PATTERNS: LazyLock<ReferencePatterns> = LazyLock::new(|| {
    let mk = |pat: &str| Regex::new(pat).expect("Invalid reference regex");
    ReferencePatterns {
        temporal: mk(
            r"(?i)\b(?:(next|following|last|previous|prior)\s+(year|month)|the\s+(year|month)\s+(before|after))\b",
        ),
        what_about: mk(r"(?i)^\s*(?:and\s+|ok\s+|okay\s+|so\s+|then\s+)?(?:what|how)\s+about\s+(.+?)[\s?.!]*$"),
        instead: mk(r"(?i)^\s*(.+?)\s+instead[\s?.!]*$"),
        anaphora: mk(
            r"(?i)\b(the\s+previous\s+results?|the\s+previous\s+one|the\s+last\s+one|the\s+same|it|them)\b",
        ),
        demonstrative: mk(
            r"(?i)\b(this|that|these|those)(?:\s+(data|results?|query|ones?)\b|(\s+(?:by|for|in|as|with|into|to|again|sorted|ordered|grouped|but|and|per|from|instead|chart|graph)\b)|\s*[?.!]*\s*$)",
        ),
        verb_anaphor: mk(
            r"(?i)^\s*(?:now\s+|please\s+|can\s+you\s+|could\s+you\s+)?(sort|order|group|break\s+down|limit|filter|chart|plot)\s+(?:it|them|that|those|these|this|the\s+results?)\s+(.+?)[\s?.!]*$",
        ),
        predicate: mk(
            r#"(?i)^([a-z_][a-z0-9_]*(?:\([a-z_][a-z0-9_]*\))?)\s*(>=|<=|!=|<>|=|>|<)\s*('(?:[^']|'')*'|"[^"]*"|-?[a-z0-9_.\-]+)$"#,
        ),
        date_call: mk(r"(?i)^(year|month|day)\(([a-z_][a-z0-9_]*)\)$"),
    }
});

// =============================================================================
// Types
// =============================================================================

/// One substitution made while resolving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceUse {
    /// Phrase as it appeared in the utterance.
    pub trigger: String,
    pub replacement: String,
    /// Antecedent turn; `None` when the replacement came from the wall clock.
    pub turn_id: Option<TurnId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub utterance: String,
    /// True when at least one substitution drew on a prior turn.
    pub used_references: bool,
    pub references: Vec<ReferenceUse>,
    /// Trigger phrases that could not be resolved.
    pub unresolved: Vec<String>,
}

impl Resolution {
    fn unchanged(utterance: &str) -> Self {
        Self {
            utterance: utterance.to_string(),
            used_references: false,
            references: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        !self.unresolved.is_empty()
    }
}

/// Antecedent drawn from the window.
struct Antecedent {
    turn_id: TurnId,
    spec: ResolvedQuerySpec,
}

// =============================================================================
// ReferenceResolver
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ReferenceResolver {
    tables: Vec<String>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver that recognizes the schema's table names in elliptical phrases.
    pub fn for_schema(schema: &SchemaDescriptor) -> Self {
        Self {
            tables: schema.table_names().map(str::to_string).collect(),
        }
    }

    pub fn resolve(&self, utterance: &str, window: &ContextWindow) -> Resolution {
        self.resolve_at(utterance, window, Utc::now())
    }

    /// Resolve against `window`, using `now` as the anchor for relative time
    /// phrases when no prior turn carries a time filter.
    pub fn resolve_at(
        &self,
        utterance: &str,
        window: &ContextWindow,
        now: DateTime<Utc>,
    ) -> Resolution {
        let p = &*PATTERNS;
        let has_temporal = p.temporal.is_match(utterance);
        let has_elliptical = p.what_about.is_match(utterance) || p.instead.is_match(utterance);
        let has_anaphor = has_anaphor(utterance);
        if !(has_temporal || has_elliptical || has_anaphor) {
            return Resolution::unchanged(utterance);
        }

        let antecedent = find_antecedent(window);
        let mut out = Resolution::unchanged(utterance);

        // Relative time first: "what about last year?" becomes "what about year=2018?".
        let mut text = utterance.to_string();
        let mut temporal_only = false;
        if has_temporal {
            let (rewritten, uses) = self.substitute_temporal(&text, antecedent.as_ref(), now);
            let stripped = strip_phrases(&rewritten, uses.iter().map(|u| u.replacement.as_str()));
            temporal_only = tokenize(&stripped).iter().all(|w| is_filler_word(w));
            text = rewritten;
            out.references.extend(uses);
        }

        let Some(base) = antecedent else {
            // Only wall-clock substitutions are possible without an antecedent.
            if has_elliptical || has_anaphor {
                out.unresolved.push(utterance.trim().to_string());
                debug!(utterance, "No antecedent for reference");
                return Resolution {
                    utterance: utterance.to_string(),
                    ..out
                };
            }
            out.utterance = text;
            return out;
        };

        if let Some(resolved) = self.resolve_elliptical(&text, &base, temporal_only) {
            match resolved {
                Ok((trigger, spec)) => {
                    let replacement = spec.describe();
                    out.references.push(ReferenceUse {
                        trigger,
                        replacement: replacement.clone(),
                        turn_id: Some(base.turn_id),
                    });
                    out.utterance = replacement;
                }
                Err(phrase) => {
                    out.unresolved.push(phrase);
                    out.utterance = utterance.to_string();
                    out.references.clear();
                }
            }
        } else if has_anaphor {
            let (rewritten, uses) = substitute_anaphora(&text, &base);
            out.references.extend(uses);
            out.utterance = rewritten;
        } else {
            out.utterance = text;
        }

        out.used_references = out.references.iter().any(|r| r.turn_id.is_some());
        debug!(
            used_references = out.used_references,
            resolved = %out.utterance,
            "Resolved references"
        );
        out
    }

    // ---- Relative time ----

    fn substitute_temporal(
        &self,
        text: &str,
        base: Option<&Antecedent>,
        now: DateTime<Utc>,
    ) -> (String, Vec<ReferenceUse>) {
        let mut uses = Vec::new();
        let rewritten = PATTERNS
            .temporal
            .replace_all(text, |c: &regex::Captures<'_>| {
                let (unit, step) = match (c.get(1), c.get(2), c.get(3), c.get(4)) {
                    (Some(dir), Some(unit), _, _) => {
                        let forward = matches!(dir.as_str().to_lowercase().as_str(), "next" | "following");
                        (unit.as_str().to_lowercase(), if forward { 1 } else { -1 })
                    }
                    (_, _, Some(unit), Some(dir)) => {
                        let forward = dir.as_str().eq_ignore_ascii_case("after");
                        (unit.as_str().to_lowercase(), if forward { 1 } else { -1 })
                    }
                    _ => return c[0].to_string(),
                };
                let part = if unit == "month" {
                    DatePart::Month
                } else {
                    DatePart::Year
                };
                let (replacement, turn_id) = match base.and_then(|b| shift_anchor(&b.spec, part, step, now)) {
                    Some(text) => (text, base.map(|b| b.turn_id)),
                    None => (wall_clock(part, step, now), None),
                };
                uses.push(ReferenceUse {
                    trigger: c[0].to_string(),
                    replacement: replacement.clone(),
                    turn_id,
                });
                replacement
            })
            .into_owned();
        (rewritten, uses)
    }

    // ---- Ellipsis ----

    /// `None` when the utterance is not elliptical. `Err` carries the phrase
    /// that could not be applied to the antecedent.
    fn resolve_elliptical(
        &self,
        text: &str,
        base: &Antecedent,
        temporal_only: bool,
    ) -> Option<Result<(String, ResolvedQuerySpec), String>> {
        let p = &*PATTERNS;
        let (trigger, phrase) = if let Some(c) = p.what_about.captures(text) {
            (c[0].trim().to_string(), c[1].to_string())
        } else if let Some(c) = p.instead.captures(text) {
            (c[0].trim().to_string(), c[1].to_string())
        } else if temporal_only {
            // Trim filler at the ends only; the "and" between substituted
            // predicates has to survive.
            let words: Vec<&str> = text.split_whitespace().collect();
            let is_content = |w: &&str| !is_filler_word(&w.to_lowercase());
            let start = words.iter().position(is_content).unwrap_or(words.len());
            let end = words.iter().rposition(is_content).map_or(start, |i| i + 1);
            (text.trim().to_string(), words[start..end].join(" "))
        } else {
            return None;
        };

        // "what about those by region" is an anaphor, not a bare replacement.
        if has_anaphor(&phrase) {
            return None;
        }

        let phrase = normalize_phrase(&phrase);
        if phrase.is_empty() {
            return Some(Err(trigger));
        }
        Some(
            self.apply_phrase(&phrase, &base.spec)
                .map(|spec| (trigger, spec))
                .ok_or(phrase),
        )
    }

    fn apply_phrase(&self, phrase: &str, base: &ResolvedQuerySpec) -> Option<ResolvedQuerySpec> {
        let mut spec = base.clone();

        // One or more predicates: "year=2020", "region = 'West' and year=2020".
        let parts: Vec<&str> = phrase.split(" and ").map(str::trim).collect();
        let preds: Option<Vec<Predicate>> = parts.iter().map(|p| parse_predicate(p, base)).collect();
        if let Some(preds) = preds {
            for pred in preds {
                spec.upsert_filter(pred);
            }
            return Some(spec);
        }

        // A bare number replaces the time filter, else the last numeric filter.
        if let Literal::Integer(_) | Literal::Float(_) = Literal::parse(phrase) {
            let value = Literal::parse(phrase);
            let target = spec
                .temporal_filter()
                .cloned()
                .or_else(|| spec.filters.iter().rev().find(|f| f.value.is_numeric()).cloned());
            if let Some(old) = target {
                spec.upsert_filter(Predicate::new(old.expr, old.op, value));
                return Some(spec);
            }
            if matches!(value, Literal::Integer(y) if (1900..=2100).contains(&y)) {
                let table = spec.primary_table().unwrap_or_default().to_string();
                spec.upsert_filter(Predicate::new(
                    Expr::column(table, "year"),
                    CompareOp::Eq,
                    value,
                ));
                return Some(spec);
            }
            return None;
        }

        // A table name swaps the subject.
        if let Some(table) = self.known_table(phrase) {
            return Some(swap_subject(base, &table));
        }

        let unquoted = phrase.trim_matches(|c| c == '\'' || c == '"').to_string();
        if let Some(idx) = spec
            .filters
            .iter()
            .rposition(|f| matches!(f.value, Literal::Text(_)) && f.op == CompareOp::Eq)
        {
            spec.filters[idx].value = Literal::Text(unquoted);
            return Some(spec);
        }

        // Without a schema to consult, a single word is taken as a table.
        if self.tables.is_empty() && !phrase.contains(' ') {
            return Some(swap_subject(base, phrase));
        }
        None
    }

    fn known_table(&self, phrase: &str) -> Option<String> {
        let words = tokenize(phrase);
        let joined = words.join("_");
        let candidates = std::iter::once(joined.as_str())
            .chain(words.iter().map(String::as_str).filter(|w| !is_stop_word(w)));
        for word in candidates {
            if let Some(t) = self.tables.iter().find(|t| same_word(t, word)) {
                return Some(t.clone());
            }
        }
        None
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn find_antecedent(window: &ContextWindow) -> Option<Antecedent> {
    if let Some((turn, spec)) = window.nearest_rows_spec() {
        return Some(Antecedent {
            turn_id: turn.turn_id,
            spec: spec.clone(),
        });
    }
    window.turns().rev().find_map(|t| match &t.query_spec {
        Some(ResolvedQuerySpec {
            kind: QueryKind::DescribeTable { table },
            ..
        }) => Some(Antecedent {
            turn_id: t.turn_id,
            spec: ResolvedQuerySpec::rows(table.clone()),
        }),
        _ => None,
    })
}

fn has_anaphor(text: &str) -> bool {
    PATTERNS.anaphora.is_match(text) || PATTERNS.demonstrative.is_match(text)
}

fn is_filler_word(word: &str) -> bool {
    is_stop_word(word) || matches!(word, "ok" | "okay" | "then" | "so" | "well" | "now")
}

fn normalize_phrase(phrase: &str) -> String {
    let mut out = phrase.trim().trim_end_matches(['?', '.', '!']).trim().to_string();
    loop {
        let lower = out.to_lowercase();
        let prefix = ["the ", "for ", "in ", "with ", "only ", "just ", "during "]
            .iter()
            .find(|p| lower.starts_with(*p));
        match prefix {
            Some(p) => out = out[p.len()..].trim_start().to_string(),
            None => break,
        }
    }
    out
}

fn strip_phrases<'a>(text: &str, phrases: impl Iterator<Item = &'a str>) -> String {
    let mut out = text.to_string();
    for phrase in phrases {
        out = out.replace(phrase, " ");
    }
    out
}

/// Move the antecedent's time filter by `step` units of `part`, rendered as
/// predicates ("year=2020", "year(order_date)=2020 and month(order_date)=1").
///
/// A month step against an antecedent that filters only on the year keeps
/// that year and takes the month from `now`.
fn shift_anchor(
    spec: &ResolvedQuerySpec,
    part: DatePart,
    step: i64,
    now: DateTime<Utc>,
) -> Option<String> {
    let matches_part = |expr: &Expr, want: DatePart| match expr {
        Expr::DatePart { part, .. } => *part == want,
        Expr::Column(c) => c.column.to_lowercase().contains(want.as_str()),
        _ => false,
    };
    let find = |want: DatePart| {
        spec.filters
            .iter()
            .find(|f| f.op == CompareOp::Eq && matches_part(&f.expr, want))
            .and_then(|f| match f.value {
                Literal::Integer(v) => Some((f.expr.clone(), v)),
                _ => None,
            })
    };

    match part {
        DatePart::Year => {
            let (expr, year) = find(DatePart::Year)?;
            Some(format!("{}={}", expr, year + step))
        }
        DatePart::Month => {
            let Some((expr, month)) = find(DatePart::Month) else {
                let (year_expr, year) = find(DatePart::Year)?;
                let (month, year_shift) = step_month(i64::from(now.month()), step);
                let month_expr = match &year_expr {
                    Expr::DatePart { column, .. } => Expr::DatePart {
                        part: DatePart::Month,
                        column: column.clone(),
                    }
                    .to_string(),
                    _ => DatePart::Month.as_str().to_string(),
                };
                return Some(format!(
                    "{}={} and {}={}",
                    year_expr,
                    year + year_shift,
                    month_expr,
                    month
                ));
            };
            let (shifted, year_shift) = step_month(month, step);
            let month_text = format!("{}={}", expr, shifted);
            match (year_shift, find(DatePart::Year)) {
                (0, _) | (_, None) => Some(month_text),
                (shift, Some((year_expr, year))) => {
                    Some(format!("{}={} and {}", year_expr, year + shift, month_text))
                }
            }
        }
        DatePart::Day => None,
    }
}

/// Month `step` away from `month`, with the year carry.
fn step_month(month: i64, step: i64) -> (i64, i64) {
    let shifted = month + step;
    if shifted > 12 {
        (1, 1)
    } else if shifted < 1 {
        (12, -1)
    } else {
        (shifted, 0)
    }
}

fn wall_clock(part: DatePart, step: i64, now: DateTime<Utc>) -> String {
    let year = i64::from(now.year());
    match part {
        DatePart::Month => {
            let (month, year_shift) = step_month(i64::from(now.month()), step);
            format!("year={} and month={month}", year + year_shift)
        }
        _ => format!("year={}", year + step),
    }
}

fn parse_predicate(text: &str, base: &ResolvedQuerySpec) -> Option<Predicate> {
    let c = PATTERNS.predicate.captures(text.trim())?;
    let op = CompareOp::parse(&c[2])?;
    let raw = c[3].trim();
    let value = if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        Literal::Text(raw[1..raw.len() - 1].replace("''", "'"))
    } else {
        Literal::parse(raw)
    };
    let name = c[1].to_lowercase();
    let expr = if let Some(d) = PATTERNS.date_call.captures(&name) {
        Expr::DatePart {
            part: DatePart::parse(&d[1])?,
            column: column_in(base, &d[2]),
        }
    } else {
        // Keep the antecedent's own rendering of a calendar filter.
        base.filters
            .iter()
            .map(|f| &f.expr)
            .find(|e| e.to_string() == name)
            .cloned()
            .unwrap_or_else(|| Expr::Column(column_in(base, &name)))
    };
    Some(Predicate::new(expr, op, value))
}

fn column_in(base: &ResolvedQuerySpec, column: &str) -> ColumnRef {
    base.column_refs()
        .into_iter()
        .find(|c| c.column.eq_ignore_ascii_case(column))
        .cloned()
        .unwrap_or_else(|| ColumnRef::new(base.primary_table().unwrap_or_default(), column))
}

fn swap_subject(base: &ResolvedQuerySpec, table: &str) -> ResolvedQuerySpec {
    let mut spec = ResolvedQuerySpec::rows(table);
    spec.limit = base.limit;
    spec.chart_request = base.chart_request;
    if let Some(count) = base.projections.iter().find(|e| {
        matches!(
            e,
            Expr::Aggregate {
                func: AggregateFn::Count,
                arg: None
            }
        )
    }) {
        spec.projections.push(count.clone());
    }
    spec
}

/// Replace anaphors with the antecedent's description.
fn substitute_anaphora(text: &str, base: &Antecedent) -> (String, Vec<ReferenceUse>) {
    let description = base.spec.describe();
    let p = &*PATTERNS;

    // "sort it by amount" keeps the verb's meaning after the description.
    if let Some(c) = p.verb_anaphor.captures(text) {
        let verb = c[1].to_lowercase();
        let rest = c[2].trim();
        let connector = match verb.as_str() {
            "sort" => "sorted",
            "order" => "ordered",
            "group" => "grouped",
            "limit" => "limit",
            "chart" | "plot" => "",
            v if v.starts_with("break") => "broken down",
            _ => "",
        };
        let rewritten = [description.as_str(), connector, rest]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        let uses = vec![ReferenceUse {
            trigger: c[0].trim().to_string(),
            replacement: rewritten.clone(),
            turn_id: Some(base.turn_id),
        }];
        return (rewritten, uses);
    }

    let mut uses = Vec::new();
    let after_anaphora = p
        .anaphora
        .replace_all(text, |c: &regex::Captures<'_>| {
            uses.push(ReferenceUse {
                trigger: c[0].to_string(),
                replacement: description.clone(),
                turn_id: Some(base.turn_id),
            });
            description.clone()
        })
        .into_owned();
    let rewritten = p
        .demonstrative
        .replace_all(&after_anaphora, |c: &regex::Captures<'_>| {
            let tail = c.get(3).map(|m| m.as_str()).unwrap_or("");
            uses.push(ReferenceUse {
                trigger: c[0].trim().to_string(),
                replacement: description.clone(),
                turn_id: Some(base.turn_id),
            });
            format!("{description}{tail}")
        })
        .into_owned();
    (rewritten, uses)
}
