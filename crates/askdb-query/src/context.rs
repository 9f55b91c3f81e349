//! Conversation context management.
//!
//! Builds the bounded, relevance-filtered window of prior turns that the
//! resolver, classifier and generator consult for the current utterance.

use std::collections::HashSet;

use tracing::debug;

use askdb_core::config::ContextConfig;
use askdb_core::query::ResolvedQuerySpec;
use askdb_core::types::{SchemaDescriptor, Session, Turn};

use crate::text::{content_terms, is_literal, quoted_values, singularize, tokenize};

// =============================================================================
// ContextWindow
// =============================================================================

/// A prior turn admitted to the window, with its decayed relevance score.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub turn: Turn,
    pub score: f64,
}

/// Chronologically ordered, relevance-filtered subset of a session's
/// successful turns. Never mixes sessions.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    entries: Vec<WindowEntry>,
}

impl ContextWindow {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a window directly from turns, oldest first. Failed turns are skipped.
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self {
            entries: turns
                .into_iter()
                .filter(|t| !t.is_failed())
                .map(|turn| WindowEntry { turn, score: 1.0 })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[WindowEntry] {
        &self.entries
    }

    /// Turns, oldest first.
    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &Turn> {
        self.entries.iter().map(|e| &e.turn)
    }

    pub fn most_recent(&self) -> Option<&Turn> {
        self.entries.last().map(|e| &e.turn)
    }

    /// Nearest turn (most recent first) satisfying `pred`.
    pub fn nearest<F>(&self, pred: F) -> Option<&Turn>
    where
        F: Fn(&Turn) -> bool,
    {
        self.turns().rev().find(|t| pred(t))
    }

    /// Spec of the nearest turn that fetched rows.
    pub fn nearest_rows_spec(&self) -> Option<(&Turn, &ResolvedQuerySpec)> {
        self.turns().rev().find_map(|t| match &t.query_spec {
            Some(spec) if spec.is_rows() => Some((t, spec)),
            _ => None,
        })
    }

    /// Resolved utterances of the window, oldest first, one per line.
    pub fn transcript(&self) -> String {
        self.turns()
            .map(|t| match &t.generated_sql {
                Some(sql) => format!("Q: {}\nSQL: {}", t.resolved_utterance, sql),
                None => format!("Q: {}", t.resolved_utterance),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =============================================================================
// ContextManager
// =============================================================================

/// Selects which prior turns are relevant to a new utterance.
#[derive(Debug, Clone)]
pub struct ContextManager {
    config: ContextConfig,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the context window for `utterance`.
    ///
    /// Failed turns and turns of other sessions are dropped before the last
    /// `max_turns` are taken. Each candidate is scored by weighted overlap
    /// with the utterance, decayed by age; candidates at or above the
    /// threshold are kept and the most recent candidate is always kept.
    pub fn build_window(
        &self,
        session: &Session,
        utterance: &str,
        schema: Option<&SchemaDescriptor>,
    ) -> ContextWindow {
        let eligible: Vec<&Turn> = session
            .turns
            .iter()
            .filter(|t| !t.is_failed() && t.session_id == session.session_id)
            .collect();
        let start = eligible.len().saturating_sub(self.config.max_turns);
        let candidates = &eligible[start..];
        if candidates.is_empty() {
            return ContextWindow::empty();
        }

        let schema_ids: HashSet<String> = schema
            .map(|s| s.identifiers().into_iter().collect())
            .unwrap_or_default();
        let newest = candidates.len() - 1;

        let mut entries = Vec::new();
        for (idx, turn) in candidates.iter().enumerate() {
            let age = (newest - idx) as i32;
            let overlap = self.overlap(utterance, turn, &schema_ids);
            let score = overlap * self.config.recency_decay.powi(age);
            let keep = idx == newest || score >= self.config.relevance_threshold;
            debug!(
                turn_id = %turn.turn_id,
                age,
                score,
                keep,
                "Scored context candidate"
            );
            if keep {
                entries.push(WindowEntry {
                    turn: (*turn).clone(),
                    score,
                });
            }
        }

        ContextWindow { entries }
    }

    /// Weighted share of the utterance's terms found in `turn`, in `0.0..=1.0`.
    pub fn overlap(&self, utterance: &str, turn: &Turn, schema_ids: &HashSet<String>) -> f64 {
        let mut turn_terms: HashSet<String> = HashSet::new();
        turn_terms.extend(tokenize(&turn.resolved_utterance));
        turn_terms.extend(quoted_values(&turn.resolved_utterance));
        if let Some(sql) = &turn.generated_sql {
            turn_terms.extend(tokenize(sql));
            turn_terms.extend(quoted_values(sql));
        }
        let mut spec_ids: HashSet<String> = HashSet::new();
        if let Some(spec) = &turn.query_spec {
            spec_ids.extend(spec.identifiers());
            turn_terms.extend(spec.identifiers());
            turn_terms.extend(spec.literals());
        }
        let turn_singulars: HashSet<String> = turn_terms.iter().map(|t| singularize(t)).collect();

        let quoted = quoted_values(utterance);
        let mut terms: Vec<String> = content_terms(utterance);
        terms.extend(quoted.iter().cloned());
        terms.sort();
        terms.dedup();

        let mut total = 0.0;
        let mut matched = 0.0;
        for term in &terms {
            let singular = singularize(term);
            let weight = if is_literal(term) || quoted.contains(term) {
                self.config.literal_weight
            } else if schema_ids.contains(term)
                || schema_ids.contains(&singular)
                || spec_ids.contains(term)
                || spec_ids.iter().any(|id| singularize(id) == singular)
            {
                self.config.identifier_weight
            } else {
                self.config.term_weight
            };
            total += weight;
            if turn_terms.contains(term) || turn_singulars.contains(&singular) {
                matched += weight;
            }
        }

        if total == 0.0 {
            0.0
        } else {
            matched / total
        }
    }
}
