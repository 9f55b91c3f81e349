//! Query classification.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use askdb_core::safety::mutating_verb;
use askdb_core::types::{QueryClass, SchemaDescriptor};

use crate::context::ContextWindow;
use crate::text::{is_stop_word, tokenize, IdentifierMatcher};

struct ClassPatterns {
    schema: Vec<Regex>,
    data: Vec<Regex>,
}

static PATTERNS: LazyLock<ClassPatterns> = LazyLock::new(|| {
    let mk = |pats: &[&str]| -> Vec<Regex> {
        pats.iter()
            .map(|p| Regex::new(p).expect("Invalid classifier regex"))
            .collect()
    };

    ClassPatterns {
        schema: mk(&[
            r"(?i)\btables?\b",
            r"(?i)\bcolumns?\b",
            r"(?i)\bschemas?\b",
            r"(?i)\bstructure\b",
            r"(?i)\bdescribe\b",
            r"(?i)\bfields?\b",
        ]),
        data: mk(&[
            r"(?i)\b(?:select|show|find|get|list|count|sum|average|avg|total|max|min|top|bottom)\b",
            r"(?i)\b(?:chart|graph|plot|visuali[sz]e|analy[sz]e|display|give)\b",
            r"(?i)\bhow\s+(?:many|much)\b",
            r"(?i)\b(?:which|what)\s+(?:\w+\s+)?(?:has|have|had|is|are|were)\s+the\s+(?:most|highest|lowest|least)\b",
        ]),
    }
});

/// Result of classifying one resolved utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub class: QueryClass,
    /// No rule fired; a language model may be consulted. Advisory only.
    pub ambiguous: bool,
}

impl Classification {
    pub fn new(class: QueryClass) -> Self {
        Self {
            class,
            ambiguous: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryClassifier {
    matcher: IdentifierMatcher,
}

impl QueryClassifier {
    pub fn new(matcher: IdentifierMatcher) -> Self {
        Self { matcher }
    }

    /// Classify `utterance` (already resolved). Rules apply in order:
    /// mutating verbs, schema keywords, follow-up, data cues, fallback.
    pub fn classify(
        &self,
        utterance: &str,
        used_references: bool,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
    ) -> Classification {
        // Routed to the generator so it can reject them with a precise error.
        if mutating_verb(utterance).is_some() {
            return Classification::new(QueryClass::Data);
        }

        if PATTERNS.schema.iter().any(|re| re.is_match(utterance))
            && !PATTERNS.data[1].is_match(utterance)
        {
            return Classification::new(QueryClass::Schema);
        }

        if used_references || self.continues_previous(utterance, window, schema) {
            return Classification::new(QueryClass::FollowUp);
        }

        if PATTERNS.data.iter().any(|re| re.is_match(utterance))
            || !self.tables_named(utterance, schema).is_empty()
        {
            return Classification::new(QueryClass::Data);
        }

        Classification {
            class: QueryClass::General,
            ambiguous: true,
        }
    }

    /// Shares a table or column with the immediately preceding turn and names
    /// no table that turn did not use.
    fn continues_previous(
        &self,
        utterance: &str,
        window: &ContextWindow,
        schema: &SchemaDescriptor,
    ) -> bool {
        let Some(previous) = window.most_recent() else {
            return false;
        };
        let Some(spec) = previous.query_spec.as_ref().filter(|s| s.is_rows()) else {
            return false;
        };

        let named = self.tables_named(utterance, schema);
        if named.iter().any(|t| !spec.has_table(t)) {
            return false;
        }
        if !named.is_empty() {
            return true;
        }

        let mut ids = spec.identifiers();
        for table in spec.tables.iter().filter_map(|t| schema.table(t)) {
            ids.extend(table.columns.iter().map(|c| c.name.to_lowercase()));
        }
        tokenize(utterance)
            .iter()
            .filter(|w| !is_stop_word(w))
            .any(|w| ids.iter().any(|id| id == w))
    }

    fn tables_named(&self, utterance: &str, schema: &SchemaDescriptor) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for word in tokenize(utterance) {
            if is_stop_word(&word) || word.len() < 3 {
                continue;
            }
            // Exact column names are not table mentions.
            if schema.tables.iter().any(|t| t.column(&word).is_some())
                && schema.table(&word).is_none()
            {
                continue;
            }
            if let Some(t) = self.matcher.match_table(&word, schema) {
                if !out.iter().any(|x| x == t) {
                    out.push(t.to_string());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_core::query::ResolvedQuerySpec;
    use askdb_core::types::{ColumnInfo, SessionId, TableSchema, Turn};

    fn make_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            TableSchema::new(
                "sales",
                vec![
                    ColumnInfo::new("region", "TEXT"),
                    ColumnInfo::new("amount", "REAL"),
                ],
            ),
            TableSchema::new("customers", vec![ColumnInfo::new("name", "TEXT")]),
        ])
    }

    fn make_window_on(table: &str) -> ContextWindow {
        let mut turn = Turn::new(SessionId::new(), format!("show {table}"));
        turn.query_spec = Some(ResolvedQuerySpec::rows(table));
        ContextWindow::from_turns(vec![turn])
    }

    fn classify(utterance: &str, used: bool, window: &ContextWindow) -> Classification {
        QueryClassifier::default().classify(utterance, used, window, &make_schema())
    }

    #[test]
    fn test_mutating_verbs_route_to_data() {
        let c = classify("delete all customers", false, &ContextWindow::empty());
        assert_eq!(c.class, QueryClass::Data);
        let c = classify("drop the sales table", false, &ContextWindow::empty());
        assert_eq!(c.class, QueryClass::Data);
    }

    #[test]
    fn test_schema_keywords() {
        let empty = ContextWindow::empty();
        assert_eq!(classify("what tables are there?", false, &empty).class, QueryClass::Schema);
        assert_eq!(classify("describe customers", false, &empty).class, QueryClass::Schema);
        assert_eq!(
            classify("which columns does sales have", false, &empty).class,
            QueryClass::Schema
        );
    }

    #[test]
    fn test_chart_request_is_not_schema() {
        let c = classify("show sales as a table chart", false, &ContextWindow::empty());
        assert_eq!(c.class, QueryClass::Data);
    }

    #[test]
    fn test_used_references_is_followup() {
        let c = classify("sales data for year=2020", true, &make_window_on("sales"));
        assert_eq!(c.class, QueryClass::FollowUp);
    }

    #[test]
    fn test_shared_identifier_is_followup() {
        let c = classify("only region West", false, &make_window_on("sales"));
        assert_eq!(c.class, QueryClass::FollowUp);
    }

    #[test]
    fn test_new_table_is_not_followup() {
        let c = classify("show me all customers", false, &make_window_on("sales"));
        assert_eq!(c.class, QueryClass::Data);
    }

    #[test]
    fn test_data_verbs_and_tables() {
        let empty = ContextWindow::empty();
        assert_eq!(classify("how many customers", false, &empty).class, QueryClass::Data);
        assert_eq!(classify("customers", false, &empty).class, QueryClass::Data);
    }

    #[test]
    fn test_general_is_ambiguous() {
        let c = classify("hello, who are you?", false, &ContextWindow::empty());
        assert_eq!(c.class, QueryClass::General);
        assert!(c.ambiguous);
    }
}
