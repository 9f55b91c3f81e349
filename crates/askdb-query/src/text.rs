//! Tokenizing and identifier matching shared by the pipeline stages.

use strsim::jaro_winkler;

use askdb_core::types::{SchemaDescriptor, TableSchema};

pub(crate) static STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "do", "does", "did", "i", "me",
    "my", "we", "our", "you", "your", "of", "in", "to", "for", "with", "on", "at", "from", "by",
    "about", "as", "into", "and", "or", "not", "no", "so", "if", "then", "than", "too", "very",
    "just", "also", "all", "any", "some", "please", "can", "could", "would", "will", "what",
    "which", "who", "how", "when", "where", "there", "here", "it", "its", "that", "this",
    "those", "these", "them", "they", "give", "show", "list", "get", "find", "display", "see",
    "tell", "let", "lets", "want", "need", "data", "rows", "records", "entries", "every",
    "each", "instead", "again", "same", "previous", "one", "ones", "now", "only", "per",
];

pub(crate) fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Lowercase word tokens. Keeps `_` inside identifiers and `.` inside numbers.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tokens that carry meaning (stop words removed).
pub fn content_terms(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stop_word(t))
        .collect()
}

/// Numbers, years and quoted values count as literals.
pub fn is_literal(token: &str) -> bool {
    token.parse::<f64>().is_ok()
}

/// Values inside single or double quotes, lowercased.
pub fn quoted_values(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for quote in ['\'', '"'] {
        let parts: Vec<&str> = text.split(quote).collect();
        // Odd-indexed segments sit between a pair of quotes.
        for (i, part) in parts.iter().enumerate() {
            if i % 2 == 1 && i + 1 < parts.len() && !part.is_empty() {
                out.push(part.to_lowercase());
            }
        }
    }
    out
}

pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{stem}y");
        }
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with('s') && !word.ends_with("ss") && word.len() > 1 {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

pub fn pluralize(word: &str) -> String {
    if word.ends_with('y')
        && !word.ends_with("ay")
        && !word.ends_with("ey")
        && !word.ends_with("oy")
    {
        return format!("{}ies", &word[..word.len() - 1]);
    }
    if word.ends_with('s') || word.ends_with('x') || word.ends_with("ch") || word.ends_with("sh") {
        return format!("{word}es");
    }
    format!("{word}s")
}

pub(crate) fn same_word(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    a == b || singularize(&a) == singularize(&b) || pluralize(&a) == b || pluralize(&b) == a
}

// =============================================================================
// IdentifierMatcher
// =============================================================================

/// Maps words from an utterance onto schema identifiers.
///
/// Tries, in order: case-insensitive equality, singular/plural forms, a match
/// on one `_`-separated part of the identifier, then Jaro-Winkler similarity
/// at or above the threshold.
#[derive(Debug, Clone)]
pub struct IdentifierMatcher {
    pub similarity_threshold: f64,
}

impl Default for IdentifierMatcher {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.88,
        }
    }
}

impl IdentifierMatcher {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    fn best<'a, I>(&self, term: &str, candidates: I) -> Option<&'a str>
    where
        I: Iterator<Item = &'a str> + Clone,
    {
        let term = term.to_lowercase();
        if term.is_empty() {
            return None;
        }

        if let Some(hit) = candidates.clone().find(|c| c.eq_ignore_ascii_case(&term)) {
            return Some(hit);
        }
        if let Some(hit) = candidates.clone().find(|c| same_word(c, &term)) {
            return Some(hit);
        }
        // "price" -> "unit_price", "customer" -> "customer_id" is skipped by callers
        // that only want non-key columns.
        let parts_hit: Vec<&str> = candidates
            .clone()
            .filter(|c| {
                c.contains('_')
                    && c.to_lowercase()
                        .split('_')
                        .any(|part| !part.is_empty() && same_word(part, &term))
            })
            .collect();
        if parts_hit.len() == 1 {
            return Some(parts_hit[0]);
        }

        if term.chars().count() < 4 {
            return None;
        }
        let mut best: Option<(&str, f64)> = None;
        for candidate in candidates {
            let score = jaro_winkler(&term, &candidate.to_lowercase());
            if score >= self.similarity_threshold && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((candidate, score));
            }
        }
        best.map(|(c, _)| c)
    }

    /// Table whose name matches `term`.
    pub fn match_table<'a>(&self, term: &str, schema: &'a SchemaDescriptor) -> Option<&'a str> {
        let term = term.to_lowercase();
        // Table names also match with underscores spelled as spaces ("order items").
        let spaced = term.replace(' ', "_");
        self.best(&spaced, schema.tables.iter().map(|t| t.name.as_str()))
    }

    /// Column of `table` whose name matches `term`.
    pub fn match_column<'a>(&self, term: &str, table: &'a TableSchema) -> Option<&'a str> {
        self.best(term, table.columns.iter().map(|c| c.name.as_str()))
    }

    /// First table in `tables` with a column matching `term`, as `(table, column)`.
    pub fn match_column_in<'a>(
        &self,
        term: &str,
        tables: &[&'a TableSchema],
    ) -> Option<(&'a str, &'a str)> {
        // Exact hits anywhere win over fuzzy hits in an earlier table.
        for table in tables {
            if let Some(col) = table.column(term) {
                return Some((table.name.as_str(), col.name.as_str()));
            }
        }
        for table in tables {
            if let Some(col) = self.match_column(term, table) {
                return Some((table.name.as_str(), col));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_core::types::ColumnInfo;

    fn make_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            TableSchema::new(
                "customers",
                vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("name", "TEXT"),
                    ColumnInfo::new("city", "TEXT"),
                ],
            ),
            TableSchema::new(
                "order_items",
                vec![
                    ColumnInfo::new("id", "INTEGER").primary_key(),
                    ColumnInfo::new("unit_price", "REAL"),
                    ColumnInfo::new("quantity", "INTEGER"),
                ],
            ),
            TableSchema::new("categories", vec![ColumnInfo::new("label", "TEXT")]),
        ])
    }

    // ---- Tokenizing ----

    #[test]
    fn test_tokenize_keeps_identifiers_and_decimals() {
        assert_eq!(
            tokenize("Show order_items where unit_price > 4.50?"),
            vec!["show", "order_items", "where", "unit_price", "4.50"]
        );
    }

    #[test]
    fn test_content_terms_drop_stop_words() {
        assert_eq!(content_terms("show me all the customers"), vec!["customers"]);
    }

    #[test]
    fn test_quoted_values() {
        assert_eq!(
            quoted_values("city = 'Paris' or name = \"Ann\""),
            vec!["paris", "ann"]
        );
        assert!(quoted_values("it's").is_empty());
    }

    #[test]
    fn test_singular_plural() {
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("customers"), "customer");
        assert_eq!(singularize("boxes"), "box");
        assert_eq!(singularize("class"), "class");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
        assert_eq!(pluralize("box"), "boxes");
    }

    // ---- Identifier matching ----

    #[test]
    fn test_match_table_variants() {
        let schema = make_schema();
        let m = IdentifierMatcher::default();
        assert_eq!(m.match_table("Customers", &schema), Some("customers"));
        assert_eq!(m.match_table("customer", &schema), Some("customers"));
        assert_eq!(m.match_table("category", &schema), Some("categories"));
        assert_eq!(m.match_table("order items", &schema), Some("order_items"));
        assert_eq!(m.match_table("custmers", &schema), Some("customers"));
        assert_eq!(m.match_table("foobar", &schema), None);
    }

    #[test]
    fn test_match_column_by_part() {
        let schema = make_schema();
        let m = IdentifierMatcher::default();
        let items = schema.table("order_items").unwrap();
        assert_eq!(m.match_column("price", items), Some("unit_price"));
        assert_eq!(m.match_column("quantities", items), Some("quantity"));
        assert_eq!(m.match_column("xyz", items), None);
    }

    #[test]
    fn test_short_terms_are_not_fuzzy_matched() {
        let schema = make_schema();
        let m = IdentifierMatcher::default();
        let customers = schema.table("customers").unwrap();
        assert_eq!(m.match_column("nam", customers), None);
    }

    #[test]
    fn test_match_column_in_prefers_exact() {
        let schema = make_schema();
        let m = IdentifierMatcher::default();
        let tables: Vec<&TableSchema> = schema.tables.iter().collect();
        assert_eq!(m.match_column_in("city", &tables), Some(("customers", "city")));
    }
}
