//! Per-family SQL templates.
//!
//! A [`Dialect`] is resolved once per connection from the database family
//! name and owns every syntax difference the generator cares about.

use std::fmt;

use askdb_core::query::DatePart;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatabaseFamily {
    Sqlite,
    Postgres,
    MySql,
    /// ANSI fallback for families without their own template set.
    Generic,
}

impl DatabaseFamily {
    /// Map a family name onto a template set. Unknown names fall back to `Generic`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => DatabaseFamily::Sqlite,
            "postgres" | "postgresql" | "pg" => DatabaseFamily::Postgres,
            "mysql" | "mariadb" => DatabaseFamily::MySql,
            _ => DatabaseFamily::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseFamily::Sqlite => "sqlite",
            DatabaseFamily::Postgres => "postgresql",
            DatabaseFamily::MySql => "mysql",
            DatabaseFamily::Generic => "ansi",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            DatabaseFamily::Sqlite => "SQLite",
            DatabaseFamily::Postgres => "PostgreSQL",
            DatabaseFamily::MySql => "MySQL",
            DatabaseFamily::Generic => "ANSI SQL",
        }
    }
}

impl fmt::Display for DatabaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const RESERVED: &[&str] = &[
    "order", "group", "select", "from", "where", "table", "user", "limit", "by", "desc", "asc",
    "index", "key",
];

#[derive(Clone, Debug)]
pub struct Dialect {
    family: DatabaseFamily,
    compatibility_warning: Option<String>,
}

impl Dialect {
    pub fn new(family: DatabaseFamily) -> Self {
        Self {
            family,
            compatibility_warning: None,
        }
    }

    /// Resolve the template set for a family name.
    pub fn for_family(name: &str) -> Self {
        let family = DatabaseFamily::from_name(name);
        let compatibility_warning = (family == DatabaseFamily::Generic).then(|| {
            format!(
                "Database family '{}' has no dedicated templates; using ANSI SQL",
                name.trim()
            )
        });
        Self {
            family,
            compatibility_warning,
        }
    }

    pub fn family(&self) -> DatabaseFamily {
        self.family
    }

    pub fn compatibility_warning(&self) -> Option<&str> {
        self.compatibility_warning.as_deref()
    }

    /// Quote an identifier only when it is not a plain lowercase-safe name.
    pub fn quote_ident(&self, ident: &str) -> String {
        let simple = ident
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
            && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if simple && !RESERVED.contains(&ident.to_ascii_lowercase().as_str()) {
            return ident.to_string();
        }
        match self.family {
            DatabaseFamily::MySql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    pub fn date_part(&self, part: DatePart, column: &str) -> String {
        match self.family {
            DatabaseFamily::Sqlite => {
                let fmt = match part {
                    DatePart::Year => "%Y",
                    DatePart::Month => "%m",
                    DatePart::Day => "%d",
                };
                format!("CAST(strftime('{fmt}', {column}) AS INTEGER)")
            }
            DatabaseFamily::MySql => format!("{}({column})", part.as_str().to_ascii_uppercase()),
            DatabaseFamily::Postgres | DatabaseFamily::Generic => {
                format!("EXTRACT({} FROM {column})", part.as_str().to_ascii_uppercase())
            }
        }
    }

    /// Join rendered column expressions with a single space between values.
    pub fn concat(&self, parts: &[String]) -> String {
        match self.family {
            DatabaseFamily::MySql => format!("CONCAT({})", parts.join(", ' ', ")),
            _ => parts.join(" || ' ' || "),
        }
    }

    /// Operator for case-insensitive pattern matching.
    pub fn like_operator(&self) -> &'static str {
        match self.family {
            DatabaseFamily::Postgres => "ILIKE",
            _ => "LIKE",
        }
    }

    /// Trailing row-window clause, or an empty string when neither is set.
    pub fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (self.family, limit, offset) {
            (_, None, None) => String::new(),
            (DatabaseFamily::Generic, limit, offset) => {
                let mut out = String::new();
                if let Some(offset) = offset {
                    out.push_str(&format!("OFFSET {offset} ROWS"));
                }
                if let Some(limit) = limit {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&format!("FETCH FIRST {limit} ROWS ONLY"));
                }
                out
            }
            (DatabaseFamily::MySql, Some(limit), Some(offset)) => {
                format!("LIMIT {offset}, {limit}")
            }
            (_, Some(limit), Some(offset)) => format!("LIMIT {limit} OFFSET {offset}"),
            (_, Some(limit), None) => format!("LIMIT {limit}"),
            // OFFSET without LIMIT is not valid in SQLite or MySQL.
            (DatabaseFamily::Sqlite, None, Some(offset)) => format!("LIMIT -1 OFFSET {offset}"),
            (DatabaseFamily::MySql, None, Some(offset)) => {
                format!("LIMIT {offset}, 18446744073709551615")
            }
            (DatabaseFamily::Postgres, None, Some(offset)) => format!("OFFSET {offset}"),
        }
    }

    pub fn list_tables_sql(&self) -> String {
        match self.family {
            DatabaseFamily::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name"
                .to_string(),
            DatabaseFamily::Postgres => "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' ORDER BY table_name"
                .to_string(),
            DatabaseFamily::MySql => "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() ORDER BY table_name"
                .to_string(),
            DatabaseFamily::Generic => "SELECT table_name FROM information_schema.tables \
                 ORDER BY table_name"
                .to_string(),
        }
    }

    pub fn describe_table_sql(&self, table: &str) -> String {
        let escaped = table.replace('\'', "''");
        match self.family {
            DatabaseFamily::Sqlite => format!(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info('{escaped}') ORDER BY cid"
            ),
            _ => format!(
                "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
                 WHERE table_name = '{escaped}' ORDER BY ordinal_position"
            ),
        }
    }

    /// Prompt asking a language model for one SELECT statement.
    pub fn prompt(&self, schema: &str, context: &str, question: &str) -> String {
        let name = self.family.display_name();
        let like_rule = match self.family {
            DatabaseFamily::Postgres => "Use ILIKE for case-insensitive text searches",
            DatabaseFamily::MySql => "Use LIKE for text searches",
            _ => "Use LIKE for case-insensitive text searches",
        };
        let context = if context.trim().is_empty() {
            "(none)"
        } else {
            context
        };
        format!(
            "You are a {name} expert. Convert the user's question to a valid {name} query.\n\n\
             Database Schema:\n{schema}\n\n\
             Previous Conversation Context (use only if relevant to current query):\n{context}\n\n\
             Rules:\n\
             1. Only generate SELECT queries - no INSERT, UPDATE, DELETE, DROP, etc.\n\
             2. Use proper {name} syntax\n\
             3. Include LIMIT clause if not specified (default 100)\n\
             4. Use table and column names exactly as shown in schema\n\
             5. For aggregations, use appropriate GROUP BY clauses\n\
             6. Handle date/time columns properly\n\
             7. {like_rule}\n\
             8. Only use the previous context if it is directly relevant to the current question\n\
             9. If the current query is independent, ignore the previous context completely\n\
             10. Return only the SQL query without explanation\n\n\
             User Question: {question}\n\n\
             SQL Query:\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_resolution() {
        assert_eq!(DatabaseFamily::from_name("SQLite"), DatabaseFamily::Sqlite);
        assert_eq!(DatabaseFamily::from_name("postgresql"), DatabaseFamily::Postgres);
        assert_eq!(DatabaseFamily::from_name("mariadb"), DatabaseFamily::MySql);
        assert_eq!(DatabaseFamily::from_name("oracle"), DatabaseFamily::Generic);
    }

    #[test]
    fn test_unknown_family_carries_warning() {
        assert!(Dialect::for_family("sqlite").compatibility_warning().is_none());
        let generic = Dialect::for_family("duckdb");
        assert_eq!(generic.family(), DatabaseFamily::Generic);
        assert!(generic.compatibility_warning().unwrap().contains("duckdb"));
    }

    #[test]
    fn test_date_part_per_family() {
        assert_eq!(
            Dialect::new(DatabaseFamily::Sqlite).date_part(DatePart::Year, "order_date"),
            "CAST(strftime('%Y', order_date) AS INTEGER)"
        );
        assert_eq!(
            Dialect::new(DatabaseFamily::Postgres).date_part(DatePart::Month, "d"),
            "EXTRACT(MONTH FROM d)"
        );
        assert_eq!(
            Dialect::new(DatabaseFamily::MySql).date_part(DatePart::Day, "d"),
            "DAY(d)"
        );
    }

    #[test]
    fn test_concat_and_like() {
        let parts = vec!["first".to_string(), "last".to_string()];
        assert_eq!(
            Dialect::new(DatabaseFamily::Sqlite).concat(&parts),
            "first || ' ' || last"
        );
        assert_eq!(
            Dialect::new(DatabaseFamily::MySql).concat(&parts),
            "CONCAT(first, ' ', last)"
        );
        assert_eq!(Dialect::new(DatabaseFamily::Postgres).like_operator(), "ILIKE");
        assert_eq!(Dialect::new(DatabaseFamily::MySql).like_operator(), "LIKE");
    }

    #[test]
    fn test_limit_clauses() {
        let sqlite = Dialect::new(DatabaseFamily::Sqlite);
        assert_eq!(sqlite.limit_clause(None, None), "");
        assert_eq!(sqlite.limit_clause(Some(5), None), "LIMIT 5");
        assert_eq!(sqlite.limit_clause(Some(5), Some(10)), "LIMIT 5 OFFSET 10");
        assert_eq!(
            Dialect::new(DatabaseFamily::MySql).limit_clause(Some(5), Some(10)),
            "LIMIT 10, 5"
        );
        assert_eq!(
            Dialect::new(DatabaseFamily::Generic).limit_clause(Some(5), Some(10)),
            "OFFSET 10 ROWS FETCH FIRST 5 ROWS ONLY"
        );
    }

    #[test]
    fn test_quoting_only_when_needed() {
        let sqlite = Dialect::new(DatabaseFamily::Sqlite);
        assert_eq!(sqlite.quote_ident("customers"), "customers");
        assert_eq!(sqlite.quote_ident("order"), "\"order\"");
        assert_eq!(sqlite.quote_ident("unit price"), "\"unit price\"");
        assert_eq!(
            Dialect::new(DatabaseFamily::MySql).quote_ident("group"),
            "`group`"
        );
    }

    #[test]
    fn test_metadata_queries() {
        let sqlite = Dialect::new(DatabaseFamily::Sqlite);
        assert!(sqlite.list_tables_sql().contains("sqlite_master"));
        assert!(sqlite
            .describe_table_sql("orders")
            .contains("pragma_table_info('orders')"));
        assert!(Dialect::new(DatabaseFamily::Postgres)
            .describe_table_sql("orders")
            .contains("information_schema.columns"));
    }

    #[test]
    fn test_prompt_mentions_family_rules() {
        let pg = Dialect::new(DatabaseFamily::Postgres).prompt("sales(year)", "", "sales?");
        assert!(pg.contains("PostgreSQL expert"));
        assert!(pg.contains("ILIKE"));
        assert!(pg.contains("(none)"));
        let lite = Dialect::new(DatabaseFamily::Sqlite).prompt("s", "Q: x", "q");
        assert!(lite.contains("Use LIKE"));
        assert!(lite.contains("User Question: q"));
    }
}
