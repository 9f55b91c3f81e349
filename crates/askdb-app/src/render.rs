//! Plain-text rendering of query outcomes for the terminal.

use std::fmt::Write as _;

use askdb_core::types::{SessionSummary, TabularResult, Turn};
use askdb_query::QueryOutcome;

/// Rows printed before the table is cut off.
const MAX_PRINTED_ROWS: usize = 50;
/// Cells wider than this are truncated.
const MAX_CELL_WIDTH: usize = 40;

pub fn render_outcome(outcome: &QueryOutcome) -> String {
    let mut out = String::new();
    if let Some(ref sql) = outcome.turn.generated_sql {
        let _ = writeln!(out, "SQL: {sql}");
    }
    if let Some(ref answer) = outcome.answer {
        let _ = writeln!(out, "{answer}");
    }
    if let Some(ref result) = outcome.result {
        out.push_str(&render_table(result));
    }
    if let Some(ref chart) = outcome.chart {
        if let (Some(x), Some(y)) = (&chart.x, &chart.y) {
            let _ = writeln!(out, "Chart: {} ({x} vs {y})", chart.hint);
        }
    }
    for warning in &outcome.warnings {
        let _ = writeln!(out, "note: {warning}");
    }
    out
}

pub fn render_table(result: &TabularResult) -> String {
    if result.columns.is_empty() {
        return "(no columns)\n".to_string();
    }

    let header: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .take(MAX_PRINTED_ROWS)
        .map(|row| row.iter().map(|cell| truncate(&cell.to_string())).collect())
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let mut out = String::new();
    push_row(&mut out, &header, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_row(&mut out, &rule, &widths);
    for row in &rows {
        push_row(&mut out, row, &widths);
    }

    let total = result.row_count();
    if total > MAX_PRINTED_ROWS {
        let _ = writeln!(out, "... {} more rows", total - MAX_PRINTED_ROWS);
    }
    let _ = writeln!(out, "({total} {})", if total == 1 { "row" } else { "rows" });
    out
}

pub fn render_history(turns: &[Turn]) -> String {
    if turns.is_empty() {
        return "No turns yet.\n".to_string();
    }
    let mut out = String::new();
    for (i, turn) in turns.iter().enumerate() {
        let status = match (&turn.failure, &turn.result_summary) {
            (Some(f), _) => format!("failed ({}): {}", f.kind, f.message),
            (None, Some(s)) => format!("{} rows", s.row_count),
            (None, None) => "answered".to_string(),
        };
        let _ = writeln!(
            out,
            "{:>3}. [{}] {}  ->  {}",
            i + 1,
            turn.classification,
            turn.raw_utterance,
            status
        );
        if let Some(ref sql) = turn.generated_sql {
            let _ = writeln!(out, "     {sql}");
        }
    }
    out
}

pub fn render_sessions(sessions: &[SessionSummary], current: askdb_core::types::SessionId) -> String {
    if sessions.is_empty() {
        return "No sessions.\n".to_string();
    }
    let mut out = String::new();
    for s in sessions {
        let marker = if s.session_id == current { "*" } else { " " };
        let _ = writeln!(
            out,
            "{marker} {}  {} turns  last active {}",
            s.session_id,
            s.turn_count,
            s.last_active_at.format("%Y-%m-%d %H:%M")
        );
    }
    out
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, w)| format!("{cell:<w$}", w = *w))
        .collect();
    out.push_str(line.join(" | ").trim_end());
    out.push('\n');
}

fn truncate(cell: &str) -> String {
    if cell.chars().count() <= MAX_CELL_WIDTH {
        return cell.to_string();
    }
    let cut: String = cell.chars().take(MAX_CELL_WIDTH - 3).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_core::types::{
        CellValue, ColumnSummary, ColumnType, FailureKind, QueryClass, SessionId, TurnFailure,
    };

    fn make_result(rows: usize) -> TabularResult {
        TabularResult::new(
            vec![
                ColumnSummary::new("region", ColumnType::Text),
                ColumnSummary::new("total", ColumnType::Float),
            ],
            (0..rows)
                .map(|i| vec![CellValue::Text(format!("r{i}")), CellValue::Float(i as f64)])
                .collect(),
        )
    }

    #[test]
    fn test_table_aligns_columns() {
        let text = render_table(&make_result(2));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "region | total");
        assert_eq!(lines[1], "------ | -----");
        assert_eq!(lines[2], "r0     | 0");
        assert_eq!(lines.last(), Some(&"(2 rows)"));
    }

    #[test]
    fn test_table_cuts_long_results() {
        let text = render_table(&make_result(60));
        assert!(text.contains("... 10 more rows"));
        assert!(text.ends_with("(60 rows)\n"));
    }

    #[test]
    fn test_long_cells_truncated() {
        let long = "x".repeat(100);
        let cut = truncate(&long);
        assert_eq!(cut.chars().count(), MAX_CELL_WIDTH);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_history_marks_failures() {
        let sid = SessionId::new();
        let mut ok = Turn::new(sid, "show sales");
        ok.classification = QueryClass::Data;
        ok.generated_sql = Some("SELECT * FROM sales".into());
        ok.result_summary = Some(make_result(3).summary());
        let mut failed = Turn::new(sid, "show foobar");
        failed.failure = Some(TurnFailure::new(FailureKind::SchemaMismatch, "no table"));

        let text = render_history(&[ok, failed]);
        assert!(text.contains("  1. [data] show sales  ->  3 rows"));
        assert!(text.contains("     SELECT * FROM sales"));
        assert!(text.contains("failed (schema_mismatch): no table"));
    }
}
