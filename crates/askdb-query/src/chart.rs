//! Chart hinting from the shape of a result set.

use serde::{Deserialize, Serialize};

use askdb_core::query::{is_temporal_name, ChartRequest};
use askdb_core::types::{ChartHint, ColumnSummary, TabularResult};

/// What a chart consumer receives alongside the rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartPayload {
    pub hint: ChartHint,
    /// Column plotted on the x axis (categories, time, or histogram values).
    pub x: Option<String>,
    /// Column plotted on the y axis.
    pub y: Option<String>,
}

impl ChartPayload {
    pub fn table() -> Self {
        Self {
            hint: ChartHint::Table,
            x: None,
            y: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Numeric,
    Temporal,
    Categorical,
}

fn role(column: &ColumnSummary) -> Role {
    if column.column_type.is_temporal() || is_temporal_name(&column.name) {
        Role::Temporal
    } else if column.column_type.is_numeric() {
        Role::Numeric
    } else {
        Role::Categorical
    }
}

/// Pick a visualization for `result`. An explicit request always wins;
/// otherwise two columns map to bar (category + number) or line (time +
/// number), a lone numeric column to a histogram, and anything else to a table.
pub fn chart_hint(result: &TabularResult, requested: Option<ChartRequest>) -> ChartPayload {
    if let Some(request) = requested {
        return requested_payload(result, request);
    }
    if result.rows.is_empty() {
        return ChartPayload::table();
    }

    let roles: Vec<Role> = result.columns.iter().map(role).collect();
    match roles.as_slice() {
        [Role::Numeric] => ChartPayload {
            hint: ChartHint::Histogram,
            x: Some(result.columns[0].name.clone()),
            y: None,
        },
        [a, b] => {
            let (dim, measure) = match (a, b) {
                (_, Role::Numeric) => (0, 1),
                (Role::Numeric, _) => (1, 0),
                _ => return ChartPayload::table(),
            };
            let hint = match roles[dim] {
                Role::Categorical => ChartHint::Bar,
                Role::Temporal => ChartHint::Line,
                Role::Numeric => return ChartPayload::table(),
            };
            ChartPayload {
                hint,
                x: Some(result.columns[dim].name.clone()),
                y: Some(result.columns[measure].name.clone()),
            }
        }
        _ => ChartPayload::table(),
    }
}

fn requested_payload(result: &TabularResult, request: ChartRequest) -> ChartPayload {
    let hint = match request {
        ChartRequest::Bar => ChartHint::Bar,
        ChartRequest::Line => ChartHint::Line,
        ChartRequest::Histogram => ChartHint::Histogram,
        ChartRequest::Table => return ChartPayload::table(),
    };

    let first_numeric = result
        .columns
        .iter()
        .find(|c| role(c) == Role::Numeric)
        .map(|c| c.name.clone());

    if hint == ChartHint::Histogram {
        return ChartPayload {
            hint,
            x: first_numeric.or_else(|| result.columns.first().map(|c| c.name.clone())),
            y: None,
        };
    }

    let x = result
        .columns
        .iter()
        .find(|c| role(c) != Role::Numeric)
        .or_else(|| result.columns.first())
        .map(|c| c.name.clone());
    let y = result
        .columns
        .iter()
        .find(|c| role(c) == Role::Numeric && Some(&c.name) != x.as_ref())
        .map(|c| c.name.clone());
    ChartPayload { hint, x, y }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askdb_core::types::{CellValue, ColumnType};

    fn make_result(columns: &[(&str, ColumnType)]) -> TabularResult {
        let columns: Vec<ColumnSummary> = columns
            .iter()
            .map(|(n, t)| ColumnSummary::new(*n, *t))
            .collect();
        let row = vec![CellValue::Integer(1); columns.len()];
        TabularResult::new(columns, vec![row])
    }

    #[test]
    fn test_category_and_number_is_bar() {
        let result = make_result(&[("region", ColumnType::Text), ("total", ColumnType::Float)]);
        let chart = chart_hint(&result, None);
        assert_eq!(chart.hint, ChartHint::Bar);
        assert_eq!(chart.x.as_deref(), Some("region"));
        assert_eq!(chart.y.as_deref(), Some("total"));
    }

    #[test]
    fn test_measure_first_still_detected() {
        let result = make_result(&[("total", ColumnType::Float), ("region", ColumnType::Text)]);
        let chart = chart_hint(&result, None);
        assert_eq!(chart.hint, ChartHint::Bar);
        assert_eq!(chart.x.as_deref(), Some("region"));
    }

    #[test]
    fn test_time_and_number_is_line() {
        let result = make_result(&[("year", ColumnType::Integer), ("amount", ColumnType::Float)]);
        assert_eq!(chart_hint(&result, None).hint, ChartHint::Line);

        let result = make_result(&[("day", ColumnType::Date), ("count_all", ColumnType::Integer)]);
        assert_eq!(chart_hint(&result, None).hint, ChartHint::Line);
    }

    #[test]
    fn test_single_numeric_is_histogram() {
        let result = make_result(&[("amount", ColumnType::Float)]);
        let chart = chart_hint(&result, None);
        assert_eq!(chart.hint, ChartHint::Histogram);
        assert_eq!(chart.x.as_deref(), Some("amount"));
    }

    #[test]
    fn test_wide_or_empty_results_are_tables() {
        let wide = make_result(&[
            ("id", ColumnType::Integer),
            ("name", ColumnType::Text),
            ("city", ColumnType::Text),
        ]);
        assert_eq!(chart_hint(&wide, None), ChartPayload::table());

        let empty = TabularResult::new(vec![ColumnSummary::new("amount", ColumnType::Float)], vec![]);
        assert_eq!(chart_hint(&empty, None).hint, ChartHint::Table);

        let two_text = make_result(&[("a", ColumnType::Text), ("b", ColumnType::Text)]);
        assert_eq!(chart_hint(&two_text, None).hint, ChartHint::Table);
    }

    #[test]
    fn test_explicit_request_wins() {
        let wide = make_result(&[
            ("name", ColumnType::Text),
            ("city", ColumnType::Text),
            ("spend", ColumnType::Float),
        ]);
        let chart = chart_hint(&wide, Some(ChartRequest::Bar));
        assert_eq!(chart.hint, ChartHint::Bar);
        assert_eq!(chart.x.as_deref(), Some("name"));
        assert_eq!(chart.y.as_deref(), Some("spend"));

        let bar = make_result(&[("region", ColumnType::Text), ("total", ColumnType::Float)]);
        assert_eq!(
            chart_hint(&bar, Some(ChartRequest::Table)),
            ChartPayload::table()
        );
    }
}
