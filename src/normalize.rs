//! Baseline-relative normalization of result rows.

use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use tracing::debug;

/// One flat result row: column name -> scalar or string
pub type ResultRow = Map<String, Value>;

const KEY_SEPARATOR: char = '\u{1f}';

/// Rewrites `metric` so that each row is expressed relative to the row of its
/// group whose `column` equals `baseline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeNormalizer {
    pub column: String,
    pub baseline: String,
    pub metric: String,
    group_columns: Option<Vec<String>>,
}

impl RelativeNormalizer {
    pub fn new(
        column: impl Into<String>,
        baseline: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            baseline: baseline.into(),
            metric: metric.into(),
            group_columns: None,
        }
    }

    /// Groups by these columns instead of every column of the result set
    pub fn group_by(mut self, columns: Vec<String>) -> Self {
        self.group_columns = Some(columns);
        self
    }

    /// Grouping key columns: everything but the relative and the metric column
    pub fn grouping_columns(&self, rows: &[ResultRow]) -> Vec<String> {
        let candidates = match &self.group_columns {
            Some(columns) => columns.clone(),
            None => result_columns(rows),
        };
        candidates
            .into_iter()
            .filter(|c| *c != self.column && *c != self.metric)
            .collect()
    }

    /// Divides in place. Rows without a baseline in their group, or whose
    /// baseline is zero or not numeric, are left as they are. Applying it
    /// twice divides twice.
    pub fn apply(&self, rows: &mut [ResultRow]) {
        let group_columns = self.grouping_columns(rows);

        let mut baselines: HashMap<String, f64> = HashMap::new();
        for row in rows.iter() {
            if row.get(&self.column).map(stringify).as_deref() != Some(self.baseline.as_str()) {
                continue;
            }
            if let Some(metric) = row.get(&self.metric).and_then(Value::as_f64) {
                baselines.insert(group_key(row, &group_columns), metric);
            }
        }

        let mut rewritten = 0usize;
        for row in rows.iter_mut() {
            let Some(&base) = baselines.get(&group_key(row, &group_columns)) else {
                continue;
            };
            if base == 0.0 {
                continue;
            }
            let Some(original) = row.get(&self.metric).and_then(Value::as_f64) else {
                continue;
            };
            if let Some(relative) = Number::from_f64(original / base) {
                row.insert(self.metric.clone(), Value::Number(relative));
                rewritten += 1;
            }
        }

        debug!(
            groups = baselines.len(),
            rewritten,
            rows = rows.len(),
            baseline = %self.baseline,
            "applied relative normalization"
        );
    }

    pub fn normalized(&self, mut rows: Vec<ResultRow>) -> Vec<ResultRow> {
        self.apply(&mut rows);
        rows
    }
}

/// Every column of the result set, in order of first appearance
pub fn result_columns(rows: &[ResultRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn group_key(row: &ResultRow, columns: &[String]) -> String {
    let mut key = String::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        if let Some(value) = row.get(column) {
            key.push_str(&stringify(value));
        }
    }
    key
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(value: Value) -> Vec<ResultRow> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_missing_baseline_passes_through() {
        let input = rows(json!([{"g": "a", "m": 10}, {"g": "b", "m": 20}]));
        let output = RelativeNormalizer::new("g", "c", "m").normalized(input.clone());
        assert_eq!(output, input);
    }

    #[test]
    fn test_divides_by_group_baseline() {
        let input = rows(json!([{"g": "base", "k": 1, "m": 10}, {"g": "x", "k": 1, "m": 30}]));
        let output = RelativeNormalizer::new("g", "base", "m").normalized(input);
        assert_eq!(output[0]["m"], json!(1.0));
        assert_eq!(output[1]["m"], json!(3.0));
        assert_eq!(output[1]["g"], json!("x"));
        assert_eq!(output[1]["k"], json!(1));
    }

    #[test]
    fn test_groups_are_independent() {
        let input = rows(json!([
            {"g": "base", "k": "gpu", "m": 4},
            {"g": "x", "k": "gpu", "m": 2},
            {"g": "base", "k": "cpu", "m": 10},
            {"g": "x", "k": "cpu", "m": 5},
            {"g": "x", "k": "tpu", "m": 7},
        ]));
        let output = RelativeNormalizer::new("g", "base", "m").normalized(input);
        assert_eq!(output[1]["m"], json!(0.5));
        assert_eq!(output[3]["m"], json!(0.5));
        // tpu 组没有基线
        assert_eq!(output[4]["m"], json!(7));
        assert_eq!(output.len(), 5);
    }

    #[test]
    fn test_zero_baseline_passes_through() {
        let input = rows(json!([{"g": "base", "m": 0}, {"g": "x", "m": 30}]));
        let output = RelativeNormalizer::new("g", "base", "m").normalized(input.clone());
        assert_eq!(output, input);
    }

    #[test]
    fn test_non_numeric_metric_passes_through() {
        let input =
            rows(json!([{"g": "base", "m": 2}, {"g": "x", "m": "n/a"}, {"g": "y", "m": null}]));
        let output = RelativeNormalizer::new("g", "base", "m").normalized(input);
        assert_eq!(output[1]["m"], json!("n/a"));
        assert_eq!(output[2]["m"], Value::Null);
    }

    #[test]
    fn test_numeric_baseline_value_matches_string() {
        let input = rows(json!([{"batch": 32, "m": 8}, {"batch": 64, "m": 12}]));
        let output = RelativeNormalizer::new("batch", "32", "m").normalized(input);
        assert_eq!(output[1]["m"], json!(1.5));
    }

    #[test]
    fn test_applying_twice_divides_twice() {
        let input = rows(json!([{"g": "base", "m": 2}, {"g": "x", "m": 8}]));
        let normalizer = RelativeNormalizer::new("g", "x", "m");
        let once = normalizer.normalized(input);
        assert_eq!(once[0]["m"], json!(0.25));
        let twice = normalizer.normalized(once);
        // 基线行第一次已变成 1, 第二次除以 1
        assert_eq!(twice[0]["m"], json!(0.25));
        assert_eq!(twice[1]["m"], json!(1.0));
    }

    #[test]
    fn test_explicit_group_columns() {
        let input = rows(json!([
            {"g": "base", "k": 1, "noise": "a", "m": 10},
            {"g": "x", "k": 1, "noise": "b", "m": 30},
        ]));
        let derived = RelativeNormalizer::new("g", "base", "m").normalized(input.clone());
        assert_eq!(derived[1]["m"], json!(30));

        let explicit = RelativeNormalizer::new("g", "base", "m")
            .group_by(vec!["k".to_string()])
            .normalized(input);
        assert_eq!(explicit[1]["m"], json!(3.0));
    }

    #[test]
    fn test_result_columns_first_seen_order() {
        let input = rows(json!([{"a": 1, "b": 2}, {"a": 1, "c": 3}]));
        assert_eq!(result_columns(&input), vec!["a", "b", "c"]);
    }
}
