//! SQL compiler that turns a structured pivot request into an aggregate query using sea-query.
//!
//! This is a preview of what the remote executor runs: row and column fields
//! become grouping columns, value fields become one aggregate per aggregator,
//! filter fields become `WHERE` conditions.

use crate::codec::FilterEntry;
use crate::field::{Aggregator, FieldRef, FilterValue, Operator};
use crate::gateway::StructuredRequest;
use sea_query::{
    Alias, Expr, Func, JoinType, PostgresQueryBuilder, SelectStatement, SimpleExpr, Value,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("nothing to select: add a row, column or value field")]
    EmptySelection,

    #[error("field `{0}` has no table prefix")]
    MissingTable(FieldRef),
}

/// Result of SQL compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub sql: String,
    /// Physical tables in join order, base table first
    pub tables: Vec<String>,
}

/// Resolved physical location of a field reference
#[derive(Debug, Clone)]
struct ColumnRef {
    table: String,
    column: String,
    label: String,
}

impl ColumnRef {
    fn expr(&self) -> Expr {
        Expr::col((Alias::new(&self.table), Alias::new(&self.column)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SqlCompiler {
    /// Maps logical table names to physical table names
    table_mapping: HashMap<String, String>,
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table_mapping(table_mapping: HashMap<String, String>) -> Self {
        Self { table_mapping }
    }

    /// Set table mapping for logical table names
    pub fn set_table_mapping(&mut self, mapping: HashMap<String, String>) {
        self.table_mapping = mapping;
    }

    /// Get the physical table name, lower-cased logical name when unmapped
    fn get_table_name(&self, table: &str) -> String {
        self.table_mapping
            .get(table)
            .cloned()
            .unwrap_or_else(|| table.to_lowercase())
    }

    fn resolve(&self, field: &FieldRef) -> Result<ColumnRef, CompileError> {
        let table = field.table().ok_or_else(|| CompileError::MissingTable(field.clone()))?;
        Ok(ColumnRef {
            table: self.get_table_name(table),
            column: field.path().to_string(),
            label: field.label().to_string(),
        })
    }

    /// Compile a structured request into Postgres SQL
    pub fn compile(&self, request: &StructuredRequest) -> Result<CompileResult, CompileError> {
        if request.rows.is_empty() && request.cols.is_empty() && request.values.is_empty() {
            return Err(CompileError::EmptySelection);
        }

        let mut tables: Vec<String> = Vec::new();
        let mut track = |column: &ColumnRef| {
            if !tables.contains(&column.table) {
                tables.push(column.table.clone());
            }
        };

        let mut select = SelectStatement::new();
        let mut group_columns = Vec::new();

        for field in request.rows.iter().chain(request.cols.iter()) {
            let column = self.resolve(field)?;
            track(&column);
            select.expr_as(column.expr(), Alias::new(&column.label));
            group_columns.push(column);
        }

        for value in &request.values {
            let column = self.resolve(&value.field)?;
            track(&column);
            for agg in &value.aggregators {
                let label = format!("{}({})", agg.as_str(), column.label);
                select.expr_as(self.compile_aggregate(*agg, &column), Alias::new(label));
            }
        }

        let mut conditions = Vec::new();
        for filter in &request.filters {
            let column = self.resolve(&filter.field)?;
            track(&column);
            conditions.push(self.compile_filter(filter, &column));
        }

        let base = tables[0].clone();
        select.from(Alias::new(&base));
        for joined in tables.iter().skip(1) {
            select.join(
                JoinType::InnerJoin,
                Alias::new(joined),
                Expr::col((Alias::new(&base), Alias::new("id")))
                    .equals((Alias::new(joined), Alias::new("id"))),
            );
        }

        for condition in conditions {
            select.and_where(condition);
        }

        if !request.values.is_empty() {
            for column in &group_columns {
                select.group_by_col((Alias::new(&column.table), Alias::new(&column.column)));
            }
        }

        Ok(CompileResult {
            sql: select.to_string(PostgresQueryBuilder),
            tables,
        })
    }

    fn compile_aggregate(&self, agg: Aggregator, column: &ColumnRef) -> SimpleExpr {
        let col = column.expr();
        match agg {
            Aggregator::Avg => Func::avg(col).into(),
            Aggregator::Sum => Func::sum(col).into(),
            Aggregator::Count => Func::count(col).into(),
            Aggregator::Min => Func::min(col).into(),
            Aggregator::Max => Func::max(col).into(),
            Aggregator::Std => Func::cust(Alias::new("STDDEV")).arg(col).into(),
            Aggregator::Var => Func::cust(Alias::new("VARIANCE")).arg(col).into(),
            Aggregator::Median => {
                Expr::cust_with_expr("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY $1)", col)
            }
        }
    }

    /// Compile a single filter condition
    fn compile_filter(&self, filter: &FilterEntry, column: &ColumnRef) -> SimpleExpr {
        let col = column.expr();
        let value = &filter.value;
        match filter.operator {
            Operator::In => col.is_in(self.list_values(value)),
            Operator::NotIn => col.is_not_in(self.list_values(value)),
            Operator::Is if is_null_literal(value) => col.is_null(),
            Operator::IsNot if is_null_literal(value) => col.is_not_null(),
            Operator::Is => col.is(self.scalar_value(value)),
            Operator::IsNot => col.is_not(self.scalar_value(value)),
            Operator::Eq => col.eq(self.scalar_value(value)),
            Operator::NotEq => col.ne(self.scalar_value(value)),
            Operator::Gt => col.gt(self.scalar_value(value)),
            Operator::Gte => col.gte(self.scalar_value(value)),
            Operator::Lt => col.lt(self.scalar_value(value)),
            Operator::Lte => col.lte(self.scalar_value(value)),
            Operator::Like => col.like(scalar_text(value)),
            Operator::NotLike => col.not_like(scalar_text(value)),
        }
    }

    fn scalar_value(&self, value: &FilterValue) -> Value {
        self.literal_to_value(&scalar_text(value))
    }

    fn list_values(&self, value: &FilterValue) -> Vec<Value> {
        match value {
            FilterValue::List(values) => values.iter().map(|v| self.literal_to_value(v)).collect(),
            FilterValue::Single(v) => vec![self.literal_to_value(v)],
        }
    }

    /// Numbers keep their type, everything else is a string literal
    fn literal_to_value(&self, literal: &str) -> Value {
        if let Ok(n) = literal.parse::<i64>() {
            Value::BigInt(Some(n))
        } else if let Ok(f) = literal.parse::<f64>() {
            Value::Double(Some(f))
        } else {
            Value::String(Some(Box::new(literal.to_string())))
        }
    }
}

fn is_null_literal(value: &FilterValue) -> bool {
    matches!(value, FilterValue::Single(v) if v.eq_ignore_ascii_case("null"))
}

fn scalar_text(value: &FilterValue) -> String {
    match value {
        FilterValue::Single(v) => v.clone(),
        FilterValue::List(values) => values.join(","),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::PivotField;
    use crate::registry::FieldRegistry;

    fn create_test_compiler() -> SqlCompiler {
        let mut compiler = SqlCompiler::new();
        let mut mapping = HashMap::new();
        mapping.insert("Exec".to_string(), "execs".to_string());
        mapping.insert("Metric".to_string(), "metrics".to_string());
        compiler.set_table_mapping(mapping);
        compiler
    }

    fn request(fields: Vec<PivotField>) -> StructuredRequest {
        StructuredRequest::from_registry(&FieldRegistry::from_fields(fields).unwrap())
    }

    #[test]
    fn test_pivot_compilation() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&request(vec![
                PivotField::row("Exec:name"),
                PivotField::column("Metric:name"),
                PivotField::value("Metric:value", vec![Aggregator::Avg, Aggregator::Max]),
                PivotField::filter("Metric:name", Operator::Eq, FilterValue::Single("rate".into())),
            ]))
            .unwrap();

        assert_eq!(result.tables, vec!["execs", "metrics"]);
        assert!(result.sql.contains(r#""execs"."name" AS "Exec:name""#));
        assert!(result.sql.contains(r#"AVG("metrics"."value") AS "avg(Metric:value)""#));
        assert!(result.sql.contains(r#"MAX("metrics"."value") AS "max(Metric:value)""#));
        assert!(result.sql.contains(r#"FROM "execs""#));
        assert!(result.sql.contains(r#"INNER JOIN "metrics" ON "execs"."id" = "metrics"."id""#));
        assert!(result.sql.contains(r#""metrics"."name" = 'rate'"#));
        assert!(result.sql.contains(r#"GROUP BY "execs"."name", "metrics"."name""#));
    }

    #[test]
    fn test_alias_and_unmapped_table() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&request(vec![PivotField::row("Pack:meta.gpu as gpu")]))
            .unwrap();
        assert_eq!(result.tables, vec!["pack"]);
        assert!(result.sql.contains(r#""pack"."meta.gpu" AS "gpu""#));
        // 没有值字段时不分组
        assert!(!result.sql.contains("GROUP BY"));
    }

    #[test]
    fn test_list_operators() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&request(vec![
                PivotField::value("Metric:value", vec![Aggregator::Sum]),
                PivotField::filter(
                    "Exec:name",
                    Operator::NotIn,
                    FilterValue::List(vec!["a".into(), "b".into()]),
                ),
                PivotField::filter(
                    "Metric:batch",
                    Operator::In,
                    FilterValue::List(vec!["32".into(), "64".into()]),
                ),
            ]))
            .unwrap();
        assert!(result.sql.contains(r#""execs"."name" NOT IN ('a', 'b')"#));
        assert!(result.sql.contains(r#""metrics"."batch" IN (32, 64)"#));
    }

    #[test]
    fn test_null_checks_and_like() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&request(vec![
                PivotField::row("Exec:name"),
                PivotField::filter("Exec:error", Operator::Is, FilterValue::Single("NULL".into())),
                PivotField::filter("Exec:gpu", Operator::IsNot, FilterValue::Single("null".into())),
                PivotField::filter(
                    "Exec:name",
                    Operator::Like,
                    FilterValue::Single("bert%".into()),
                ),
                PivotField::filter("Exec:score", Operator::Gte, FilterValue::Single("0.5".into())),
            ]))
            .unwrap();
        assert!(result.sql.contains(r#""execs"."error" IS NULL"#));
        assert!(result.sql.contains(r#""execs"."gpu" IS NOT NULL"#));
        assert!(result.sql.contains(r#""execs"."name" LIKE 'bert%'"#));
        assert!(result.sql.contains(r#""execs"."score" >= 0.5"#));
    }

    #[test]
    fn test_statistical_aggregators() {
        let compiler = create_test_compiler();
        let result = compiler
            .compile(&request(vec![PivotField::value(
                "Metric:value",
                vec![Aggregator::Std, Aggregator::Var, Aggregator::Median, Aggregator::Count],
            )]))
            .unwrap();
        assert!(result.sql.contains("STDDEV("));
        assert!(result.sql.contains("VARIANCE("));
        assert!(result.sql.contains("PERCENTILE_CONT(0.5) WITHIN GROUP"));
        assert!(result.sql.contains(r#"COUNT("metrics"."value")"#));
    }

    #[test]
    fn test_errors() {
        let compiler = create_test_compiler();
        assert_eq!(compiler.compile(&request(vec![])), Err(CompileError::EmptySelection));
        assert_eq!(
            compiler.compile(&request(vec![PivotField::row("name")])),
            Err(CompileError::MissingTable(FieldRef::from("name")))
        );

        // 只有过滤字段也不能出 SQL
        let only_filter = request(vec![PivotField::filter(
            "Exec:name",
            Operator::Eq,
            FilterValue::Single("x".into()),
        )]);
        assert_eq!(only_filter.filters.len(), 1);
        assert_eq!(compiler.compile(&only_filter), Err(CompileError::EmptySelection));
    }
}
