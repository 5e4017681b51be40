//! 透视表字段的数据模型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 字段引用, 形如 `Table:path` 或 `Table:path as alias`
///
/// 两个字段引用相等当且仅当字符串相等, 不做任何规范化。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldRef(pub String);

const ALIAS_SEPARATOR: &str = " as ";

impl FieldRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 去掉别名后的部分
    pub fn source(&self) -> &str {
        match self.0.split_once(ALIAS_SEPARATOR) {
            Some((source, _)) => source,
            None => &self.0,
        }
    }

    /// `as` 之后的别名
    pub fn alias(&self) -> Option<&str> {
        self.0.split_once(ALIAS_SEPARATOR).map(|(_, alias)| alias)
    }

    /// 结果列名: 有别名用别名, 否则是去掉别名的引用
    pub fn label(&self) -> &str {
        self.alias().unwrap_or_else(|| self.source())
    }

    /// 第一个 `:` 之前的表名, 没有 `:` 时返回 None
    pub fn table(&self) -> Option<&str> {
        self.source().split_once(':').map(|(table, _)| table)
    }

    /// 第一个 `:` 之后的路径, 没有 `:` 时返回整个引用
    pub fn path(&self) -> &str {
        let source = self.source();
        match source.split_once(':') {
            Some((_, path)) => path,
            None => source,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FieldRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 字段在聚合中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Row,
    Column,
    Value,
    Filter,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Row, Role::Column, Role::Value, Role::Filter];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Row => "row",
            Role::Column => "column",
            Role::Value => "value",
            Role::Filter => "filter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 无法识别的枚举标记
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{token}`")]
pub struct UnknownToken {
    pub kind: &'static str,
    pub token: String,
}

impl FromStr for Role {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "row" | "rows" => Ok(Role::Row),
            "column" | "col" | "cols" => Ok(Role::Column),
            "value" | "values" => Ok(Role::Value),
            "filter" | "filters" => Ok(Role::Filter),
            _ => Err(UnknownToken { kind: "role", token: s.to_string() }),
        }
    }
}

/// 过滤字段的比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "not like")]
    NotLike,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is not")]
    IsNot,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Eq,
        Operator::NotEq,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::In,
        Operator::NotIn,
        Operator::Like,
        Operator::NotLike,
        Operator::Is,
        Operator::IsNot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Like => "like",
            Operator::NotLike => "not like",
            Operator::Is => "is",
            Operator::IsNot => "is not",
        }
    }

    /// `in` 与 `not in` 的值是字符串列表
    pub fn takes_list(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| UnknownToken { kind: "operator", token: s.to_string() })
    }
}

/// 值字段的聚合函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    Avg,
    Sum,
    Count,
    Min,
    Max,
    Std,
    Var,
    Median,
}

impl Aggregator {
    pub const ALL: [Aggregator; 8] = [
        Aggregator::Avg,
        Aggregator::Sum,
        Aggregator::Count,
        Aggregator::Min,
        Aggregator::Max,
        Aggregator::Std,
        Aggregator::Var,
        Aggregator::Median,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Aggregator::Avg => "avg",
            Aggregator::Sum => "sum",
            Aggregator::Count => "count",
            Aggregator::Min => "min",
            Aggregator::Max => "max",
            Aggregator::Std => "std",
            Aggregator::Var => "var",
            Aggregator::Median => "median",
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregator {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Aggregator::ALL
            .into_iter()
            .find(|agg| agg.as_str() == lower)
            .ok_or_else(|| UnknownToken { kind: "aggregator", token: s.to_string() })
    }
}

/// 新建值字段时的默认聚合
pub fn default_aggregators() -> Vec<Aggregator> {
    vec![Aggregator::Avg]
}

/// 过滤值: 单个字符串, 或 `in`/`not in` 使用的字符串列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Single(String),
    List(Vec<String>),
}

impl FilterValue {
    pub fn is_list(&self) -> bool {
        matches!(self, FilterValue::List(_))
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Single(value) => write!(f, "{:?}", value),
            FilterValue::List(values) => write!(f, "{:?}", values),
        }
    }
}

/// 透视表中的一个已分类字段
///
/// `operator`/`filter_value` 只对 `Role::Filter` 有意义,
/// `aggregators` 只对 `Role::Value` 有意义。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotField {
    pub field: FieldRef,
    pub role: Role,
    pub operator: Option<Operator>,
    pub filter_value: Option<FilterValue>,
    pub aggregators: Vec<Aggregator>,
}

impl PivotField {
    fn bare(field: FieldRef, role: Role) -> Self {
        Self {
            field,
            role,
            operator: None,
            filter_value: None,
            aggregators: Vec::new(),
        }
    }

    pub fn row(field: impl Into<FieldRef>) -> Self {
        Self::bare(field.into(), Role::Row)
    }

    pub fn column(field: impl Into<FieldRef>) -> Self {
        Self::bare(field.into(), Role::Column)
    }

    /// 聚合列表为空时使用默认的 `["avg"]`
    pub fn value(field: impl Into<FieldRef>, aggregators: Vec<Aggregator>) -> Self {
        let mut pivot = Self::bare(field.into(), Role::Value);
        pivot.aggregators =
            if aggregators.is_empty() { default_aggregators() } else { aggregators };
        pivot
    }

    pub fn filter(field: impl Into<FieldRef>, operator: Operator, value: FilterValue) -> Self {
        let mut pivot = Self::bare(field.into(), Role::Filter);
        pivot.operator = Some(operator);
        pivot.filter_value = Some(value);
        pivot
    }

    /// 只有角色、尚未填写运算符和值的过滤字段
    pub fn incomplete_filter(field: impl Into<FieldRef>) -> Self {
        Self::bare(field.into(), Role::Filter)
    }

    /// 过滤字段必须同时带有运算符和值, 其他角色总是完整的
    pub fn is_complete(&self) -> bool {
        match self.role {
            Role::Filter => self.operator.is_some() && self.filter_value.is_some(),
            Role::Value => !self.aggregators.is_empty(),
            Role::Row | Role::Column => true,
        }
    }

    /// 改写角色, 丢弃新角色上没有意义的属性
    pub fn retarget(&mut self, role: Role) {
        self.role = role;
        self.normalize();
    }

    pub(crate) fn normalize(&mut self) {
        if self.role != Role::Filter {
            self.operator = None;
            self.filter_value = None;
        }
        match self.role {
            Role::Value if self.aggregators.is_empty() => self.aggregators = default_aggregators(),
            Role::Value => {}
            _ => self.aggregators.clear(),
        }
    }
}

impl fmt::Display for PivotField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6} {}", self.role, self.field)?;
        match self.role {
            Role::Value => {
                let aggs: Vec<_> = self.aggregators.iter().map(|a| a.as_str()).collect();
                write!(f, " [{}]", aggs.join(", "))
            }
            Role::Filter => match (&self.operator, &self.filter_value) {
                (Some(op), Some(value)) => write!(f, " {} {}", op, value),
                _ => f.write_str(" (incomplete)"),
            },
            Role::Row | Role::Column => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_ref_parts() {
        let plain = FieldRef::from("Metric:value");
        assert_eq!(plain.table(), Some("Metric"));
        assert_eq!(plain.path(), "value");
        assert_eq!(plain.alias(), None);

        let aliased = FieldRef::from("Exec:meta.gpu:name as gpu");
        assert_eq!(aliased.source(), "Exec:meta.gpu:name");
        assert_eq!(aliased.table(), Some("Exec"));
        assert_eq!(aliased.path(), "meta.gpu:name");
        assert_eq!(aliased.alias(), Some("gpu"));
        assert_eq!(aliased.label(), "gpu");
        assert_eq!(plain.label(), "Metric:value");

        let bare = FieldRef::from("name");
        assert_eq!(bare.table(), None);
        assert_eq!(bare.path(), "name");
    }

    #[test]
    fn test_operator_tokens() {
        for op in Operator::ALL {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
        assert_eq!("NOT   IN".parse::<Operator>().unwrap(), Operator::NotIn);
        assert!("~=".parse::<Operator>().is_err());
        assert!(Operator::In.takes_list());
        assert!(!Operator::Like.takes_list());
    }

    #[test]
    fn test_operator_serde_uses_tokens() {
        assert_eq!(serde_json::to_string(&Operator::IsNot).unwrap(), r#""is not""#);
        let op: Operator = serde_json::from_str(r#""<=""#).unwrap();
        assert_eq!(op, Operator::Lte);
    }

    #[test]
    fn test_aggregator_tokens() {
        assert_eq!("MEDIAN".parse::<Aggregator>().unwrap(), Aggregator::Median);
        assert!("mode".parse::<Aggregator>().is_err());
        assert_eq!(serde_json::to_string(&Aggregator::Std).unwrap(), r#""std""#);
    }

    #[test]
    fn test_filter_value_untagged() {
        let single: FilterValue = serde_json::from_str(r#""rate""#).unwrap();
        assert_eq!(single, FilterValue::Single("rate".to_string()));
        let list: FilterValue = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(list, FilterValue::List(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_value_defaults_to_avg() {
        let value = PivotField::value("Metric:value", vec![]);
        assert_eq!(value.aggregators, vec![Aggregator::Avg]);
        assert!(value.is_complete());
    }

    #[test]
    fn test_retarget_clears_stale_attributes() {
        let mut field =
            PivotField::filter("Metric:name", Operator::Eq, FilterValue::Single("rate".into()));
        field.retarget(Role::Value);
        assert_eq!(field.operator, None);
        assert_eq!(field.filter_value, None);
        assert_eq!(field.aggregators, vec![Aggregator::Avg]);

        field.retarget(Role::Row);
        assert!(field.aggregators.is_empty());
        assert_eq!(field, PivotField::row("Metric:name"));
    }

    #[test]
    fn test_incomplete_filter() {
        assert!(!PivotField::incomplete_filter("Metric:name").is_complete());
    }
}
