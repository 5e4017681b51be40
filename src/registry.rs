//! 字段注册表: 有序的 PivotField 序列
//!
//! 顺序只在同一角色内部有意义, 行轴就是"注册表中所有 row 字段按出现顺序"。

use crate::field::{Aggregator, FieldRef, FilterValue, Operator, PivotField, Role};
use thiserror::Error;

/// 字段追加后在注册表中的位置
pub type RegistryId = usize;

/// 变更接口拒绝的操作
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("index {index} out of range (registry has {len} fields)")]
    OutOfRange { index: usize, len: usize },

    #[error("a value field needs at least one aggregator")]
    EmptyAggregators,

    #[error("field at {index} has role `{role}`, expected `{expected}`")]
    WrongRole { index: usize, role: Role, expected: Role },

    #[error("operator `{operator}` expects {expected}")]
    FilterValueShape { operator: Operator, expected: &'static str },

    #[error("field reference `{0}` is empty or contains a comma")]
    InvalidFieldRef(FieldRef),

    #[error("filter on `{0}` has no operator and value yet")]
    IncompleteFilter(FieldRef),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRegistry {
    fields: Vec<PivotField>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(
        fields: impl IntoIterator<Item = PivotField>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for field in fields {
            registry.append(field)?;
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PivotField> {
        self.fields.get(index)
    }

    pub fn fields(&self) -> &[PivotField] {
        &self.fields
    }

    pub fn iter(&self) -> impl Iterator<Item = &PivotField> {
        self.fields.iter()
    }

    /// 追加到序列末尾
    ///
    /// 未完成或值形状不对的过滤字段、空的字段引用都会被拒绝,
    /// 注册表中的字段因此总能原样编码。
    pub fn append(&mut self, mut field: PivotField) -> Result<RegistryId, RegistryError> {
        field.normalize();
        check_field(&field)?;
        self.fields.push(field);
        Ok(self.fields.len() - 1)
    }

    /// 按位置删除, 之后的索引依次前移
    pub fn remove(&mut self, index: usize) -> Result<PivotField, RegistryError> {
        self.check_index(index)?;
        Ok(self.fields.remove(index))
    }

    /// 替换值字段的聚合列表, 拒绝空列表
    pub fn update_aggregators(
        &mut self,
        index: usize,
        aggregators: Vec<Aggregator>,
    ) -> Result<(), RegistryError> {
        self.expect_role(index, Role::Value)?;
        if aggregators.is_empty() {
            return Err(RegistryError::EmptyAggregators);
        }
        self.fields[index].aggregators = aggregators;
        Ok(())
    }

    /// 同时替换过滤字段的运算符和值
    pub fn update_filter(
        &mut self,
        index: usize,
        operator: Operator,
        value: FilterValue,
    ) -> Result<(), RegistryError> {
        self.expect_role(index, Role::Filter)?;
        check_filter_shape(operator, &value)?;
        let field = &mut self.fields[index];
        field.operator = Some(operator);
        field.filter_value = Some(value);
        Ok(())
    }

    /// 某个角色的字段, 保持注册表顺序
    pub fn by_role(&self, role: Role) -> Vec<&PivotField> {
        self.fields.iter().filter(|f| f.role == role).collect()
    }

    /// 每个角色的子序列都相同即视为等价, 不同角色之间的交错顺序不计
    pub fn equivalent(&self, other: &FieldRegistry) -> bool {
        Role::ALL.into_iter().all(|role| self.by_role(role) == other.by_role(role))
    }

    /// 某个角色的字段在整个注册表中的位置
    pub fn positions_of(&self, role: Role) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.role == role)
            .map(|(i, _)| i)
            .collect()
    }

    /// 插入到指定位置, 位置越界时追加到末尾
    pub(crate) fn insert(
        &mut self,
        index: usize,
        mut field: PivotField,
    ) -> Result<RegistryId, RegistryError> {
        field.normalize();
        check_field(&field)?;
        let index = index.min(self.fields.len());
        self.fields.insert(index, field);
        Ok(index)
    }

    fn check_index(&self, index: usize) -> Result<(), RegistryError> {
        if index < self.fields.len() {
            Ok(())
        } else {
            Err(RegistryError::OutOfRange { index, len: self.fields.len() })
        }
    }

    fn expect_role(&self, index: usize, expected: Role) -> Result<(), RegistryError> {
        self.check_index(index)?;
        let role = self.fields[index].role;
        if role == expected {
            Ok(())
        } else {
            Err(RegistryError::WrongRole { index, role, expected })
        }
    }
}

/// `in`/`not in` 必须是列表, 其余运算符必须是单个值
pub fn check_filter_shape(operator: Operator, value: &FilterValue) -> Result<(), RegistryError> {
    match (operator.takes_list(), value.is_list()) {
        (true, false) => {
            Err(RegistryError::FilterValueShape { operator, expected: "a list of values" })
        }
        (false, true) => {
            Err(RegistryError::FilterValueShape { operator, expected: "a single value" })
        }
        _ => Ok(()),
    }
}

/// 字段引用不能为空, 也不能含有 `,` (行列参数以逗号拼接)
pub fn check_field_ref(field: &FieldRef) -> Result<(), RegistryError> {
    let raw = field.as_str();
    if raw.trim().is_empty() || raw.contains(',') {
        return Err(RegistryError::InvalidFieldRef(field.clone()));
    }
    Ok(())
}

/// 能否进入注册表: 引用合法, 过滤字段完整且值形状正确
pub fn check_field(field: &PivotField) -> Result<(), RegistryError> {
    check_field_ref(&field.field)?;
    if field.role != Role::Filter {
        return Ok(());
    }
    match (field.operator, &field.filter_value) {
        (Some(operator), Some(value)) => check_filter_shape(operator, value),
        _ => Err(RegistryError::IncompleteFilter(field.field.clone())),
    }
}
