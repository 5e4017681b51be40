//! 拖拽重排引擎
//!
//! 把一次拖拽手势 (`MoveRequest`) 解析为注册表的新顺序或新角色。
//!
//! ```text
//! apply_move()
//!   ├─ 校验 source_index 与 source_role
//!   ├─ 从注册表删除源字段 (后续索引前移一位)
//!   ├─ 同角色 → 纯重排, 插入到目标子序列的 before_index 处
//!   └─ 跨角色 → 改写角色
//!        ├─ filter → 返回 PendingFilter, 字段暂不在注册表中
//!        └─ 其他   → 插入到目标子序列 (无位置信息时追加到末尾)
//! ```

use crate::field::{FieldRef, FilterValue, Operator, PivotField, Role};
use crate::registry::{
    check_field_ref, check_filter_shape, FieldRegistry, RegistryError, RegistryId,
};
use thiserror::Error;
use tracing::debug;

/// 一次拖拽手势, 任何事件源 (指针、键盘、程序调用) 都可以产生
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    /// 被移动字段在整个注册表中的位置
    pub source_index: usize,
    pub source_role: Role,
    pub target_role: Role,
    /// 目标角色子序列中的序号, 字段落在该元素之前; None 表示追加
    pub before_index: Option<isize>,
}

impl MoveRequest {
    pub fn new(source_index: usize, source_role: Role, target_role: Role) -> Self {
        Self { source_index, source_role, target_role, before_index: None }
    }

    pub fn before(mut self, before_index: isize) -> Self {
        self.before_index = Some(before_index);
        self
    }
}

/// 等待填写运算符和值的过滤字段, 此时它不在注册表中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFilter {
    pub field: FieldRef,
    pub before_index: Option<isize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// 字段已落在注册表的该位置
    Completed { index: RegistryId },
    PendingFilter(PendingFilter),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReorderError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("field at {index} has role `{actual}`, move request says `{expected}`")]
    RoleMismatch { index: usize, expected: Role, actual: Role },
}

/// 执行一次移动
///
/// 失败时注册表保持不变。
pub fn apply_move(
    registry: &mut FieldRegistry,
    request: MoveRequest,
) -> Result<MoveOutcome, ReorderError> {
    let actual = registry
        .get(request.source_index)
        .map(|f| f.role)
        .ok_or(RegistryError::OutOfRange { index: request.source_index, len: registry.len() })?;
    if actual != request.source_role {
        return Err(ReorderError::RoleMismatch {
            index: request.source_index,
            expected: request.source_role,
            actual,
        });
    }

    let mut field = registry.remove(request.source_index)?;

    if request.source_role == request.target_role {
        let position = subsequence_position(registry, request.target_role, request.before_index);
        let index = registry.insert(position, field)?;
        debug!(
            from = request.source_index,
            to = index,
            role = %request.target_role,
            "reordered field"
        );
        return Ok(MoveOutcome::Completed { index });
    }

    if request.target_role == Role::Filter {
        debug!(field = %field.field, "move into filters is pending operator and value");
        return Ok(MoveOutcome::PendingFilter(PendingFilter {
            field: field.field,
            before_index: request.before_index,
        }));
    }

    field.retarget(request.target_role);
    let position = cross_role_position(registry, request.target_role, request.before_index);
    let index = registry.insert(position, field)?;
    debug!(
        from = request.source_index,
        to = index,
        source = %request.source_role,
        target = %request.target_role,
        "moved field to another role"
    );
    Ok(MoveOutcome::Completed { index })
}

/// 从字段列表拖入一个新字段, 落点规则与跨角色移动相同
pub fn place_new(
    registry: &mut FieldRegistry,
    field: FieldRef,
    role: Role,
    before_index: Option<isize>,
) -> Result<MoveOutcome, ReorderError> {
    check_field_ref(&field)?;
    if role == Role::Filter {
        return Ok(MoveOutcome::PendingFilter(PendingFilter { field, before_index }));
    }
    let mut pivot = PivotField::row(field);
    pivot.retarget(role);
    let position = cross_role_position(registry, role, before_index);
    let index = registry.insert(position, pivot)?;
    Ok(MoveOutcome::Completed { index })
}

/// 为拖入过滤区的字段补齐运算符和值, 然后插回注册表
pub fn complete_filter(
    registry: &mut FieldRegistry,
    pending: PendingFilter,
    operator: Operator,
    value: FilterValue,
) -> Result<RegistryId, ReorderError> {
    check_filter_shape(operator, &value)?;
    let position = cross_role_position(registry, Role::Filter, pending.before_index);
    let filter = PivotField::filter(pending.field, operator, value);
    registry.insert(position, filter).map_err(ReorderError::from)
}

/// 目标角色子序列中 before_index 对应的注册表位置
///
/// 负数或越界的 before_index 视为追加到子序列末尾;
/// 子序列为空时追加到注册表末尾。
pub fn subsequence_position(
    registry: &FieldRegistry,
    role: Role,
    before_index: Option<isize>,
) -> usize {
    let positions = registry.positions_of(role);
    let before = before_index.and_then(|b| usize::try_from(b).ok());
    match before {
        Some(b) if b < positions.len() => positions[b],
        _ => positions.last().map_or(registry.len(), |last| last + 1),
    }
}

fn cross_role_position(registry: &FieldRegistry, role: Role, before_index: Option<isize>) -> usize {
    match before_index {
        Some(_) => subsequence_position(registry, role, before_index),
        None => registry.len(),
    }
}
