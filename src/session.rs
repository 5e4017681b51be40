//! 一次构建会话的状态
//!
//! `BuilderState` 持有唯一的字段注册表、相对值开关和尚未完成的过滤字段。
//! 每次成功的变更都会把编码后的参数推送给 `ParamSink` 恰好一次,
//! 由外部适配器写入 URL。

use crate::codec::{PivotSnapshot, QueryParams, RelativeFlags};
use crate::config::BuilderConfig;
use crate::field::{Aggregator, FieldRef, FilterValue, Operator, Role};
use crate::gateway::{ExecutionTicket, ExecutionTracker, GatewayError, LegacyRequest, QueryGateway};
use crate::gateway::{RenderFragment, Resolution, StructuredRequest};
use crate::normalize::{RelativeNormalizer, ResultRow};
use crate::registry::{FieldRegistry, RegistryError, RegistryId};
use crate::reorder::{self, MoveOutcome, MoveRequest, PendingFilter, ReorderError};
use crate::saved::{SavedQuery, SavedQueryError};
use thiserror::Error;
use tracing::{debug, warn};

/// 接收参数镜像的一方 (URL/history 适配器)
pub trait ParamSink {
    fn mirror(&mut self, params: &QueryParams);
}

impl<F: FnMut(&QueryParams)> ParamSink for F {
    fn mirror(&mut self, params: &QueryParams) {
        self(params)
    }
}

/// 不做任何事的镜像
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ParamSink for NullSink {
    fn mirror(&mut self, _params: &QueryParams) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Reorder(#[from] ReorderError),

    #[error("no filter is waiting for an operator and value")]
    NoPendingFilter,

    #[error("relative {0} must not be empty")]
    EmptyRelativeSetting(&'static str),
}

/// 修改值字段的聚合列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditAggregatorsCommand {
    pub index: usize,
    pub aggregators: Vec<Aggregator>,
}

/// 同时修改过滤字段的运算符和值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFilterCommand {
    pub index: usize,
    pub operator: Operator,
    pub value: FilterValue,
}

pub struct BuilderState {
    snapshot: PivotSnapshot,
    pending: Option<PendingFilter>,
    sink: Box<dyn ParamSink>,
    tracker: ExecutionTracker,
}

impl std::fmt::Debug for BuilderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderState")
            .field("snapshot", &self.snapshot)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl BuilderState {
    pub fn new(snapshot: PivotSnapshot, sink: Box<dyn ParamSink>) -> Self {
        Self {
            snapshot,
            pending: None,
            sink,
            tracker: ExecutionTracker::new(),
        }
    }

    /// 使用配置中的默认字段开始会话
    pub fn seeded(config: &BuilderConfig, sink: Box<dyn ParamSink>) -> Result<Self, SessionError> {
        let snapshot = PivotSnapshot {
            registry: config.seed.registry()?,
            relative: config.relative.flags(),
        };
        Ok(Self::new(snapshot, sink))
    }

    /// 从 URL 参数恢复
    pub fn from_params(params: &QueryParams, sink: Box<dyn ParamSink>) -> Self {
        Self::new(PivotSnapshot::from_params(params), sink)
    }

    /// 从保存的查询恢复
    pub fn from_saved(saved: &SavedQuery, sink: Box<dyn ParamSink>) -> Self {
        Self::new(saved.snapshot(), sink)
    }

    pub fn snapshot(&self) -> &PivotSnapshot {
        &self.snapshot
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.snapshot.registry
    }

    pub fn relative(&self) -> &RelativeFlags {
        &self.snapshot.relative
    }

    pub fn pending_filter(&self) -> Option<&PendingFilter> {
        self.pending.as_ref()
    }

    pub fn params(&self) -> QueryParams {
        self.snapshot.to_params()
    }

    fn commit(&mut self) {
        let params = self.snapshot.to_params();
        debug!(keys = params.len(), "mirroring builder state");
        self.sink.mirror(&params);
    }

    fn abandon_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(field = %pending.field, "abandoning pending filter");
        }
    }

    /// 把一个新字段放入某个角色区域; 放入过滤区时返回待完成的过滤字段
    pub fn place(
        &mut self,
        field: impl Into<FieldRef>,
        role: Role,
        before_index: Option<isize>,
    ) -> Result<MoveOutcome, SessionError> {
        let outcome =
            reorder::place_new(&mut self.snapshot.registry, field.into(), role, before_index)?;
        self.abandon_pending();
        match &outcome {
            MoveOutcome::Completed { .. } => self.commit(),
            MoveOutcome::PendingFilter(pending) => self.pending = Some(pending.clone()),
        }
        Ok(outcome)
    }

    /// 执行一次拖拽移动
    ///
    /// 移入过滤区时字段先从注册表删除 (并镜像), 等待 `complete_filter`。
    /// 被拒绝的移动不会影响已有的待定过滤字段。
    pub fn apply_move(&mut self, request: MoveRequest) -> Result<MoveOutcome, SessionError> {
        let outcome = reorder::apply_move(&mut self.snapshot.registry, request)?;
        self.abandon_pending();
        if let MoveOutcome::PendingFilter(pending) = &outcome {
            self.pending = Some(pending.clone());
        }
        self.commit();
        Ok(outcome)
    }

    /// 为待完成的过滤字段填写运算符和值; 校验失败时过滤字段仍然待完成
    pub fn complete_filter(
        &mut self,
        operator: Operator,
        value: FilterValue,
    ) -> Result<RegistryId, SessionError> {
        let pending = self.pending.take().ok_or(SessionError::NoPendingFilter)?;
        let registry = &mut self.snapshot.registry;
        match reorder::complete_filter(registry, pending.clone(), operator, value) {
            Ok(index) => {
                self.commit();
                Ok(index)
            }
            Err(e) => {
                self.pending = Some(pending);
                Err(e.into())
            }
        }
    }

    /// 放弃待完成的过滤字段, 字段不会回到原来的位置
    pub fn abandon_filter(&mut self) -> Option<PendingFilter> {
        let pending = self.pending.take();
        if let Some(pending) = &pending {
            debug!(field = %pending.field, "filter creation abandoned, field dropped");
        }
        pending
    }

    pub fn remove(&mut self, index: usize) -> Result<(), SessionError> {
        self.snapshot.registry.remove(index)?;
        self.commit();
        Ok(())
    }

    pub fn edit_aggregators(
        &mut self,
        command: EditAggregatorsCommand,
    ) -> Result<(), SessionError> {
        self.snapshot
            .registry
            .update_aggregators(command.index, command.aggregators)?;
        self.commit();
        Ok(())
    }

    pub fn edit_filter(&mut self, command: EditFilterCommand) -> Result<(), SessionError> {
        self.snapshot
            .registry
            .update_filter(command.index, command.operator, command.value)?;
        self.commit();
        Ok(())
    }

    /// 列、基线、指标可以不设置, 但不能是空字符串
    pub fn set_relative(&mut self, relative: RelativeFlags) -> Result<(), SessionError> {
        let settings = [
            ("column", &relative.column),
            ("baseline", &relative.baseline),
            ("metric", &relative.metric),
        ];
        for (name, value) in settings {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(SessionError::EmptyRelativeSetting(name));
            }
        }
        self.snapshot.relative = relative;
        self.commit();
        Ok(())
    }

    /// 当前快照的归一化器, 见 `normalizer_for`
    pub fn normalizer(&self) -> Option<RelativeNormalizer> {
        self.normalizer_for(&StructuredRequest::from_registry(self.registry()))
    }

    /// 开启相对值且列、基线、指标都已设置时返回归一化器,
    /// 按 `request` 的行列字段分组
    pub fn normalizer_for(&self, request: &StructuredRequest) -> Option<RelativeNormalizer> {
        let relative = &self.snapshot.relative;
        if !relative.enabled {
            return None;
        }
        match (&relative.column, &relative.baseline, &relative.metric) {
            (Some(column), Some(baseline), Some(metric)) => {
                let group_columns = request
                    .rows
                    .iter()
                    .chain(request.cols.iter())
                    .map(|f| f.label().to_string())
                    .collect();
                Some(RelativeNormalizer::new(column, baseline, metric).group_by(group_columns))
            }
            _ => {
                warn!("relative display enabled without column, baseline and metric");
                None
            }
        }
    }

    /// 只有与当前注册表内容一致、且是最近一次触发的结果才会被采用
    fn resolve<T>(
        &self,
        ticket: &ExecutionTicket,
        result: Result<T, GatewayError>,
    ) -> Resolution<T> {
        if !ticket.matches(&StructuredRequest::from_registry(self.registry())) {
            debug!(sequence = ticket.sequence, "registry changed since execution was triggered");
            return Resolution::Stale;
        }
        self.tracker.resolve(ticket, result)
    }

    /// 为当前快照登记一次执行
    pub fn begin_execution(&mut self) -> (ExecutionTicket, StructuredRequest) {
        let request = StructuredRequest::from_registry(self.registry());
        (self.tracker.begin(&request), request)
    }

    /// 执行返回后调用: 过期结果被丢弃, 失败不影响构建器状态,
    /// 被采用的结果按执行时的行列字段做一次相对值归一化
    pub fn finish_execution(
        &self,
        ticket: &ExecutionTicket,
        result: Result<Vec<ResultRow>, GatewayError>,
    ) -> Resolution<Vec<ResultRow>> {
        match self.resolve(ticket, result) {
            Resolution::Applied(rows) => match self.normalizer_for(ticket.request()) {
                Some(normalizer) => Resolution::Applied(normalizer.normalized(rows)),
                None => Resolution::Applied(rows),
            },
            other => other,
        }
    }

    /// 同步执行结构化查询
    pub fn execute(&mut self, gateway: &dyn QueryGateway) -> Resolution<Vec<ResultRow>> {
        let (ticket, request) = self.begin_execution();
        let result = gateway.query(&request);
        self.finish_execution(&ticket, result)
    }

    /// 旧版字符串查询模式的执行登记, 与结构化执行共用"最新快照优先"规则
    pub fn begin_render(&mut self) -> (ExecutionTicket, LegacyRequest) {
        let ticket = self.tracker.begin(&StructuredRequest::from_registry(self.registry()));
        (ticket, LegacyRequest::from_registry(self.registry()))
    }

    pub fn finish_render(
        &self,
        ticket: &ExecutionTicket,
        result: Result<RenderFragment, GatewayError>,
    ) -> Resolution<RenderFragment> {
        self.resolve(ticket, result)
    }

    /// 同步执行旧版查询, 返回可直接展示的片段
    pub fn render(&mut self, gateway: &dyn QueryGateway) -> Resolution<RenderFragment> {
        let (ticket, request) = self.begin_render();
        let result = gateway.render(&request);
        self.finish_render(&ticket, result)
    }

    pub fn save(&self, name: &str, target: &str) -> Result<SavedQuery, SavedQueryError> {
        SavedQuery::new(name, target, &self.snapshot)
    }

    /// 整体替换状态 (例如载入保存的查询), 同样镜像一次
    pub fn replace(&mut self, snapshot: PivotSnapshot) {
        self.abandon_pending();
        self.snapshot = snapshot;
        self.commit();
    }
}
