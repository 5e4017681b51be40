//! 配置模块，负责加载JSON配置文件

use crate::codec::{FilterEntry, RelativeFlags, ValueEntry};
use crate::field::{Aggregator, FieldRef, PivotField};
use crate::registry::{check_filter_shape, FieldRegistry, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "pivot_builder.json";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {0}")]
    NotFound(String),

    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("无法解析JSON配置文件 {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("初始字段无效 {field}: {message}")]
    InvalidSeed { field: String, message: String },
}

/// 会话开始时的默认字段列表, 与查询参数使用相同的结构
///
/// 只给出部分角色时, 其余角色为空而不是回落到默认字段。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub rows: Vec<FieldRef>,
    #[serde(default)]
    pub cols: Vec<FieldRef>,
    #[serde(default)]
    pub values: Vec<ValueEntry>,
    #[serde(default)]
    pub filters: Vec<FilterEntry>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            rows: vec![FieldRef::from("Exec:name")],
            cols: vec![FieldRef::from("Metric:name")],
            values: vec![ValueEntry {
                field: FieldRef::from("Metric:value"),
                aggregators: vec![Aggregator::Avg],
            }],
            filters: Vec::new(),
        }
    }
}

impl SeedConfig {
    pub fn registry(&self) -> Result<FieldRegistry, RegistryError> {
        let rows = self.rows.iter().cloned().map(|f| PivotField::row(f));
        let cols = self.cols.iter().cloned().map(|f| PivotField::column(f));
        let values = self.values.iter().cloned().map(ValueEntry::into_field);
        let filters = self.filters.iter().cloned().map(FilterEntry::into_field);
        FieldRegistry::from_fields(rows.chain(cols).chain(values).chain(filters))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for value in &self.values {
            if value.aggregators.is_empty() {
                return Err(ConfigError::InvalidSeed {
                    field: value.field.to_string(),
                    message: "至少需要一个聚合函数".to_string(),
                });
            }
        }
        for filter in &self.filters {
            check_filter_shape(filter.operator, &filter.value).map_err(|e| {
                ConfigError::InvalidSeed { field: filter.field.to_string(), message: e.to_string() }
            })?;
        }
        self.registry().map_err(|e| ConfigError::InvalidSeed {
            field: "seed".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// 相对值 (基线归一化) 的默认设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeConfig {
    pub column: Option<String>,
    pub baseline: Option<String>,
    pub metric: Option<String>,
}

impl RelativeConfig {
    /// 默认关闭, 只预填列/基线/指标
    pub fn flags(&self) -> RelativeFlags {
        RelativeFlags {
            enabled: false,
            column: self.column.clone(),
            baseline: self.baseline.clone(),
            metric: self.metric.clone(),
        }
    }
}

/// 构建器配置结构
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// 保存查询时的目标视图
    pub target: String,
    pub seed: SeedConfig,
    /// 逻辑表名到数据库表名的映射
    pub table_mapping: HashMap<String, String>,
    pub relative: RelativeConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            target: "pivot".to_string(),
            seed: SeedConfig::default(),
            table_mapping: HashMap::new(),
            relative: RelativeConfig::default(),
        }
    }
}

impl BuilderConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::NotFound(path_ref.display().to_string()));
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;

        let config: BuilderConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path_ref.display().to_string(),
                source,
            })?;
        config.seed.validate()?;

        Ok(config)
    }

    /// 加载失败时使用默认配置
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "使用默认配置");
                Self::default()
            }
        }
    }
}
