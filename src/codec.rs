//! Query codec: maps a pivot snapshot to a flat string parameter map and back.
//!
//! The same map is mirrored into the URL and stored as the `parameters` of a
//! saved query, so the encoding has to stay byte-compatible with documents
//! that already exist:
//!
//! * `rows` / `cols` - comma-joined field references
//! * `values` - base64(JSON list of `{field, aggregators}`), always present
//! * `filters` - base64(JSON list of `{field, operator, value}`), only when non-empty
//! * `relative`, `relative_column`, `baseline`, `relative_metric` - scalar flags

use crate::field::{
    default_aggregators, Aggregator, FieldRef, FilterValue, Operator, PivotField, Role,
};
use crate::registry::{check_filter_shape, FieldRegistry};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Flat string-keyed parameter map
pub type QueryParams = BTreeMap<String, String>;

pub const ROWS: &str = "rows";
pub const COLS: &str = "cols";
pub const VALUES: &str = "values";
pub const FILTERS: &str = "filters";
pub const RELATIVE: &str = "relative";
pub const RELATIVE_COLUMN: &str = "relative_column";
pub const BASELINE: &str = "baseline";
pub const RELATIVE_METRIC: &str = "relative_metric";

/// Wire shape of a value field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEntry {
    pub field: FieldRef,
    pub aggregators: Vec<Aggregator>,
}

/// Wire shape of a complete filter field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub field: FieldRef,
    pub operator: Operator,
    pub value: FilterValue,
}

impl ValueEntry {
    pub fn into_field(self) -> PivotField {
        PivotField::value(self.field, self.aggregators)
    }
}

impl FilterEntry {
    pub fn into_field(self) -> PivotField {
        PivotField::filter(self.field, self.operator, self.value)
    }
}

/// Baseline-relative display settings carried next to the field list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelativeFlags {
    pub enabled: bool,
    pub column: Option<String>,
    pub baseline: Option<String>,
    pub metric: Option<String>,
}

/// Everything the codec mirrors: the registry plus auxiliary flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PivotSnapshot {
    pub registry: FieldRegistry,
    pub relative: RelativeFlags,
}

impl PivotSnapshot {
    pub fn new(registry: FieldRegistry) -> Self {
        Self { registry, relative: RelativeFlags::default() }
    }

    pub fn to_params(&self) -> QueryParams {
        encode(self)
    }

    pub fn from_params(params: &QueryParams) -> Self {
        decode(params)
    }

    /// Same per-role field order and same flags
    pub fn equivalent(&self, other: &PivotSnapshot) -> bool {
        self.relative == other.relative && self.registry.equivalent(&other.registry)
    }
}

/// Field references of one role, in registry order
pub fn role_refs(registry: &FieldRegistry, role: Role) -> Vec<FieldRef> {
    registry.by_role(role).into_iter().map(|f| f.field.clone()).collect()
}

pub fn value_entries(registry: &FieldRegistry) -> Vec<ValueEntry> {
    registry
        .by_role(Role::Value)
        .into_iter()
        .map(|f| ValueEntry { field: f.field.clone(), aggregators: f.aggregators.clone() })
        .collect()
}

/// Complete filter fields only; a half-built filter never leaves the builder
pub fn filter_entries(registry: &FieldRegistry) -> Vec<FilterEntry> {
    registry
        .by_role(Role::Filter)
        .into_iter()
        .filter_map(|f| match (f.operator, &f.filter_value) {
            (Some(operator), Some(value)) => Some(FilterEntry {
                field: f.field.clone(),
                operator,
                value: value.clone(),
            }),
            _ => {
                debug!(field = %f.field, "skipping incomplete filter");
                None
            }
        })
        .collect()
}

pub fn encode(snapshot: &PivotSnapshot) -> QueryParams {
    let registry = &snapshot.registry;
    let mut params = QueryParams::new();

    params.insert(ROWS.to_string(), join_refs(&role_refs(registry, Role::Row)));
    params.insert(COLS.to_string(), join_refs(&role_refs(registry, Role::Column)));
    params.insert(VALUES.to_string(), encode_json(&value_entries(registry)));

    let filters = filter_entries(registry);
    if !filters.is_empty() {
        params.insert(FILTERS.to_string(), encode_json(&filters));
    }

    let relative = &snapshot.relative;
    if relative.enabled {
        params.insert(RELATIVE.to_string(), "true".to_string());
    }
    for (key, value) in [
        (RELATIVE_COLUMN, &relative.column),
        (BASELINE, &relative.baseline),
        (RELATIVE_METRIC, &relative.metric),
    ] {
        if let Some(value) = value {
            params.insert(key.to_string(), value.clone());
        }
    }

    params
}

/// Never fails: malformed entries degrade instead of aborting the decode
pub fn decode(params: &QueryParams) -> PivotSnapshot {
    let mut registry = FieldRegistry::new();

    let rows = split_refs(params.get(ROWS).map(String::as_str))
        .into_iter()
        .map(|f| PivotField::row(f));
    let cols = split_refs(params.get(COLS).map(String::as_str))
        .into_iter()
        .map(|f| PivotField::column(f));
    let values = params.get(VALUES).map(|raw| decode_values(raw)).unwrap_or_default();
    let filters = params.get(FILTERS).map(|raw| decode_filters(raw)).unwrap_or_default();
    for field in rows.chain(cols).chain(values).chain(filters) {
        let name = field.field.clone();
        if let Err(err) = registry.append(field) {
            warn!(field = %name, error = %err, "dropping field");
        }
    }

    let relative = RelativeFlags {
        enabled: params.get(RELATIVE).map(String::as_str) == Some("true"),
        column: non_empty(params.get(RELATIVE_COLUMN)),
        baseline: non_empty(params.get(BASELINE)),
        metric: non_empty(params.get(RELATIVE_METRIC)),
    };

    PivotSnapshot { registry, relative }
}

#[derive(Deserialize)]
struct RawValueEntry {
    field: String,
    #[serde(default)]
    aggregators: Vec<String>,
}

#[derive(Deserialize)]
struct RawFilterEntry {
    field: String,
    operator: String,
    value: FilterValue,
}

/// Decodes `values`; anything that is not base64(JSON) is read as the legacy
/// comma-joined list of bare field names.
pub fn decode_values(raw: &str) -> Vec<PivotField> {
    if raw.is_empty() {
        return Vec::new();
    }
    match decode_json::<Vec<RawValueEntry>>(raw) {
        Ok(entries) => entries
            .into_iter()
            .map(|entry| {
                let aggregators = parse_aggregators(&entry.field, &entry.aggregators);
                PivotField::value(entry.field, aggregators)
            })
            .collect(),
        Err(err) => {
            warn!(error = %err, "values is not base64 JSON, reading it as a legacy field list");
            split_refs(Some(raw))
                .into_iter()
                .map(|field| PivotField::value(field, default_aggregators()))
                .collect()
        }
    }
}

/// Decodes `filters`; a malformed payload drops every filter and malformed
/// entries are dropped one by one.
pub fn decode_filters(raw: &str) -> Vec<PivotField> {
    let entries = match decode_json::<Vec<RawFilterEntry>>(raw) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "dropping undecodable filters");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            let operator = match entry.operator.parse::<Operator>() {
                Ok(operator) => operator,
                Err(err) => {
                    warn!(field = %entry.field, error = %err, "dropping filter");
                    return None;
                }
            };
            if let Err(err) = check_filter_shape(operator, &entry.value) {
                warn!(field = %entry.field, error = %err, "dropping filter");
                return None;
            }
            Some(PivotField::filter(entry.field, operator, entry.value))
        })
        .collect()
}

fn parse_aggregators(field: &str, tokens: &[String]) -> Vec<Aggregator> {
    let aggregators: Vec<Aggregator> = tokens
        .iter()
        .filter_map(|token| match token.parse::<Aggregator>() {
            Ok(agg) => Some(agg),
            Err(err) => {
                warn!(field, error = %err, "ignoring aggregator");
                None
            }
        })
        .collect();
    if aggregators.is_empty() {
        default_aggregators()
    } else {
        aggregators
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PayloadError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> String {
    // Serializing plain structs of strings into a Vec cannot fail
    let json = serde_json::to_vec(value).unwrap_or_default();
    BASE64_STANDARD.encode(json)
}

pub(crate) fn decode_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, PayloadError> {
    let bytes = BASE64_STANDARD.decode(raw.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn join_refs(refs: &[FieldRef]) -> String {
    refs.iter().map(FieldRef::as_str).collect::<Vec<_>>().join(",")
}

fn split_refs(raw: Option<&str>) -> Vec<FieldRef> {
    raw.map(|raw| {
        raw.split(',')
            .filter(|token| !token.is_empty())
            .map(FieldRef::from)
            .collect()
    })
    .unwrap_or_default()
}

fn non_empty(raw: Option<&String>) -> Option<String> {
    raw.filter(|value| !value.is_empty()).cloned()
}

/// Renders the parameter map as an `application/x-www-form-urlencoded` query string
pub fn to_query_string(params: &QueryParams) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}

/// Parses a query string (a leading `?` is allowed); later duplicates win
pub fn from_query_string(query: &str) -> QueryParams {
    let query = query.strip_prefix('?').unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}
