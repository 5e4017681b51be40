//! Boundary with the remote query executor.
//!
//! The executor takes one of two request shapes produced from the same
//! registry snapshot:
//!
//! * structured mode - `{rows, cols, values, filters}` as JSON, answered with
//!   flat result rows
//! * legacy mode - flat query parameters, answered with an opaque renderable
//!   fragment
//!
//! Executions are triggered explicitly and may resolve out of order; the
//! [`ExecutionTracker`] keeps only results that match the latest snapshot.

use crate::codec::{encode_json, filter_entries, role_refs, value_entries};
use crate::codec::{FilterEntry, QueryParams, ValueEntry, COLS, FILTERS, ROWS, VALUES};
use crate::field::{Aggregator, FieldRef, Role};
use crate::normalize::ResultRow;
use crate::registry::FieldRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed response: {0}")]
    Response(#[from] serde_json::Error),

    #[error("query backend failed: {0}")]
    Backend(String),
}

/// Structured-mode request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub rows: Vec<FieldRef>,
    pub cols: Vec<FieldRef>,
    pub values: Vec<ValueEntry>,
    pub filters: Vec<FilterEntry>,
}

impl StructuredRequest {
    pub fn from_registry(registry: &FieldRegistry) -> Self {
        Self {
            rows: role_refs(registry, Role::Row),
            cols: role_refs(registry, Role::Column),
            values: value_entries(registry),
            filters: filter_entries(registry),
        }
    }

    /// Canonical JSON of the request, used to match responses to snapshots
    pub fn content_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Legacy-mode request: the render endpoint's query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRequest {
    pub params: QueryParams,
}

impl LegacyRequest {
    /// `values` is a field -> aggregators object here, not a list. A field
    /// used twice as a value merges its aggregators.
    pub fn from_registry(registry: &FieldRegistry) -> Self {
        let mut values: BTreeMap<String, Vec<Aggregator>> = BTreeMap::new();
        for entry in value_entries(registry) {
            let aggregators = values.entry(entry.field.0).or_default();
            for agg in entry.aggregators {
                if !aggregators.contains(&agg) {
                    aggregators.push(agg);
                }
            }
        }

        let join = |role| {
            role_refs(registry, role)
                .iter()
                .map(FieldRef::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };

        let mut params = QueryParams::new();
        params.insert(ROWS.to_string(), join(Role::Row));
        params.insert(COLS.to_string(), join(Role::Column));
        params.insert(VALUES.to_string(), encode_json(&values));
        let filters = filter_entries(registry);
        if !filters.is_empty() {
            params.insert(FILTERS.to_string(), encode_json(&filters));
        }
        Self { params }
    }
}

/// Legacy-mode response, handed to presentation untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFragment(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Structured,
    Legacy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutput {
    Rows(Vec<ResultRow>),
    Fragment(RenderFragment),
}

pub trait QueryGateway {
    fn query(&self, request: &StructuredRequest) -> Result<Vec<ResultRow>, GatewayError>;

    fn render(&self, request: &LegacyRequest) -> Result<RenderFragment, GatewayError>;

    fn execute(
        &self,
        mode: ExecutionMode,
        registry: &FieldRegistry,
    ) -> Result<ExecutionOutput, GatewayError> {
        match mode {
            ExecutionMode::Structured => self
                .query(&StructuredRequest::from_registry(registry))
                .map(ExecutionOutput::Rows),
            ExecutionMode::Legacy => self
                .render(&LegacyRequest::from_registry(registry))
                .map(ExecutionOutput::Fragment),
        }
    }
}

/// Serves canned responses from a file: a JSON array of rows in structured
/// mode, the raw text in legacy mode.
#[derive(Debug, Clone)]
pub struct FileGateway {
    path: PathBuf,
}

impl FileGateway {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn read(&self) -> Result<String, GatewayError> {
        fs::read_to_string(&self.path).map_err(|source| GatewayError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }
}

impl QueryGateway for FileGateway {
    fn query(&self, request: &StructuredRequest) -> Result<Vec<ResultRow>, GatewayError> {
        debug!(
            path = %self.path.display(),
            rows = request.rows.len(),
            cols = request.cols.len(),
            "structured query"
        );
        Ok(serde_json::from_str(&self.read()?)?)
    }

    fn render(&self, _request: &LegacyRequest) -> Result<RenderFragment, GatewayError> {
        Ok(RenderFragment(self.read()?))
    }
}

/// Identifies one triggered execution and the request it was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTicket {
    pub sequence: u64,
    key: String,
    request: StructuredRequest,
}

impl ExecutionTicket {
    /// The snapshot this execution was triggered from
    pub fn request(&self) -> &StructuredRequest {
        &self.request
    }

    /// Whether `request` has the same content as the executed one
    pub fn matches(&self, request: &StructuredRequest) -> bool {
        self.key == request.content_key()
    }
}

#[derive(Debug)]
pub enum Resolution<T> {
    Applied(T),
    Failed(GatewayError),
    /// The snapshot changed after this execution was triggered
    Stale,
}

/// Latest snapshot wins
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    latest: Option<String>,
    issued: u64,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, request: &StructuredRequest) -> ExecutionTicket {
        self.issued += 1;
        let key = request.content_key();
        self.latest = Some(key.clone());
        ExecutionTicket { sequence: self.issued, key, request: request.clone() }
    }

    pub fn is_current(&self, ticket: &ExecutionTicket) -> bool {
        self.latest.as_deref() == Some(ticket.key.as_str())
    }

    pub fn resolve<T>(
        &self,
        ticket: &ExecutionTicket,
        result: Result<T, GatewayError>,
    ) -> Resolution<T> {
        if !self.is_current(ticket) {
            debug!(sequence = ticket.sequence, "discarding stale execution result");
            return Resolution::Stale;
        }
        match result {
            Ok(value) => Resolution::Applied(value),
            Err(err) => {
                warn!(sequence = ticket.sequence, error = %err, "execution failed");
                Resolution::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_json;
    use crate::field::{FilterValue, Operator, PivotField};
    use serde_json::json;
    use std::cell::RefCell;

    fn registry() -> FieldRegistry {
        FieldRegistry::from_fields(vec![
            PivotField::row("Exec:name"),
            PivotField::column("Metric:name"),
            PivotField::value("Metric:value", vec![Aggregator::Avg, Aggregator::Max]),
            PivotField::value("Metric:value", vec![Aggregator::Max, Aggregator::Min]),
            PivotField::filter("Metric:name", Operator::Eq, FilterValue::Single("rate".into())),
        ])
        .unwrap()
    }

    #[test]
    fn test_structured_request_shape() {
        let request = StructuredRequest::from_registry(&registry());
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "rows": ["Exec:name"],
                "cols": ["Metric:name"],
                "values": [
                    {"field": "Metric:value", "aggregators": ["avg", "max"]},
                    {"field": "Metric:value", "aggregators": ["max", "min"]},
                ],
                "filters": [{"field": "Metric:name", "operator": "==", "value": "rate"}],
            })
        );
    }

    #[test]
    fn test_legacy_request_shape() {
        let request = LegacyRequest::from_registry(&registry());
        assert_eq!(request.params[ROWS], "Exec:name");
        assert_eq!(request.params[COLS], "Metric:name");
        let values: BTreeMap<String, Vec<Aggregator>> =
            decode_json(&request.params[VALUES]).unwrap();
        assert_eq!(values["Metric:value"], vec![Aggregator::Avg, Aggregator::Max, Aggregator::Min]);
        let filters: Vec<FilterEntry> = decode_json(&request.params[FILTERS]).unwrap();
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn test_legacy_request_without_filters() {
        let registry = FieldRegistry::from_fields(vec![PivotField::row("Exec:name")]).unwrap();
        let request = LegacyRequest::from_registry(&registry);
        assert!(!request.params.contains_key(FILTERS));
        assert_eq!(request.params[VALUES], encode_json(&serde_json::Map::new()));
    }

    struct Recorder {
        structured: RefCell<Vec<StructuredRequest>>,
    }

    impl QueryGateway for Recorder {
        fn query(&self, request: &StructuredRequest) -> Result<Vec<ResultRow>, GatewayError> {
            self.structured.borrow_mut().push(request.clone());
            Ok(vec![serde_json::from_value(json!({"Exec:name": "bert", "m": 1})).unwrap()])
        }

        fn render(&self, request: &LegacyRequest) -> Result<RenderFragment, GatewayError> {
            Ok(RenderFragment(format!("<table data-rows=\"{}\"></table>", request.params[ROWS])))
        }
    }

    #[test]
    fn test_execute_dispatches_by_mode() {
        let gateway = Recorder { structured: RefCell::new(Vec::new()) };
        let rows = gateway.execute(ExecutionMode::Structured, &registry()).unwrap();
        assert!(matches!(rows, ExecutionOutput::Rows(ref r) if r.len() == 1));
        assert_eq!(gateway.structured.borrow().len(), 1);

        let fragment = gateway.execute(ExecutionMode::Legacy, &registry()).unwrap();
        assert_eq!(
            fragment,
            ExecutionOutput::Fragment(RenderFragment(
                "<table data-rows=\"Exec:name\"></table>".into()
            ))
        );
    }

    #[test]
    fn test_latest_snapshot_wins() {
        let mut tracker = ExecutionTracker::new();
        let first = tracker.begin(&StructuredRequest::from_registry(&registry()));

        let mut changed = registry();
        changed.remove(0).unwrap();
        let second = tracker.begin(&StructuredRequest::from_registry(&changed));

        // 第二次先返回
        assert!(matches!(tracker.resolve(&second, Ok(2)), Resolution::Applied(2)));
        assert!(matches!(tracker.resolve(&first, Ok(1)), Resolution::Stale));
        assert_eq!(first.request().rows.len(), 1);
        assert!(second.request().rows.is_empty());
        assert!(second.matches(&StructuredRequest::from_registry(&changed)));
        assert!(!first.matches(&StructuredRequest::from_registry(&changed)));
    }

    #[test]
    fn test_same_content_is_still_current() {
        let mut tracker = ExecutionTracker::new();
        let first = tracker.begin(&StructuredRequest::from_registry(&registry()));
        let again = tracker.begin(&StructuredRequest::from_registry(&registry()));
        assert_ne!(first.sequence, again.sequence);
        assert!(tracker.is_current(&first));
        assert!(matches!(tracker.resolve(&first, Ok(())), Resolution::Applied(())));
    }

    #[test]
    fn test_failures_are_reported_and_stale_failures_dropped() {
        let mut tracker = ExecutionTracker::new();
        let old = tracker.begin(&StructuredRequest::from_registry(&FieldRegistry::new()));
        let current = tracker.begin(&StructuredRequest::from_registry(&registry()));

        let failed: Resolution<()> =
            tracker.resolve(&current, Err(GatewayError::Backend("503".into())));
        assert!(matches!(failed, Resolution::Failed(GatewayError::Backend(_))));
        let stale: Resolution<()> =
            tracker.resolve(&old, Err(GatewayError::Backend("timeout".into())));
        assert!(matches!(stale, Resolution::Stale));
    }

    #[test]
    fn test_file_gateway() {
        let path = std::env::temp_dir().join(format!("pivot_rows_{}.json", std::process::id()));
        fs::write(&path, r#"[{"Exec:name": "bert", "avg(Metric:value)": 3.5}]"#).unwrap();
        let gateway = FileGateway::new(&path);

        let rows = gateway.query(&StructuredRequest::from_registry(&registry())).unwrap();
        assert_eq!(rows[0]["avg(Metric:value)"], json!(3.5));
        let fragment = gateway.render(&LegacyRequest::from_registry(&registry())).unwrap();
        assert!(fragment.0.contains("bert"));

        fs::remove_file(&path).ok();
        assert!(matches!(
            gateway.query(&StructuredRequest::from_registry(&registry())),
            Err(GatewayError::Io { .. })
        ));
    }
}
