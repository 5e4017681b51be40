pub mod field;
pub mod registry;
pub mod reorder;
pub mod codec;
pub mod saved;
pub mod normalize;
pub mod gateway;
pub mod sql_compiler;
pub mod session;
pub mod config;

pub use codec::{PivotSnapshot, QueryParams, RelativeFlags};
pub use config::BuilderConfig;
pub use field::{Aggregator, FieldRef, FilterValue, Operator, PivotField, Role};
pub use gateway::{FileGateway, QueryGateway, Resolution, StructuredRequest};
pub use normalize::{RelativeNormalizer, ResultRow};
pub use registry::{FieldRegistry, RegistryError, RegistryId};
pub use reorder::{MoveOutcome, MoveRequest, PendingFilter, ReorderError};
pub use saved::SavedQuery;
pub use session::{BuilderState, EditAggregatorsCommand, EditFilterCommand, NullSink, ParamSink};
pub use sql_compiler::SqlCompiler;
