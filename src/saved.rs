//! Saved query documents.
//!
//! Storage belongs to a persistence service; this module only builds and
//! reads the document `{name, query: {target, parameters}, createdAt}` whose
//! `parameters` is exactly the codec's flat map.

use crate::codec::{PivotSnapshot, QueryParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SavedQueryError {
    #[error("saved query needs a name")]
    MissingName,

    #[error("failed to access `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid saved query document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryBody {
    /// Logical destination view
    pub target: String,
    pub parameters: QueryParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQuery {
    pub name: String,
    pub query: QueryBody,
    pub created_at: DateTime<Utc>,
}

impl SavedQuery {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        snapshot: &PivotSnapshot,
    ) -> Result<Self, SavedQueryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SavedQueryError::MissingName);
        }
        Ok(Self {
            name,
            query: QueryBody {
                target: target.into(),
                parameters: snapshot.to_params(),
            },
            created_at: Utc::now(),
        })
    }

    /// Rehydrates the builder state stored in this document
    pub fn snapshot(&self) -> PivotSnapshot {
        PivotSnapshot::from_params(&self.query.parameters)
    }

    pub fn to_json(&self) -> Result<String, SavedQueryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SavedQueryError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), SavedQueryError> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|source| SavedQueryError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<Self, SavedQueryError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| SavedQueryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }
}
