//! Curated paper list read from a JSON file.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use paperscope_core::{Discovery, Error, Result};

use super::payload::{entry_list, normalize_entries};
use super::SourceConnector;

pub struct StaticListConnector {
    source_id: String,
    path: PathBuf,
    limit: usize,
}

impl StaticListConnector {
    pub fn new(source_id: &str, path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            source_id: source_id.to_string(),
            path: path.into(),
            limit,
        }
    }
}

#[async_trait]
impl SourceConnector for StaticListConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn discover(&self) -> Result<Discovery> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::PermanentInput(format!("reading {}: {e}", self.path.display()))
        })?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::PermanentInput(format!("parsing {}: {e}", self.path.display())))?;
        let entries = entry_list(&payload).ok_or_else(|| {
            Error::PermanentInput(format!("{} holds no paper list", self.path.display()))
        })?;
        Ok(normalize_entries(&self.source_id, entries, self.limit))
    }
}
