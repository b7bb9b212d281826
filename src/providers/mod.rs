pub mod gitlab;
pub mod kanboard;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::model::board::{BoardOperation, BoardState};
use crate::model::record::{Link, Record, RecordId};

/// Fetch failure, split so the caller can decide whether a retry makes sense.
/// Rate limiting and network trouble are worth retrying; bad credentials and
/// missing projects are not. No retrying happens below this boundary.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent fetch failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Classify an HTTP status the way both collaborators need it.
    pub fn from_status(status: reqwest::StatusCode, context: anyhow::Error) -> FetchError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            FetchError::Transient(context)
        } else {
            FetchError::Permanent(context)
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::from_status(status, err.into()),
            // connect/timeout/decode without a status: assume the network
            None => FetchError::Transient(err.into()),
        }
    }
}

/// Failure to apply a single board operation. The run carries on; the next
/// reconciliation re-emits whatever is still divergent.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("parent task for {0} was never created in this run")]
    UnresolvedParent(RecordId),
    #[error("board rejected the operation: {0}")]
    Rejected(String),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

#[async_trait]
pub trait TrackerProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_records(&self, project: &str) -> Result<Vec<Record>, FetchError>;
    async fn fetch_links(&self, project: &str) -> Result<Vec<Link>, FetchError>;
}

#[async_trait]
pub trait BoardProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_board_state(&self) -> Result<BoardState, FetchError>;
    /// Apply one operation. Returns the assigned task id for a creation so
    /// the caller can resolve operations that depend on it.
    async fn apply_operation(
        &self,
        op: &BoardOperation,
        created: &HashMap<RecordId, u64>,
    ) -> Result<Option<u64>, OpError>;
}

pub fn create_tracker(config: &AppConfig) -> anyhow::Result<Box<dyn TrackerProvider>> {
    let cfg = config
        .tracker
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no [tracker] section in config"))?;
    Ok(Box::new(gitlab::GitLabProvider::new(
        cfg.url.clone(),
        cfg.token.clone(),
        cfg.labels.clone(),
    )))
}

pub fn create_board(config: &AppConfig) -> anyhow::Result<Box<dyn BoardProvider>> {
    let cfg = config
        .board
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no [board] section in config"))?;
    Ok(Box::new(kanboard::KanboardProvider::new(
        cfg.url.clone(),
        cfg.token.clone(),
        cfg.project_id,
    )))
}
