//! Hook for surfacing `UserChoice` conflicts to a UI.

use crate::resolver::ConflictRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// The user's answer to a presented conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum UserResolution {
    KeepLocal,
    TakeRemote,
    /// A new value, e.g. a manual merge of both sides.
    Value(serde_json::Value),
}

/// Presents conflicts and reports the user's answer asynchronously.
///
/// The local value stays in place until an answer arrives; the answer is then
/// written as an ordinary local field write that supersedes both sides.
/// Dropping the sender settles the conflict under the fallback strategy.
pub trait ConflictPresenter: Send + Sync {
    fn present_conflict(&self, record: ConflictRecord) -> oneshot::Receiver<UserResolution>;
}
