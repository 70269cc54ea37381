//! Transport abstraction.
//!
//! The core only needs two calls against a remote: push a batch of local
//! operations and pull the remote's operation stream from a cursor. Whether
//! the remote is a server, a relay or another replica is the transport's
//! concern.

use crate::error::SyncResult;
use async_trait::async_trait;
use tandem_types::{Operation, OperationId};

/// Acknowledgement of a push. Only acknowledged operations are marked synced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushAck {
    pub accepted: Vec<OperationId>,
}

/// One page of the remote operation stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullBatch {
    pub operations: Vec<Operation>,
    /// Opaque position to resume from; committed with the merged state.
    pub cursor: u64,
}

/// A remote the coordinator can exchange operations with.
///
/// Remotes may deliver the same operation more than once and must preserve
/// the order in which each origin's operations were pushed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends operations in log order.
    async fn push(&self, operations: &[Operation]) -> SyncResult<PushAck>;

    /// Fetches up to `limit` operations after `since`.
    async fn pull(&self, since: u64, limit: usize) -> SyncResult<PullBatch>;
}

/// In-memory relay for tests: every endpoint shares one operation log.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tandem_types::{decode_operations, encode_operations};

    #[derive(Debug, Default)]
    struct RelayState {
        /// Each entry is one encoded operation, exactly as it crossed the wire.
        log: Vec<Vec<u8>>,
        seen: HashSet<OperationId>,
        offline: bool,
        /// Accept this many operations of the next push, then fail it.
        fail_next_push_after: Option<usize>,
        duplicate_delivery: bool,
        latency: Option<Duration>,
        pushes: usize,
        /// Operations pushes leave unstored and unacknowledged.
        refused: HashSet<OperationId>,
    }

    /// A relay that stores operations in arrival order and serves them to
    /// any endpoint. Pushes are deduplicated by operation ID.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryRelay {
        state: Arc<Mutex<RelayState>>,
    }

    impl MemoryRelay {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, RelayState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Number of distinct operations stored.
        pub fn len(&self) -> usize {
            self.state().log.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Number of push calls received, including failed ones.
        pub fn push_count(&self) -> usize {
            self.state().pushes
        }

        /// Every stored operation, decoded.
        pub fn operations(&self) -> SyncResult<Vec<Operation>> {
            let state = self.state();
            let mut ops = Vec::with_capacity(state.log.len());
            for bytes in &state.log {
                ops.extend(decode_operations(bytes)?);
            }
            Ok(ops)
        }

        /// While offline every call fails with a network error.
        pub fn set_offline(&self, offline: bool) {
            self.state().offline = offline;
        }

        /// The next push stores its first `accepted` operations and then
        /// fails without an acknowledgement.
        pub fn fail_next_push_after(&self, accepted: usize) {
            self.state().fail_next_push_after = Some(accepted);
        }

        /// Every pulled operation is delivered twice.
        pub fn set_duplicate_delivery(&self, duplicate: bool) {
            self.state().duplicate_delivery = duplicate;
        }

        /// Delay before every response.
        pub fn set_latency(&self, latency: Option<Duration>) {
            self.state().latency = latency;
        }

        /// Pushes of `id` answer normally but neither store nor acknowledge it.
        pub fn refuse(&self, id: OperationId) {
            self.state().refused.insert(id);
        }

        /// Stops refusing operations.
        pub fn accept_all(&self) {
            self.state().refused.clear();
        }

        /// Appends an operation directly, bypassing deduplication.
        pub fn inject(&self, op: &Operation) -> SyncResult<()> {
            let bytes = encode_operations(std::slice::from_ref(op))?;
            self.state().log.push(bytes);
            Ok(())
        }

        async fn delay(&self) {
            let latency = self.state().latency;
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
        }

        fn store(state: &mut RelayState, op: &Operation) -> SyncResult<()> {
            if state.seen.insert(op.id) {
                state.log.push(encode_operations(std::slice::from_ref(op))?);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MemoryRelay {
        async fn push(&self, operations: &[Operation]) -> SyncResult<PushAck> {
            self.delay().await;
            let mut state = self.state();
            state.pushes += 1;
            if state.offline {
                return Err(SyncError::Network("relay unreachable".into()));
            }
            if let Some(accepted) = state.fail_next_push_after.take() {
                for op in operations.iter().take(accepted) {
                    Self::store(&mut state, op)?;
                }
                return Err(SyncError::Network("connection reset during push".into()));
            }
            let mut accepted = Vec::with_capacity(operations.len());
            for op in operations {
                if state.refused.contains(&op.id) {
                    continue;
                }
                Self::store(&mut state, op)?;
                accepted.push(op.id);
            }
            Ok(PushAck { accepted })
        }

        async fn pull(&self, since: u64, limit: usize) -> SyncResult<PullBatch> {
            self.delay().await;
            let state = self.state();
            if state.offline {
                return Err(SyncError::Network("relay unreachable".into()));
            }
            let start = usize::try_from(since).unwrap_or(usize::MAX).min(state.log.len());
            let end = start.saturating_add(limit).min(state.log.len());
            let mut operations = Vec::with_capacity(end - start);
            for bytes in &state.log[start..end] {
                let decoded = decode_operations(bytes)?;
                if state.duplicate_delivery {
                    operations.extend(decoded.iter().cloned());
                }
                operations.extend(decoded);
            }
            Ok(PullBatch {
                operations,
                cursor: end as u64,
            })
        }
    }
}
