use crate::FieldState;

/// Custom merge logic for fields declared with `FieldRule::Custom`.
///
/// Handlers are registered by name and looked up when a remote write is
/// concurrent with the local value. The result should not depend on which
/// side is local, otherwise replicas will not converge.
pub trait MergeHandler: Send + Sync {
    /// Merges two concurrent values of `field`.
    /// Default implementation is last-writer-wins by stamp.
    fn merge(&self, field: &str, local: &FieldState, remote: &FieldState) -> serde_json::Value {
        let _ = field;
        if remote.stamp() > local.stamp() {
            remote.value().clone()
        } else {
            local.value().clone()
        }
    }
}
