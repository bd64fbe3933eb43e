//! Which devices the kubelet has handed out, per extended resource.

use std::collections::BTreeMap;

use error_stack::Report;
use thiserror::Error;

/// resource name -> assigned device ids
pub type AssignmentMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("Kubelet pod-resources API unavailable: {message}")]
    Unavailable { message: String },
    #[error("Kubelet pod-resources API did not answer within {seconds}s")]
    Timeout { seconds: u64 },
    #[error("Failed to read device state file {path}")]
    ReadCheckpoint { path: String },
    #[error("Failed to parse device state file {path}")]
    ParseCheckpoint { path: String },
}

/// Read-only view of the node's current device assignments.
#[async_trait::async_trait]
pub trait AssignmentSource: Send + Sync {
    async fn current_assignments(&self) -> Result<AssignmentMap, Report<AssignmentError>>;
}

/// Merge `(resource, ids)` pairs, concatenating ids of repeated resources.
pub fn aggregate<I, S>(entries: I) -> AssignmentMap
where
    I: IntoIterator<Item = (S, Vec<String>)>,
    S: Into<String>,
{
    let mut map = AssignmentMap::new();
    for (resource_name, device_ids) in entries {
        map.entry(resource_name.into())
            .or_default()
            .extend(device_ids);
    }
    map
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn repeated_resources_are_concatenated() {
        let map = aggregate(vec![
            ("R", ids(&["d1"])),
            ("S", ids(&["d3"])),
            ("R", ids(&["d2"])),
        ]);

        assert_eq!(map.get("R"), Some(&ids(&["d1", "d2"])));
        assert_eq!(map.get("S"), Some(&ids(&["d3"])));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn empty_input_yields_empty_map() {
        let map = aggregate(Vec::<(String, Vec<String>)>::new());
        assert!(map.is_empty());
    }
}
