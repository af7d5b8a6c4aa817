//! Identifier types used by the orchestrator.

use crate::define_id;

// Ownership
define_id!(UserId, "usr");
define_id!(ProjectId, "prj");

// Work
define_id!(
    /// A task request; also the key of its task runner actor.
    TaskId,
    "task"
);
define_id!(ChatSessionId, "chat");
define_id!(AgentSessionId, "sess");

// Compute
define_id!(
    /// A physical compute node; also the key of its lifecycle actor.
    NodeId,
    "node"
);
define_id!(WorkspaceId, "ws");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_display_uses_prefix() {
        let id = TaskId::new();
        assert!(id.to_string().starts_with("task_"));
    }

    #[test]
    fn test_parse_rejects_foreign_prefix() {
        let node = NodeId::new().to_string();
        let err = TaskId::parse(&node).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(WorkspaceId::parse(""), Err(IdError::Empty));
        assert_eq!(WorkspaceId::parse("ws"), Err(IdError::MissingSeparator));
        assert!(matches!(
            WorkspaceId::parse("ws_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let first = AgentSessionId::from_ulid(ulid::Ulid::from_parts(1_000, 0));
        let second = AgentSessionId::from_ulid(ulid::Ulid::from_parts(2_000, 0));
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn prop_display_parse_identity(ts in 0u64..(1u64 << 48), rand in any::<u128>()) {
            let id = NodeId::from_ulid(ulid::Ulid::from_parts(ts, rand));
            prop_assert_eq!(NodeId::parse(&id.to_string()).unwrap(), id);
        }
    }
}
