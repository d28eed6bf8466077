use std::sync::Arc;

use serde::Serialize;

use super::OutcomeStatus;
use crate::provider::{GroupMembershipEdge, MemberKind, ProviderError, ResourceApi};

/// Result of adding one member edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipOutcome {
    pub group_id: String,
    pub member_id: String,
    pub member_kind: MemberKind,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

impl MembershipOutcome {
    fn new(edge: &GroupMembershipEdge, status: OutcomeStatus, failure_detail: Option<String>) -> Self {
        Self {
            group_id: edge.group_id.clone(),
            member_id: edge.member_id.clone(),
            member_kind: edge.member_kind,
            status,
            failure_detail,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Adds members to managed groups. An edge that already exists is success.
pub struct MembershipManager {
    provider: Arc<dyn ResourceApi>,
}

impl MembershipManager {
    pub fn new(provider: Arc<dyn ResourceApi>) -> Self {
        Self { provider }
    }

    pub async fn ensure_member(&self, edge: &GroupMembershipEdge) -> MembershipOutcome {
        if edge.group_id.trim().is_empty() || edge.member_id.trim().is_empty() {
            return MembershipOutcome::new(
                edge,
                OutcomeStatus::Failed,
                Some("group and member ids are required".into()),
            );
        }

        match self.provider.add_group_member(edge).await {
            Ok(()) => {
                tracing::info!(group = %edge.group_id, member = %edge.member_id, kind = %edge.member_kind, "Member added");
                MembershipOutcome::new(edge, OutcomeStatus::Created, None)
            }
            Err(ProviderError::Conflict(_)) => {
                tracing::debug!(group = %edge.group_id, member = %edge.member_id, "Already a member");
                MembershipOutcome::new(edge, OutcomeStatus::AlreadyExists, None)
            }
            Err(e) => {
                tracing::warn!(group = %edge.group_id, member = %edge.member_id, error = %e, "Failed to add member");
                MembershipOutcome::new(edge, OutcomeStatus::Failed, Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryCloud, MemoryFault, MemoryOp};

    fn edge() -> GroupMembershipEdge {
        GroupMembershipEdge {
            group_id: "g1".into(),
            member_id: "u1".into(),
            member_kind: MemberKind::User,
        }
    }

    #[tokio::test]
    async fn test_duplicate_edge_is_success() {
        let cloud = Arc::new(MemoryCloud::new());
        let manager = MembershipManager::new(cloud.clone());

        let first = manager.ensure_member(&edge()).await;
        let second = manager.ensure_member(&edge()).await;

        assert_eq!(first.status, OutcomeStatus::Created);
        assert_eq!(second.status, OutcomeStatus::AlreadyExists);
        assert!(second.is_success());
        assert!(cloud.has_member("g1", "u1"));
    }

    #[tokio::test]
    async fn test_provider_error_is_failed() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.inject(
            MemoryFault::Op(MemoryOp::AddGroupMember),
            ProviderError::Api {
                status: 403,
                code: "Authorization_RequestDenied".into(),
                message: "Insufficient privileges".into(),
            },
        );

        let outcome = MembershipManager::new(cloud).ensure_member(&edge()).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.failure_detail.unwrap().contains("Insufficient privileges"));
    }

    #[tokio::test]
    async fn test_empty_member_rejected_without_call() {
        let cloud = Arc::new(MemoryCloud::new());
        let mut edge = edge();
        edge.member_id = String::new();

        let outcome = MembershipManager::new(cloud.clone()).ensure_member(&edge).await;

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(cloud.op_calls(MemoryOp::AddGroupMember), 0);
    }
}
