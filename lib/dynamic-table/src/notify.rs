//! Messages for live subscribers.
//!
//! The engine does not hold connections. It groups the users who lost access
//! to tables by each table's permission channel group and hands one message
//! per group to a [`Broadcaster`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{TableError, TableId};

pub const USERS_REMOVED_FROM_PERMISSION_GROUP: &str = "users_removed_from_permission_group";

/// Channel group of the subscribers allowed to see every event of a table.
pub fn table_permission_group(table_id: TableId) -> String {
    format!("table-{}-permissions", table_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGroupMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub user_ids_to_remove: Vec<i64>,
    pub permission_group_name: String,
}

impl PermissionGroupMessage {
    pub fn users_removed(group: impl Into<String>, user_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            message_type: USERS_REMOVED_FROM_PERMISSION_GROUP.to_string(),
            user_ids_to_remove: user_ids.into_iter().collect(),
            permission_group_name: group.into(),
        }
    }
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_to_group(&self, group: &str, message: &PermissionGroupMessage) -> Result<(), TableError>;
}

/// Decides whether a user may still listen to every event of a table.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can_listen_to_table(&self, user_id: i64, table_id: TableId) -> Result<bool, TableError>;
}

/// In-process broadcaster backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<(String, PermissionGroupMessage)>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, PermissionGroupMessage)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn send_to_group(&self, group: &str, message: &PermissionGroupMessage) -> Result<(), TableError> {
        // No subscribers is not a failure.
        let _ = self.sender.send((group.to_string(), message.clone()));
        Ok(())
    }
}

/// Remove `user_ids` from the permission groups of `table_ids`. With a
/// checker, users who can still listen to a table stay subscribed to it.
/// Returns the number of messages sent.
pub async fn unsubscribe_subject_from_tables(
    broadcaster: &dyn Broadcaster,
    checker: Option<&dyn PermissionChecker>,
    user_ids: &[i64],
    table_ids: &[TableId],
) -> Result<usize, TableError> {
    let mut groups: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
    for user_id in user_ids {
        for table_id in table_ids {
            let remove = match checker {
                None => true,
                Some(checker) => !checker.can_listen_to_table(*user_id, *table_id).await?,
            };
            if remove {
                groups
                    .entry(table_permission_group(*table_id))
                    .or_default()
                    .insert(*user_id);
            }
        }
    }

    for (group, users) in &groups {
        let message = PermissionGroupMessage::users_removed(group.as_str(), users.iter().copied());
        broadcaster.send_to_group(group, &message).await?;
        debug!(group = %group, users = users.len(), "Removed users from permission group");
    }
    Ok(groups.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct OnlyTable(TableId);

    #[async_trait]
    impl PermissionChecker for OnlyTable {
        async fn can_listen_to_table(&self, _user_id: i64, table_id: TableId) -> Result<bool, TableError> {
            Ok(table_id == self.0)
        }
    }

    #[test]
    fn message_wire_shape() {
        let message = PermissionGroupMessage::users_removed(table_permission_group(7), [3, 1]);
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "users_removed_from_permission_group",
                "user_ids_to_remove": [3, 1],
                "permission_group_name": "table-7-permissions",
            })
        );
    }

    #[tokio::test]
    async fn groups_users_per_table() {
        let broadcaster = ChannelBroadcaster::new(16);
        let mut receiver = broadcaster.subscribe();

        let sent = unsubscribe_subject_from_tables(&broadcaster, None, &[2, 1], &[10, 11])
            .await
            .unwrap();
        assert_eq!(sent, 2);

        let (group, message) = receiver.recv().await.unwrap();
        assert_eq!(group, "table-10-permissions");
        assert_eq!(message.user_ids_to_remove, vec![1, 2]);
        let (group, _) = receiver.recv().await.unwrap();
        assert_eq!(group, "table-11-permissions");
    }

    #[tokio::test]
    async fn checker_keeps_users_with_access() {
        let broadcaster = ChannelBroadcaster::new(16);
        let mut receiver = broadcaster.subscribe();
        let checker = OnlyTable(10);

        let sent = unsubscribe_subject_from_tables(&broadcaster, Some(&checker), &[5], &[10, 11])
            .await
            .unwrap();
        assert_eq!(sent, 1);
        let (group, message) = receiver.recv().await.unwrap();
        assert_eq!(group, "table-11-permissions");
        assert_eq!(message.user_ids_to_remove, vec![5]);
    }
}
