use anyhow::Error;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{error, trace};

use crate::pg_row::ResourceTable;

pub const GRANT_CHANNEL: &str = "nas_grant_channel";
pub const GROUP_MEMBER_CHANNEL: &str = "nas_group_member_channel";
pub const USER_CHANNEL: &str = "nas_user_channel";

/// Forwards the payloads of one Postgres NOTIFY channel to a broadcast channel.
pub struct PostgresDBListener<T: Clone> {
  pub notify: broadcast::Sender<T>,
}

impl<T> PostgresDBListener<T>
where
  T: Clone + DeserializeOwned + Send + 'static,
{
  pub async fn new(pg_pool: &PgPool, channel: &str) -> Result<Self, Error> {
    let mut listener = PgListener::connect_with(pg_pool).await?;
    listener.listen(channel).await?;

    let (tx, _) = broadcast::channel(1000);
    let notify = tx.clone();
    let channel = channel.to_string();
    tokio::spawn(async move {
      loop {
        match listener.recv().await {
          Ok(notification) => {
            trace!("[{}]: received {}", channel, notification.payload());
            match serde_json::from_str::<T>(notification.payload()) {
              Ok(change) => {
                let _ = tx.send(change);
              },
              Err(err) => {
                error!(
                  "Failed to deserialize {} payload: {:?}, payload: {}",
                  channel,
                  err,
                  notification.payload()
                );
              },
            }
          },
          Err(err) => {
            error!("[{}]: listener stopped: {}", channel, err);
            break;
          },
        }
      }
    });
    Ok(Self { notify })
  }

  pub fn subscribe(&self) -> broadcast::Receiver<T> {
    self.notify.subscribe()
  }
}

/// Payload of `nas_grant_channel`.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantNotification {
  pub resource_kind: ResourceTable,
  pub resource_id: i64,
}

/// Payload of `nas_group_member_channel`.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupMemberNotification {
  pub group_id: i64,
  pub uid: i64,
}

/// Payload of `nas_user_channel`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserNotification {
  pub uid: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn grant_notification_payload_test() {
    let payload = r#"{"resource_kind":"file","resource_id":42}"#;
    let notification = serde_json::from_str::<GrantNotification>(payload).unwrap();
    assert_eq!(notification.resource_kind, ResourceTable::File);
    assert_eq!(notification.resource_id, 42);

    let payload = r#"{"group_id":7,"uid":3}"#;
    let notification = serde_json::from_str::<GroupMemberNotification>(payload).unwrap();
    assert_eq!(notification.group_id, 7);
    assert_eq!(notification.uid, 3);
  }
}
