use std::sync::Arc;
use std::time::Duration;

use access_control::engine::PermissionEngine;
use access_control::entity::ResourceRef;
use anyhow::Error;
use database::listener::{
  GrantNotification, GroupMemberNotification, PostgresDBListener, UserNotification, GRANT_CHANNEL,
  GROUP_MEMBER_CHANNEL, USER_CHANNEL,
};
use sqlx::PgPool;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, trace, warn};

pub type GrantListener = PostgresDBListener<GrantNotification>;
pub type GroupMemberListener = PostgresDBListener<GroupMemberNotification>;
pub type UserListener = PostgresDBListener<UserNotification>;

pub struct PgListeners {
  grant_listener: GrantListener,
  group_member_listener: GroupMemberListener,
  user_listener: UserListener,
}

impl PgListeners {
  pub async fn new(pg_pool: &PgPool) -> Result<Self, Error> {
    let grant_listener = GrantListener::new(pg_pool, GRANT_CHANNEL).await?;
    let group_member_listener = GroupMemberListener::new(pg_pool, GROUP_MEMBER_CHANNEL).await?;
    let user_listener = UserListener::new(pg_pool, USER_CHANNEL).await?;
    Ok(Self {
      grant_listener,
      group_member_listener,
      user_listener,
    })
  }

  pub fn subscribe_grant_change(&self) -> broadcast::Receiver<GrantNotification> {
    self.grant_listener.subscribe()
  }

  pub fn subscribe_group_member_change(&self) -> broadcast::Receiver<GroupMemberNotification> {
    self.group_member_listener.subscribe()
  }

  pub fn subscribe_user_change(&self) -> broadcast::Receiver<UserNotification> {
    self.user_listener.subscribe()
  }
}

/// Feeds the changes made by other writers of the database into the engine's invalidation hooks.
pub fn spawn_permission_change_forwarder(
  listeners: &PgListeners,
  engine: Arc<PermissionEngine>,
) -> Vec<JoinHandle<()>> {
  let mut grant_rx = listeners.subscribe_grant_change();
  let grant_engine = engine.clone();
  let grant_handle = tokio::spawn(async move {
    loop {
      match grant_rx.recv().await {
        Ok(change) => {
          trace!("[permission]: grant changed on {:?}", change);
          grant_engine
            .on_grant_changed(ResourceRef {
              kind: change.resource_kind.into(),
              id: change.resource_id,
            })
            .await;
        },
        Err(RecvError::Lagged(skipped)) => {
          // missed notifications leave unknown stale entries behind
          warn!(
            "[permission]: grant listener lagged by {} notifications, clearing the cache",
            skipped
          );
          if let Err(err) = grant_engine.clear_cache().await {
            warn!("[permission]: failed to clear the cache: {}", err);
          }
        },
        Err(RecvError::Closed) => break,
      }
    }
  });

  let mut group_rx = listeners.subscribe_group_member_change();
  let group_engine = engine.clone();
  let group_handle = tokio::spawn(async move {
    loop {
      match group_rx.recv().await {
        Ok(change) => {
          trace!("[permission]: group membership changed {:?}", change);
          group_engine.on_group_membership_changed(change.group_id).await;
          group_engine.on_principal_changed(change.uid).await;
        },
        Err(RecvError::Lagged(skipped)) => {
          warn!(
            "[permission]: group member listener lagged by {} notifications, clearing the cache",
            skipped
          );
          if let Err(err) = group_engine.clear_cache().await {
            warn!("[permission]: failed to clear the cache: {}", err);
          }
        },
        Err(RecvError::Closed) => break,
      }
    }
  });

  let mut user_rx = listeners.subscribe_user_change();
  let user_handle = tokio::spawn(async move {
    loop {
      match user_rx.recv().await {
        Ok(change) => {
          trace!("[permission]: principal changed {:?}", change);
          engine.on_principal_changed(change.uid).await;
        },
        Err(RecvError::Lagged(skipped)) => {
          warn!(
            "[permission]: user listener lagged by {} notifications, clearing the cache",
            skipped
          );
          if let Err(err) = engine.clear_cache().await {
            warn!("[permission]: failed to clear the cache: {}", err);
          }
        },
        Err(RecvError::Closed) => break,
      }
    }
  });

  vec![grant_handle, group_handle, user_handle]
}

/// Logs the cache statistics once per `period`.
pub fn spawn_cache_stats_logger(engine: Arc<PermissionEngine>, period: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = interval(period);
    interval.tick().await;
    loop {
      interval.tick().await;
      match engine.cache_stats().await {
        Ok(stats) => info!(
          "[permission cache]: entries:{}, hits:{}, misses:{}, evictions:{}, invalidations:{}, bypassed:{}",
          stats.entries,
          stats.hits,
          stats.misses,
          stats.evictions,
          stats.invalidations,
          engine.is_cache_bypassed()
        ),
        Err(err) => warn!("[permission cache]: failed to read stats: {}", err),
      }
    }
  })
}
