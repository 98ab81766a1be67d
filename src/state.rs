use std::sync::Arc;

use access_control::cache::PermissionCache;
use access_control::engine::PermissionEngine;
use access_control::metrics::AccessControlMetrics;
use prometheus_client::registry::Registry;
use sqlx::PgPool;

use crate::biz::pg_listener::PgListeners;
use crate::config::config::Config;

/// Everything the background tasks of the service share.
#[derive(Clone)]
pub struct AppState {
  pub pg_pool: PgPool,
  pub config: Arc<Config>,
  pub engine: Arc<PermissionEngine>,
  pub cache: Arc<dyn PermissionCache>,
  pub pg_listeners: Arc<PgListeners>,
  /// The `ac` metrics are registered here.
  pub registry: Arc<Registry>,
  pub access_control_metrics: Arc<AccessControlMetrics>,
}
