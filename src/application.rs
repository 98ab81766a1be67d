use std::sync::Arc;
use std::time::Duration;

use access_control::cache::{MemoryPermissionCache, PermissionCache, RedisPermissionCache};
use access_control::engine::PermissionEngine;
use access_control::metrics::{tick_metric, AccessControlMetrics};
use access_control::pg_store::PgGrantStore;
use anyhow::{Context, Error};
use prometheus_client::registry::Registry;
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::biz::pg_listener::{
  spawn_cache_stats_logger, spawn_permission_change_forwarder, PgListeners,
};
use crate::config::config::{Config, DatabaseSetting};
use crate::state::AppState;

pub struct Application {
  state: AppState,
  background_tasks: Vec<JoinHandle<()>>,
}

impl Application {
  pub async fn build(state: AppState) -> Result<Self, Error> {
    let engine = state.engine.clone();
    let mut background_tasks =
      spawn_permission_change_forwarder(&state.pg_listeners, engine.clone());
    background_tasks.push(engine.spawn_cache_sweeper());
    background_tasks.push(tick_metric(
      state.cache.clone(),
      state.access_control_metrics.clone(),
      Duration::from_secs(30),
    ));
    background_tasks.push(spawn_cache_stats_logger(
      engine,
      state.config.stats_interval,
    ));
    Ok(Self {
      state,
      background_tasks,
    })
  }

  pub async fn run_until_stopped(self) -> Result<(), Error> {
    info!(
      "nas_access is running with the {} resolver",
      self.state.engine.resolver_name()
    );
    tokio::signal::ctrl_c()
      .await
      .context("fail to listen for the shutdown signal")?;
    info!("shutting down");
    for task in self.background_tasks {
      task.abort();
    }
    self.state.pg_pool.close().await;
    Ok(())
  }
}

pub async fn init_state(config: &Config) -> Result<AppState, Error> {
  info!("Connecting to postgres database...");
  let pg_pool = get_connection_pool(&config.db_settings).await?;
  migrate(&pg_pool).await?;

  let mut registry = Registry::default();
  let access_control_metrics = Arc::new(AccessControlMetrics::register(&mut registry));
  let cache = get_permission_cache(config).await;
  let store = Arc::new(PgGrantStore::new(pg_pool.clone()));
  let engine = Arc::new(PermissionEngine::new(
    store,
    cache.clone(),
    config.access_control.clone(),
    access_control_metrics.clone(),
  ));

  info!("Setting up Pg listeners...");
  let pg_listeners = Arc::new(PgListeners::new(&pg_pool).await?);

  Ok(AppState {
    pg_pool,
    config: Arc::new(config.clone()),
    engine,
    cache,
    pg_listeners,
    registry: Arc::new(registry),
    access_control_metrics,
  })
}

async fn get_permission_cache(config: &Config) -> Arc<dyn PermissionCache> {
  let memory_cache = || -> Arc<dyn PermissionCache> {
    Arc::new(MemoryPermissionCache::new(
      config.access_control.cache_max_entries,
    ))
  };
  match config.redis_uri.as_ref() {
    Some(redis_uri) => match RedisPermissionCache::new(redis_uri.expose_secret()).await {
      Ok(cache) => {
        info!("[permission cache]: using redis");
        Arc::new(cache)
      },
      Err(err) => {
        warn!(
          "[permission cache]: redis is unreachable: {}, falling back to memory",
          err
        );
        memory_cache()
      },
    },
    None => memory_cache(),
  }
}

pub async fn get_connection_pool(setting: &DatabaseSetting) -> Result<PgPool, Error> {
  info!("Connecting to postgres database with setting: {}", setting);
  PgPoolOptions::new()
    .max_connections(setting.max_connections)
    .acquire_timeout(Duration::from_secs(10))
    .connect_with(setting.pg_connect_options())
    .await
    .context("fail to connect to postgres database")
}

async fn migrate(pool: &PgPool) -> Result<(), Error> {
  sqlx::migrate!("./migrations")
    .set_ignore_missing(true)
    .run(pool)
    .await
    .context("fail to run migrations")
}
