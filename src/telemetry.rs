use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::config::Environment;

/// Installs the global subscriber. Must be called once, before any span is created.
///
/// `filters` are `target=level` directives; when empty `RUST_LOG` is used, defaulting to info.
pub fn init_subscriber(app_env: &Environment, filters: Vec<String>) -> Result<(), anyhow::Error> {
  // sqlx logs through the `log` facade
  LogTracer::init()?;

  let env_filter = if filters.is_empty() {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  } else {
    EnvFilter::new(filters.join(","))
  };
  let subscriber = Registry::default().with(env_filter);

  match app_env {
    Environment::Local => {
      let fmt_layer = fmt::layer()
        .pretty()
        .with_ansi(true)
        .with_target(false)
        .with_file(false);
      set_global_default(subscriber.with(fmt_layer))?;
    },
    Environment::Production => {
      let bunyan_layer = BunyanFormattingLayer::new("nas_access".to_string(), std::io::stdout);
      set_global_default(subscriber.with(JsonStorageLayer).with(bunyan_layer))?;
    },
  }
  Ok(())
}
