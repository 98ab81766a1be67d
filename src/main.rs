use nas_access::application::{init_state, Application};
use nas_access::config::config::get_configuration;
use nas_access::telemetry::init_subscriber;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let level = std::env::var("RUST_LOG").unwrap_or("info".to_string());
  println!("nas_access with RUST_LOG={}", level);
  let filters = vec![
    format!("nas_access={}", level),
    format!("access_control={}", level),
    format!("database={}", level),
  ];
  let conf =
    get_configuration().map_err(|e| anyhow::anyhow!("Failed to read configuration: {}", e))?;
  init_subscriber(&conf.app_env, filters)?;
  info!("environment: {}", conf.app_env.as_str());

  let state = init_state(&conf)
    .await
    .map_err(|e| anyhow::anyhow!("Failed to initialize application state: {}", e))?;
  let application = Application::build(state).await?;
  application.run_until_stopped().await?;

  Ok(())
}
