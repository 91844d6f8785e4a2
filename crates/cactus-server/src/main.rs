//! Cactus Server - HTTP API for an on-device Cactus inference session

use cactus_core::{DeviceRegistry, Engine, Error, ServerConfig, Session, Utility};
use config::{Config, Environment, File};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cactus_server=debug,cactus_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cactus Server");

    // Load configuration
    let config = load_config(Config::builder().add_source(File::with_name("cactus").required(false)))?;
    info!("Models directory: {:?}", config.session.models_dir);

    run(config).await
}

/// Layer `CACTUS_*` environment variables over `builder` and deserialize.
///
/// Nested keys use a double underscore, e.g. `CACTUS_SESSION__CONTEXT_SIZE`.
fn load_config(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> cactus_core::Result<ServerConfig> {
    builder
        .add_source(
            Environment::with_prefix("CACTUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|settings| settings.try_deserialize())
        .map_err(|e| Error::Config(e.to_string()))
}

#[cfg(feature = "native")]
async fn run(config: ServerConfig) -> anyhow::Result<()> {
    use cactus_core::{NativeEngine, NativeRegistry};

    let session = Session::new(NativeEngine)?;
    let utility = Utility::new(NativeRegistry)?;
    serve(config, session, utility).await
}

#[cfg(not(feature = "native"))]
async fn run(_config: ServerConfig) -> anyhow::Result<()> {
    anyhow::bail!("cactus-server was built without the `native` feature; rebuild with `--features native` to link libcactus")
}

#[cfg_attr(not(feature = "native"), allow(dead_code))]
async fn serve<E: Engine, R: DeviceRegistry>(
    config: ServerConfig,
    session: Session<E>,
    utility: Utility<R>,
) -> anyhow::Result<()> {
    // Load the startup model, if one is configured
    if let Some(model) = &config.model_path {
        let path = config.session.model_path(model);
        info!("Loading startup model {:?}", path);
        if let Err(e) = session
            .init(
                &path.to_string_lossy(),
                config.session.context_size,
                config.corpus_dir.as_deref(),
            )
            .await
        {
            warn!("Startup model failed to load: {}", e);
        }
    }

    let addr = config.bind_addr();
    let state = AppState::new(session, utility, config.session.clone());

    // Build router
    let app = api::create_router(state, config.cors_enabled);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn file_settings_fill_server_config() {
        let toml = r#"
            port = 9090
            model_path = "qwen3-0.6"

            [session]
            context_size = 4096
        "#;
        let config = load_config(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
            .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.model_path.as_deref(), Some("qwen3-0.6"));
        assert_eq!(config.session.context_size, 4096);
        assert_eq!(config.session.default_max_tokens, 512);
    }

    #[test]
    fn malformed_settings_are_a_config_error() {
        let toml = r#"port = "eighty""#;
        let err = load_config(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_settings_use_defaults() {
        let config = load_config(Config::builder()).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.cors_enabled);
        assert!(config.model_path.is_none());
    }
}
