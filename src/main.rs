//! Polo server binary.
//!
//! Runs from the configuration directory: every `*.yml` file there is
//! merged into the root configuration. The HTTP server exposes the REST
//! surface; the background workers drive the session lifecycle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use polo::config::load_configurations;
use polo::server::{AppState, build_router};
use polo::startup::{Startup, StartupOptions};
use polo::storage::JsonFilePersistence;
use polo::versioning::CliGitClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_dir = std::env::current_dir().expect("could not determine working directory");
    let configuration = match load_configurations(&config_dir) {
        Ok(configuration) => configuration,
        Err(e) => {
            tracing::error!(error = %e, "Could not load configuration");
            std::process::exit(1);
        }
    };

    if configuration.applications.is_empty() {
        tracing::warn!("No applications configured; only the REST surface will be useful");
    }

    let sessions_folder = PathBuf::from(&configuration.global.sessions_folder);
    let persistence = JsonFilePersistence::new(sessions_folder.join("sessions.json"));
    let port = configuration.global.port;

    if configuration.global.tls_cert_file.is_some() || configuration.global.tls_key_file.is_some() {
        tracing::warn!("TLS termination is not handled by this binary; front it with a proxy");
    }

    let startup = Startup::new(
        configuration,
        Arc::new(CliGitClient::new()),
        Box::new(persistence),
    );
    startup.start(&StartupOptions::default()).await;

    let app_state = AppState::new(startup.core());
    let app = build_router(app_state);

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server started on port {port}");

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
