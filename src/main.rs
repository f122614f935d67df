//! Service entry point.
//!
//! Exit codes: 0 clean shutdown, 2 startup misconfiguration (missing
//! secret, invalid policy), 3 storage unreachable.

use std::path::PathBuf;
use std::sync::Arc;

use inboxos::clock::Clock;
use inboxos::config::{Policy, Secrets};
use inboxos::db::Store;
use inboxos::llm::HttpLlmProvider;
use inboxos::server::build_router;
use inboxos::state::ServiceState;

const EXIT_MISCONFIG: i32 = 2;
const EXIT_STORAGE: i32 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let secrets = Secrets::from_env();
    if let Err(e) = secrets.validate() {
        tracing::error!(error = %e, "startup misconfiguration");
        std::process::exit(EXIT_MISCONFIG);
    }

    let policy = match std::env::var("INBOXOS_POLICY") {
        Ok(path) => match Policy::load(&PathBuf::from(&path)) {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(error = %e, "invalid policy file");
                std::process::exit(EXIT_MISCONFIG);
            }
        },
        Err(_) => {
            tracing::info!("no INBOXOS_POLICY set, using compiled defaults");
            Policy::default()
        }
    };

    let store = match Store::open() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "storage unreachable at boot");
            std::process::exit(EXIT_STORAGE);
        }
    };

    // Sessions left behind by a crash or cancellation are reaped before
    // traffic starts.
    match store.reap_incomplete_sessions() {
        Ok(0) => {}
        Ok(reaped) => tracing::info!(reaped, "reaped incomplete digest sessions"),
        Err(e) => tracing::warn!(error = %e, "session reap failed"),
    }

    let provider = Arc::new(HttpLlmProvider::new(
        std::env::var("INBOXOS_LLM_ENDPOINT")
            .unwrap_or_else(|_| "http://127.0.0.1:11434/api/structured".to_string()),
        secrets.llm_api_key.clone().unwrap_or_default(),
        std::env::var("INBOXOS_LLM_MODEL").unwrap_or_else(|_| "inbox-classifier-v3".to_string()),
        std::env::var("INBOXOS_LLM_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000),
    ));

    let state = Arc::new(ServiceState::new(
        policy,
        secrets,
        store,
        provider,
        Clock::system(),
    ));
    let router = build_router(state);

    let addr = std::env::var("INBOXOS_ADDR").unwrap_or_else(|_| "127.0.0.1:8787".to_string());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(EXIT_MISCONFIG);
        }
    };
    tracing::info!(addr = %addr, version = inboxos::state::VERSION, "inboxos listening");

    let service = router.into_make_service_with_connect_info::<std::net::SocketAddr>();
    if let Err(e) = axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
