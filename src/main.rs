// Botgate — gateway process entry point.
// Startup phases: logging, config, store, engine wiring, startup recovery.
// The GatewayFacade built here is the surface the (external) HTTP layer
// mounts its routes on. Exit codes: 0 on graceful shutdown, 1 on missing
// configuration or an unreachable store.

use botgate::engine::config::GatewayConfig;
use botgate::engine::gateway::GatewayFacade;
use botgate::engine::media::{HttpMediaStore, MediaStore};
use botgate::engine::pipeline::MessagePipeline;
use botgate::engine::providers::{GeminiClient, LlmClient};
use botgate::engine::store::Store;
use botgate::engine::webchat::PublicChatSessionManager;
use botgate::engine::whatsapp::{BridgeClientFactory, SessionPolicy, WhatsAppSessionManager};
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("[main] {}", e);
            std::process::exit(1);
        }
    };

    let store = match Store::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("[main] Store unavailable at {:?}: {}", config.db_path, e);
            std::process::exit(1);
        }
    };

    let media_store: Option<Arc<dyn MediaStore>> = config
        .object_store
        .as_ref()
        .map(|os| Arc::new(HttpMediaStore::new(os)) as Arc<dyn MediaStore>);
    if media_store.is_none() {
        info!("[main] No object store configured — inbound media will be refused");
    }

    let llm: Arc<dyn LlmClient> = Arc::new(GeminiClient::new(&config));
    let pipeline = Arc::new(MessagePipeline::new(
        Arc::clone(&store),
        media_store,
        config.max_upload_bytes,
        config.history_window,
    ));

    // The external WhatsApp client persists pairing state and its page
    // cache under these paths; make sure they exist before any session.
    for dir in [&config.whatsapp_auth_dir, &config.whatsapp_cache_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("[main] Could not create {:?}: {}", dir, e);
        }
    }

    let factory = BridgeClientFactory::new(
        &config.whatsapp_bridge_url,
        config.whatsapp_bridge_api_key.as_deref(),
        config.whatsapp_webhook_port,
        &config.whatsapp_auth_dir,
    );
    let whatsapp = WhatsAppSessionManager::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        Arc::clone(&llm),
        factory.clone(),
        SessionPolicy::from_config(&config),
    );
    let public_chat = PublicChatSessionManager::new(
        Arc::clone(&store),
        pipeline,
        llm,
        config.tool_loop_max_steps,
    );

    let gateway = GatewayFacade::new(Arc::clone(&store), whatsapp, public_chat);

    // Restore every connection persisted with auto-reconnect before the
    // HTTP layer starts taking traffic.
    gateway.recover_whatsapp_sessions().await;

    let sweeper = config
        .public_idle_timeout
        .map(|timeout| gateway.spawn_public_idle_sweeper(timeout));

    info!(
        "[main] Botgate up (model {}, store {:?})",
        config.llm_model, config.db_path
    );

    wait_for_shutdown_signal().await;

    info!("[main] Shutdown signal received");
    if let Some(handle) = sweeper {
        handle.abort();
    }
    gateway.shutdown(config.shutdown_grace).await;
    factory.shutdown();
    info!("[main] Bye");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("[main] SIGTERM handler failed: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
