mod api;
mod call;
mod config;
mod greeting;
mod manager;
mod pipeline;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use manager::{BridgeEvent, CallManager};
use pipeline::agent::AgentClient;
use pipeline::tts::TtsClient;
use twilio::client::TwilioClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Spoken to the caller when the agent gateway fails; the call stays open.
const AGENT_FALLBACK: &str = "Sorry, I couldn't process that. Please try again.";

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: Arc<CallManager>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("voice-bridge {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("voice-bridge {VERSION}");
    println!("Real-time bridge between Twilio media streams and a conversational agent");
    println!();
    println!("Usage: voice-bridge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the bridge server.");
}

async fn server() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        stt = %config.stt.provider,
        tts = %config.tts.provider,
        "Starting voice-bridge"
    );

    let tts = match TtsClient::new(&config.tts) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Invalid TTS configuration: {e}");
            std::process::exit(1);
        }
    };
    let twilio = Arc::new(TwilioClient::new(&config.twilio));
    let agent = Arc::new(AgentClient::new(&config.agent.gateway_url));

    let (events_tx, events_rx) = mpsc::channel(64);
    let manager = Arc::new(CallManager::new(
        config.clone(),
        twilio,
        tts,
        events_tx,
    ));

    // Event-driven transcript forwarding to the agent gateway
    tokio::spawn(forward_events(events_rx, agent, manager.clone()));

    let state = AppState {
        config: config.clone(),
        manager: manager.clone(),
    };
    let app = router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .expect("Server error");
}

/// All routes of the bridge: carrier webhooks, media stream, control API.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Carrier signaling webhooks
        .route("/voice/inbound", post(twilio::webhook::handle_inbound))
        .route("/voice/status", post(twilio::webhook::handle_status))
        .route("/voice/gather", post(twilio::webhook::handle_gather))
        // Carrier media stream (WebSocket)
        .route("/voice/stream", get(twilio::webhook::handle_stream_upgrade))
        // Control API
        .route("/api/call", post(api::calls::create_call))
        .route("/api/speak", post(api::calls::speak))
        .route("/api/end", post(api::calls::end_call))
        .route("/api/call/{call_sid}", get(api::calls::get_call))
        .route("/api/calls", get(api::calls::list_calls))
        // Health check
        .route("/health", get(api::calls::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for ctrl-c, then hang up every live call before the server exits.
async fn shutdown_signal(manager: Arc<CallManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        return;
    }
    tracing::info!("Shutdown requested, ending live calls");
    manager.shutdown().await;
}

/// Forward final transcripts to the agent gateway and speak its replies.
async fn forward_events(
    mut events: mpsc::Receiver<BridgeEvent>,
    agent: Arc<AgentClient>,
    manager: Arc<CallManager>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Transcription {
                call_sid,
                from,
                text,
            } => {
                let agent = agent.clone();
                let manager = manager.clone();
                // Per-call work must not stall the event loop for other calls.
                tokio::spawn(async move {
                    match agent.relay(&call_sid, &from, &text).await {
                        Ok(Some(reply)) => {
                            if let Err(e) = manager.speak(&call_sid, &reply).await {
                                tracing::warn!(call_sid = %call_sid, "Reply failed: {e}");
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(call_sid = %call_sid, "Agent had no reply");
                        }
                        Err(e) => {
                            tracing::warn!(call_sid = %call_sid, "Agent gateway error: {e}");
                            if let Err(e) = manager.speak(&call_sid, AGENT_FALLBACK).await {
                                tracing::warn!(call_sid = %call_sid, "Fallback failed: {e}");
                            }
                        }
                    }
                });
            }
            BridgeEvent::Dtmf { call_sid, digits } => {
                tracing::info!(call_sid = %call_sid, digits = %digits, "DTMF received");
            }
        }
    }
}
