//! MCP Engine - demo Model Context Protocol server.
//!
//! Serves the built-in demo tools over stdio, HTTP+SSE, WebSocket or a Unix
//! socket.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mcp_engine_rs::config::{Args, Config, Transport};
use mcp_engine_rs::error::Result;
use mcp_engine_rs::mcp::server::Server;
use mcp_engine_rs::tools;
use mcp_engine_rs::transport::{
    HttpServerTransport, StdioTransport, UnixSessionListener, WebSocketServerTransport,
};
use mcp_engine_rs::VERSION;

fn init_logging(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_args(Args::parse())?;
    init_logging(&config);

    info!("MCP Engine v{}", VERSION);
    info!("Transport: {:?}", config.transport);

    match config.transport {
        Transport::Stdio => {
            let server = Server::new(Arc::new(StdioTransport::new()), config.server_config());
            serve(server).await
        }
        Transport::Http => {
            let transport = Arc::new(HttpServerTransport::new(config.http_server_config()));
            let metrics = transport.metrics().clone();
            let server = Server::with_metrics(transport, config.server_config(), metrics);
            serve(server).await
        }
        Transport::Ws => {
            let transport = Arc::new(WebSocketServerTransport::new(
                config.websocket_server_config(),
            ));
            let metrics = transport.metrics().clone();
            let server = Server::with_metrics(transport, config.server_config(), metrics);
            serve(server).await
        }
        Transport::Unix => serve_unix(&config).await,
    }
}

/// Run one server until its session ends or Ctrl-C arrives.
async fn serve(server: Server) -> Result<()> {
    tools::register_all_tools(&server)?;
    info!("Registered {} MCP tools", server.tools().len());

    tokio::select! {
        started = server.start() => started?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the handshake finished");
            return server.stop().await;
        }
    }

    tokio::select! {
        state = server.closed() => info!("Session ended: {}", state),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.stop().await?;
        }
    }
    Ok(())
}

async fn serve_unix(config: &Config) -> Result<()> {
    let listener_config = config.unix_listener_config().with_hook(|server: &Server| {
        if let Err(e) = tools::register_all_tools(server) {
            error!("Failed to register tools: {}", e);
        }
    });
    let listener = UnixSessionListener::new(listener_config);
    listener.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot wait for Ctrl-C: {}", e);
    }
    info!("Shutting down ({} open sessions)", listener.session_count());
    listener.stop().await
}
