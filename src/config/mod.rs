//! Configuration management for the MCP engine binary.
//!
//! Settings come from command-line flags (with `MCP_ENGINE_*` environment
//! fallbacks) and can be overlaid by a YAML file passed with `--config`.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mcp::server::ServerConfig;
use crate::transport::{HttpServerConfig, UnixListenerConfig, WebSocketServerConfig};

/// Command-line arguments for the engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-engine")]
#[command(author = "MCP Engine Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Model Context Protocol server with pluggable transports")]
pub struct Args {
    /// Transport: stdio, http, ws or unix
    #[arg(short, long, default_value = "stdio", env = "MCP_ENGINE_TRANSPORT")]
    pub transport: Transport,

    /// Listen address for http and ws
    #[arg(long, default_value = "127.0.0.1", env = "MCP_ENGINE_HOST")]
    pub host: IpAddr,

    /// Listen port for http and ws
    #[arg(short, long, default_value = "3000", env = "MCP_ENGINE_PORT")]
    pub port: u16,

    /// Socket path for the unix transport
    #[arg(long, env = "MCP_ENGINE_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Require `Authorization: Bearer <token>` on http and ws
    #[arg(long, env = "MCP_ENGINE_BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// Reject WebSocket upgrades from any other origin
    #[arg(long, env = "MCP_ENGINE_ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    /// Seconds a POSTed request may run before the answer moves to SSE
    #[arg(long, default_value = "10", env = "MCP_ENGINE_INLINE_TIMEOUT")]
    pub inline_timeout: u64,

    /// Instructions sent to clients during the handshake
    #[arg(long, env = "MCP_ENGINE_INSTRUCTIONS")]
    pub instructions: Option<String>,

    /// YAML file overriding these settings
    #[arg(short, long, env = "MCP_ENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_ENGINE_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "MCP_ENGINE_LOG_JSON")]
    pub log_json: bool,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Http,
    Ws,
    Unix,
}

/// Effective engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: Transport,
    pub host: IpAddr,
    pub port: u16,
    pub socket: PathBuf,
    pub bearer_token: Option<String>,
    pub allowed_origin: Option<String>,
    /// Seconds
    pub inline_timeout: u64,
    pub instructions: Option<String>,
    pub debug: bool,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            host: IpAddr::from([127, 0, 0, 1]),
            port: 3000,
            socket: UnixListenerConfig::default().path,
            bearer_token: None,
            allowed_origin: None,
            inline_timeout: 10,
            instructions: None,
            debug: false,
            log_json: false,
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let defaults = Config::default();
        Self {
            transport: args.transport,
            host: args.host,
            port: args.port,
            socket: args.socket.unwrap_or(defaults.socket),
            bearer_token: args.bearer_token,
            allowed_origin: args.allowed_origin,
            inline_timeout: args.inline_timeout,
            instructions: args.instructions,
            debug: args.debug,
            log_json: args.log_json,
        }
    }
}

/// Settings a YAML file may override. Absent keys leave the value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub transport: Option<Transport>,
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub socket: Option<PathBuf>,
    pub bearer_token: Option<String>,
    pub allowed_origin: Option<String>,
    pub inline_timeout: Option<u64>,
    pub instructions: Option<String>,
    pub debug: Option<bool>,
    pub log_json: Option<bool>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }
}

impl Config {
    /// Build the configuration from arguments, applying `--config` if given.
    pub fn from_args(args: Args) -> Result<Self> {
        let file = args.config.clone();
        let mut config = Config::from(args);
        if let Some(path) = file {
            config.apply(ConfigFile::load(&path)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, file: ConfigFile) {
        if let Some(v) = file.transport {
            self.transport = v;
        }
        if let Some(v) = file.host {
            self.host = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.socket {
            self.socket = v;
        }
        if file.bearer_token.is_some() {
            self.bearer_token = file.bearer_token;
        }
        if file.allowed_origin.is_some() {
            self.allowed_origin = file.allowed_origin;
        }
        if let Some(v) = file.inline_timeout {
            self.inline_timeout = v;
        }
        if file.instructions.is_some() {
            self.instructions = file.instructions;
        }
        if let Some(v) = file.debug {
            self.debug = v;
        }
        if let Some(v) = file.log_json {
            self.log_json = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.inline_timeout == 0 {
            return Err(Error::Config("inline_timeout must be at least 1 second".to_string()));
        }
        if matches!(self.bearer_token.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(Error::Config("bearer_token must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            instructions: self.instructions.clone(),
            ..ServerConfig::default()
        }
    }

    pub fn http_server_config(&self) -> HttpServerConfig {
        HttpServerConfig {
            bind: self.bind_addr(),
            bearer_token: self.bearer_token.clone(),
            inline_response_timeout: Duration::from_secs(self.inline_timeout),
            ..HttpServerConfig::default()
        }
    }

    pub fn websocket_server_config(&self) -> WebSocketServerConfig {
        WebSocketServerConfig {
            bind: self.bind_addr(),
            bearer_token: self.bearer_token.clone(),
            required_origin: self.allowed_origin.clone(),
            ..WebSocketServerConfig::default()
        }
    }

    pub fn unix_listener_config(&self) -> UnixListenerConfig {
        UnixListenerConfig {
            server: self.server_config(),
            ..UnixListenerConfig::new(&self.socket)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_transport_default() {
        assert_eq!(Transport::default(), Transport::Stdio);
    }

    #[test]
    fn test_transport_serialization() {
        let transports = [
            (Transport::Stdio, "\"stdio\""),
            (Transport::Http, "\"http\""),
            (Transport::Ws, "\"ws\""),
            (Transport::Unix, "\"unix\""),
        ];

        for (transport, expected) in &transports {
            let json = serde_json::to_string(transport).unwrap();
            assert_eq!(&json, expected);
        }
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "mcp-engine",
            "--transport",
            "http",
            "--port",
            "8080",
            "--bearer-token",
            "secret",
        ]);
        let config = Config::from(args);
        assert_eq!(config.transport, Transport::Http);
        assert_eq!(config.port, 8080);
        assert_eq!(config.bearer_token.as_deref(), Some("secret"));
        assert_eq!(config.socket, Config::default().socket);
    }

    #[test]
    fn test_file_overlay() {
        let mut config = Config::default();
        let file = ConfigFile::parse(
            "transport: ws\nport: 4100\nallowed_origin: https://app.example\n",
        )
        .unwrap();
        config.apply(file);

        assert_eq!(config.transport, Transport::Ws);
        assert_eq!(config.port, 4100);
        assert_eq!(config.allowed_origin.as_deref(), Some("https://app.example"));
        assert_eq!(config.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.inline_timeout, 10);
    }

    #[test]
    fn test_empty_and_unknown_file_keys() {
        assert!(ConfigFile::parse("").unwrap().transport.is_none());
        assert!(matches!(
            ConfigFile::parse("colour: blue\n"),
            Err(Error::Yaml(_))
        ));
    }

    #[test]
    fn test_from_args_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "transport: unix\nsocket: /tmp/engine-test.sock").unwrap();

        let args = Args::parse_from([
            "mcp-engine",
            "--config",
            file.path().to_str().unwrap(),
        ]);
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.transport, Transport::Unix);
        assert_eq!(config.socket, PathBuf::from("/tmp/engine-test.sock"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let args = Args::parse_from(["mcp-engine", "--config", "/nonexistent/engine.yaml"]);
        assert!(matches!(Config::from_args(args), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.inline_timeout = 0;
        assert!(config.validate().is_err());

        let config = Config {
            bearer_token: Some("  ".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_configs() {
        let config = Config {
            port: 4200,
            bearer_token: Some("t".to_string()),
            allowed_origin: Some("https://x".to_string()),
            inline_timeout: 3,
            instructions: Some("be nice".to_string()),
            ..Config::default()
        };

        let http = config.http_server_config();
        assert_eq!(http.bind.port(), 4200);
        assert_eq!(http.inline_response_timeout, Duration::from_secs(3));
        assert_eq!(http.sse_path, "/sse");

        let ws = config.websocket_server_config();
        assert_eq!(ws.required_origin.as_deref(), Some("https://x"));
        assert_eq!(ws.bearer_token.as_deref(), Some("t"));

        let unix = config.unix_listener_config();
        assert_eq!(unix.server.instructions.as_deref(), Some("be nice"));
        assert_eq!(unix.path, config.socket);
    }
}
