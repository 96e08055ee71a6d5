//! HTTP+SSE client transport.
//!
//! Outbound envelopes are POSTed as JSON. Inbound envelopes arrive either on a
//! long-lived `text/event-stream` GET or in the body of a POST response (plain
//! JSON or a short SSE stream).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{retry_with_backoff, BackoffParams};
use super::sse::SseParser;
use super::{lock, EventReceiver, FrameSink, Transport, TransportCore, TransportState, WriteQueue};
use crate::error::{Error, Result};
use crate::mcp::codec::{self, Message};

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP+SSE client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Endpoint receiving POSTs (and, by default, the SSE GET).
    pub url: String,
    /// Separate SSE endpoint, if the server uses one.
    pub sse_url: Option<String>,
    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    /// Per-POST timeout.
    pub request_timeout: Option<Duration>,
    /// Open the long-lived SSE GET on connect.
    pub open_sse_stream: bool,
    /// Reopen the SSE stream after it drops.
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl HttpClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000/".to_string(),
            sse_url: None,
            bearer_token: None,
            request_timeout: Some(Duration::from_secs(30)),
            open_sse_stream: true,
            auto_reconnect: false,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: None,
        }
    }
}

/// Mutable connection details shared with the POST writer and SSE reader.
struct Shared {
    post_url: RwLock<Url>,
    session_id: RwLock<Option<String>>,
}

impl Shared {
    fn post_url(&self) -> Url {
        self.post_url
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, id: String) {
        let mut slot = self
            .session_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.as_deref() != Some(id.as_str()) {
            debug!("HTTP session id: {}", id);
            *slot = Some(id);
        }
    }

    fn capture_session(&self, headers: &HeaderMap) {
        if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            self.set_session_id(id.to_string());
        }
    }

    /// Apply an `endpoint` event: a (possibly relative) URL carrying `sessionId`.
    fn apply_endpoint(&self, data: &str) -> Result<()> {
        let base = self.post_url();
        let url = base
            .join(data.trim())
            .map_err(|e| Error::Transport(format!("invalid endpoint {:?}: {}", data, e)))?;
        if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "sessionId") {
            self.set_session_id(id.into_owned());
        }
        info!("SSE endpoint: {}", url);
        *self
            .post_url
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = url;
        Ok(())
    }
}

/// HTTP+SSE client transport.
pub struct HttpClientTransport {
    core: Arc<TransportCore>,
    config: HttpClientConfig,
    client: Client,
    shared: Arc<Shared>,
    writer: Mutex<Option<WriteQueue>>,
    sse_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<CancellationToken>,
}

impl HttpClientTransport {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let post_url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid url {:?}: {}", config.url, e)))?;
        let client = Client::builder().build()?;
        Ok(Self {
            core: Arc::new(TransportCore::new("http")),
            config,
            client,
            shared: Arc::new(Shared {
                post_url: RwLock::new(post_url),
                session_id: RwLock::new(None),
            }),
            writer: Mutex::new(None),
            sse_task: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    /// Session id assigned by the server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    fn sse_url(&self) -> String {
        self.config
            .sse_url
            .clone()
            .unwrap_or_else(|| self.config.url.clone())
    }
}

fn authorize(builder: RequestBuilder, token: Option<&str>, session: Option<String>) -> RequestBuilder {
    let builder = match token {
        Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
        None => builder,
    };
    match session {
        Some(id) => builder.header(SESSION_HEADER, id),
        None => builder,
    }
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

async fn open_sse(
    client: &Client,
    url: &str,
    token: Option<&str>,
    shared: &Shared,
) -> Result<Response> {
    let request = authorize(
        client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream")),
        token,
        shared.session_id(),
    );
    let response = request.send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::HttpStatus { status, body });
    }
    shared.capture_session(response.headers());
    Ok(response)
}

/// Pump one SSE response body into the event stream. Returns when the body ends.
async fn pump_sse(core: &TransportCore, shared: &Shared, response: Response) -> Result<()> {
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for event in parser.feed(&chunk) {
            dispatch_sse_event(core, shared, event.event_type(), &event.data);
        }
    }
    if let Some(event) = parser.finish() {
        dispatch_sse_event(core, shared, event.event_type(), &event.data);
    }
    Ok(())
}

fn dispatch_sse_event(core: &TransportCore, shared: &Shared, kind: &str, data: &str) {
    match kind {
        "endpoint" => {
            if let Err(e) = shared.apply_endpoint(data) {
                warn!("{}", e);
                core.emit_error(e);
            }
        }
        "message" => core.emit_frame(data),
        other => debug!("ignoring SSE event type {:?}", other),
    }
}

async fn sse_loop(
    core: Arc<TransportCore>,
    shared: Arc<Shared>,
    client: Client,
    config: HttpClientConfig,
    sse_url: String,
    shutdown: CancellationToken,
    first: Response,
) {
    let mut response = first;
    loop {
        let outcome = tokio::select! {
            result = pump_sse(&core, &shared, response) => result,
            _ = shutdown.cancelled() => return,
        };
        if shutdown.is_cancelled() {
            return;
        }
        match outcome {
            Ok(()) => warn!("SSE stream ended"),
            Err(e) => warn!("SSE stream failed: {}", e),
        }
        core.emit_error(Error::ConnectionClosed("SSE stream closed".to_string()));

        if !config.auto_reconnect {
            core.set_state(TransportState::Disconnected);
            return;
        }

        core.set_state(TransportState::Connecting);
        let params = BackoffParams::fixed(config.reconnect_delay, config.max_reconnect_attempts);
        let token = config.bearer_token.as_deref();
        let client_ref = &client;
        let shared_ref = &*shared;
        let url_ref = sse_url.as_str();
        let reopened = tokio::select! {
            result = async {
                tokio::time::sleep(config.reconnect_delay).await;
                retry_with_backoff(
                    move || async move {
                        info!("Reopening SSE stream at {}", url_ref);
                        open_sse(client_ref, url_ref, token, shared_ref).await
                    },
                    |_| true,
                    &params,
                )
                .await
            } => result,
            _ = shutdown.cancelled() => return,
        };

        match reopened {
            Ok(next) => {
                core.set_state(TransportState::Connected);
                response = next;
            }
            Err(e) => {
                core.emit_error(Error::Transport(format!(
                    "SSE reconnect attempts exceeded: {}",
                    e
                )));
                core.set_state(TransportState::Error);
                return;
            }
        }
    }
}

/// Writes each frame as one POST and feeds any inline reply back as events.
struct PostSink {
    core: Arc<TransportCore>,
    shared: Arc<Shared>,
    client: Client,
    bearer_token: Option<String>,
    timeout: Option<Duration>,
}

#[async_trait]
impl FrameSink for PostSink {
    async fn write_frame(&mut self, frame: String) -> Result<()> {
        let mut request = self
            .client
            .post(self.shared.post_url())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(frame);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let request = authorize(
            request,
            self.bearer_token.as_deref(),
            self.shared.session_id(),
        );

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    millis: self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                }
            } else {
                Error::Http(e)
            }
        })?;
        self.shared.capture_session(response.headers());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        if is_event_stream(&response) {
            // Streamed replies may stay open; do not hold the write queue for them.
            let core = self.core.clone();
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = pump_sse(&core, &shared, response).await {
                    warn!("POST response stream failed: {}", e);
                    core.emit_error(e);
                }
            });
        } else {
            let body = response.text().await?;
            self.core.emit_frame(&body);
        }
        Ok(())
    }

    fn stops_on_error(&self) -> bool {
        false
    }
}

#[async_trait]
impl Transport for HttpClientTransport {
    fn kind(&self) -> &'static str {
        self.core.kind()
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn take_events(&self) -> Option<EventReceiver> {
        self.core.take_events()
    }

    async fn connect(&self) -> Result<()> {
        self.core
            .transition(&[TransportState::Disconnected], TransportState::Connecting)?;

        let shutdown = CancellationToken::new();
        *lock(&self.shutdown) = shutdown.clone();

        if self.config.open_sse_stream {
            let sse_url = self.sse_url();
            info!("Opening SSE stream at {}", sse_url);
            let response = match open_sse(
                &self.client,
                &sse_url,
                self.config.bearer_token.as_deref(),
                &self.shared,
            )
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.core.set_state(TransportState::Error);
                    return Err(e);
                }
            };
            let task = tokio::spawn(sse_loop(
                self.core.clone(),
                self.shared.clone(),
                self.client.clone(),
                self.config.clone(),
                sse_url,
                shutdown,
                response,
            ));
            *lock(&self.sse_task) = Some(task);
        }

        let (queue, _writer_task) = WriteQueue::spawn(PostSink {
            core: self.core.clone(),
            shared: self.shared.clone(),
            client: self.client.clone(),
            bearer_token: self.config.bearer_token.clone(),
            timeout: self.config.request_timeout,
        });
        *lock(&self.writer) = Some(queue);

        self.core.set_state(TransportState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.core.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.core.set_state(TransportState::Disconnecting);
        lock(&self.shutdown).cancel();
        if let Some(task) = lock(&self.sse_task).take() {
            task.abort();
        }
        lock(&self.writer).take();

        if let Some(id) = self.shared.session_id() {
            let request = authorize(
                self.client.delete(self.shared.post_url()),
                self.config.bearer_token.as_deref(),
                Some(id),
            );
            if let Err(e) = request.send().await {
                debug!("session DELETE failed: {}", e);
            }
        }

        self.core.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if !matches!(
            self.core.state(),
            TransportState::Connected | TransportState::Connecting
        ) {
            return Err(Error::ConnectionClosed(format!(
                "http transport is {}",
                self.core.state()
            )));
        }
        let queue = lock(&self.writer)
            .clone()
            .ok_or_else(|| Error::ConnectionClosed("http writer closed".to_string()))?;
        queue.write(codec::encode_line(&message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(url: &str) -> Shared {
        Shared {
            post_url: RwLock::new(Url::parse(url).unwrap()),
            session_id: RwLock::new(None),
        }
    }

    #[test]
    fn test_endpoint_event_sets_url_and_session() {
        let shared = shared("http://localhost:3000/sse");
        shared.apply_endpoint("/messages?sessionId=abc123").unwrap();
        assert_eq!(
            shared.post_url().as_str(),
            "http://localhost:3000/messages?sessionId=abc123"
        );
        assert_eq!(shared.session_id().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_session_header_capture() {
        let shared = shared("http://localhost:3000/");
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s-42"));
        shared.capture_session(&headers);
        assert_eq!(shared.session_id().as_deref(), Some("s-42"));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = HttpClientTransport::new(HttpClientConfig::new("not a url"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport =
            HttpClientTransport::new(HttpClientConfig::new("http://127.0.0.1:9/")).unwrap();
        let err = transport
            .send(Message::notification("notifications/initialized", None))
            .await
            .unwrap_err();
        assert!(err.is_connection_closed());
    }
}
