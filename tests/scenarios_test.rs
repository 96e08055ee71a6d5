//! End-to-end scenarios
//!
//! Each test wires a real client or raw peer against a real server over one
//! of the transports and checks the wire-visible outcome.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use mcp_engine_rs::error::{Error, ErrorCode};
use mcp_engine_rs::mcp::handler::{get_string_arg, resource_fn, tool_fn, Arguments, ToolContext};
use mcp_engine_rs::mcp::{Client, ClientConfig, Server, ServerConfig, SessionState};
use mcp_engine_rs::tools;
use mcp_engine_rs::transport::{
    HttpServerConfig, HttpServerTransport, StdioTransport, Transport, TransportState,
    WebSocketClientConfig, WebSocketClientTransport,
};
use mcp_engine_rs::types::{
    CompletionArgument, CompletionReference, ResourceContents, ResourceTemplate, TaskStatus, Tool,
    ToolResult,
};

/// A server and a client joined by an in-memory pipe, handshake done.
async fn duplex_session(configure: impl FnOnce(&Server)) -> (Server, Client) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);

    let (read, write) = tokio::io::split(server_end);
    let server = Server::new(
        Arc::new(StdioTransport::from_streams(read, write)),
        ServerConfig::default(),
    );
    configure(&server);

    let (read, write) = tokio::io::split(client_end);
    let client = Client::new(
        Arc::new(StdioTransport::from_streams(read, write)),
        ClientConfig::default(),
    );

    let start = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });
    client.connect().await.unwrap();
    start.await.unwrap().unwrap();
    (server, client)
}

fn args(value: Value) -> Arguments {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn stdio_echo_round_trip() {
    let (server, client) = duplex_session(|server| {
        server.add_tool(
            Tool::new("echo", "Echo text"),
            tool_fn(|args: Arguments, _ctx: ToolContext| async move {
                Ok(ToolResult::text(get_string_arg(&args, "text")?))
            }),
        );
    })
    .await;
    assert_eq!(server.state(), SessionState::Ready);
    assert_eq!(client.state(), SessionState::Ready);

    let result = client.call_tool("echo", args(json!({"text": "hi"}))).await.unwrap();
    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["content"], json!([{"type": "text", "text": "hi"}]));
    assert_eq!(wire["isError"], false);

    client.disconnect().await.unwrap();
    assert_eq!(server.closed().await, SessionState::Disconnected);
}

#[tokio::test]
async fn websocket_reconnect_gives_up_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    {
        let accepts = accepts.clone();
        tokio::spawn(async move {
            // Accept and hang up before any handshake bytes are exchanged.
            while let Ok((stream, _)) = listener.accept().await {
                accepts.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
    }

    let transport = WebSocketClientTransport::new(WebSocketClientConfig {
        url: format!("ws://{}/", addr),
        reconnect: true,
        reconnect_initial_delay: Duration::from_millis(10),
        max_reconnect_attempts: Some(3),
        ..WebSocketClientConfig::default()
    });

    let err = tokio::time::timeout(Duration::from_secs(10), transport.connect())
        .await
        .expect("connect should give up")
        .unwrap_err();
    assert!(err.to_string().contains("attempts exceeded"), "{}", err);
    assert_eq!(transport.state(), TransportState::Error);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 3);
}

/// Start a server on an HTTP transport bound to a free port.
async fn http_server(inline: Duration) -> (Server, SocketAddr) {
    let transport = Arc::new(HttpServerTransport::new(HttpServerConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        inline_response_timeout: inline,
        ..HttpServerConfig::default()
    }));
    let server = Server::new(transport.clone(), ServerConfig::default());
    tools::register_all_tools(&server).unwrap();
    server.add_tool(
        Tool::new("slow", "Answers after a second"),
        tool_fn(|_args: Arguments, _ctx: ToolContext| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(ToolResult::text("done"))
        }),
    );

    tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });

    for _ in 0..200 {
        if let Some(addr) = transport.local_addr() {
            return (server, addr);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("HTTP transport never bound");
}

#[tokio::test]
async fn http_inline_and_deferred_answers() {
    let (server, addr) = http_server(Duration::from_millis(300)).await;
    let url = format!("http://{}/", addr);
    let http = reqwest::Client::new();

    let init = http
        .post(&url)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "curl", "version": "1"}
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(init.status(), reqwest::StatusCode::OK);
    let session = init
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("session header");
    let body: Value = init.json().await.unwrap();
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");

    let initialized = http
        .post(&url)
        .header("mcp-session-id", &session)
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .unwrap();
    assert_eq!(initialized.status(), reqwest::StatusCode::ACCEPTED);

    let call = |id: u32, name: &str| {
        http.post(&url).header("mcp-session-id", &session).json(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": {"text": "inline"}}
        }))
    };

    let fast = call(2, "echo").send().await.unwrap();
    assert_eq!(fast.status(), reqwest::StatusCode::OK);
    assert_eq!(
        fast.headers().get("mcp-session-id").and_then(|v| v.to_str().ok()),
        Some(session.as_str())
    );
    let body: Value = fast.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "inline");

    let slow = call(3, "slow").send().await.unwrap();
    assert_eq!(slow.status(), reqwest::StatusCode::ACCEPTED);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn template_routes_unmatched_uris() {
    let (_server, client) = duplex_session(|server| {
        server
            .add_resource_template(
                ResourceTemplate::new("file:///{path}", "files"),
                resource_fn(|uri: String, vars: HashMap<String, String>| async move {
                    Ok(vec![ResourceContents::text(
                        uri,
                        format!("contents of {}", vars["path"]),
                    )])
                }),
            )
            .unwrap();
    })
    .await;

    let contents = client.read_resource("file:///a/b.txt").await.unwrap();
    assert_eq!(contents[0].uri, "file:///a/b.txt");
    assert_eq!(contents[0].text.as_deref(), Some("contents of a/b.txt"));

    let err = client.read_resource("http://elsewhere/x").await.unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));
    assert_eq!(err.code(), ErrorCode::MethodNotFound);

    // The session survives the failed read.
    client.ping().await.unwrap();
}

#[tokio::test]
async fn demo_capabilities_end_to_end() {
    let (_server, client) = duplex_session(|server| {
        tools::register_all_tools(server).unwrap();
    })
    .await;

    let tools: Vec<String> = client
        .list_tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(tools, vec!["echo", "delayed_echo"]);

    let about = client.read_resource("engine://about").await.unwrap();
    assert_eq!(about[0].mime_type.as_deref(), Some("application/json"));

    let echoed = client.read_resource("echo://hello").await.unwrap();
    assert_eq!(echoed[0].text.as_deref(), Some("hello"));

    let prompt = client
        .get_prompt("greeting", Some(args(json!({"name": "Grace"}))))
        .await
        .unwrap();
    let text = serde_json::to_value(&prompt.messages[0].content).unwrap();
    assert!(text["text"].as_str().unwrap().contains("Grace"));

    let missing = client.get_prompt("greeting", None).await.unwrap_err();
    assert_eq!(missing.code(), ErrorCode::InvalidParams);

    let completion = client
        .complete(
            CompletionReference::Prompt {
                name: "greeting".to_string(),
            },
            CompletionArgument {
                name: Some("name".to_string()),
                value: "g".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(completion.values, vec!["Grace"]);

    let started = client
        .call_tool("delayed_echo", args(json!({"text": "later", "delay_ms": 20})))
        .await
        .unwrap();
    let task = started.task.expect("task record");
    assert_eq!(task.status, TaskStatus::Working);

    let mut status = task.status;
    for _ in 0..100 {
        status = client.get_task(&task.task_id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TaskStatus::Completed);
    let result = client.task_result(&task.task_id).await.unwrap();
    assert_eq!(result.content[0].as_text(), Some("later"));
}
