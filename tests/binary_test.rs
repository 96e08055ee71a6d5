//! Binary integration tests
//!
//! Spawn the `mcp-engine` binary and talk JSON-RPC to it over stdio.

#![allow(deprecated)] // cargo_bin

use assert_cmd::cargo::CommandCargoExt;
use assert_cmd::Command as AssertCommand;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Test client speaking newline-delimited JSON-RPC to a spawned server.
struct StdioTestClient {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    request_id: i64,
}

impl StdioTestClient {
    fn spawn() -> Result<Self, Box<dyn std::error::Error>> {
        let mut child = Command::cargo_bin("mcp-engine")?
            .arg("--transport")
            .arg("stdio")
            .env_remove("MCP_ENGINE_CONFIG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or("no stdin")?;
        let stdout = BufReader::new(child.stdout.take().ok_or("no stdout")?);

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
            request_id: 0,
        })
    }

    fn send(&mut self, message: Value) -> Result<(), Box<dyn std::error::Error>> {
        let stdin = self.stdin.as_mut().ok_or("stdin closed")?;
        writeln!(stdin, "{}", serde_json::to_string(&message)?)?;
        stdin.flush()?;
        Ok(())
    }

    fn request(&mut self, method: &str, params: Value) -> Result<Value, Box<dyn std::error::Error>> {
        self.request_id += 1;
        let id = self.request_id;
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))?;

        // Skip notifications until our response arrives.
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err("server closed stdout".into());
            }
            let message: Value = serde_json::from_str(&line)?;
            if message["id"] == id {
                return Ok(message);
            }
        }
    }

    fn initialize(&mut self) -> Result<Value, Box<dyn std::error::Error>> {
        let response = self.request(
            "initialize",
            json!({
                "protocolVersion": "2025-06-18",
                "capabilities": { "roots": { "listChanged": true } },
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }),
        )?;
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))?;
        Ok(response)
    }

    fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, Box<dyn std::error::Error>> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
    }
}

impl Drop for StdioTestClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

#[test]
fn test_binary_help() {
    AssertCommand::cargo_bin("mcp-engine")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Model Context Protocol"))
        .stdout(predicate::str::contains("--transport"));
}

#[test]
fn test_binary_version() {
    AssertCommand::cargo_bin("mcp-engine")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mcp-engine"));
}

#[test]
fn test_binary_rejects_unknown_transport() {
    AssertCommand::cargo_bin("mcp-engine")
        .unwrap()
        .args(["--transport", "carrier-pigeon"])
        .assert()
        .failure();
}

#[test]
fn test_stdio_session() {
    let mut client = StdioTestClient::spawn().expect("Failed to spawn server");

    let response = client.initialize().expect("Failed to initialize");
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2025-06-18");
    assert_eq!(result["serverInfo"]["name"], "mcp-engine");
    assert!(result["capabilities"]["tools"].is_object());
    assert!(result["capabilities"]["completions"].is_object());

    let tools = client.request("tools/list", json!({})).unwrap();
    let names: Vec<&str> = tools["result"]["tools"]
        .as_array()
        .expect("tools should be array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, vec!["echo", "delayed_echo"]);

    let echo = client.call_tool("echo", json!({"text": "hi"})).unwrap();
    assert_eq!(
        echo["result"]["content"],
        json!([{"type": "text", "text": "hi"}])
    );
    assert_eq!(echo["result"]["isError"], false);

    let missing = client.call_tool("nonexistent_tool", json!({})).unwrap();
    assert_eq!(missing["error"]["code"], -32601);

    let prompts = client.request("prompts/list", json!({})).unwrap();
    assert_eq!(prompts["result"]["prompts"][0]["name"], "greeting");
}

#[test]
fn test_stdio_exits_on_eof() {
    let mut client = StdioTestClient::spawn().expect("Failed to spawn server");
    client.initialize().expect("Failed to initialize");

    drop(client.stdin.take());
    let status = client.child.wait().expect("server should exit");
    assert!(status.success());
}
