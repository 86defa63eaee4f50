//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::hex;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use wallet_engine::evm::{JsonRpcTransport, RpcError};
use wallet_engine::http::{HttpResponse, HttpTransport, TransportError};
use wallet_engine::SigningKey;

pub const GATEWAY: &str = "http://gateway.test";

/// Well-known development keys, in the order their addresses sort:
/// 0x3C44… < 0x7099… < 0xf39F….
pub const KEY_0: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const KEY_1: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
pub const KEY_2: &str = "5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

pub fn key(hex_key: &str) -> SigningKey {
    SigningKey::from_hex(hex_key).unwrap()
}

type Reply = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// In-memory TRON gateway. Each path holds a queue of replies; the last one
/// repeats. Unknown paths answer `{}`.
#[derive(Default)]
pub struct ScriptedGateway {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Duration,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, path: &str, reply: Value) -> Self {
        self.on_fn(path, move |_| reply.clone())
    }

    pub fn on_fn<F>(self, path: &str, reply: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(Box::new(reply));
        self
    }

    /// Answer each request after `delay`, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Request bodies sent to `path`, oldest first.
    pub fn calls_to(&self, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedGateway {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        self.calls.lock().unwrap().push((path.clone(), body.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut routes = self.routes.lock().unwrap();
        let reply = match routes.get_mut(&path) {
            Some(queue) if queue.len() > 1 => {
                let reply = queue.pop_front().unwrap();
                reply(body)
            }
            Some(queue) => queue.front().map(|reply| reply(body)).unwrap_or_else(|| json!({})),
            None => json!({}),
        };
        Ok(HttpResponse::ok(reply.to_string()))
    }
}

/// A built transaction as the gateway returns it, with a txID that matches
/// its raw bytes.
pub fn built(contract: &str, owner_hex: &str) -> Value {
    let raw_hex = "0a02abcd";
    let raw = hex::decode(raw_hex).unwrap();
    let txid = hex::encode(Sha256::digest(&raw));
    json!({
        "txID": txid,
        "raw_data_hex": raw_hex,
        "raw_data": {"contract": [{
            "type": contract,
            "parameter": {"value": {"owner_address": owner_hex}}
        }]}
    })
}

/// Like [`built`], echoing `Permission_id` when the request carried `field`.
pub fn built_echoing(contract: &str, owner_hex: &str, field: &str, body: &Value) -> Value {
    let mut tx = built(contract, owner_hex);
    if let Some(id) = body.get(field).and_then(Value::as_u64) {
        tx["raw_data"]["contract"][0]["Permission_id"] = json!(id);
    }
    tx
}

/// A confirmed `gettransactioninfobyid` answer.
pub fn confirmed_info(block: u64) -> Value {
    json!({"id": "aa", "blockNumber": block, "receipt": {"result": "SUCCESS"}})
}

type NodeHandler = Box<dyn Fn(&str, &Value) -> Result<Value, RpcError> + Send + Sync>;

/// In-memory JSON-RPC node answering through a handler and recording calls.
pub struct ScriptedNode {
    handler: NodeHandler,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Duration,
}

impl ScriptedNode {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Answer each call after `delay`, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(m, _)| m == method).count()
    }

    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl JsonRpcTransport for ScriptedNode {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.calls.lock().unwrap().push((method.to_string(), params.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(method, &params)
    }
}

/// A node-side JSON-RPC error.
pub fn node_error(code: i64, message: &str) -> RpcError {
    RpcError::Node {
        code,
        message: message.to_string(),
        data: None,
    }
}

/// Start a TCP backend on an ephemeral port. The handler sees the request
/// path and body and returns the status and body to send.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some((path, body)) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, body) = f(path, body).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Read one HTTP/1.1 request: headers, then `Content-Length` bytes of body.
async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = (header_end + length).min(buf.len());
    let body = String::from_utf8_lossy(&buf[header_end..end]).to_string();
    Some((path, body))
}
