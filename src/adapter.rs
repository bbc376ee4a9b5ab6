//! Adapter layer - agents, tools, and memory backends
//!
//! The core never talks to an LLM, a tool runtime, or a memory service
//! directly; it goes through these traits. Implementations here:
//!
//! - [`MockAgent`] / [`MockTool`] - configurable responses for tests and CI
//! - [`HttpTool`] - production fetch tool with SSRF validation
//! - [`InMemoryMemory`] - keyed message log with flush support
//!
//! Adapter methods return `anyhow::Result`; the execute and memory drivers
//! wrap failures into the crate error with adapter category, and the durable
//! runtime retries per its own policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::template;
use crate::types::MessageRole;

/// Default timeout for HTTP fetches (30 seconds)
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// AGENT ADAPTER
// ============================================================================

/// Request handed to an agent adapter
///
/// `config` is the binding config after run-time re-parsing against live
/// workflow state; the adapter sees resolved values only.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub agent_id: String,
    pub action: Option<String>,
    pub prompt: Option<String>,
    pub input: Value,
    pub config: Map<String, Value>,
    pub env: HashMap<String, String>,
}

/// An LLM-backed agent the execute path can invoke
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn call(&self, request: AgentRequest) -> Result<Value>;
}

// ============================================================================
// TOOL ADAPTER
// ============================================================================

/// Request handed to a tool adapter
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool_id: String,
    pub input: Value,
    pub config: Map<String, Value>,
    pub env: HashMap<String, String>,
}

/// A deterministic tool the execute path can invoke
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn call(&self, request: ToolRequest) -> Result<Value>;
}

// ============================================================================
// ADAPTER REGISTRY
// ============================================================================

/// Lock-free registry binding component ids to adapters
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    agents: Arc<DashMap<String, Arc<dyn AgentAdapter>>>,
    tools: Arc<DashMap<String, Arc<dyn ToolAdapter>>>,
    memories: Arc<DashMap<String, Arc<dyn MemoryBackend>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&self, id: impl Into<String>, adapter: Arc<dyn AgentAdapter>) {
        self.agents.insert(id.into(), adapter);
    }

    pub fn register_tool(&self, id: impl Into<String>, adapter: Arc<dyn ToolAdapter>) {
        self.tools.insert(id.into(), adapter);
    }

    pub fn register_memory(&self, id: impl Into<String>, backend: Arc<dyn MemoryBackend>) {
        self.memories.insert(id.into(), backend);
    }

    pub fn agent(&self, id: &str) -> Result<Arc<dyn AgentAdapter>> {
        self.agents
            .get(id)
            .map(|a| Arc::clone(&a))
            .ok_or_else(|| anyhow!("unknown agent: {id}"))
    }

    pub fn tool(&self, id: &str) -> Result<Arc<dyn ToolAdapter>> {
        self.tools
            .get(id)
            .map(|t| Arc::clone(&t))
            .ok_or_else(|| anyhow!("unknown tool: {id}"))
    }

    pub fn memory(&self, id: &str) -> Result<Arc<dyn MemoryBackend>> {
        self.memories
            .get(id)
            .map(|m| Arc::clone(&m))
            .ok_or_else(|| anyhow!("unknown memory: {id}"))
    }
}

// ============================================================================
// MOCK ADAPTERS
// ============================================================================

/// Mock agent with a FIFO response queue and request capture
pub struct MockAgent {
    responses: Mutex<Vec<Value>>,
    requests: Mutex<Vec<AgentRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(vec![]),
            requests: Mutex::new(vec![]),
            fail_with: Mutex::new(None),
        }
    }

    pub fn with_responses(responses: Vec<Value>) -> Self {
        let mock = Self::new();
        *mock.responses.lock().unwrap() = responses;
        mock
    }

    /// Make every subsequent call fail with this message
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(message.into());
    }

    pub fn queue_response(&self, response: Value) {
        self.responses.lock().unwrap().push(response);
    }

    /// All captured requests (for assertions)
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<AgentRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentAdapter for MockAgent {
    async fn call(&self, request: AgentRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            bail!("{message}");
        }

        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            // echo behavior: reflect the input back
            Ok(json!({"echo": request.input}))
        } else {
            Ok(queue.remove(0))
        }
    }
}

/// Mock tool that echoes its input, with optional canned responses
pub struct MockTool {
    responses: Mutex<Vec<Value>>,
    requests: Mutex<Vec<ToolRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl MockTool {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(vec![]),
            requests: Mutex::new(vec![]),
            fail_with: Mutex::new(None),
        }
    }

    pub fn with_responses(responses: Vec<Value>) -> Self {
        let mock = Self::new();
        *mock.responses.lock().unwrap() = responses;
        mock
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(message.into());
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for MockTool {
    async fn call(&self, request: ToolRequest) -> Result<Value> {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            bail!("{message}");
        }

        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            Ok(request.input)
        } else {
            Ok(queue.remove(0))
        }
    }
}

// ============================================================================
// HTTP TOOL
// ============================================================================

/// Validate a fetch URL (SSRF prevention)
///
/// Blocks non-HTTP(S) schemes and loopback/unspecified hosts.
fn validate_fetch_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw).with_context(|| format!("invalid url: {raw}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => bail!("url scheme {other:?} is not allowed"),
    }
    match parsed.host() {
        Some(url::Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                bail!("loopback host is not allowed");
            }
        }
        Some(url::Host::Ipv4(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                bail!("loopback host is not allowed");
            }
        }
        Some(url::Host::Ipv6(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                bail!("loopback host is not allowed");
            }
        }
        None => bail!("url has no host"),
    }
    Ok(parsed)
}

/// Production fetch tool backed by a shared reqwest client
///
/// Config keys: `url` (required), `method`, `headers`, `body`.
pub struct HttpTool {
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent("ordo/0.1")
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for HttpTool {
    async fn call(&self, request: ToolRequest) -> Result<Value> {
        let raw_url = request
            .config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("http tool requires a url"))?;
        let url = validate_fetch_url(raw_url)?;

        let method = request
            .config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let mut builder = if method.eq_ignore_ascii_case("POST") {
            self.client.post(url)
        } else if method.eq_ignore_ascii_case("PUT") {
            self.client.put(url)
        } else if method.eq_ignore_ascii_case("DELETE") {
            self.client.delete(url)
        } else {
            self.client.get(url)
        };

        if let Some(headers) = request.config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    builder = builder.header(key, v);
                }
            }
        }
        if let Some(body) = request.config.get("body") {
            builder = builder.json(body);
        }

        let response = builder.send().await.context("http request failed")?;
        let status = response.status().as_u16();
        let text = response.text().await.context("failed to read response")?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(json!({"status": status, "body": body}))
    }
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

/// One message in a keyed memory log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Health snapshot reported by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub healthy: bool,
    pub message_count: usize,
    pub token_count: usize,
    pub flush_strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush: Option<DateTime<Utc>>,
}

/// Outcome of a backend flush
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub summary_generated: bool,
    pub message_count: usize,
    pub token_count: usize,
}

/// Keyed message-log backend consumed by the memory driver
///
/// The backend performs final key resolution: the driver passes the raw
/// `key_template` plus the evaluation context, so a backend-configured
/// default template can take over when the task omits details.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Resolve a key template against the evaluation context
    fn resolve_key(&self, key_template: &str, context: &Value) -> Result<String>;

    async fn read(&self, key: &str) -> Result<Vec<MemoryMessage>>;

    /// Append messages; may fail after persisting a prefix
    async fn append(&self, key: &str, messages: &[MemoryMessage]) -> Result<usize>;

    async fn clear(&self, key: &str) -> Result<usize>;

    async fn health(&self, key: &str) -> Result<MemoryHealth>;

    /// Whether [`Self::flush`] is implemented
    fn supports_flush(&self) -> bool {
        false
    }

    async fn flush(&self, key: &str) -> Result<FlushOutcome> {
        let _ = key;
        bail!("backend does not support flush")
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

/// Average characters per token for mixed prose (estimation only)
const CHARS_PER_TOKEN: usize = 4;

fn estimate_tokens(messages: &[MemoryMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.content.len().div_ceil(CHARS_PER_TOKEN))
        .sum()
}

/// DashMap-backed memory backend with summarizing flush
///
/// `fail_append_on` makes appends fail when a message contains the marker,
/// after persisting the preceding prefix - used to exercise the driver's
/// write rollback.
pub struct InMemoryMemory {
    logs: DashMap<String, Vec<MemoryMessage>>,
    default_key_template: Option<String>,
    last_flush: Mutex<Option<DateTime<Utc>>>,
    flushes: AtomicUsize,
    fail_append_on: Mutex<Option<String>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            default_key_template: None,
            last_flush: Mutex::new(None),
            flushes: AtomicUsize::new(0),
            fail_append_on: Mutex::new(None),
        }
    }

    pub fn with_default_key_template(mut self, template: impl Into<String>) -> Self {
        self.default_key_template = Some(template.into());
        self
    }

    /// Fail any append whose message content contains `marker`
    pub fn fail_append_on(&self, marker: impl Into<String>) {
        *self.fail_append_on.lock().unwrap() = Some(marker.into());
    }

    pub fn clear_failure(&self) {
        *self.fail_append_on.lock().unwrap() = None;
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryMemory {
    fn resolve_key(&self, key_template: &str, context: &Value) -> Result<String> {
        let effective = if key_template.trim().is_empty() {
            self.default_key_template
                .as_deref()
                .ok_or_else(|| anyhow!("no key template and no default configured"))?
        } else {
            key_template
        };
        let key = template::render_string(effective, context)
            .map_err(|e| anyhow!("key template: {e}"))?;
        if key.trim().is_empty() || key.contains(template::NO_VALUE) {
            bail!("key template resolved to an unusable key: {key:?}");
        }
        Ok(key)
    }

    async fn read(&self, key: &str) -> Result<Vec<MemoryMessage>> {
        Ok(self.logs.get(key).map(|l| l.clone()).unwrap_or_default())
    }

    async fn append(&self, key: &str, messages: &[MemoryMessage]) -> Result<usize> {
        let marker = self.fail_append_on.lock().unwrap().clone();
        let mut log = self.logs.entry(key.to_string()).or_default();
        let mut appended = 0;
        for message in messages {
            if let Some(marker) = &marker {
                if message.content.contains(marker.as_str()) {
                    bail!("append rejected at message {}", appended + 1);
                }
            }
            log.push(message.clone());
            appended += 1;
        }
        Ok(appended)
    }

    async fn clear(&self, key: &str) -> Result<usize> {
        Ok(self.logs.remove(key).map(|(_, l)| l.len()).unwrap_or(0))
    }

    async fn health(&self, key: &str) -> Result<MemoryHealth> {
        let messages = self.read(key).await?;
        Ok(MemoryHealth {
            healthy: true,
            message_count: messages.len(),
            token_count: estimate_tokens(&messages),
            flush_strategy: "summarize".to_string(),
            last_flush: *self.last_flush.lock().unwrap(),
        })
    }

    fn supports_flush(&self) -> bool {
        true
    }

    async fn flush(&self, key: &str) -> Result<FlushOutcome> {
        let messages = self.read(key).await?;
        if messages.is_empty() {
            return Ok(FlushOutcome {
                summary_generated: false,
                message_count: 0,
                token_count: 0,
            });
        }

        let token_count = estimate_tokens(&messages);
        let summary = MemoryMessage {
            role: MessageRole::System,
            content: format!("[summary of {} messages]", messages.len()),
        };
        self.logs.insert(key.to_string(), vec![summary]);
        *self.last_flush.lock().unwrap() = Some(Utc::now());
        self.flushes.fetch_add(1, Ordering::SeqCst);

        Ok(FlushOutcome {
            summary_generated: true,
            message_count: messages.len(),
            token_count,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> MemoryMessage {
        MemoryMessage {
            role: MessageRole::User,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn mock_agent_echoes_by_default() {
        let agent = MockAgent::new();
        let out = agent
            .call(AgentRequest {
                agent_id: "a1".into(),
                action: Some("hello".into()),
                prompt: None,
                input: json!({"name": "Ada"}),
                config: Map::new(),
                env: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(out["echo"]["name"], "Ada");
        assert_eq!(agent.requests().len(), 1);
    }

    #[tokio::test]
    async fn mock_agent_queue_then_failure() {
        let agent = MockAgent::with_responses(vec![json!({"text": "first"})]);
        let request = AgentRequest {
            agent_id: "a1".into(),
            action: None,
            prompt: None,
            input: Value::Null,
            config: Map::new(),
            env: HashMap::new(),
        };
        assert_eq!(
            agent.call(request.clone()).await.unwrap()["text"],
            "first"
        );

        agent.fail_with("quota exhausted");
        assert!(agent.call(request).await.is_err());
    }

    #[tokio::test]
    async fn registry_resolves_and_rejects() {
        let registry = AdapterRegistry::new();
        registry.register_tool("echo", Arc::new(MockTool::new()));

        assert!(registry.tool("echo").is_ok());
        assert!(registry.tool("missing").is_err());
        assert!(registry.agent("missing").is_err());
    }

    #[test]
    fn fetch_url_validation() {
        assert!(validate_fetch_url("https://api.example.com/v1").is_ok());
        assert!(validate_fetch_url("file:///etc/passwd").is_err());
        assert!(validate_fetch_url("http://localhost:8080").is_err());
        assert!(validate_fetch_url("http://127.0.0.1/").is_err());
        assert!(validate_fetch_url("not a url").is_err());
    }

    #[tokio::test]
    async fn memory_append_read_clear() {
        let memory = InMemoryMemory::new();
        memory.append("k", &[msg("one"), msg("two")]).await.unwrap();
        assert_eq!(memory.read("k").await.unwrap().len(), 2);

        let cleared = memory.clear("k").await.unwrap();
        assert_eq!(cleared, 2);
        assert!(memory.read("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_partial_append_failure() {
        let memory = InMemoryMemory::new();
        memory.fail_append_on("poison");

        let err = memory
            .append("k", &[msg("ok-1"), msg("ok-2"), msg("poison-pill"), msg("ok-4")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("message 3"));
        // the prefix was persisted - the driver's rollback cleans this up
        assert_eq!(memory.read("k").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_flush_summarizes() {
        let memory = InMemoryMemory::new();
        memory
            .append("k", &[msg("alpha"), msg("beta"), msg("gamma")])
            .await
            .unwrap();

        let outcome = memory.flush("k").await.unwrap();
        assert!(outcome.summary_generated);
        assert_eq!(outcome.message_count, 3);

        let after = memory.read("k").await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].role, MessageRole::System);

        let health = memory.health("k").await.unwrap();
        assert!(health.last_flush.is_some());
    }

    #[test]
    fn key_resolution_uses_default_template() {
        let memory = InMemoryMemory::new().with_default_key_template("wf:{{ workflow.id }}");
        let context = json!({"workflow": {"id": "wf-9"}});

        let key = memory.resolve_key("", &context).unwrap();
        assert_eq!(key, "wf:wf-9");

        let key = memory
            .resolve_key("user:{{ workflow.id }}", &context)
            .unwrap();
        assert_eq!(key, "user:wf-9");
    }

    #[test]
    fn key_resolution_rejects_unresolved() {
        let memory = InMemoryMemory::new();
        let context = json!({});
        assert!(memory.resolve_key("k:{{ missing.path }}", &context).is_err());
        assert!(memory.resolve_key("", &context).is_err());
    }
}
