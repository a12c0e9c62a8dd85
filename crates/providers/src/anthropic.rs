//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level, cacheable block
//! - Retrieved passages as `search_result` blocks with native citations
//! - Server-side web search tool and the client-side memory tool, with
//!   tool rounds replayed as `tool_use` / `tool_result` blocks
//! - Streaming via SSE, translated into [`GenerationDelta`]s by
//!   [`AnthropicStreamDecoder`]
//! - Extended thinking support

use async_trait::async_trait;
use ciq_core::error::ProviderError;
use ciq_core::message::{Message, Role};
use ciq_core::provider::*;
use ciq_core::tool::{ToolCall, ToolRound};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_THINKING_BUDGET: u32 = 8000;
const WEB_SEARCH_MAX_USES: u32 = 5;
const MEMORY_TOOL_TYPE: &str = "memory_20250818";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Budget tokens for extended thinking when a request enables reasoning.
    thinking_budget: u32,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        // No client-level timeout: the orchestrator owns the overall deadline
        // and long reasoning streams would otherwise be cut.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            thinking_budget: DEFAULT_THINKING_BUDGET,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the extended-thinking budget used when reasoning is requested.
    pub fn with_thinking_budget(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = budget_tokens;
        self
    }

    /// Convert messages to Anthropic API format.
    ///
    /// Documents are attached to the final user message as `search_result`
    /// blocks ahead of the question text. Tool rounds follow, each as an
    /// assistant turn with its calls and a user turn with their results.
    fn to_api_messages(
        messages: &[Message],
        documents: &[SourceDocument],
        rounds: &[ToolRound],
    ) -> Vec<AnthropicMessage> {
        let last_user = messages.iter().rposition(|m| m.role == Role::User);

        let mut api: Vec<AnthropicMessage> = messages
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                let content = if Some(i) == last_user && !documents.is_empty() {
                    let mut blocks: Vec<ContentBlock> =
                        documents.iter().map(ContentBlock::search_result).collect();
                    blocks.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                    AnthropicContent::Blocks(blocks)
                } else {
                    AnthropicContent::Text(msg.content.clone())
                };
                AnthropicMessage {
                    role: msg.role.as_str().into(),
                    content,
                }
            })
            .collect();

        for round in rounds {
            let mut calls = Vec::with_capacity(round.calls.len() + 1);
            if !round.text.is_empty() {
                calls.push(ContentBlock::Text {
                    text: round.text.clone(),
                });
            }
            calls.extend(round.calls.iter().map(|c| ContentBlock::ToolUse {
                id: c.id.clone(),
                name: c.name.clone(),
                input: c.input.clone(),
            }));
            api.push(AnthropicMessage {
                role: "assistant".into(),
                content: AnthropicContent::Blocks(calls),
            });
            api.push(AnthropicMessage {
                role: "user".into(),
                content: AnthropicContent::Blocks(
                    round
                        .outputs
                        .iter()
                        .map(|o| ContentBlock::ToolResult {
                            tool_use_id: o.tool_use_id.clone(),
                            content: o.content.clone(),
                        })
                        .collect(),
                ),
            });
        }

        api
    }

    /// Build the JSON request body.
    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages, &request.documents, &request.tool_rounds),
            "max_tokens": request.max_tokens,
        });

        if !request.system.is_empty() {
            body["system"] = json!([{
                "type": "text",
                "text": request.system,
                "cache_control": {"type": "ephemeral"},
            }]);
        }

        if request.reasoning {
            // Temperature must be left unset with thinking enabled.
            let budget = self.thinking_budget.min(request.max_tokens.saturating_sub(1));
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": budget,
            });
        } else {
            body["temperature"] = json!(request.temperature);
        }

        let mut tools = Vec::new();
        if request.web_search {
            tools.push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": WEB_SEARCH_MAX_USES,
            }));
        }
        if request.memory_tool {
            tools.push(json!({
                "type": MEMORY_TOOL_TYPE,
                "name": "memory",
            }));
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    /// Send the request and map non-success statuses to provider errors.
    async fn send(&self, body: &Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if stream {
            req = req.header("Accept", "text/event-stream");
        }

        let response = req
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ciq_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = self.build_body(&request, false);

        debug!(provider = "anthropic", model = %request.model, "Sending completion request");

        let response = self.send(&body, false).await?;

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Anthropic response: {e}")))?;

        Ok(Self::response_to_provider_response(api_resp))
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<DeltaReceiver, ProviderError> {
        let body = self.build_body(&request, true);

        debug!(
            provider = "anthropic",
            model = %request.model,
            documents = request.documents.len(),
            reasoning = request.reasoning,
            tool_rounds = request.tool_rounds.len(),
            "Sending streaming request"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = self.send(&body, true) => r?,
        };

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = LineBuffer::default();
            let mut decoder = AnthropicStreamDecoder::default();

            loop {
                let chunk_result = tokio::select! {
                    biased;
                    // Returning drops the response body, closing the connection.
                    _ = cancel.cancelled() => {
                        debug!("Anthropic stream cancelled");
                        return;
                    }
                    next = byte_stream.next() => match next {
                        Some(c) => c,
                        None => break,
                    },
                };

                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                lines.extend(&bytes);

                while let Some(line) = lines.next_line() {
                    match decoder.push_line(&line) {
                        Ok(deltas) => {
                            for delta in deltas {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }

                    if decoder.is_finished() {
                        return;
                    }
                }
            }

            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "stream ended before message_stop".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

impl AnthropicProvider {
    /// Convert an Anthropic API response to our ProviderResponse.
    fn response_to_provider_response(resp: AnthropicResponse) -> ProviderResponse {
        let text = resp
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                ResponseContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        ProviderResponse {
            text,
            usage: Some(resp.usage.into()),
            model: resp.model,
            stop_reason: resp.stop_reason,
        }
    }
}

/// Splits a byte stream into lines.
///
/// Bytes are kept raw until a full line has arrived, so a multi-byte
/// character split across two network chunks decodes intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// The next complete line, without its `\n` or `\r\n`.
    fn next_line(&mut self) -> Option<String> {
        loop {
            let end = self.pending.iter().position(|&b| b == b'\n')?;
            let mut line: Vec<u8> = self.pending.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(line) => return Some(line),
                Err(e) => trace!(error = %e, "Skipping SSE line with invalid UTF-8"),
            }
        }
    }
}

/// Translates Anthropic SSE lines into provider-neutral deltas.
///
/// Pure and synchronous so the whole wire mapping can be exercised without
/// a network. Feed it one line at a time (without the trailing newline).
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    /// Type of the content block currently open, if any.
    block_type: Option<String>,
    /// Client tool call whose input JSON is still streaming in.
    pending_call: Option<PendingCall>,
    stop_reason: Option<String>,
    finished: bool,
}

impl AnthropicStreamDecoder {
    /// Whether `message_stop` has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode one SSE line.
    pub fn push_line(&mut self, line: &str) -> Result<Vec<GenerationDelta>, ProviderError> {
        // `event:` lines duplicate the `type` field of the data payload.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let event: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
                return Ok(Vec::new());
            }
        };

        self.decode_event(&event)
    }

    fn decode_event(&mut self, event: &Value) -> Result<Vec<GenerationDelta>, ProviderError> {
        let mut out = Vec::new();

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = event["message"].get("usage") {
                    out.push(GenerationDelta::Usage {
                        usage: usage_from_json(usage),
                    });
                }
            }
            "content_block_start" => {
                let block = &event["content_block"];
                let btype = block["type"].as_str().unwrap_or("").to_string();
                match btype.as_str() {
                    "server_tool_use" => out.push(GenerationDelta::ToolUseStart {
                        id: str_field(block, "id"),
                        name: str_field(block, "name"),
                    }),
                    "tool_use" => {
                        let call = PendingCall {
                            id: str_field(block, "id"),
                            name: str_field(block, "name"),
                            json: String::new(),
                        };
                        out.push(GenerationDelta::ToolUseStart {
                            id: call.id.clone(),
                            name: call.name.clone(),
                        });
                        self.pending_call = Some(call);
                    }
                    "web_search_tool_result" => out.push(GenerationDelta::ToolResult {
                        tool_use_id: str_field(block, "tool_use_id"),
                        name: "web_search".into(),
                        content: block.get("content").cloned().unwrap_or(Value::Null),
                    }),
                    _ => {}
                }
                self.block_type = Some(btype);
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(GenerationDelta::Text { text: text.into() });
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str() {
                            out.push(GenerationDelta::Thinking { text: text.into() });
                        }
                    }
                    "citations_delta" => {
                        if let Some(citation) = delta.get("citation") {
                            out.push(GenerationDelta::Citation {
                                citation: citation_from_json(citation),
                            });
                        }
                    }
                    "input_json_delta" => {
                        // Server tool input is not surfaced.
                        if let (Some(call), Some(part)) =
                            (self.pending_call.as_mut(), delta["partial_json"].as_str())
                        {
                            call.json.push_str(part);
                        }
                    }
                    // Signatures are not surfaced.
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(call) = self.pending_call.take() {
                    out.push(GenerationDelta::ToolCall { call: call.finish() });
                }
                self.block_type = None;
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = event.get("usage") {
                    out.push(GenerationDelta::Usage {
                        usage: usage_from_json(usage),
                    });
                }
            }
            "message_stop" => {
                self.finished = true;
                out.push(GenerationDelta::Stop {
                    reason: self.stop_reason.take(),
                });
            }
            "error" => {
                let err = &event["error"];
                let kind = err["type"].as_str().unwrap_or("error");
                let message = err["message"].as_str().unwrap_or("").to_string();
                return Err(match kind {
                    "overloaded_error" | "rate_limit_error" => ProviderError::RateLimited {
                        retry_after_secs: 5,
                    },
                    "authentication_error" | "permission_error" => {
                        ProviderError::AuthenticationFailed(message)
                    }
                    _ => ProviderError::StreamInterrupted(format!("{kind}: {message}")),
                });
            }
            // "ping" and future event types
            _ => {}
        }

        Ok(out)
    }
}

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    json: String,
}

impl PendingCall {
    fn finish(self) -> ToolCall {
        let input = if self.json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.json).unwrap_or_else(|e| {
                warn!(tool = %self.name, error = %e, "Tool input is not valid JSON");
                json!({ "raw": self.json })
            })
        };
        ToolCall {
            id: self.id,
            name: self.name,
            input,
        }
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or("").to_string()
}

fn usage_from_json(u: &Value) -> Usage {
    let get = |k: &str| u.get(k).and_then(Value::as_u64).unwrap_or(0);
    let prompt_tokens = get("input_tokens");
    let completion_tokens = get("output_tokens");
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cache_creation_tokens: get("cache_creation_input_tokens"),
        cache_read_tokens: get("cache_read_input_tokens"),
    }
}

fn citation_from_json(c: &Value) -> CitationRef {
    let opt = |k: &str| c.get(k).and_then(Value::as_str).map(str::to_string);
    CitationRef {
        document_index: c
            .get("search_result_index")
            .or_else(|| c.get("document_index"))
            .and_then(Value::as_u64)
            .map(|i| i as usize),
        source: opt("source").or_else(|| opt("url")),
        title: opt("title").or_else(|| opt("document_title")),
        cited_text: opt("cited_text").unwrap_or_default(),
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "search_result")]
    SearchResult {
        source: String,
        title: String,
        content: Vec<TextBlock>,
        citations: CitationsToggle,
    },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
}

impl ContentBlock {
    fn search_result(doc: &SourceDocument) -> Self {
        Self::SearchResult {
            source: doc.source.clone(),
            title: doc.title.clone(),
            content: vec![TextBlock {
                kind: "text".into(),
                text: doc.text.clone(),
            }],
            citations: CitationsToggle { enabled: true },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TextBlock {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CitationsToggle {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        Usage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
            cache_creation_tokens: u.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: u.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciq_core::Provider;
    use ciq_core::tool::ToolOutput;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("sk-ant-test").unwrap()
    }

    fn decode_all(lines: &[&str]) -> Result<Vec<GenerationDelta>, ProviderError> {
        let mut decoder = AnthropicStreamDecoder::default();
        let mut out = Vec::new();
        for line in lines {
            out.extend(decoder.push_line(line)?);
        }
        Ok(out)
    }

    fn doc(source: &str) -> SourceDocument {
        SourceDocument {
            source: source.into(),
            title: "Pricing page (website, high)".into(),
            text: "Starts at $99".into(),
        }
    }

    #[test]
    fn constructor() {
        let provider = provider();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn constructor_with_base_url() {
        let provider = provider().with_base_url("https://custom.proxy.com/");
        assert_eq!(provider.base_url, "https://custom.proxy.com");
    }

    #[test]
    fn documents_attach_to_final_user_message() {
        let messages = vec![
            Message::user("What about pricing?"),
            Message::assistant("Earlier answer"),
            Message::user("And now?"),
        ];
        let api = AnthropicProvider::to_api_messages(&messages, &[doc("https://a.example")], &[]);
        assert_eq!(api.len(), 3);
        assert!(matches!(api[0].content, AnthropicContent::Text(_)));
        match &api[2].content {
            AnthropicContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(blocks[0], ContentBlock::SearchResult { .. }));
                match &blocks[1] {
                    ContentBlock::Text { text } => assert_eq!(text, "And now?"),
                    _ => panic!("Expected trailing text block"),
                }
            }
            _ => panic!("Expected blocks content"),
        }
    }

    #[test]
    fn search_result_block_shape() {
        let json = serde_json::to_value(ContentBlock::search_result(&doc("vectordb://c1"))).unwrap();
        assert_eq!(json["type"], "search_result");
        assert_eq!(json["source"], "vectordb://c1");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["citations"]["enabled"], true);
    }

    #[test]
    fn body_with_reasoning_omits_temperature() {
        let mut req = ProviderRequest::simple("claude-sonnet-4-6", "sys", "q", 0.15, 16000);
        req.reasoning = true;
        let body = provider().build_body(&req, true);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn body_without_reasoning_sets_temperature_and_tools() {
        let mut req = ProviderRequest::simple("claude-haiku-4-5-20251001", "", "q", 0.15, 8000);
        req.web_search = true;
        let body = provider().build_body(&req, false);
        assert!(body.get("thinking").is_none());
        assert!(body.get("system").is_none());
        assert!((body["temperature"].as_f64().unwrap() - 0.15).abs() < 1e-6);
        assert_eq!(body["tools"][0]["type"], "web_search_20250305");
        assert_eq!(body["tools"][0]["max_uses"], 5);
    }

    #[test]
    fn body_offers_memory_tool_beside_web_search() {
        let mut req = ProviderRequest::simple("claude-sonnet-4-6", "", "q", 0.15, 8000);
        req.web_search = true;
        req.memory_tool = true;
        let body = provider().build_body(&req, true);
        assert_eq!(body["tools"][0]["name"], "web_search");
        assert_eq!(body["tools"][1]["type"], "memory_20250818");
        assert_eq!(body["tools"][1]["name"], "memory");

        req.web_search = false;
        req.memory_tool = false;
        assert!(provider().build_body(&req, true).get("tools").is_none());
    }

    #[test]
    fn tool_rounds_follow_the_question() {
        let mut req = ProviderRequest::simple("claude-sonnet-4-6", "", "Remember I cover KX", 0.15, 8000);
        req.tool_rounds = vec![ToolRound {
            text: "Noting that.".into(),
            calls: vec![ToolCall {
                id: "toolu_1".into(),
                name: "memory".into(),
                input: json!({"command": "view", "path": "/memories"}),
            }],
            outputs: vec![ToolOutput {
                tool_use_id: "toolu_1".into(),
                content: "No memories stored yet.".into(),
            }],
        }];
        let body = provider().build_body(&req, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);

        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "text");
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[1]["content"][1]["input"]["command"], "view");

        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(messages[2]["content"][0]["content"], "No memories stored yet.");
    }

    #[test]
    fn parse_text_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "id": "msg_01",
                "model": "claude-sonnet-4-6",
                "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "x"},
                    {"type": "text", "text": "Hello!"}
                ],
                "usage": {"input_tokens": 10, "output_tokens": 5, "cache_read_input_tokens": 3},
                "stop_reason": "end_turn"
            }"#,
        )
        .unwrap();

        let pr = AnthropicProvider::response_to_provider_response(resp);
        assert_eq!(pr.text, "Hello!");
        let usage = pr.usage.unwrap();
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.cache_read_tokens, 3);
        assert_eq!(pr.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn decode_text_and_thinking_stream() {
        let deltas = decode_all(&[
            "event: message_start",
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":120,"output_tokens":1,"cache_read_input_tokens":100}}}"#,
            "",
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Compare pricing"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
            r#"data: {"type":"ping"}"#,
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"KX is "}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"faster."}}"#,
            r#"data: {"type":"content_block_stop","index":1}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
            r#"data: {"type":"message_stop"}"#,
        ])
        .unwrap();

        assert!(matches!(&deltas[0], GenerationDelta::Usage { usage } if usage.prompt_tokens == 120 && usage.cache_read_tokens == 100));
        assert_eq!(deltas[1], GenerationDelta::Thinking { text: "Compare pricing".into() });
        assert_eq!(deltas[2], GenerationDelta::Text { text: "KX is ".into() });
        assert_eq!(deltas[3], GenerationDelta::Text { text: "faster.".into() });
        assert!(matches!(&deltas[4], GenerationDelta::Usage { usage } if usage.completion_tokens == 42));
        assert_eq!(
            deltas[5],
            GenerationDelta::Stop {
                reason: Some("end_turn".into())
            }
        );
    }

    #[test]
    fn decode_search_result_citation() {
        let deltas = decode_all(&[
            r#"data: {"type":"content_block_delta","index":2,"delta":{"type":"citations_delta","citation":{"type":"search_result_location","search_result_index":3,"source":"https://kx.com/pricing","title":"Pricing (website, high)","cited_text":"Starts at $99","start_block_index":0,"end_block_index":0}}}"#,
        ])
        .unwrap();

        match &deltas[0] {
            GenerationDelta::Citation { citation } => {
                assert_eq!(citation.document_index, Some(3));
                assert_eq!(citation.source.as_deref(), Some("https://kx.com/pricing"));
                assert_eq!(citation.cited_text, "Starts at $99");
            }
            other => panic!("Expected citation, got {other:?}"),
        }
    }

    #[test]
    fn decode_web_search_citation_uses_url() {
        let deltas = decode_all(&[
            r#"data: {"type":"content_block_delta","index":4,"delta":{"type":"citations_delta","citation":{"type":"web_search_result_location","url":"https://news.example/a","title":"News","cited_text":"Raised $50M","encrypted_index":"abc"}}}"#,
        ])
        .unwrap();
        match &deltas[0] {
            GenerationDelta::Citation { citation } => {
                assert_eq!(citation.document_index, None);
                assert_eq!(citation.source.as_deref(), Some("https://news.example/a"));
            }
            other => panic!("Expected citation, got {other:?}"),
        }
    }

    #[test]
    fn decode_web_search_tool_blocks() {
        let deltas = decode_all(&[
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"server_tool_use","id":"srvtoolu_1","name":"web_search","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"query\":"}}"#,
            r#"data: {"type":"content_block_stop","index":1}"#,
            r#"data: {"type":"content_block_start","index":2,"content_block":{"type":"web_search_tool_result","tool_use_id":"srvtoolu_1","content":[{"type":"web_search_result","url":"https://x.example","title":"X"}]}}"#,
        ])
        .unwrap();

        assert_eq!(deltas.len(), 2);
        assert_eq!(
            deltas[0],
            GenerationDelta::ToolUseStart {
                id: "srvtoolu_1".into(),
                name: "web_search".into()
            }
        );
        match &deltas[1] {
            GenerationDelta::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                assert_eq!(tool_use_id, "srvtoolu_1");
                assert_eq!(content[0]["url"], "https://x.example");
            }
            other => panic!("Expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn decode_client_tool_call_assembles_input() {
        let deltas = decode_all(&[
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_7","name":"memory","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\": \"cre"}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"ate\", \"path\": \"/memories/kx.md\"}"}}"#,
            r#"data: {"type":"content_block_stop","index":1}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":30}}"#,
            r#"data: {"type":"message_stop"}"#,
        ])
        .unwrap();

        assert_eq!(
            deltas[0],
            GenerationDelta::ToolUseStart {
                id: "toolu_7".into(),
                name: "memory".into()
            }
        );
        match &deltas[1] {
            GenerationDelta::ToolCall { call } => {
                assert_eq!(call.id, "toolu_7");
                assert_eq!(call.input["command"], "create");
                assert_eq!(call.input["path"], "/memories/kx.md");
            }
            other => panic!("Expected tool call, got {other:?}"),
        }
        assert_eq!(
            deltas.last(),
            Some(&GenerationDelta::Stop {
                reason: Some("tool_use".into())
            })
        );
    }

    #[test]
    fn invalid_tool_input_is_kept_raw() {
        let deltas = decode_all(&[
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_8","name":"memory","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
        ])
        .unwrap();
        match &deltas[1] {
            GenerationDelta::ToolCall { call } => assert_eq!(call.input["raw"], "{\"command\":"),
            other => panic!("Expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn decode_error_event() {
        let err = decode_all(&[
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}"#,
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        ])
        .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));

        let err = decode_all(&[r#"data: {"type":"error","error":{"type":"api_error","message":"boom"}}"#])
            .unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(m) if m.contains("boom")));
    }

    #[test]
    fn character_split_across_chunks_survives() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"café"}}"#;
        let bytes = format!("{line}\r\n").into_bytes();
        // Cut between the two bytes of "é".
        let cut = line.find('é').unwrap() + 1;

        let mut lines = LineBuffer::default();
        lines.extend(&bytes[..cut]);
        assert_eq!(lines.next_line(), None);
        lines.extend(&bytes[cut..]);
        let decoded = lines.next_line().unwrap();
        assert_eq!(decoded, line);
        assert_eq!(lines.next_line(), None);

        let deltas = AnthropicStreamDecoder::default().push_line(&decoded).unwrap();
        assert_eq!(deltas, vec![GenerationDelta::Text { text: "café".into() }]);
    }

    #[test]
    fn line_buffer_skips_invalid_utf8_lines() {
        let mut lines = LineBuffer::default();
        lines.extend(b"data: \xff\xfe\nevent: ping\n");
        assert_eq!(lines.next_line().as_deref(), Some("event: ping"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn decoder_ignores_garbage_and_comments() {
        let mut decoder = AnthropicStreamDecoder::default();
        assert!(decoder.push_line(": keep-alive").unwrap().is_empty());
        assert!(decoder.push_line("data: {not json").unwrap().is_empty());
        assert!(decoder.push_line("event: ping").unwrap().is_empty());
        assert!(!decoder.is_finished());
        decoder.push_line(r#"data: {"type":"message_stop"}"#).unwrap();
        assert!(decoder.is_finished());
    }
}
