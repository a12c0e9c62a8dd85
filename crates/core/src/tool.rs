//! Client tools — tool calls the model makes that this process executes.
//!
//! Server tools (web search) run on the provider's side and only surface as
//! deltas. A client tool call ends the model's turn with `stop_reason =
//! "tool_use"`; the engine executes the calls, then continues generation with
//! a [`ToolRound`] carrying the calls and their outputs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A completed client tool call, input fully assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back in the matching [`ToolOutput`]
    pub id: String,
    pub name: String,
    /// Parsed input; `{"raw": "<text>"}` when the streamed JSON was invalid
    pub input: serde_json::Value,
}

/// The text result of executing one [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_use_id: String,
    pub content: String,
}

/// One finished model turn that ended in tool calls, plus their outputs.
///
/// Rounds are replayed after the conversation messages, in order, when
/// generation continues.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRound {
    /// Answer text the model produced before calling the tools
    #[serde(default)]
    pub text: String,
    pub calls: Vec<ToolCall>,
    pub outputs: Vec<ToolOutput>,
}

/// A tool executed locally on the model's behalf.
///
/// Failures are reported to the model as text, never as errors: the model
/// reads the output and decides what to do next.
#[async_trait]
pub trait ClientTool: Send + Sync {
    /// The tool name the model calls (e.g., "memory").
    fn name(&self) -> &str;

    /// Execute one call for `owner`.
    async fn execute(&self, owner: &str, input: &serde_json::Value) -> String;
}
