//! Event model for the Claude CLI `stream-json` output format.
//!
//! The CLI backend reads one JSON event per line. `StreamAccumulator`
//! folds those lines into the final result text plus the cost and token
//! usage reported by the terminal `result` event.

use serde::Deserialize;
use serde_json::Value;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<Usage>,
    },

    /// `system`, `user` and any event type this crate does not consume.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Token usage reported on the terminal result event.
#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// Folded outcome of one CLI session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub text: String,
    pub is_error: bool,
    pub saw_result: bool,
    pub subtype: String,
    pub cost_usd: f64,
    pub tokens: u64,
    pub tool_uses: Vec<String>,
}

/// Accumulates stream-json lines into a `StreamOutcome`.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    accumulated_text: String,
    outcome: StreamOutcome,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.accumulated_text.push_str(&text);
                            self.accumulated_text.push('\n');
                        }
                        ContentBlock::ToolUse { name, .. } => {
                            self.outcome.tool_uses.push(name);
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result {
                subtype,
                result,
                is_error,
                total_cost_usd,
                usage,
            }) => {
                self.outcome.saw_result = true;
                self.outcome.subtype = subtype;
                self.outcome.is_error = is_error;
                self.outcome.cost_usd = total_cost_usd.unwrap_or(0.0);
                self.outcome.tokens = usage.map(|u| u.total()).unwrap_or(0);
                if let Some(result) = result {
                    self.outcome.text = result;
                }
            }
            Ok(StreamEvent::Other) => {}
            Err(_) => {
                // Not a stream event, keep it as plain output
                self.accumulated_text.push_str(line);
                self.accumulated_text.push('\n');
            }
        }
    }

    /// Finish accumulation. Falls back to the streamed text when the
    /// result event carried no result body.
    pub fn finish(mut self) -> StreamOutcome {
        if self.outcome.text.is_empty() {
            self.outcome.text = self.accumulated_text.trim_end().to_string();
        }
        self.outcome
    }
}
