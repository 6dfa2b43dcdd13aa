//! Decoder for the agent CLI's `stream-json` output (one JSON object per line).

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::core::types::TokenUsage;
use crate::io::agent::{AgentMessage, ContentBlock, ResultMessage};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: WireAssistant,
        #[serde(default)]
        session_id: Option<String>,
    },
    User {
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Deserialize)]
struct WireAssistant {
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

const KNOWN_TYPES: [&str; 4] = ["system", "assistant", "user", "result"];

/// Decode one stdout line. Blank lines and unknown message types yield `None`.
pub fn parse_line(line: &str) -> Result<Option<AgentMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed).context("parse stream line as json")?;
    let known = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|ty| KNOWN_TYPES.contains(&ty));
    if !known {
        return Ok(None);
    }
    let wire: WireMessage = serde_json::from_value(value).context("decode stream message")?;
    Ok(Some(wire.into()))
}

impl From<WireMessage> for AgentMessage {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::System {
                subtype,
                session_id,
            } => AgentMessage::System {
                subtype,
                session_id,
            },
            WireMessage::Assistant {
                message,
                session_id,
            } => AgentMessage::Assistant {
                content: message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        WireContent::Text { text } => Some(ContentBlock::Text(text)),
                        WireContent::ToolUse { id, name, input } => {
                            Some(ContentBlock::ToolUse { id, name, input })
                        }
                        WireContent::Other => None,
                    })
                    .collect(),
                usage: message.usage,
                session_id,
            },
            WireMessage::User { session_id } => AgentMessage::User { session_id },
            WireMessage::Result {
                subtype,
                is_error,
                result,
                session_id,
                total_cost_usd,
                duration_ms,
                usage,
            } => AgentMessage::Result(ResultMessage {
                subtype,
                is_error,
                result,
                session_id,
                total_cost_usd,
                duration_ms,
                usage,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_init() {
        let msg = parse_line(r#"{"type":"system","subtype":"init","session_id":"s-1","tools":[]}"#)
            .expect("parse")
            .expect("message");
        assert_eq!(msg.session_id(), Some("s-1"));
    }

    #[test]
    fn parses_assistant_text_and_tool_use() {
        let line = r#"{"type":"assistant","session_id":"s-1","message":{"content":[
            {"type":"text","text":"hello"},
            {"type":"thinking","thinking":"hmm"},
            {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"a.rs"}}
        ],"usage":{"input_tokens":10,"output_tokens":2}}}"#
            .replace('\n', "");
        let msg = parse_line(&line).expect("parse").expect("message");
        match msg {
            AgentMessage::Assistant { content, usage, .. } => {
                assert_eq!(content.len(), 2);
                assert_eq!(content[0], ContentBlock::Text("hello".to_string()));
                assert!(matches!(&content[1], ContentBlock::ToolUse { name, .. } if name == "Read"));
                assert_eq!(usage.expect("usage").input_tokens, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_result() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"s-2","total_cost_usd":0.25,"duration_ms":1200,"usage":{"input_tokens":100,"output_tokens":20,"cache_read_input_tokens":5}}"#;
        let msg = parse_line(line).expect("parse").expect("message");
        match msg {
            AgentMessage::Result(result) => {
                assert_eq!(result.result.as_deref(), Some("done"));
                assert_eq!(result.total_cost_usd, 0.25);
                assert_eq!(result.usage.expect("usage").cache_read_input_tokens, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_types_and_blank_lines_are_skipped() {
        assert!(parse_line("").expect("parse").is_none());
        assert!(
            parse_line(r#"{"type":"stream_event","event":{}}"#)
                .expect("parse")
                .is_none()
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_line("not json").is_err());
    }
}
