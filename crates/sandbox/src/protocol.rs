/// Message envelope exchanged with the isolated context
/// One JSON object per message, tagged by `type`
use serde::{Deserialize, Serialize};

use crate::{Result, SandboxError};

/// Host -> isolated context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "runCode")]
    RunCode { code: String },
}

/// Isolated context -> host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SandboxMessage {
    #[serde(rename = "log")]
    Log { message: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "clear")]
    Clear,
}

impl HostMessage {
    pub fn run_code(code: impl Into<String>) -> Self {
        Self::RunCode { code: code.into() }
    }

    /// Encode as a single line of JSON
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| SandboxError::SerializationError(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

impl SandboxMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| SandboxError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_code_envelope() {
        let msg = HostMessage::run_code("console.log(1)");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({ "type": "runCode", "code": "console.log(1)" }));

        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_inbound_envelopes() {
        assert_eq!(
            SandboxMessage::parse(r#"{"type":"log","message":"hi"}"#).unwrap(),
            SandboxMessage::Log {
                message: "hi".to_string()
            }
        );
        assert_eq!(
            SandboxMessage::parse(r#"{"type":"error","message":"boom"}"#).unwrap(),
            SandboxMessage::Error {
                message: "boom".to_string()
            }
        );
        assert_eq!(
            SandboxMessage::parse("{\"type\":\"clear\"}\n").unwrap(),
            SandboxMessage::Clear
        );

        let clear = serde_json::to_value(SandboxMessage::Clear).unwrap();
        assert_eq!(clear, json!({ "type": "clear" }));
    }

    #[test]
    fn test_unknown_envelope_rejected() {
        assert!(SandboxMessage::parse(r#"{"type":"warn","message":"x"}"#).is_err());
        assert!(SandboxMessage::parse("not json").is_err());
    }
}
