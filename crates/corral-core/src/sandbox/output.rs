//! Host/sandbox wire contract

use serde::{Deserialize, Serialize};

/// Sent once over the sandbox's stdin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(alias = "groupFolder")]
    pub group_folder: String,
    #[serde(alias = "chatJid")]
    pub chat_jid: String,
    #[serde(alias = "isMain")]
    pub is_main: bool,
    #[serde(default, alias = "isScheduledTask")]
    pub is_scheduled_task: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

/// Base64 image passed through to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Error,
}

/// Structured result printed by the sandbox between the sentinel lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOutput {
    pub status: OutputStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, alias = "newSessionId")]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ContainerOutput {
    pub fn success(result: Option<String>) -> Self {
        Self {
            status: OutputStatus::Success,
            result,
            new_session_id: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutputStatus::Success
    }
}

/// Last `max_chars` characters of `text`
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// Locate and decode the sandbox result in captured stdout.
///
/// Prefers the JSON between the first start marker and the following end
/// marker; otherwise tries the last non-empty line. Never fails: a decode error
/// becomes an error output carrying the tail of stdout.
pub fn parse_output(stdout: &str, start_marker: &str, end_marker: &str) -> ContainerOutput {
    let between_markers = stdout.find(start_marker).and_then(|start| {
        let body_start = start + start_marker.len();
        stdout[body_start..]
            .find(end_marker)
            .map(|end| stdout[body_start..body_start + end].trim())
    });

    let candidate = match between_markers {
        Some(body) => body,
        None => stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or(""),
    };

    match serde_json::from_str::<ContainerOutput>(candidate) {
        Ok(output) => output,
        Err(e) => ContainerOutput::error(format!(
            "Failed to parse container output: {}. Output tail: {}",
            e,
            tail(stdout, 500)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "---START---";
    const END: &str = "---END---";

    #[test]
    fn test_parse_between_markers() {
        let stdout = "booting\n---START---\n{\"status\":\"success\",\"result\":\"pong\"}\n---END---\n";
        let out = parse_output(stdout, START, END);
        assert_eq!(out, ContainerOutput::success(Some("pong".to_string())));
    }

    #[test]
    fn test_markers_win_over_trailing_noise() {
        let stdout = "---START---\n{\"status\":\"success\",\"result\":\"a\",\"new_session_id\":\"s1\"}\n---END---\n{\"status\":\"error\"}\n";
        let out = parse_output(stdout, START, END);
        assert!(out.is_success());
        assert_eq!(out.new_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_camel_case_session_id_is_accepted() {
        let stdout = "---START---\n{\"status\":\"success\",\"result\":\"ok\",\"newSessionId\":\"sess-9\"}\n---END---\n";
        let out = parse_output(stdout, START, END);
        assert!(out.is_success());
        assert_eq!(out.new_session_id.as_deref(), Some("sess-9"));
    }

    #[test]
    fn test_fallback_to_last_line() {
        let stdout = "log line\n{\"status\":\"error\",\"result\":null,\"error\":\"boom\"}\n\n";
        let out = parse_output(stdout, START, END);
        assert_eq!(out.status, OutputStatus::Error);
        assert_eq!(out.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_garbage_becomes_error_with_tail() {
        let out = parse_output("no json here", START, END);
        assert_eq!(out.status, OutputStatus::Error);
        let err = out.error.unwrap();
        assert!(err.starts_with("Failed to parse container output"));
        assert!(err.contains("no json here"));

        let out = parse_output("", START, END);
        assert_eq!(out.status, OutputStatus::Error);
    }

    #[test]
    fn test_input_serialization() {
        let input = ContainerInput {
            prompt: "ping".to_string(),
            session_id: None,
            group_folder: "main".to_string(),
            chat_jid: "!r:x".to_string(),
            is_main: true,
            is_scheduled_task: false,
            images: vec![ImageAttachment {
                data: "aGk=".to_string(),
                mime_type: "image/png".to_string(),
            }],
        };
        let json: serde_json::Value = serde_json::to_value(&input).unwrap();
        assert_eq!(json["group_folder"], "main");
        assert_eq!(json["images"][0]["mimeType"], "image/png");
        assert!(json.get("session_id").is_none());

        let camel: ContainerInput = serde_json::from_str(
            r#"{"prompt":"p","sessionId":"s","groupFolder":"g","chatJid":"c","isMain":false}"#,
        )
        .unwrap();
        assert_eq!(camel.session_id.as_deref(), Some("s"));
        assert!(!camel.is_scheduled_task);
    }

    #[test]
    fn test_tail_is_char_safe() {
        assert_eq!(tail("héllo", 3), "llo");
        assert_eq!(tail("ab", 10), "ab");
        assert_eq!(tail("日本語", 2), "本語");
    }
}
