use promptl::MessageRole;
use serde::{Deserialize, Serialize};

/// One role-tagged message of the produced conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        image: String,
    },
    File {
        file: String,
        mime_type: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        result: serde_json::Value,
    },
}

impl Message {
    /// A message with a single text content.
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Message {
            role,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Message::text(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::text(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::text(MessageRole::Assistant, text)
    }

    /// Concatenated text contents, separated by newlines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_with_tagged_content() {
        let message = Message {
            role: MessageRole::Assistant,
            content: vec![
                Content::Text { text: "hi".into() },
                Content::ToolCall {
                    id: "c1".into(),
                    name: "lookup".into(),
                    arguments: serde_json::json!({ "q": 1 }),
                },
            ],
        };
        let json = serde_json::to_value(&message).expect("serialise");
        assert_eq!(
            json,
            serde_json::json!({
                "role": "assistant",
                "content": [
                    { "type": "text", "text": "hi" },
                    { "type": "tool-call", "id": "c1", "name": "lookup", "arguments": { "q": 1 } }
                ]
            })
        );
        let back: Message = serde_json::from_value(json).expect("deserialise");
        assert_eq!(back, message);
    }

    #[test]
    fn text_content_skips_other_kinds() {
        let message = Message {
            role: MessageRole::User,
            content: vec![
                Content::Text { text: "a".into() },
                Content::Image { image: "http://x".into() },
                Content::Text { text: "b".into() },
            ],
        };
        assert_eq!(message.text_content(), "a\nb");
    }
}
