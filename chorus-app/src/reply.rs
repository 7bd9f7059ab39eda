//! Typed model outputs and the JSON-schema constraints sent with each
//! generation request.

use crate::reactions;
use serde::{Deserialize, Serialize};

/// Which output shape the model is held to for one response generation.
///
/// The message field is mandatory once the room owes a reply, optional under
/// the `sometimes` policy, and absent from the schema otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    NoMessage,
    OptionalMessage,
    MandatoryMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YesNo {
    Yes,
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaReply {
    pub respond: YesNo,
    pub feeling: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PersonaReply {
    /// Enforce what the schema promised. A reply that fails here is treated
    /// exactly like a parse failure. For the no-message shape any stray
    /// message text is stripped rather than sent.
    pub fn validated(mut self, shape: ReplyShape, username: &str) -> Result<Self, String> {
        if self.from != username {
            return Err(format!("reply claims to be from {:?}", self.from));
        }
        if !reactions::is_known(&self.feeling) {
            return Err(format!("unknown feeling {:?}", self.feeling));
        }
        match shape {
            ReplyShape::MandatoryMessage if self.message.is_none() => {
                Err("mandatory message missing".to_string())
            }
            ReplyShape::NoMessage => {
                self.message = None;
                Ok(self)
            }
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReply {
    pub summary: String,
}

pub fn reply_schema(shape: ReplyShape, username: &str) -> serde_json::Value {
    let mut feelings = vec![reactions::NO_FEELING];
    feelings.extend(reactions::names());

    let mut properties = serde_json::json!({
        "respond": { "type": "string", "enum": ["yes", "no"] },
        "feeling": { "type": "string", "enum": feelings },
        "from": { "type": "string", "enum": [username] },
    });
    let mut required = vec!["respond", "feeling", "from"];
    match shape {
        ReplyShape::NoMessage => {}
        ReplyShape::OptionalMessage => {
            properties["message"] = serde_json::json!({ "type": "string" });
        }
        ReplyShape::MandatoryMessage => {
            properties["message"] = serde_json::json!({ "type": "string" });
            required.push("message");
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub fn summary_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": { "summary": { "type": "string" } },
        "required": ["summary"],
    })
}
