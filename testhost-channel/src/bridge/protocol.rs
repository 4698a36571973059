//! Wire types exchanged between the supervisor and the test host.
//!
//! Every frame carries one [`Message`]: a free-form type tag plus an opaque JSON
//! payload. The channel only ever looks at the tag, and only to spot the two
//! reserved kinds below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Sent by the test host when it is ready for the connection to close.
pub const ACKNOWLEDGE_TYPE: &str = "TestHost.Acknowledge";

/// Carries an [`ErrorMessage`] payload.
pub const ERROR_TYPE: &str = "Error";

/// One message on the wire: `{"MessageType": string, "Payload": <json>}`.
///
/// Field names are emitted in PascalCase. Decoding also accepts camelCase and
/// snake_case spellings so peers written against other serializers interoperate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(
        rename = "MessageType",
        alias = "messageType",
        alias = "message_type"
    )]
    pub message_type: String,

    /// Carried verbatim. Missing on input decodes as `null`.
    #[serde(rename = "Payload", alias = "payload", default)]
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }

    /// Build a message from any serializable payload.
    pub fn with_payload<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(message_type, serde_json::to_value(payload)?))
    }

    /// An `"Error"` message wrapping `text`.
    pub fn error(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::new(ERROR_TYPE, serde_json::json!({ "Message": text }))
    }

    /// The terminal acknowledgement with an empty object payload.
    pub fn acknowledge() -> Self {
        Self::new(ACKNOWLEDGE_TYPE, serde_json::json!({}))
    }

    pub fn is_acknowledge(&self) -> bool {
        self.message_type == ACKNOWLEDGE_TYPE
    }

    pub fn is_error(&self) -> bool {
        self.message_type == ERROR_TYPE
    }

    /// Deserialize the payload into a concrete shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Payload of an `"Error"` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "Message", alias = "message")]
    pub message: String,
}
