use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests other extension surfaces send to a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Refresh,
    UpdateFilters {
        #[serde(default)]
        filters: Value,
    },
    UpdateDebugSettings {
        #[serde(default, rename = "debugSettings")]
        debug_settings: Value,
    },
    GetCheckedItemsCount,
    ClearCheckedItems,
}

impl Request {
    pub fn from_json(raw: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Count { count: usize },
    Ack { success: bool },
}

impl Response {
    pub fn success() -> Self {
        Response::Ack { success: true }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("receiving end does not exist")]
    NotReady,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("storage unavailable: {0:#}")]
    Storage(anyhow::Error),
}

impl MessageError {
    /// Short status line for a UI surface.
    pub fn status(&self) -> &'static str {
        match self {
            MessageError::NotReady => "Feed reader not ready on this page",
            MessageError::Malformed(_) => "Unrecognized message",
            MessageError::Storage(_) => "Error loading count",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_actions() {
        assert_eq!(
            Request::from_json(r#"{"action":"refresh"}"#).unwrap(),
            Request::Refresh
        );
        assert_eq!(
            Request::from_json(r#"{"action":"updateDebugSettings","debugSettings":{"showIds":true}}"#)
                .unwrap(),
            Request::UpdateDebugSettings {
                debug_settings: json!({"showIds": true})
            }
        );
        assert_eq!(
            Request::from_json(r#"{"action":"updateFilters"}"#).unwrap(),
            Request::UpdateFilters {
                filters: Value::Null
            }
        );
        assert!(matches!(
            Request::from_json(r#"{"action":"explode"}"#),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn responses_match_wire_shape() {
        assert_eq!(Response::success().to_json(), r#"{"success":true}"#);
        assert_eq!(Response::Count { count: 3 }.to_json(), r#"{"count":3}"#);
    }
}
