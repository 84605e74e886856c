use serde::{Deserialize, Serialize};

/// Protocol metadata exchanged alongside terminal bytes.
///
/// Serialized as a JSON object tagged by `type`:
/// `{"type":"session","sessionId":"…","reconnected":false}`,
/// `{"type":"resize","cols":120,"rows":40}`, `{"type":"takeover"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Server → client, first frame after every successful attach.
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// False when the session was created for this connection.
        #[serde(default)]
        reconnected: bool,
    },
    /// Client → server, on open and whenever the viewport changes.
    Resize { cols: u16, rows: u16 },
    /// Server → client, sent to a connection that has just been displaced.
    Takeover {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ControlMessage {
    pub fn takeover() -> Self {
        ControlMessage::Takeover {
            message: Some("Session taken over by another client".to_string()),
        }
    }
}

/// WebSocket close codes used by the server (private-use range 4000-4999).
pub mod close_code {
    /// The session was claimed by another client.
    pub const TAKEOVER: u16 = 4000;
    /// The shell process exited; the session no longer exists.
    pub const SESSION_ENDED: u16 = 4001;
    /// The PTY could not be started.
    pub const SPAWN_FAILED: u16 = 4002;
    /// The server closed the session (idle eviction or shutdown).
    pub const SESSION_CLOSED: u16 = 4003;
    /// Replaced by a newer connection from the same client.
    pub const SUPERSEDED: u16 = 4005;

    /// Codes after which the session id must not be retried.
    pub fn ends_session(code: u16) -> bool {
        matches!(code, SESSION_ENDED | SPAWN_FAILED | SESSION_CLOSED)
    }
}

/// How frames are distinguished on one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Every message is binary with a one-byte discriminator.
    #[default]
    Tagged,
    /// Control as text JSON, data as raw binary; inbound text is sniffed.
    Legacy,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::Tagged => "tagged",
            Framing::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query parameters accepted on the terminal endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Session to reattach to. Unknown or expired ids yield a fresh session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Stable id of the logical client, so its own reconnects are reattaches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<Framing>,
}

impl ConnectParams {
    /// Render as a URL query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        let mut pairs = Vec::new();
        if let Some(id) = &self.session_id {
            pairs.push(format!("sessionId={}", urlencoding::encode(id)));
        }
        if let Some(id) = &self.client_id {
            pairs.push(format!("clientId={}", urlencoding::encode(id)));
        }
        if let Some(framing) = self.framing {
            pairs.push(format!("framing={}", framing));
        }
        pairs.join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_message_shape() {
        let msg = ControlMessage::Session {
            session_id: "abc".to_string(),
            reconnected: false,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "session", "sessionId": "abc", "reconnected": false})
        );
    }

    #[test]
    fn session_without_reconnected_flag_parses() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"session","sessionId":"s-1"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Session {
                session_id: "s-1".to_string(),
                reconnected: false
            }
        );
    }

    #[test]
    fn takeover_message_is_minimal_when_bare() {
        let bare = ControlMessage::Takeover { message: None };
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"type":"takeover"}"#);
        let parsed: ControlMessage = serde_json::from_str(r#"{"type":"takeover"}"#).unwrap();
        assert_eq!(parsed, bare);
    }

    #[test]
    fn resize_requires_both_dimensions() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"resize","cols":80}"#).is_err());
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ControlMessage::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn session_ending_close_codes() {
        assert!(close_code::ends_session(close_code::SESSION_ENDED));
        assert!(close_code::ends_session(close_code::SPAWN_FAILED));
        assert!(close_code::ends_session(close_code::SESSION_CLOSED));
        assert!(!close_code::ends_session(close_code::TAKEOVER));
        assert!(!close_code::ends_session(close_code::SUPERSEDED));
        assert!(!close_code::ends_session(1006));
    }

    #[test]
    fn connect_params_query() {
        let params = ConnectParams {
            session_id: Some("5f0c-11".to_string()),
            client_id: Some("tab 1/ü".to_string()),
            framing: Some(Framing::Tagged),
        };
        assert_eq!(
            params.to_query(),
            "sessionId=5f0c-11&clientId=tab%201%2F%C3%BC&framing=tagged"
        );
        assert_eq!(ConnectParams::default().to_query(), "");
    }
}
