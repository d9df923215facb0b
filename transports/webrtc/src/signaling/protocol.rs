//! Relay signaling messages
//!
//! The host keeps one WebSocket to the relay and multiplexes every joiner
//! over it. Each message is a JSON object tagged by `type`; joiner-scoped
//! messages carry the relay-assigned `joinerID`, which the host adopts as
//! the peer ID.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::SessionDescription;
use crate::{Error, Result};

/// One message on the relay socket, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Host announces itself once connected
    HostHello {
        #[serde(rename = "hostID", skip_serializing_if = "Option::is_none")]
        host_id: Option<String>,
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
    },

    /// A joiner asks to be admitted
    JoinerHello {
        #[serde(rename = "joinerID")]
        joiner_id: String,
    },

    /// SDP offer from an admitted joiner
    JoinerOffer {
        #[serde(rename = "joinerID")]
        joiner_id: String,
        offer: SessionDescription,
    },

    /// Remote ICE candidate as `RTCIceCandidateInit` JSON
    JoinerIceCandidate {
        #[serde(rename = "joinerID")]
        joiner_id: String,
        candidate: Value,
    },

    /// The relay lost the joiner's socket
    JoinerGone {
        #[serde(rename = "joinerID")]
        joiner_id: String,
    },

    HostAnswer {
        #[serde(rename = "joinerID")]
        joiner_id: String,
        answer: SessionDescription,
    },

    HostIceCandidate {
        #[serde(rename = "joinerID")]
        joiner_id: String,
        candidate: Value,
    },

    /// Admission refused, the session is at capacity
    HubFull {
        #[serde(rename = "joinerID")]
        joiner_id: String,
    },

    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Joiner this message concerns, if any
    pub fn joiner_id(&self) -> Option<&str> {
        match self {
            RelayMessage::JoinerHello { joiner_id }
            | RelayMessage::JoinerOffer { joiner_id, .. }
            | RelayMessage::JoinerIceCandidate { joiner_id, .. }
            | RelayMessage::JoinerGone { joiner_id }
            | RelayMessage::HostAnswer { joiner_id, .. }
            | RelayMessage::HostIceCandidate { joiner_id, .. }
            | RelayMessage::HubFull { joiner_id } => Some(joiner_id),
            RelayMessage::HostHello { .. } | RelayMessage::Unknown => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        if matches!(self, RelayMessage::Unknown) {
            return Err(Error::SerializationError(
                "Cannot serialize an unknown relay message".to_string(),
            ));
        }
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_parses() {
        let text = r#"{"type":"joiner-offer","joinerID":"j-1","offer":{"type":"offer","sdp":"v=0"}}"#;
        let message = RelayMessage::from_json(text).unwrap();
        assert_eq!(
            message,
            RelayMessage::JoinerOffer {
                joiner_id: "j-1".to_string(),
                offer: SessionDescription::offer("v=0"),
            }
        );
        assert_eq!(message.joiner_id(), Some("j-1"));
    }

    #[test]
    fn test_answer_wire_shape() {
        let message = RelayMessage::HostAnswer {
            joiner_id: "j-2".to_string(),
            answer: SessionDescription::answer("v=0"),
        };
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "host-answer",
                "joinerID": "j-2",
                "answer": { "type": "answer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn test_host_hello_omits_missing_id() {
        let message = RelayMessage::HostHello {
            host_id: None,
            protocol_version: "0.0.1".to_string(),
        };
        assert_eq!(
            message.to_json().unwrap(),
            r#"{"type":"host-hello","protocolVersion":"0.0.1"}"#
        );
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let message = RelayMessage::from_json(r#"{"type":"stats-report","x":1}"#).unwrap();
        assert_eq!(message, RelayMessage::Unknown);
        assert!(message.joiner_id().is_none());
        assert!(message.to_json().is_err());
    }

    #[test]
    fn test_missing_joiner_id_is_rejected() {
        assert!(RelayMessage::from_json(r#"{"type":"joiner-hello"}"#).is_err());
    }
}
