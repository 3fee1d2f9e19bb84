//! # Wire Protocol Messages
//!
//! Every message on the wire is a JSON object. Requests carry a `COMMAND`
//! discriminator plus the sender and intended recipient ids; responses
//! carry `SUCCESS` and, on failure, an `ERRORS` string. Payload fields sit
//! beside the envelope at the top level, matching the protocol's original
//! field layout.
//!
//! | COMMAND | Request payload | Response payload |
//! |---------|-----------------|------------------|
//! | `JOIN` | `NEW_PEER` | `PREDECESSOR` |
//! | `LEAVE` | `NEW_PRED` + `NEW_MIN`, or `NEW_SUCC` | — |
//! | `NOTIFY` | `RECIP_ID`, `NEW_PEER` | — |
//! | `GET_SUCC` | `KEY` | peer descriptor fields |
//! | `GET_PRED` | `KEY` | peer descriptor fields |
//! | `CREATE_FRAG` | `KEY`, `FRAGMENT` | — |
//! | `READ_FRAG` | `KEY` | `FRAGMENT` |
//! | `SYNCHRONIZE` | `KEYS` | — |
//! | `MAINTENANCE` | — | — |
//!
//! Keys are hex strings, peer descriptors are
//! `{ID, MIN_KEY, MAX_KEY, IP_ADDR, PORT}`, fragments are their
//! `"index:v1 v2 …"` serialization.

use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::routing::PeerInfo;

/// Command discriminator and payload, tagged by the `COMMAND` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "COMMAND")]
pub enum Command {
    #[serde(rename = "JOIN")]
    Join {
        #[serde(rename = "NEW_PEER")]
        new_peer: PeerInfo,
    },
    /// A leaving peer tells its successor who its new predecessor is, and
    /// its predecessor which descriptor now succeeds it.
    #[serde(rename = "LEAVE")]
    Leave {
        #[serde(rename = "NEW_PRED", skip_serializing_if = "Option::is_none", default)]
        new_pred: Option<PeerInfo>,
        #[serde(rename = "NEW_MIN", skip_serializing_if = "Option::is_none", default)]
        new_min: Option<Key>,
        #[serde(rename = "NEW_SUCC", skip_serializing_if = "Option::is_none", default)]
        new_succ: Option<PeerInfo>,
    },
    #[serde(rename = "NOTIFY")]
    Notify {
        #[serde(rename = "RECIP_ID")]
        recipient: Key,
        #[serde(rename = "NEW_PEER")]
        new_peer: PeerInfo,
    },
    #[serde(rename = "GET_SUCC")]
    GetSuccessor {
        #[serde(rename = "KEY")]
        key: Key,
    },
    #[serde(rename = "GET_PRED")]
    GetPredecessor {
        #[serde(rename = "KEY")]
        key: Key,
    },
    #[serde(rename = "CREATE_FRAG")]
    CreateFragment {
        #[serde(rename = "KEY")]
        key: Key,
        #[serde(rename = "FRAGMENT")]
        fragment: String,
    },
    #[serde(rename = "READ_FRAG")]
    ReadFragment {
        #[serde(rename = "KEY")]
        key: Key,
    },
    #[serde(rename = "SYNCHRONIZE")]
    Synchronize {
        #[serde(rename = "KEYS")]
        keys: Vec<Key>,
    },
    #[serde(rename = "MAINTENANCE")]
    Maintenance,
}

impl Command {
    /// The wire name, used for handler dispatch and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "JOIN",
            Command::Leave { .. } => "LEAVE",
            Command::Notify { .. } => "NOTIFY",
            Command::GetSuccessor { .. } => "GET_SUCC",
            Command::GetPredecessor { .. } => "GET_PRED",
            Command::CreateFragment { .. } => "CREATE_FRAG",
            Command::ReadFragment { .. } => "READ_FRAG",
            Command::Synchronize { .. } => "SYNCHRONIZE",
            Command::Maintenance => "MAINTENANCE",
        }
    }
}

/// A request envelope. `JOIN` is sent before the joiner has learned any
/// ids, so the envelope fields are optional; handlers that validate their
/// caller require them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "SENDER_ID", skip_serializing_if = "Option::is_none", default)]
    pub sender_id: Option<Key>,
    #[serde(rename = "RECIPIENT_ID", skip_serializing_if = "Option::is_none", default)]
    pub recipient_id: Option<Key>,
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    /// A bare request with the envelope ids unset.
    pub fn new(command: Command) -> Self {
        Request { sender_id: None, recipient_id: None, command }
    }
}

/// A response envelope. Payload fields are optional and sit at the top
/// level: `GET_SUCC`/`GET_PRED` inline the peer descriptor fields, `JOIN`
/// nests its descriptor under `PREDECESSOR`, `READ_FRAG` carries
/// `FRAGMENT`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    #[serde(rename = "SUCCESS")]
    pub success: bool,
    #[serde(rename = "ERRORS", skip_serializing_if = "Option::is_none", default)]
    pub errors: Option<String>,
    // Inlined peer descriptor, present on GET_SUCC/GET_PRED replies.
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<Key>,
    #[serde(rename = "MIN_KEY", skip_serializing_if = "Option::is_none", default)]
    pub min_key: Option<Key>,
    #[serde(rename = "MAX_KEY", skip_serializing_if = "Option::is_none", default)]
    pub max_key: Option<Key>,
    #[serde(rename = "IP_ADDR", skip_serializing_if = "Option::is_none", default)]
    pub addr: Option<String>,
    #[serde(rename = "PORT", skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
    #[serde(rename = "PREDECESSOR", skip_serializing_if = "Option::is_none", default)]
    pub predecessor: Option<PeerInfo>,
    #[serde(rename = "FRAGMENT", skip_serializing_if = "Option::is_none", default)]
    pub fragment: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Response { success: true, ..Default::default() }
    }

    pub fn fail(errors: impl Into<String>) -> Self {
        Response { success: false, errors: Some(errors.into()), ..Default::default() }
    }

    /// Success with the descriptor fields inlined at the top level.
    pub fn with_peer(peer: PeerInfo) -> Self {
        Response {
            success: true,
            id: Some(peer.id),
            min_key: Some(peer.min_key),
            max_key: Some(peer.max_key),
            addr: Some(peer.addr),
            port: Some(peer.port),
            ..Default::default()
        }
    }

    /// Success carrying a nested `PREDECESSOR` descriptor.
    pub fn with_predecessor(predecessor: PeerInfo) -> Self {
        Response { success: true, predecessor: Some(predecessor), ..Default::default() }
    }

    /// Success carrying a serialized fragment.
    pub fn with_fragment(fragment: impl Into<String>) -> Self {
        Response { success: true, fragment: Some(fragment.into()), ..Default::default() }
    }

    /// Reassemble the inlined descriptor, if all of its fields arrived.
    pub fn peer(&self) -> Option<PeerInfo> {
        Some(PeerInfo {
            id: self.id?,
            min_key: self.min_key?,
            max_key: self.max_key?,
            addr: self.addr.clone()?,
            port: self.port?,
            latency: 0,
        })
    }
}

pub fn encode_request(request: &Request) -> serde_json::Result<String> {
    serde_json::to_string(request)
}

pub fn decode_request(text: &str) -> serde_json::Result<Request> {
    serde_json::from_str(text)
}

pub fn encode_response(response: &Response) -> serde_json::Result<String> {
    serde_json::to_string(response)
}

pub fn decode_response(text: &str) -> serde_json::Result<Response> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> PeerInfo {
        PeerInfo::new("127.0.0.1", 5055)
    }

    #[test]
    fn request_envelope_round_trip() {
        let mut request = Request::new(Command::GetSuccessor { key: Key::hash("k") });
        request.sender_id = Some(Key::hash("sender"));
        request.recipient_id = Some(Key::hash("recipient"));

        let text = encode_request(&request).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["COMMAND"], "GET_SUCC");
        assert_eq!(value["KEY"], Key::hash("k").to_hex());
        assert_eq!(value["SENDER_ID"], Key::hash("sender").to_hex());

        let back = decode_request(&text).unwrap();
        assert_eq!(back.sender_id, request.sender_id);
        assert_eq!(back.command.name(), "GET_SUCC");
    }

    #[test]
    fn join_omits_envelope_ids() {
        let request = Request::new(Command::Join { new_peer: sample_peer() });
        let text = encode_request(&request).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("SENDER_ID").is_none());
        assert_eq!(value["NEW_PEER"]["IP_ADDR"], "127.0.0.1");

        let back = decode_request(&text).unwrap();
        assert_eq!(back.sender_id, None);
        match back.command {
            Command::Join { new_peer } => assert_eq!(new_peer, sample_peer()),
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn every_command_round_trips() {
        let peer = sample_peer();
        let commands = vec![
            Command::Join { new_peer: peer.clone() },
            Command::Leave {
                new_pred: Some(peer.clone()),
                new_min: Some(Key::hash("min")),
                new_succ: None,
            },
            Command::Leave { new_pred: None, new_min: None, new_succ: Some(peer.clone()) },
            Command::Notify { recipient: Key::hash("r"), new_peer: peer.clone() },
            Command::GetSuccessor { key: Key::hash("k") },
            Command::GetPredecessor { key: Key::hash("k") },
            Command::CreateFragment { key: Key::hash("k"), fragment: "3:1 2 3 4".into() },
            Command::ReadFragment { key: Key::hash("k") },
            Command::Synchronize { keys: vec![Key::hash("a"), Key::hash("b")] },
            Command::Maintenance,
        ];

        for command in commands {
            let name = command.name();
            let text = encode_request(&Request::new(command)).unwrap();
            let back = decode_request(&text).unwrap();
            assert_eq!(back.command.name(), name);
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(decode_request(r#"{"COMMAND":"UPDATE_FRAG","KEY":"ff"}"#).is_err());
        assert!(decode_request(r#"{"KEY":"ff"}"#).is_err());
        assert!(decode_request("not json at all").is_err());
    }

    #[test]
    fn missing_fields_are_rejected() {
        // GET_SUCC without its KEY.
        assert!(decode_request(r#"{"COMMAND":"GET_SUCC"}"#).is_err());
        // NOTIFY with a malformed descriptor.
        assert!(decode_request(r#"{"COMMAND":"NOTIFY","RECIP_ID":"1","NEW_PEER":{"ID":"zz"}}"#)
            .is_err());
    }

    #[test]
    fn response_with_inline_peer_fields() {
        let response = Response::with_peer(sample_peer());
        let text = encode_response(&response).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["SUCCESS"], true);
        assert_eq!(value["IP_ADDR"], "127.0.0.1");
        assert_eq!(value["ID"], sample_peer().id.to_hex());

        let back = decode_response(&text).unwrap();
        assert!(back.success);
        assert_eq!(back.peer(), Some(sample_peer()));
    }

    #[test]
    fn response_with_nested_predecessor() {
        let response = Response::with_predecessor(sample_peer());
        let text = encode_response(&response).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["PREDECESSOR"]["PORT"], 5055);

        let back = decode_response(&text).unwrap();
        assert_eq!(back.predecessor, Some(sample_peer()));
    }

    #[test]
    fn failure_response_carries_errors() {
        let response = Response::fail("key does not exist in store");
        let text = encode_response(&response).unwrap();
        let back = decode_response(&text).unwrap();
        assert!(!back.success);
        assert_eq!(back.errors.as_deref(), Some("key does not exist in store"));
        assert_eq!(back.peer(), None);
        assert_eq!(back.fragment, None);
    }

    #[test]
    fn fragment_response_round_trip() {
        let response = Response::with_fragment("7:10 20 30 40");
        let text = encode_response(&response).unwrap();
        let back = decode_response(&text).unwrap();
        assert_eq!(back.fragment.as_deref(), Some("7:10 20 30 40"));
    }
}
