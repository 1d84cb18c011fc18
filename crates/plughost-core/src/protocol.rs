use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 2;
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[PROTOCOL_VERSION, 1];

pub const MAGIC_COOKIE_KEY: &str = "PLUGHOST_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "7c1b3e0f9a4d4f02b8f6c0de5a1e2b77";
pub const ENV_PROTOCOL_VERSIONS: &str = "PLUGHOST_PROTOCOL_VERSIONS";
pub const ENV_TRANSPORT: &str = "PLUGHOST_TRANSPORT";
pub const ENV_PLUGIN_ID: &str = "PLUGHOST_PLUGIN_ID";

/// Reserved method: the plugin answers with the names of the hooks it implements.
pub const METHOD_IMPLEMENTED: &str = "plughost.implemented";
/// Reserved method: liveness check, answered with `"pong"`.
pub const METHOD_PING: &str = "plughost.ping";

/// One JSON line on an RPC session. Ids are chosen by the side that makes the
/// call; a `Reply` always answers the peer's `Call`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Notify {
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Reply {
        id: u64,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|err| format!("serialize frame failed: {err}"))
    }

    pub fn decode(line: &str) -> Result<Self, String> {
        serde_json::from_str(line).map_err(|err| format!("invalid frame: {err}"))
    }
}

pub fn format_protocol_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_protocol_versions(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|item| item.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_frame_wire_shape() {
        let frame = Frame::Call {
            id: 7,
            method: "message_has_been_posted".to_string(),
            args: vec![json!({"message": "hi"})],
        };
        let line = frame.encode().expect("encode");
        assert_eq!(
            serde_json::from_str::<Value>(&line).unwrap(),
            json!({"kind": "call", "id": 7, "method": "message_has_been_posted", "args": [{"message": "hi"}]})
        );
    }

    #[test]
    fn current_version_is_preferred() {
        assert_eq!(SUPPORTED_PROTOCOL_VERSIONS.first(), Some(&PROTOCOL_VERSION));
    }

    #[test]
    fn reply_defaults_missing_fields() {
        let parsed = Frame::decode(r#"{"kind":"reply","id":3}"#).expect("decode");
        assert_eq!(
            parsed,
            Frame::Reply {
                id: 3,
                value: Value::Null,
                error: None
            }
        );
    }

    #[test]
    fn notify_without_args_is_accepted() {
        let parsed = Frame::decode(r#"{"kind":"notify","method":"x"}"#).expect("decode");
        assert!(matches!(parsed, Frame::Notify { ref args, .. } if args.is_empty()));
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert!(Frame::decode(r#"{"kind":"shout"}"#).is_err());
    }

    #[test]
    fn protocol_versions_env_format() {
        assert_eq!(format_protocol_versions(&[2, 1]), "2,1");
        assert_eq!(parse_protocol_versions(" 2, 1,x,0"), vec![2, 1]);
        assert!(parse_protocol_versions("").is_empty());
    }
}
