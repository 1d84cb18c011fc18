//! Plugin-side SDK: handshake, serve loop, hook table and host API client.
//!
//! ```no_run
//! use plughost_plugin::{serve, HookTable};
//! use plughost_core::hooks::Hook;
//! use serde_json::Value;
//!
//! let table = HookTable::new().on(Hook::OnActivate, |_api, _args| Ok(Value::Null));
//! serve(table).ok();
//! ```

use plughost_core::api::method;
use plughost_core::handshake::{HandshakeLine, TransportKind};
use plughost_core::hooks::Hook;
use plughost_core::protocol::{
    parse_protocol_versions, ENV_PLUGIN_ID, ENV_PROTOCOL_VERSIONS, ENV_TRANSPORT,
    MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, METHOD_IMPLEMENTED, METHOD_PING,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use plughost_core::rpc::{InboundHandler, RpcClient, RpcError, RpcSession};
use plughost_core::transport::{Connection, Listener};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("this binary is a plugin and must be launched by the plugin host")]
    NotLaunchedByHost,
    #[error("no protocol version in common with the host (host offers {0:?})")]
    NoCommonProtocol(Vec<u32>),
    #[error("transport setup failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("host connection lost: {0}")]
    Transport(String),
    #[error("host refused the call: {0}")]
    Host(String),
    #[error("unexpected reply from host: {0}")]
    Decode(String),
}

impl From<RpcError> for ApiError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(reason) => Self::Transport(reason),
            RpcError::Application(message) => Self::Host(message),
            RpcError::Timeout(timeout) => Self::Transport(format!("no reply within {timeout:?}")),
        }
    }
}

/// Typed client for the host API, handed to every hook handler.
#[derive(Clone)]
pub struct PluginApi {
    client: RpcClient,
}

impl PluginApi {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ApiError> {
        self.client.call(name, args).map_err(ApiError::from)
    }

    /// Current configuration snapshot as the host filtered it for this plugin.
    pub fn load_configuration(&self) -> Result<Map<String, Value>, ApiError> {
        match self.call(method::LOAD_CONFIGURATION, Vec::new())? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(ApiError::Decode(format!("configuration is not an object: {other}"))),
        }
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Value, ApiError> {
        self.call(method::GET_USER_BY_USERNAME, vec![json!(username)])
    }

    pub fn get_channel_by_name(&self, team: &str, name: &str) -> Result<Value, ApiError> {
        self.call(method::GET_CHANNEL_BY_NAME, vec![json!(team), json!(name)])
    }

    pub fn send_notification(&self, channel_id: &str, message: &str) -> Result<Value, ApiError> {
        self.call(method::SEND_NOTIFICATION, vec![json!(channel_id), json!(message)])
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<Value>, ApiError> {
        let value = self.call(method::KV_GET, vec![json!(key)])?;
        Ok((!value.is_null()).then_some(value))
    }

    pub fn kv_set(&self, key: &str, value: Value) -> Result<(), ApiError> {
        self.call(method::KV_SET, vec![json!(key), value]).map(|_| ())
    }

    pub fn log(&self, level: &str, message: &str) -> Result<(), ApiError> {
        self.call(method::LOG, vec![json!(level), json!(message)])
            .map(|_| ())
    }
}

pub type HookHandler =
    Box<dyn Fn(&PluginApi, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static>;

/// The hooks a plugin implements. Only registered hooks are advertised to
/// the host.
#[derive(Default)]
pub struct HookTable {
    handlers: BTreeMap<Hook, HookHandler>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, hook: Hook, handler: F) -> Self
    where
        F: Fn(&PluginApi, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.insert(hook, handler);
        self
    }

    pub fn insert<F>(&mut self, hook: Hook, handler: F)
    where
        F: Fn(&PluginApi, Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(hook, Box::new(handler));
    }

    /// Drops every hook `keep` returns false for.
    pub fn retain(mut self, keep: impl Fn(Hook) -> bool) -> Self {
        self.handlers.retain(|hook, _| keep(*hook));
        self
    }

    pub fn implemented(&self) -> Vec<&'static str> {
        self.handlers.keys().map(|hook| hook.as_tag()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn dispatch(&self, api: &PluginApi, method: &str, args: Vec<Value>) -> Result<Value, String> {
        match method {
            METHOD_IMPLEMENTED => Ok(json!(self.implemented())),
            METHOD_PING => Ok(json!("pong")),
            _ => {
                let hook =
                    Hook::from_tag(method).ok_or_else(|| format!("unknown method: {method}"))?;
                let handler = self
                    .handlers
                    .get(&hook)
                    .ok_or_else(|| format!("hook not implemented: {method}"))?;
                handler(api, args)
            }
        }
    }
}

impl InboundHandler for HookTable {
    fn handle(&self, peer: &RpcClient, method: &str, args: Vec<Value>) -> Result<Value, String> {
        let api = PluginApi::new(peer.clone());
        self.dispatch(&api, method, args)
    }
}

/// Overrides for what the host asked for; `None` follows the host.
#[derive(Clone, Debug, Default)]
pub struct ServeOptions {
    pub protocol_version: Option<u32>,
    pub transport: Option<TransportKind>,
}

/// Performs the handshake and serves `table` until the host disconnects.
pub fn serve(table: HookTable) -> Result<(), ServeError> {
    serve_with(table, ServeOptions::default())
}

pub fn serve_with(table: HookTable, options: ServeOptions) -> Result<(), ServeError> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(ServeError::NotLaunchedByHost);
    }

    let offered = std::env::var(ENV_PROTOCOL_VERSIONS)
        .map(|raw| parse_protocol_versions(&raw))
        .unwrap_or_default();
    let protocol_version = match options.protocol_version {
        Some(version) => version,
        None => select_protocol(&offered).ok_or(ServeError::NoCommonProtocol(offered))?,
    };
    let transport = options.transport.unwrap_or_else(|| {
        std::env::var(ENV_TRANSPORT)
            .ok()
            .and_then(|raw| TransportKind::from_tag(&raw))
            .unwrap_or(TransportKind::Tcp)
    });
    let plugin_id = std::env::var(ENV_PLUGIN_ID).unwrap_or_else(|_| "plugin".to_string());

    let connection = match transport {
        TransportKind::Stdio => {
            announce(&HandshakeLine {
                protocol_version,
                transport,
                endpoint: "-".to_string(),
            })?;
            Connection::new(io::stdin(), io::stdout())
        }
        kind => {
            let listener = Listener::bind(kind)?;
            announce(&HandshakeLine {
                protocol_version,
                transport: kind,
                endpoint: listener.endpoint()?,
            })?;
            listener.accept()?
        }
    };

    tracing::debug!(plugin_id, protocol_version, transport = transport.as_tag(), "serving host");
    RpcSession::start(&plugin_id, connection, Arc::new(table)).join();
    Ok(())
}

/// Highest version both sides speak. The host lists its versions highest
/// first.
pub fn select_protocol(offered: &[u32]) -> Option<u32> {
    offered
        .iter()
        .copied()
        .filter(|version| SUPPORTED_PROTOCOL_VERSIONS.contains(version))
        .max()
}

fn announce(line: &HandshakeLine) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", line.format())?;
    stdout.flush()
}
