//! Host API exposed to plugin processes.
//!
//! The embedding application implements [`HostApi`]; each activated plugin
//! reaches it only through a [`CapabilityGate`] that knows which capabilities
//! that plugin was granted.

use crate::rpc::{InboundHandler, RpcClient};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    LoadConfiguration,
    LookupUser,
    LookupChannel,
    SendNotification,
    KvStore,
    Log,
}

impl Capability {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::LoadConfiguration => "load_configuration",
            Self::LookupUser => "lookup_user",
            Self::LookupChannel => "lookup_channel",
            Self::SendNotification => "send_notification",
            Self::KvStore => "kv_store",
            Self::Log => "log",
        }
    }

    pub fn from_tag(input: &str) -> Option<Self> {
        match input.trim() {
            "load_configuration" => Some(Self::LoadConfiguration),
            "lookup_user" => Some(Self::LookupUser),
            "lookup_channel" => Some(Self::LookupChannel),
            "send_notification" => Some(Self::SendNotification),
            "kv_store" => Some(Self::KvStore),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    /// Granted to every plugin regardless of host policy.
    pub const fn is_baseline(self) -> bool {
        matches!(self, Self::LoadConfiguration | Self::Log)
    }
}

pub mod method {
    pub const LOAD_CONFIGURATION: &str = "load_configuration";
    pub const GET_USER_BY_USERNAME: &str = "get_user_by_username";
    pub const GET_CHANNEL_BY_NAME: &str = "get_channel_by_name";
    pub const SEND_NOTIFICATION: &str = "send_notification";
    pub const KV_GET: &str = "kv_get";
    pub const KV_SET: &str = "kv_set";
    pub const LOG: &str = "log";
}

/// Capability needed to call a host API method, or `None` for unknown methods.
pub fn capability_for_method(name: &str) -> Option<Capability> {
    match name {
        method::LOAD_CONFIGURATION => Some(Capability::LoadConfiguration),
        method::GET_USER_BY_USERNAME => Some(Capability::LookupUser),
        method::GET_CHANNEL_BY_NAME => Some(Capability::LookupChannel),
        method::SEND_NOTIFICATION => Some(Capability::SendNotification),
        method::KV_GET | method::KV_SET => Some(Capability::KvStore),
        method::LOG => Some(Capability::Log),
        _ => None,
    }
}

/// Computes the capability set for one activation: what the manifest asks for,
/// limited to what the host allows, plus the baseline set.
pub fn grant_capabilities(requested: &[Capability], allowed: &[Capability]) -> BTreeSet<Capability> {
    let mut granted = requested
        .iter()
        .copied()
        .filter(|cap| cap.is_baseline() || allowed.contains(cap))
        .collect::<BTreeSet<_>>();
    granted.insert(Capability::LoadConfiguration);
    granted.insert(Capability::Log);
    granted
}

/// Services the host offers to plugins. Every call carries the identifiers it
/// acts on; nothing is implied by the calling plugin except where a
/// `plugin_id` parameter scopes storage.
pub trait HostApi: Send + Sync + 'static {
    fn get_user_by_username(&self, username: &str) -> Result<Value, String>;
    fn get_channel_by_name(&self, team: &str, name: &str) -> Result<Value, String>;
    fn send_notification(&self, channel_id: &str, message: &str) -> Result<Value, String>;
    fn kv_get(&self, plugin_id: &str, key: &str) -> Result<Option<Value>, String>;
    fn kv_set(&self, plugin_id: &str, key: &str, value: Value) -> Result<(), String>;
}

/// Current configuration snapshot of one plugin, swapped atomically.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: Mutex<Arc<Map<String, Value>>>,
}

impl SnapshotCell {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Arc<Map<String, Value>> {
        Arc::clone(&self.current.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Installs `next` and returns the previous snapshot.
    pub fn replace(&self, next: Map<String, Value>) -> Arc<Map<String, Value>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, Arc::new(next))
    }
}

/// Routes one plugin's inbound calls to the host API, refusing anything
/// outside its granted capabilities.
pub struct CapabilityGate {
    plugin_id: String,
    granted: BTreeSet<Capability>,
    api: Arc<dyn HostApi>,
    config: Arc<SnapshotCell>,
}

impl CapabilityGate {
    pub fn new(
        plugin_id: impl Into<String>,
        granted: BTreeSet<Capability>,
        api: Arc<dyn HostApi>,
        config: Arc<SnapshotCell>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            granted,
            api,
            config,
        }
    }

    pub fn granted(&self) -> &BTreeSet<Capability> {
        &self.granted
    }

    fn dispatch(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        let capability =
            capability_for_method(name).ok_or_else(|| format!("unknown host api method: {name}"))?;
        if !self.granted.contains(&capability) {
            return Err(format!(
                "capability not granted: {} (method {name})",
                capability.as_tag()
            ));
        }

        match name {
            method::LOAD_CONFIGURATION => Ok(Value::Object((*self.config.load()).clone())),
            method::GET_USER_BY_USERNAME => self.api.get_user_by_username(arg_str(args, 0)?),
            method::GET_CHANNEL_BY_NAME => {
                self.api
                    .get_channel_by_name(arg_str(args, 0)?, arg_str(args, 1)?)
            }
            method::SEND_NOTIFICATION => {
                self.api
                    .send_notification(arg_str(args, 0)?, arg_str(args, 1)?)
            }
            method::KV_GET => self
                .api
                .kv_get(&self.plugin_id, arg_str(args, 0)?)
                .map(|value| value.unwrap_or(Value::Null)),
            method::KV_SET => {
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                self.api
                    .kv_set(&self.plugin_id, arg_str(args, 0)?, value)
                    .map(|_| Value::Null)
            }
            method::LOG => {
                let level = arg_str(args, 0)?;
                let message = arg_str(args, 1)?;
                match level {
                    "error" => tracing::error!(target: "plugin", plugin_id = %self.plugin_id, "{message}"),
                    "warn" => tracing::warn!(target: "plugin", plugin_id = %self.plugin_id, "{message}"),
                    "debug" => tracing::debug!(target: "plugin", plugin_id = %self.plugin_id, "{message}"),
                    _ => tracing::info!(target: "plugin", plugin_id = %self.plugin_id, "{message}"),
                }
                Ok(Value::Null)
            }
            _ => Err(format!("unknown host api method: {name}")),
        }
    }
}

impl InboundHandler for CapabilityGate {
    fn handle(&self, _peer: &RpcClient, method: &str, args: Vec<Value>) -> Result<Value, String> {
        self.dispatch(method, &args)
    }
}

fn arg_str(args: &[Value], index: usize) -> Result<&str, String> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("argument {index} must be a string"))
}

/// In-memory host used by tooling and tests.
#[derive(Debug, Default)]
pub struct MemoryHostApi {
    users: Mutex<HashMap<String, Value>>,
    channels: Mutex<HashMap<(String, String), Value>>,
    notifications: Mutex<Vec<(String, String)>>,
    kv: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryHostApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: &str, user: Value) {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), user);
    }

    pub fn add_channel(&self, team: &str, name: &str, channel: Value) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((team.to_string(), name.to_string()), channel);
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl HostApi for MemoryHostApi {
    fn get_user_by_username(&self, username: &str) -> Result<Value, String> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(username)
            .cloned()
            .ok_or_else(|| format!("user not found: {username}"))
    }

    fn get_channel_by_name(&self, team: &str, name: &str) -> Result<Value, String> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(team.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| format!("channel not found: {team}/{name}"))
    }

    fn send_notification(&self, channel_id: &str, message: &str) -> Result<Value, String> {
        let mut sent = self.notifications.lock().unwrap_or_else(|e| e.into_inner());
        sent.push((channel_id.to_string(), message.to_string()));
        Ok(json!({ "id": sent.len(), "channel_id": channel_id }))
    }

    fn kv_get(&self, plugin_id: &str, key: &str) -> Result<Option<Value>, String> {
        Ok(self
            .kv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(plugin_id.to_string(), key.to_string()))
            .cloned())
    }

    fn kv_set(&self, plugin_id: &str, key: &str, value: Value) -> Result<(), String> {
        self.kv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((plugin_id.to_string(), key.to_string()), value);
        Ok(())
    }
}
