//! One child process per active plugin.
//!
//! `Supervisor::start` walks `Spawning -> Handshaking -> Active` and either
//! returns a live supervisor or kills whatever it spawned. Liveness is an
//! atomic read; a monitor thread flips it when the process exits on its own.

use crate::api::{grant_capabilities, Capability, CapabilityGate, HostApi, SnapshotCell};
use crate::discovery::Bundle;
use crate::error::{PluginError, Result};
use crate::handshake::{Handshake, HandshakeError, TransportKind};
use crate::hooks::{Hook, HookMode, HookSet};
use crate::paths::resolve_executable;
use crate::protocol::{
    format_protocol_versions, ENV_PLUGIN_ID, ENV_PROTOCOL_VERSIONS, ENV_TRANSPORT,
    MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, METHOD_IMPLEMENTED, METHOD_PING,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::rpc::{PendingCall, RpcClient, RpcError, RpcSession};
use crate::settings::PluginSettings;
use crate::transport::Connection;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    Handshaking,
    Active,
    Terminating,
    Terminated,
}

impl SupervisorState {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Spawning => 0,
            Self::Handshaking => 1,
            Self::Active => 2,
            Self::Terminating => 3,
            Self::Terminated => 4,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Spawning,
            1 => Self::Handshaking,
            2 => Self::Active,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeactivationReason {
    Requested,
    Crashed,
}

/// Sent on the environment's notice channel whenever an active plugin goes
/// away, whether asked to or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeactivationNotice {
    pub plugin_id: String,
    pub reason: DeactivationReason,
    pub exit_status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub start_timeout: Duration,
    pub activate_timeout: Duration,
    pub watchdog_interval: Duration,
    pub transport: TransportKind,
    pub protocol_versions: Vec<u32>,
    pub allowed_capabilities: Vec<Capability>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_settings(&PluginSettings::default())
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &PluginSettings) -> Self {
        Self {
            start_timeout: settings.normalized_start_timeout(),
            activate_timeout: settings.normalized_activate_timeout(),
            watchdog_interval: settings.normalized_watchdog_interval(),
            transport: settings.normalized_transport(),
            protocol_versions: settings.normalized_protocol_versions(),
            allowed_capabilities: settings.normalized_allowed_capabilities(),
        }
    }

    fn protocol_versions(&self) -> Vec<u32> {
        if self.protocol_versions.is_empty() {
            return SUPPORTED_PROTOCOL_VERSIONS.to_vec();
        }
        self.protocol_versions.clone()
    }
}

struct Lifecycle {
    plugin_id: String,
    state: AtomicU8,
    child: Mutex<Child>,
    stopping: AtomicBool,
    noticed: AtomicBool,
    notices: Option<Sender<DeactivationNotice>>,
}

impl Lifecycle {
    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    fn kill_and_wait(&self) -> Option<String> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let _ = child.kill();
        child.wait().ok().map(|status| status.to_string())
    }

    fn send_notice(&self, reason: DeactivationReason, exit_status: Option<String>) {
        if self.noticed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = &self.notices {
            let _ = tx.send(DeactivationNotice {
                plugin_id: self.plugin_id.clone(),
                reason,
                exit_status,
            });
        }
    }
}

pub struct Supervisor {
    bundle: Bundle,
    lifecycle: Arc<Lifecycle>,
    pid: u32,
    session: RpcSession,
    client: RpcClient,
    hooks: HookSet,
    granted: BTreeSet<Capability>,
    config: Arc<SnapshotCell>,
    activated_at: SystemTime,
    activate_timeout: Duration,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("plugin_id", &self.bundle.id())
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("protocol_version", &self.hooks.protocol_version())
            .finish()
    }
}

impl Supervisor {
    /// Spawns the bundle's executable, completes the handshake, connects the
    /// RPC session and runs `on_activate`. Every failure after the spawn kills
    /// and reaps the child before returning.
    pub fn start(
        bundle: Bundle,
        config: &SupervisorConfig,
        api: Arc<dyn HostApi>,
        snapshot: Map<String, Value>,
        notices: Option<Sender<DeactivationNotice>>,
    ) -> Result<Self> {
        let plugin_id = bundle.id().to_string();
        let declared = bundle
            .manifest
            .executable_for_platform()
            .ok_or_else(|| PluginError::PathValidation {
                plugin_id: plugin_id.clone(),
                reason: "manifest declares no executable for this platform".to_string(),
            })?;
        let executable = resolve_executable(&bundle.path, declared).map_err(|err| {
            PluginError::PathValidation {
                plugin_id: plugin_id.clone(),
                reason: format!("{err:#}"),
            }
        })?;

        let versions = config.protocol_versions();
        let started = Instant::now();
        tracing::debug!(plugin_id, executable = %executable.display(), "spawning plugin");
        let mut child = Command::new(&executable)
            .current_dir(&bundle.path)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(ENV_PROTOCOL_VERSIONS, format_protocol_versions(&versions))
            .env(ENV_TRANSPORT, config.transport.as_tag())
            .env(ENV_PLUGIN_ID, &plugin_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| PluginError::Spawn {
                plugin_id: plugin_id.clone(),
                reason: format!("{}: {err}", executable.display()),
            })?;
        let pid = child.id();

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                kill_and_wait(&mut child);
                return Err(PluginError::Spawn {
                    plugin_id,
                    reason: "child pipes unavailable".to_string(),
                });
            }
        };
        forward_lines(&plugin_id, "stderr", stderr);

        let lifecycle = Arc::new(Lifecycle {
            plugin_id: plugin_id.clone(),
            state: AtomicU8::new(SupervisorState::Handshaking.to_u8()),
            child: Mutex::new(child),
            stopping: AtomicBool::new(false),
            noticed: AtomicBool::new(false),
            notices,
        });
        let abort = |err: PluginError| {
            lifecycle.kill_and_wait();
            lifecycle.set_state(SupervisorState::Terminated);
            tracing::warn!(plugin_id = %lifecycle.plugin_id, error = %err, "plugin failed to start");
            err
        };

        let mut handshake = Handshake::new(versions);
        let (line, stdout) = handshake
            .await_line(BufReader::new(stdout), config.start_timeout)
            .map_err(|err| match err {
                HandshakeError::Timeout(timeout) => PluginError::HandshakeTimeout {
                    plugin_id: plugin_id.clone(),
                    timeout,
                },
                other => PluginError::Handshake {
                    plugin_id: plugin_id.clone(),
                    reason: other.to_string(),
                },
            })
            .map_err(&abort)?;

        if let Some(min) = bundle.manifest.min_protocol_version {
            if line.protocol_version < min {
                return Err(abort(PluginError::Handshake {
                    plugin_id,
                    reason: format!(
                        "negotiated protocol {} is below the manifest minimum {min}",
                        line.protocol_version
                    ),
                }));
            }
        }

        let connection = match line.transport {
            TransportKind::Stdio => Connection::from_buffered(stdout, stdin),
            kind => {
                forward_lines(&plugin_id, "stdout", stdout);
                drop(stdin);
                let remaining = config.start_timeout.saturating_sub(started.elapsed());
                Connection::dial(kind, &line.endpoint, remaining).map_err(|reason| {
                    abort(PluginError::Handshake {
                        plugin_id: plugin_id.clone(),
                        reason,
                    })
                })?
            }
        };

        let granted = grant_capabilities(
            &bundle.manifest.requested_capabilities(),
            &config.allowed_capabilities,
        );
        let snapshot = Arc::new(SnapshotCell::new(snapshot));
        let gate = CapabilityGate::new(
            plugin_id.clone(),
            granted.clone(),
            api,
            Arc::clone(&snapshot),
        );
        let session = RpcSession::start(&plugin_id, connection, Arc::new(gate));
        let client = session.client();

        let advertised = client
            .call_timeout(METHOD_IMPLEMENTED, Vec::new(), config.activate_timeout)
            .map_err(|err| abort(PluginError::from_rpc(&plugin_id, err)))?;
        let advertised: Vec<String> = serde_json::from_value(advertised).map_err(|err| {
            abort(PluginError::Handshake {
                plugin_id: plugin_id.clone(),
                reason: format!("invalid hook advertisement: {err}"),
            })
        })?;
        let hooks = HookSet::from_advertised(&advertised, line.protocol_version);

        if hooks.contains(Hook::OnActivate) {
            client
                .call_timeout(Hook::OnActivate.as_tag(), Vec::new(), config.activate_timeout)
                .map_err(|err| abort(PluginError::from_rpc(&plugin_id, err)))?;
        }

        lifecycle.set_state(SupervisorState::Active);
        tracing::info!(
            plugin_id,
            pid,
            protocol = line.protocol_version,
            transport = line.transport.as_tag(),
            hooks = ?hooks.tags(),
            "plugin activated"
        );

        let monitor = spawn_monitor(
            Arc::clone(&lifecycle),
            client.clone(),
            config.watchdog_interval,
        );

        Ok(Self {
            bundle,
            lifecycle,
            pid,
            session,
            client,
            hooks,
            granted,
            config: snapshot,
            activated_at: SystemTime::now(),
            activate_timeout: config.activate_timeout,
            monitor: Mutex::new(monitor),
        })
    }

    pub fn plugin_id(&self) -> &str {
        self.bundle.id()
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Never blocks on the plugin.
    pub fn state(&self) -> SupervisorState {
        self.lifecycle.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == SupervisorState::Active
    }

    pub fn protocol_version(&self) -> u32 {
        self.hooks.protocol_version()
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn implements(&self, hook: Hook) -> bool {
        self.hooks.contains(hook)
    }

    pub fn granted_capabilities(&self) -> &BTreeSet<Capability> {
        &self.granted
    }

    pub fn activated_at(&self) -> SystemTime {
        self.activated_at
    }

    pub fn activate_timeout(&self) -> Duration {
        self.activate_timeout
    }

    pub fn configuration(&self) -> Arc<Map<String, Value>> {
        self.config.load()
    }

    /// Starts a request-mode hook call, or `None` when the plugin does not
    /// take this hook.
    pub fn start_hook(&self, hook: Hook, args: Vec<Value>) -> Option<PendingCall> {
        if hook.mode() != HookMode::Request || !self.implements(hook) {
            return None;
        }
        Some(self.client.start_call(hook.as_tag(), args))
    }

    /// Queues a notify-mode hook. Returns false when the plugin does not
    /// take this hook.
    pub fn notify_hook(&self, hook: Hook, args: Vec<Value>) -> std::result::Result<bool, RpcError> {
        if hook.mode() != HookMode::Notify || !self.implements(hook) {
            return Ok(false);
        }
        self.client.notify(hook.as_tag(), args).map(|_| true)
    }

    /// True while a host call into the plugin awaits its reply.
    pub fn is_busy(&self) -> bool {
        self.client.pending_calls() > 0
    }

    pub fn ping(&self, timeout: Duration) -> Result<()> {
        self.client
            .call_timeout(METHOD_PING, Vec::new(), timeout)
            .map(|_| ())
            .map_err(|err| PluginError::from_rpc(self.plugin_id(), err))
    }

    /// Installs `next` as the current snapshot and starts the plugin's
    /// change hook. The previous snapshot lives until the change completes.
    pub fn begin_configuration_change(&self, next: Map<String, Value>) -> ConfigurationChange {
        let previous = self.config.replace(next);
        let pending = self.start_hook(Hook::OnConfigurationChange, Vec::new());
        ConfigurationChange {
            plugin_id: self.plugin_id().to_string(),
            pending,
            previous,
        }
    }

    /// Runs `on_deactivate` (bounded), then kills and reaps the process.
    /// Idempotent.
    pub fn shutdown(&self) {
        let state = self.state();
        if matches!(state, SupervisorState::Terminating | SupervisorState::Terminated) {
            self.join_monitor();
            return;
        }
        self.lifecycle.set_state(SupervisorState::Terminating);
        self.lifecycle.stopping.store(true, Ordering::Release);

        if self.implements(Hook::OnDeactivate) && !self.client.is_closed() {
            if let Err(err) = self.client.call_timeout(
                Hook::OnDeactivate.as_tag(),
                Vec::new(),
                self.activate_timeout,
            ) {
                tracing::warn!(plugin_id = self.plugin_id(), error = %err, "on_deactivate failed");
            }
        }

        self.session.close("plugin deactivated");
        let exit_status = self.lifecycle.kill_and_wait();
        self.lifecycle.set_state(SupervisorState::Terminated);
        self.join_monitor();
        tracing::info!(plugin_id = self.plugin_id(), "plugin deactivated");
        self.lifecycle
            .send_notice(DeactivationReason::Requested, exit_status);
    }

    fn join_monitor(&self) {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.state() != SupervisorState::Terminated {
            self.lifecycle.stopping.store(true, Ordering::Release);
            self.session.close("supervisor dropped");
            self.lifecycle.kill_and_wait();
            self.lifecycle.set_state(SupervisorState::Terminated);
        }
        self.join_monitor();
    }
}

/// An in-flight `on_configuration_change` together with the snapshot it
/// replaced.
pub struct ConfigurationChange {
    plugin_id: String,
    pending: Option<PendingCall>,
    previous: Arc<Map<String, Value>>,
}

impl ConfigurationChange {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Waits for the plugin's change hook; the replaced snapshot is released
    /// afterwards either way.
    pub fn finish(self, timeout: Duration) -> Result<()> {
        let Self {
            plugin_id,
            pending,
            previous,
        } = self;
        let result = match pending {
            Some(call) => call
                .wait_timeout(timeout)
                .map(|_| ())
                .map_err(|err| PluginError::from_rpc(&plugin_id, err)),
            None => Ok(()),
        };
        drop(previous);
        result
    }
}

fn spawn_monitor(
    lifecycle: Arc<Lifecycle>,
    client: RpcClient,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    let plugin_id = lifecycle.plugin_id.clone();
    thread::Builder::new()
        .name(format!("plugin-monitor-{plugin_id}"))
        .spawn(move || loop {
            if lifecycle.stopping.load(Ordering::Acquire) {
                return;
            }
            let exited = {
                let mut child = lifecycle.child.lock().unwrap_or_else(|e| e.into_inner());
                match child.try_wait() {
                    Ok(Some(status)) => Some(status.to_string()),
                    Ok(None) => None,
                    Err(err) => Some(format!("wait failed: {err}")),
                }
            };
            if let Some(status) = exited {
                if lifecycle.stopping.load(Ordering::Acquire) {
                    return;
                }
                lifecycle.set_state(SupervisorState::Terminated);
                client.close(&format!("plugin process exited: {status}"));
                tracing::warn!(plugin_id = %lifecycle.plugin_id, status, "plugin process exited unexpectedly");
                lifecycle.send_notice(DeactivationReason::Crashed, Some(status));
                return;
            }
            thread::sleep(interval);
        })
        .map_err(|err| {
            tracing::warn!(plugin_id, error = %err, "failed to start plugin monitor");
        })
        .ok()
}

/// Re-emits a child stream line by line under the `plugin` target.
fn forward_lines<R>(plugin_id: &str, stream: &'static str, reader: R)
where
    R: Read + Send + 'static,
{
    let plugin_id = plugin_id.to_string();
    let spawned = thread::Builder::new()
        .name(format!("plugin-{stream}-{plugin_id}"))
        .spawn(move || {
            let reader = BufReader::new(reader);
            for line in reader.lines() {
                let Ok(line) = line else {
                    break;
                };
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "plugin", plugin_id = %plugin_id, stream, "{line}");
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, stream, "failed to start plugin output forwarder");
    }
}

fn kill_and_wait(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tags_survive_atomic_encoding() {
        for state in [
            SupervisorState::Spawning,
            SupervisorState::Handshaking,
            SupervisorState::Active,
            SupervisorState::Terminating,
            SupervisorState::Terminated,
        ] {
            assert_eq!(SupervisorState::from_u8(state.to_u8()), state);
        }
        assert_eq!(SupervisorState::Active.as_tag(), "active");
    }

    #[test]
    fn config_from_settings_uses_normalized_values() {
        let settings = PluginSettings {
            start_timeout_ms: 250,
            transport: "stdio".to_string(),
            supported_protocol_versions: vec![1],
            allowed_capabilities: vec!["lookup_user".to_string()],
            ..PluginSettings::default()
        };
        let config = SupervisorConfig::from_settings(&settings);
        assert_eq!(config.start_timeout, Duration::from_millis(250));
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.protocol_versions, vec![1]);
        assert_eq!(config.allowed_capabilities, vec![Capability::LookupUser]);
    }

    #[test]
    fn bundle_without_server_is_rejected_before_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = Bundle {
            manifest: crate::manifest::Manifest::parse(r#"{"id":"com.example.webonly"}"#)
                .expect("manifest"),
            path: dir.path().to_path_buf(),
        };
        let err = Supervisor::start(
            bundle,
            &SupervisorConfig::default(),
            Arc::new(crate::api::MemoryHostApi::new()),
            Map::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::PathValidation { .. }));
    }
}
