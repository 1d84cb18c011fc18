//! Process-wide registry of discovered bundles and running supervisors.
//!
//! The registry lock only guards map mutation. Activation of one id is
//! serialized by a per-id lock; different ids activate concurrently.

use crate::api::HostApi;
use crate::discovery::{scan_bundles, Bundle, BundleScan};
use crate::dispatcher::HookDispatcher;
use crate::error::{PluginError, Result};
use crate::progress::{ProgressSnapshot, TaskProgress};
use crate::settings::PluginSettings;
use crate::supervisor::{ConfigurationChange, DeactivationNotice, Supervisor, SupervisorConfig};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginStatus {
    NotRunning,
    Starting,
    Running,
    FailedToStart,
    FailedToStayRunning,
    Stopping,
}

impl PluginStatus {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::FailedToStart => "failed_to_start",
            Self::FailedToStayRunning => "failed_to_stay_running",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginStatusReport {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub status: PluginStatus,
    pub last_error: Option<String>,
    pub pid: Option<u32>,
}

/// Per-plugin outcome of an operation that touches several plugins. One
/// plugin's failure never stops delivery to the others.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, PluginError)>,
}

impl FanOutReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|(id, _)| id.as_str()).collect()
    }

    fn merge(&mut self, other: FanOutReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub restarted: Vec<String>,
    pub suppressed: Vec<String>,
    pub failed: Vec<(String, PluginError)>,
}

/// An activated plugin. UI-only bundles are active without a process.
#[derive(Clone, Debug)]
pub(crate) struct ActiveEntry {
    pub(crate) plugin_id: String,
    pub(crate) supervisor: Option<Arc<Supervisor>>,
}

impl ActiveEntry {
    fn is_live(&self) -> bool {
        self.supervisor.as_ref().map_or(true, |s| s.is_alive())
    }
}

/// Active plugins in registration order.
#[derive(Debug, Default)]
pub(crate) struct ActiveRegistry {
    entries: Mutex<Vec<ActiveEntry>>,
}

impl ActiveRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ActiveEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, entry: ActiveEntry) {
        let mut entries = self.lock();
        entries.retain(|existing| existing.plugin_id != entry.plugin_id);
        entries.push(entry);
    }

    fn remove(&self, plugin_id: &str) -> Option<ActiveEntry> {
        let mut entries = self.lock();
        let index = entries.iter().position(|e| e.plugin_id == plugin_id)?;
        Some(entries.remove(index))
    }

    /// Removes the entry for `supervisor`'s plugin only while it still holds
    /// that exact supervisor.
    fn remove_current(&self, supervisor: &Arc<Supervisor>) -> Option<ActiveEntry> {
        let mut entries = self.lock();
        let index = entries.iter().position(|e| {
            e.supervisor
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, supervisor))
        })?;
        Some(entries.remove(index))
    }

    fn take_all(&self) -> Vec<ActiveEntry> {
        std::mem::take(&mut *self.lock())
    }

    fn is_live(&self, plugin_id: &str) -> bool {
        self.lock()
            .iter()
            .any(|e| e.plugin_id == plugin_id && e.is_live())
    }

    fn live_ids(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.plugin_id.clone())
            .collect()
    }

    pub(crate) fn get(&self, plugin_id: &str) -> Option<Arc<Supervisor>> {
        self.lock()
            .iter()
            .find(|e| e.plugin_id == plugin_id)
            .and_then(|e| e.supervisor.clone())
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.plugin_id.clone()).collect()
    }

    /// Supervisors in registration order, cloned out of the lock.
    pub(crate) fn supervisors(&self) -> Vec<Arc<Supervisor>> {
        self.lock()
            .iter()
            .filter_map(|e| e.supervisor.clone())
            .collect()
    }
}

#[derive(Clone, Debug)]
struct StatusEntry {
    status: PluginStatus,
    last_error: Option<String>,
}

/// Background settings sync started by [`Environment::spawn_sync`].
pub struct SyncHandle {
    progress: Arc<TaskProgress>,
    handle: JoinHandle<FanOutReport>,
}

impl SyncHandle {
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.progress.is_finished()
    }

    pub fn join(self) -> FanOutReport {
        self.handle.join().unwrap_or_else(|_| FanOutReport {
            delivered: Vec::new(),
            failed: vec![(
                String::new(),
                PluginError::Config("settings sync panicked".to_string()),
            )],
        })
    }
}

/// Periodic [`Environment::check_health`] runner. Stops on drop.
pub struct HealthMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.halt();
    }
}

pub struct Environment {
    root: PathBuf,
    api: Arc<dyn HostApi>,
    settings: Mutex<Arc<PluginSettings>>,
    bundles: Mutex<Arc<BundleScan>>,
    registry: Arc<ActiveRegistry>,
    activation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    statuses: Mutex<BTreeMap<String, StatusEntry>>,
    crashes: Mutex<HashMap<String, VecDeque<Instant>>>,
    notices_tx: Sender<DeactivationNotice>,
    notices_rx: Mutex<Option<Receiver<DeactivationNotice>>>,
    sync_progress: Mutex<Option<Arc<TaskProgress>>>,
}

impl Environment {
    /// Builds an environment over `root` and runs the first scan. No plugin
    /// is started.
    pub fn new(root: impl AsRef<Path>, settings: PluginSettings, api: Arc<dyn HostApi>) -> Self {
        let root = root.as_ref().to_path_buf();
        let (notices_tx, notices_rx) = mpsc::channel();
        let env = Self {
            bundles: Mutex::new(Arc::new(BundleScan::default())),
            root,
            api,
            settings: Mutex::new(Arc::new(settings)),
            registry: Arc::new(ActiveRegistry::default()),
            activation_locks: Mutex::new(HashMap::new()),
            statuses: Mutex::new(BTreeMap::new()),
            crashes: Mutex::new(HashMap::new()),
            notices_tx,
            notices_rx: Mutex::new(Some(notices_rx)),
            sync_progress: Mutex::new(None),
        };
        env.rescan();
        env
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> Arc<PluginSettings> {
        Arc::clone(&self.settings.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn store_settings(&self, settings: PluginSettings) -> Arc<PluginSettings> {
        let settings = Arc::new(settings);
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&settings);
        settings
    }

    /// Re-reads the plugin directory. Running plugins are left alone, even
    /// when their bundle disappeared.
    pub fn rescan(&self) -> Arc<BundleScan> {
        let scan = Arc::new(scan_bundles(&self.root));
        for (path, err) in &scan.skipped {
            tracing::warn!(path = %path.display(), error = %err, "plugin bundle skipped");
        }
        *self.bundles.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&scan);
        scan
    }

    fn scan(&self) -> Arc<BundleScan> {
        Arc::clone(&self.bundles.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn available(&self) -> Vec<Bundle> {
        self.scan().bundles.clone()
    }

    /// Ids of running plugins in registration order. A crashed plugin drops
    /// out before the health check reaps it.
    pub fn active(&self) -> Vec<String> {
        self.registry.live_ids()
    }

    pub fn is_active(&self, plugin_id: &str) -> bool {
        self.registry.is_live(plugin_id)
    }

    pub fn supervisor(&self, plugin_id: &str) -> Option<Arc<Supervisor>> {
        self.registry.get(plugin_id)
    }

    pub fn dispatcher(&self) -> HookDispatcher {
        HookDispatcher::new(Arc::clone(&self.registry))
    }

    /// The receiver for deactivation and crash notices. Only the first
    /// caller gets it.
    pub fn take_deactivation_receiver(&self) -> Option<Receiver<DeactivationNotice>> {
        self.notices_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn activation_lock(&self, plugin_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .activation_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(plugin_id.to_string()).or_default())
    }

    fn set_status(&self, plugin_id: &str, status: PluginStatus, last_error: Option<String>) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        let entry = statuses
            .entry(plugin_id.to_string())
            .or_insert(StatusEntry {
                status,
                last_error: None,
            });
        entry.status = status;
        if last_error.is_some() {
            entry.last_error = last_error;
        }
    }

    /// Starts the plugin's process and runs `on_activate`. Activating a
    /// running plugin is a no-op; a crashed one is replaced.
    pub fn activate(&self, plugin_id: &str) -> Result<()> {
        let lock = self.activation_lock(plugin_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.activate_locked(plugin_id)
    }

    /// Removes `supervisor` if it is still the registered instance of its
    /// plugin. Returns false when the plugin was deactivated or replaced in
    /// the meantime.
    pub fn reap(&self, supervisor: &Arc<Supervisor>) -> bool {
        let lock = self.activation_lock(supervisor.plugin_id());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.registry.remove_current(supervisor).is_some()
    }

    fn activate_locked(&self, plugin_id: &str) -> Result<()> {
        if self.registry.is_live(plugin_id) {
            return Ok(());
        }
        if let Some(stale) = self.registry.get(plugin_id) {
            tracing::debug!(plugin_id, state = ?stale.state(), "replacing terminated plugin");
            self.registry.remove_current(&stale);
        }

        let settings = self.settings();
        if !settings.enable {
            return Err(PluginError::Disabled {
                plugin_id: plugin_id.to_string(),
                reason: "plugins are disabled in host settings".to_string(),
            });
        }
        let bundle = self
            .scan()
            .find(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        if !bundle.manifest.has_server() {
            tracing::debug!(plugin_id, "activating plugin without a server component");
            self.registry.insert(ActiveEntry {
                plugin_id: plugin_id.to_string(),
                supervisor: None,
            });
            self.set_status(plugin_id, PluginStatus::Running, None);
            return Ok(());
        }

        self.set_status(plugin_id, PluginStatus::Starting, None);
        let snapshot = bundle
            .manifest
            .filter_settings(settings.plugin_values(plugin_id));
        let started = Supervisor::start(
            bundle,
            &SupervisorConfig::from_settings(&settings),
            Arc::clone(&self.api),
            snapshot,
            Some(self.notices_tx.clone()),
        );

        match started {
            Ok(supervisor) => {
                self.registry.insert(ActiveEntry {
                    plugin_id: plugin_id.to_string(),
                    supervisor: Some(Arc::new(supervisor)),
                });
                self.set_status(plugin_id, PluginStatus::Running, None);
                Ok(())
            }
            Err(err) => {
                self.set_status(plugin_id, PluginStatus::FailedToStart, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stops the plugin. Returns false when it was not active.
    pub fn deactivate(&self, plugin_id: &str) -> bool {
        let lock = self.activation_lock(plugin_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = self.registry.remove(plugin_id) else {
            return false;
        };

        self.set_status(plugin_id, PluginStatus::Stopping, None);
        if let Some(supervisor) = entry.supervisor {
            supervisor.shutdown();
        }
        self.set_status(plugin_id, PluginStatus::NotRunning, None);
        true
    }

    /// Stops every active plugin concurrently.
    pub fn shutdown(&self) {
        let entries = self.registry.take_all();
        if entries.is_empty() {
            return;
        }
        tracing::info!(count = entries.len(), "shutting down plugins");
        thread::scope(|scope| {
            for entry in &entries {
                scope.spawn(move || {
                    self.set_status(&entry.plugin_id, PluginStatus::Stopping, None);
                    if let Some(supervisor) = &entry.supervisor {
                        supervisor.shutdown();
                    }
                    self.set_status(&entry.plugin_id, PluginStatus::NotRunning, None);
                });
            }
        });
    }

    /// Status of every discovered or active plugin, sorted by id.
    pub fn statuses(&self) -> Vec<PluginStatusReport> {
        let scan = self.scan();
        let statuses = self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut ids = scan.ids();
        ids.extend(self.registry.ids());
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .map(|plugin_id| {
                let supervisor = self.registry.get(&plugin_id);
                let manifest = scan
                    .find(&plugin_id)
                    .map(|b| &b.manifest)
                    .or_else(|| supervisor.as_ref().map(|s| &s.bundle().manifest));
                let entry = statuses.get(&plugin_id);
                PluginStatusReport {
                    name: manifest
                        .map(|m| m.display_name().to_string())
                        .unwrap_or_else(|| plugin_id.clone()),
                    version: manifest.map(|m| m.version.clone()).unwrap_or_default(),
                    status: match (entry.map(|e| e.status), &supervisor) {
                        (Some(PluginStatus::Running), Some(s)) if !s.is_alive() => {
                            PluginStatus::FailedToStayRunning
                        }
                        (status, _) => status.unwrap_or(PluginStatus::NotRunning),
                    },
                    last_error: entry.and_then(|e| e.last_error.clone()),
                    pid: supervisor.as_ref().map(|s| s.pid()),
                    plugin_id,
                }
            })
            .collect()
    }

    /// Pushes freshly filtered configuration to every active plugin. All
    /// change hooks are started before any reply is awaited.
    pub fn broadcast_configuration(&self, settings: PluginSettings) -> FanOutReport {
        let settings = self.store_settings(settings);
        self.fan_out_configuration(&settings, &self.registry.supervisors())
    }

    fn fan_out_configuration(
        &self,
        settings: &PluginSettings,
        targets: &[Arc<Supervisor>],
    ) -> FanOutReport {
        let changes: Vec<(ConfigurationChange, Duration)> = targets
            .iter()
            .map(|supervisor| {
                let next = supervisor
                    .bundle()
                    .manifest
                    .filter_settings(settings.plugin_values(supervisor.plugin_id()));
                (
                    supervisor.begin_configuration_change(next),
                    supervisor.activate_timeout(),
                )
            })
            .collect();

        let mut report = FanOutReport::default();
        for (change, timeout) in changes {
            let plugin_id = change.plugin_id().to_string();
            match change.finish(timeout) {
                Ok(()) => report.delivered.push(plugin_id),
                Err(err) => {
                    tracing::warn!(plugin_id, error = %err, "configuration change failed");
                    report.failed.push((plugin_id, err));
                }
            }
        }
        report
    }

    /// Applies `settings`: plugins whose state says enabled are started,
    /// the rest are stopped, and plugins that stay up get the new
    /// configuration.
    pub fn sync_active_state(&self, settings: PluginSettings) -> FanOutReport {
        self.sync_with_progress(settings, &TaskProgress::new())
    }

    fn sync_with_progress(&self, settings: PluginSettings, progress: &TaskProgress) -> FanOutReport {
        let settings = self.store_settings(settings);
        let scan = self.scan();
        let before = self.registry.ids();

        let mut to_start = Vec::new();
        let mut to_stop = Vec::new();
        for bundle in &scan.bundles {
            let wanted = settings.enable && settings.is_plugin_enabled(bundle.id());
            let present = before.iter().any(|id| id == bundle.id());
            if wanted && !self.registry.is_live(bundle.id()) {
                to_start.push(bundle.id().to_string());
            } else if !wanted && present {
                to_stop.push(bundle.id().to_string());
            }
        }
        for id in &before {
            if scan.find(id).is_none() {
                to_stop.push(id.clone());
            }
        }

        let staying = self
            .registry
            .supervisors()
            .into_iter()
            .filter(|s| {
                !to_stop.iter().any(|id| id == s.plugin_id())
                    && !to_start.iter().any(|id| id == s.plugin_id())
            })
            .collect::<Vec<_>>();

        progress.begin(to_stop.len() + to_start.len() + staying.len());
        let mut report = FanOutReport::default();

        for id in &to_stop {
            self.deactivate(id);
            progress.advance();
        }

        for id in &to_start {
            match self.activate(id) {
                Ok(()) => report.delivered.push(id.clone()),
                Err(err) => {
                    progress.record_error(format!("{id}: {err}"));
                    report.failed.push((id.clone(), err));
                }
            }
            progress.advance();
        }

        let fan_out = self.fan_out_configuration(&settings, &staying);
        for (id, err) in &fan_out.failed {
            progress.record_error(format!("{id}: {err}"));
        }
        for _ in &staying {
            progress.advance();
        }
        report.merge(fan_out);

        progress.finish();
        tracing::info!(
            started = to_start.len(),
            stopped = to_stop.len(),
            failed = report.failed.len(),
            "plugin settings synced"
        );
        report
    }

    /// Runs [`sync_active_state`](Self::sync_active_state) on a background
    /// thread. Only one sync runs at a time.
    pub fn spawn_sync(self: &Arc<Self>, settings: PluginSettings) -> Result<SyncHandle> {
        let progress = {
            let mut current = self
                .sync_progress
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|p| !p.is_finished()) {
                return Err(PluginError::Config(
                    "a plugin settings sync is already running".to_string(),
                ));
            }
            let progress = Arc::new(TaskProgress::new());
            progress.begin(0);
            *current = Some(Arc::clone(&progress));
            progress
        };

        let env = Arc::clone(self);
        let task_progress = Arc::clone(&progress);
        let handle = thread::Builder::new()
            .name("plugin-settings-sync".to_string())
            .spawn(move || env.sync_with_progress(settings, &task_progress))
            .map_err(|err| {
                progress.finish();
                PluginError::Config(format!("failed to start settings sync: {err}"))
            })?;

        Ok(SyncHandle { progress, handle })
    }

    /// Progress of the current or most recent background sync.
    pub fn sync_progress(&self) -> Option<ProgressSnapshot> {
        self.sync_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.snapshot())
    }

    /// Reaps crashed plugins, pings the live ones and restarts whatever died,
    /// unless it already crashed `max_restarts` times within
    /// `restart_window`. A plugin busy with a hook call counts as healthy
    /// since its ping queues behind that call.
    pub fn check_health(&self) -> HealthReport {
        let settings = self.settings();
        let ping_timeout = settings.normalized_start_timeout();
        let mut report = HealthReport::default();
        let mut dead = Vec::new();

        for supervisor in self.registry.supervisors() {
            let plugin_id = supervisor.plugin_id().to_string();
            if !supervisor.is_alive() {
                dead.push(supervisor);
                continue;
            }
            if supervisor.is_busy() {
                report.healthy.push(plugin_id);
                continue;
            }
            match supervisor.ping(ping_timeout) {
                Ok(()) => report.healthy.push(plugin_id),
                Err(PluginError::Timeout { .. }) if supervisor.is_busy() => {
                    report.healthy.push(plugin_id);
                }
                Err(err) => {
                    tracing::warn!(plugin_id, error = %err, "plugin failed health check");
                    dead.push(supervisor);
                }
            }
        }

        for supervisor in dead {
            let plugin_id = supervisor.plugin_id().to_string();
            let lock = self.activation_lock(&plugin_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            if self.registry.remove_current(&supervisor).is_none() {
                continue;
            }
            supervisor.shutdown();
            self.set_status(
                &plugin_id,
                PluginStatus::FailedToStayRunning,
                Some("plugin process terminated unexpectedly".to_string()),
            );

            if !self.record_crash(&plugin_id, &settings) {
                tracing::warn!(plugin_id, "plugin keeps crashing, restarts suppressed");
                report.suppressed.push(plugin_id);
                continue;
            }

            match self.activate_locked(&plugin_id) {
                Ok(()) => {
                    tracing::info!(plugin_id, "plugin restarted");
                    report.restarted.push(plugin_id);
                }
                Err(err) => {
                    self.set_status(
                        &plugin_id,
                        PluginStatus::FailedToStayRunning,
                        Some(err.to_string()),
                    );
                    report.failed.push((plugin_id, err));
                }
            }
        }

        report
    }

    /// Records a crash and tells whether another restart is allowed.
    fn record_crash(&self, plugin_id: &str, settings: &PluginSettings) -> bool {
        let window = settings.normalized_restart_window();
        let now = Instant::now();
        let mut crashes = self.crashes.lock().unwrap_or_else(|e| e.into_inner());
        let history = crashes.entry(plugin_id.to_string()).or_default();
        while history
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            history.pop_front();
        }
        history.push_back(now);
        history.len() <= settings.normalized_max_restarts() as usize
    }

    /// Runs [`check_health`](Self::check_health) every
    /// `health_check_interval` until the monitor or the environment is
    /// dropped.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> HealthMonitor {
        let stop = Arc::new(AtomicBool::new(false));
        let weak: Weak<Self> = Arc::downgrade(self);
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("plugin-health".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !flag.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(20));
                    let Some(env) = weak.upgrade() else {
                        return;
                    };
                    if last.elapsed() < env.settings().normalized_health_check_interval() {
                        continue;
                    }
                    let report = env.check_health();
                    if !report.restarted.is_empty() || !report.suppressed.is_empty() {
                        tracing::info!(
                            restarted = ?report.restarted,
                            suppressed = ?report.suppressed,
                            "plugin health check"
                        );
                    }
                    last = Instant::now();
                }
            })
            .map_err(|err| tracing::warn!(error = %err, "failed to start plugin health monitor"))
            .ok();

        HealthMonitor { stop, handle }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryHostApi;
    use std::fs;

    fn write_bundle(root: &Path, dir: &str, manifest: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).expect("bundle dir");
        fs::write(path.join("plugin.json"), manifest).expect("manifest");
    }

    fn env(root: &Path) -> Environment {
        Environment::new(root, PluginSettings::default(), Arc::new(MemoryHostApi::new()))
    }

    #[test]
    fn new_scans_without_starting_anything() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "b", r#"{"id":"com.example.b"}"#);
        write_bundle(root.path(), "a", r#"{"id":"com.example.a"}"#);
        write_bundle(root.path(), "broken", "{");

        let env = env(root.path());
        let ids = env.available().iter().map(|b| b.id().to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["com.example.a", "com.example.b"]);
        assert!(env.active().is_empty());
    }

    #[test]
    fn ui_only_bundle_activates_without_a_process() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "web", r#"{"id":"com.example.web"}"#);
        let env = env(root.path());

        env.activate("com.example.web").expect("activate");
        assert!(env.is_active("com.example.web"));
        assert!(env.supervisor("com.example.web").is_none());
        assert_eq!(env.statuses()[0].status, PluginStatus::Running);

        assert!(env.deactivate("com.example.web"));
        assert!(!env.deactivate("com.example.web"));
        assert_eq!(env.statuses()[0].status, PluginStatus::NotRunning);
    }

    #[test]
    fn activate_unknown_or_disabled() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "web", r#"{"id":"com.example.web"}"#);
        let settings = PluginSettings {
            enable: false,
            ..PluginSettings::default()
        };
        let env = Environment::new(root.path(), settings, Arc::new(MemoryHostApi::new()));

        assert!(matches!(
            env.activate("com.example.missing"),
            Err(PluginError::Disabled { .. })
        ));
        env.broadcast_configuration(PluginSettings::default());
        assert!(matches!(
            env.activate("com.example.missing"),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn rescan_picks_up_new_bundles_without_touching_active_ones() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "web", r#"{"id":"com.example.web"}"#);
        let env = env(root.path());
        env.activate("com.example.web").expect("activate");

        fs::remove_dir_all(root.path().join("web")).expect("remove bundle");
        write_bundle(root.path(), "other", r#"{"id":"com.example.other"}"#);
        let scan = env.rescan();

        assert_eq!(scan.ids(), vec!["com.example.other"]);
        assert!(env.is_active("com.example.web"));
        let ids = env.statuses().into_iter().map(|s| s.plugin_id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["com.example.other", "com.example.web"]);
    }

    #[test]
    fn sync_follows_plugin_states() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "a", r#"{"id":"com.example.a"}"#);
        write_bundle(root.path(), "b", r#"{"id":"com.example.b"}"#);
        let env = env(root.path());

        let mut settings = PluginSettings::default();
        settings.set_plugin_enabled("com.example.a", true);
        let report = env.sync_active_state(settings.clone());
        assert!(report.is_clean());
        assert_eq!(env.active(), vec!["com.example.a"]);

        settings.set_plugin_enabled("com.example.a", false);
        settings.set_plugin_enabled("com.example.b", true);
        env.sync_active_state(settings);
        assert_eq!(env.active(), vec!["com.example.b"]);
    }

    #[test]
    fn spawn_sync_reports_progress() {
        let root = tempfile::tempdir().expect("tempdir");
        write_bundle(root.path(), "a", r#"{"id":"com.example.a"}"#);
        let env = Arc::new(env(root.path()));

        let mut settings = PluginSettings::default();
        settings.set_plugin_enabled("com.example.a", true);
        let handle = env.spawn_sync(settings).expect("spawn sync");
        let report = handle.join();

        assert!(report.is_clean());
        assert_eq!(report.delivered, vec!["com.example.a"]);
        let progress = env.sync_progress().expect("progress");
        assert!(progress.finished);
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn crash_history_suppresses_restarts_past_the_limit() {
        let root = tempfile::tempdir().expect("tempdir");
        let env = env(root.path());
        let settings = PluginSettings {
            max_restarts: 2,
            ..PluginSettings::default()
        };

        assert!(env.record_crash("com.example.a", &settings));
        assert!(env.record_crash("com.example.a", &settings));
        assert!(!env.record_crash("com.example.a", &settings));
        assert!(env.record_crash("com.example.b", &settings));
    }

    #[test]
    fn deactivation_receiver_is_handed_out_once() {
        let root = tempfile::tempdir().expect("tempdir");
        let env = env(root.path());
        assert!(env.take_deactivation_receiver().is_some());
        assert!(env.take_deactivation_receiver().is_none());
    }
}
