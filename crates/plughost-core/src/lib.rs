pub mod api;
pub mod discovery;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod handshake;
pub mod hooks;
pub mod logging;
pub mod manifest;
pub mod paths;
pub mod progress;
pub mod protocol;
pub mod rpc;
pub mod settings;
pub mod supervisor;
pub mod transport;
pub mod watch;

pub use api::{Capability, HostApi, MemoryHostApi};
pub use discovery::{Bundle, BundleScan};
pub use dispatcher::{HookDispatcher, HookReply, PipelineOutcome};
pub use environment::{Environment, FanOutReport, HealthReport, PluginStatus, PluginStatusReport};
pub use error::{PluginError, PluginErrorCode};
pub use hooks::{Hook, HookMode, HookSet, PostDecision};
pub use manifest::Manifest;
pub use settings::{HostSettings, PluginSettings};
pub use supervisor::{DeactivationNotice, DeactivationReason, Supervisor, SupervisorState};
