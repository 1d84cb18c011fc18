//! Routes host events to the plugins that implement the matching hook.
//!
//! Plugins are visited in registration order. A plugin that does not
//! advertise a hook, or negotiated a protocol older than the hook, is
//! skipped without error.

use crate::environment::ActiveRegistry;
use crate::error::{PluginError, Result};
use crate::hooks::{Hook, HookMode, PostDecision};
use crate::rpc::PendingCall;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Reply of one plugin to a request-mode hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookReply {
    pub plugin_id: String,
    pub result: std::result::Result<Value, PluginError>,
}

/// Outcome of a `message_will_be_*` pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The post as returned by the last plugin that ran.
    pub post: Value,
    /// Set when a plugin rejected the post: `(plugin_id, reason)`.
    pub rejected: Option<(String, String)>,
    /// Plugins that failed; the post passed through them unchanged.
    pub errors: Vec<(String, PluginError)>,
}

impl PipelineOutcome {
    pub fn is_rejected(&self) -> bool {
        self.rejected.is_some()
    }
}

#[derive(Clone)]
pub struct HookDispatcher {
    registry: Arc<ActiveRegistry>,
    timeout: Option<Duration>,
}

impl HookDispatcher {
    pub(crate) fn new(registry: Arc<ActiveRegistry>) -> Self {
        Self {
            registry,
            timeout: None,
        }
    }

    /// Bounds every request-mode wait. Unbounded by default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn wait(&self, plugin_id: &str, call: PendingCall) -> Result<Value> {
        let result = match self.timeout {
            Some(timeout) => call.wait_timeout(timeout),
            None => call.wait(),
        };
        result.map_err(|err| PluginError::from_rpc(plugin_id, err))
    }

    fn check_call(hook: Hook, mode: HookMode, args: &[Value]) -> Result<()> {
        if hook.mode() != mode {
            return Err(PluginError::HookContract(format!(
                "{} is not a {} hook",
                hook.as_tag(),
                match mode {
                    HookMode::Notify => "notify",
                    HookMode::Request => "request",
                }
            )));
        }
        if args.len() != hook.arity() {
            return Err(PluginError::HookContract(format!(
                "{} takes {} argument(s), got {}",
                hook.as_tag(),
                hook.arity(),
                args.len()
            )));
        }
        Ok(())
    }

    /// Queues a notify hook on every implementing plugin. Never waits on a
    /// plugin. Returns the ids it was queued for.
    pub fn notify(&self, hook: Hook, args: Vec<Value>) -> Result<Vec<String>> {
        Self::check_call(hook, HookMode::Notify, &args)?;
        let mut delivered = Vec::new();
        for supervisor in self.registry.supervisors() {
            match supervisor.notify_hook(hook, args.clone()) {
                Ok(true) => delivered.push(supervisor.plugin_id().to_string()),
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    plugin_id = supervisor.plugin_id(),
                    hook = hook.as_tag(),
                    error = %err,
                    "hook notification dropped"
                ),
            }
        }
        Ok(delivered)
    }

    /// Sends a request hook to every implementing plugin, then collects the
    /// replies in registration order.
    pub fn request_all(&self, hook: Hook, args: Vec<Value>) -> Result<Vec<HookReply>> {
        Self::check_call(hook, HookMode::Request, &args)?;
        if hook.is_lifecycle() {
            return Err(PluginError::HookContract(format!(
                "{} is driven by the environment",
                hook.as_tag()
            )));
        }

        let pending = self
            .registry
            .supervisors()
            .into_iter()
            .filter_map(|supervisor| {
                let call = supervisor.start_hook(hook, args.clone())?;
                Some((supervisor.plugin_id().to_string(), call))
            })
            .collect::<Vec<_>>();

        Ok(pending
            .into_iter()
            .map(|(plugin_id, call)| {
                let result = self.wait(&plugin_id, call);
                HookReply { plugin_id, result }
            })
            .collect())
    }

    /// Calls `execute_command` on one plugin.
    pub fn execute_command(&self, plugin_id: &str, command: Value) -> Result<Value> {
        let supervisor = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        let call = supervisor
            .start_hook(Hook::ExecuteCommand, vec![command])
            .ok_or_else(|| {
                PluginError::HookContract(format!("{plugin_id} does not handle commands"))
            })?;
        self.wait(plugin_id, call)
    }

    pub fn message_will_be_posted(&self, post: Value) -> PipelineOutcome {
        self.run_pipeline(Hook::MessageWillBePosted, post, None)
    }

    pub fn message_will_be_updated(&self, new_post: Value, old_post: Value) -> PipelineOutcome {
        self.run_pipeline(Hook::MessageWillBeUpdated, new_post, Some(old_post))
    }

    /// Each plugin sees the post as left by the previous one. A rejection
    /// ends the chain; a failing plugin is skipped.
    fn run_pipeline(&self, hook: Hook, post: Value, old_post: Option<Value>) -> PipelineOutcome {
        let mut outcome = PipelineOutcome {
            post,
            rejected: None,
            errors: Vec::new(),
        };

        for supervisor in self.registry.supervisors() {
            let mut args = vec![outcome.post.clone()];
            args.extend(old_post.clone());
            let Some(call) = supervisor.start_hook(hook, args) else {
                continue;
            };
            let plugin_id = supervisor.plugin_id().to_string();

            let decision = self
                .wait(&plugin_id, call)
                .and_then(|reply| {
                    PostDecision::from_reply(reply).map_err(|message| PluginError::Application {
                        plugin_id: plugin_id.clone(),
                        message,
                    })
                });
            match decision {
                Ok(decision) => {
                    if let Some(reason) = decision.rejection() {
                        tracing::debug!(plugin_id, hook = hook.as_tag(), reason, "post rejected");
                        outcome.rejected = Some((plugin_id, reason.to_string()));
                        break;
                    }
                    if let Some(post) = decision.post {
                        outcome.post = post;
                    }
                }
                Err(err) => {
                    tracing::warn!(plugin_id, hook = hook.as_tag(), error = %err, "hook failed");
                    outcome.errors.push((plugin_id, err));
                }
            }
        }

        outcome
    }

    pub fn message_has_been_posted(&self, post: Value) -> Result<Vec<String>> {
        self.notify(Hook::MessageHasBeenPosted, vec![post])
    }

    pub fn message_has_been_updated(&self, new_post: Value, old_post: Value) -> Result<Vec<String>> {
        self.notify(Hook::MessageHasBeenUpdated, vec![new_post, old_post])
    }

    pub fn channel_has_been_created(&self, channel: Value) -> Result<Vec<String>> {
        self.notify(Hook::ChannelHasBeenCreated, vec![channel])
    }

    pub fn user_has_joined_channel(&self, member: Value, actor: Value) -> Result<Vec<String>> {
        self.notify(Hook::UserHasJoinedChannel, vec![member, actor])
    }

    pub fn user_has_left_channel(&self, member: Value, actor: Value) -> Result<Vec<String>> {
        self.notify(Hook::UserHasLeftChannel, vec![member, actor])
    }

    pub fn user_has_logged_in(&self, user: Value) -> Result<Vec<String>> {
        self.notify(Hook::UserHasLoggedIn, vec![user])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> HookDispatcher {
        HookDispatcher::new(Arc::new(ActiveRegistry::default()))
    }

    #[test]
    fn contract_violations_are_reported() {
        let d = dispatcher();
        assert!(matches!(
            d.notify(Hook::MessageWillBePosted, vec![json!({})]),
            Err(PluginError::HookContract(_))
        ));
        assert!(matches!(
            d.notify(Hook::MessageHasBeenPosted, Vec::new()),
            Err(PluginError::HookContract(_))
        ));
        assert!(matches!(
            d.request_all(Hook::OnActivate, Vec::new()),
            Err(PluginError::HookContract(_))
        ));
    }

    #[test]
    fn empty_registry_delivers_nothing() {
        let d = dispatcher();
        assert!(d.message_has_been_posted(json!({})).unwrap().is_empty());
        assert!(d
            .request_all(Hook::ExecuteCommand, vec![json!({})])
            .unwrap()
            .is_empty());

        let outcome = d.message_will_be_posted(json!({ "message": "hi" }));
        assert_eq!(outcome.post, json!({ "message": "hi" }));
        assert!(!outcome.is_rejected());
        assert!(matches!(
            d.execute_command("com.example.none", json!({})),
            Err(PluginError::NotFound(_))
        ));
    }
}
