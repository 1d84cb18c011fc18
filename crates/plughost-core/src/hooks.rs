//! Hook catalogue shared by host and plugins.
//!
//! A hook is addressed on the wire by its tag. Plugins advertise the tags they
//! implement once, at activation; the host never calls anything else.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookMode {
    /// Fire-and-forget; no reply is produced.
    Notify,
    /// Exactly one reply or one terminal error.
    Request,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    OnActivate,
    OnDeactivate,
    OnConfigurationChange,
    ExecuteCommand,
    MessageWillBePosted,
    MessageWillBeUpdated,
    MessageHasBeenPosted,
    MessageHasBeenUpdated,
    ChannelHasBeenCreated,
    UserHasJoinedChannel,
    UserHasLeftChannel,
    UserHasLoggedIn,
}

impl Hook {
    pub const ALL: [Hook; 12] = [
        Hook::OnActivate,
        Hook::OnDeactivate,
        Hook::OnConfigurationChange,
        Hook::ExecuteCommand,
        Hook::MessageWillBePosted,
        Hook::MessageWillBeUpdated,
        Hook::MessageHasBeenPosted,
        Hook::MessageHasBeenUpdated,
        Hook::ChannelHasBeenCreated,
        Hook::UserHasJoinedChannel,
        Hook::UserHasLeftChannel,
        Hook::UserHasLoggedIn,
    ];

    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::OnActivate => "on_activate",
            Self::OnDeactivate => "on_deactivate",
            Self::OnConfigurationChange => "on_configuration_change",
            Self::ExecuteCommand => "execute_command",
            Self::MessageWillBePosted => "message_will_be_posted",
            Self::MessageWillBeUpdated => "message_will_be_updated",
            Self::MessageHasBeenPosted => "message_has_been_posted",
            Self::MessageHasBeenUpdated => "message_has_been_updated",
            Self::ChannelHasBeenCreated => "channel_has_been_created",
            Self::UserHasJoinedChannel => "user_has_joined_channel",
            Self::UserHasLeftChannel => "user_has_left_channel",
            Self::UserHasLoggedIn => "user_has_logged_in",
        }
    }

    pub fn from_tag(input: &str) -> Option<Self> {
        let input = input.trim();
        Self::ALL.into_iter().find(|hook| hook.as_tag() == input)
    }

    pub const fn mode(self) -> HookMode {
        match self {
            Self::OnActivate
            | Self::OnDeactivate
            | Self::OnConfigurationChange
            | Self::ExecuteCommand
            | Self::MessageWillBePosted
            | Self::MessageWillBeUpdated => HookMode::Request,
            Self::MessageHasBeenPosted
            | Self::MessageHasBeenUpdated
            | Self::ChannelHasBeenCreated
            | Self::UserHasJoinedChannel
            | Self::UserHasLeftChannel
            | Self::UserHasLoggedIn => HookMode::Notify,
        }
    }

    /// Number of positional arguments the hook takes.
    pub const fn arity(self) -> usize {
        match self {
            Self::OnActivate | Self::OnDeactivate | Self::OnConfigurationChange => 0,
            Self::ExecuteCommand
            | Self::MessageWillBePosted
            | Self::MessageHasBeenPosted
            | Self::ChannelHasBeenCreated
            | Self::UserHasLoggedIn => 1,
            Self::MessageWillBeUpdated
            | Self::MessageHasBeenUpdated
            | Self::UserHasJoinedChannel
            | Self::UserHasLeftChannel => 2,
        }
    }

    /// Lowest negotiated protocol version that may receive this hook.
    pub const fn min_protocol_version(self) -> u32 {
        match self {
            Self::ChannelHasBeenCreated | Self::UserHasLoggedIn => 2,
            _ => 1,
        }
    }

    /// Host-side event that triggers the hook.
    pub const fn origin(self) -> &'static str {
        match self {
            Self::OnActivate => "plugin activated",
            Self::OnDeactivate => "plugin deactivated",
            Self::OnConfigurationChange => "host configuration changed",
            Self::ExecuteCommand => "slash command invoked",
            Self::MessageWillBePosted => "post about to be created",
            Self::MessageWillBeUpdated => "post about to be edited",
            Self::MessageHasBeenPosted => "post created",
            Self::MessageHasBeenUpdated => "post edited",
            Self::ChannelHasBeenCreated => "channel created",
            Self::UserHasJoinedChannel => "user joined channel",
            Self::UserHasLeftChannel => "user left channel",
            Self::UserHasLoggedIn => "user logged in",
        }
    }

    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            Self::OnActivate | Self::OnDeactivate | Self::OnConfigurationChange
        )
    }
}

/// Hooks one activated plugin may receive: what it advertised, limited to what
/// its negotiated protocol version allows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookSet {
    hooks: BTreeSet<Hook>,
    protocol_version: u32,
}

impl HookSet {
    /// Unknown tags are ignored.
    pub fn from_advertised<S: AsRef<str>>(tags: &[S], protocol_version: u32) -> Self {
        let hooks = tags
            .iter()
            .filter_map(|tag| Hook::from_tag(tag.as_ref()))
            .filter(|hook| hook.min_protocol_version() <= protocol_version)
            .collect();
        Self {
            hooks,
            protocol_version,
        }
    }

    pub fn contains(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn iter(&self) -> impl Iterator<Item = Hook> + '_ {
        self.hooks.iter().copied()
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.iter().map(Hook::as_tag).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Reply shape of `message_will_be_posted` and `message_will_be_updated`.
/// A null reply keeps the post unchanged.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PostDecision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

impl PostDecision {
    pub fn keep() -> Self {
        Self::default()
    }

    pub fn replace(post: Value) -> Self {
        Self {
            post: Some(post),
            rejection: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            post: None,
            rejection: Some(reason.into()),
        }
    }

    pub fn from_reply(reply: Value) -> Result<Self, String> {
        if reply.is_null() {
            return Ok(Self::keep());
        }
        serde_json::from_value(reply).map_err(|err| format!("invalid post decision: {err}"))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_round_trip_and_are_unique() {
        let mut seen = BTreeSet::new();
        for hook in Hook::ALL {
            assert_eq!(Hook::from_tag(hook.as_tag()), Some(hook));
            assert!(seen.insert(hook.as_tag()));
        }
        assert_eq!(Hook::from_tag("on_fire"), None);
    }

    #[test]
    fn lifecycle_hooks_are_requests_without_arguments() {
        for hook in Hook::ALL {
            if hook.is_lifecycle() {
                assert_eq!(hook.mode(), HookMode::Request);
                assert_eq!(hook.arity(), 0);
            }
        }
        assert_eq!(Hook::MessageHasBeenPosted.mode(), HookMode::Notify);
        assert_eq!(Hook::MessageWillBeUpdated.arity(), 2);
    }

    #[test]
    fn hook_set_drops_unknown_and_too_new_hooks() {
        let tags = ["on_activate", "user_has_logged_in", "not_a_hook", "message_has_been_posted"];

        let v1 = HookSet::from_advertised(&tags, 1);
        assert!(v1.contains(Hook::OnActivate));
        assert!(v1.contains(Hook::MessageHasBeenPosted));
        assert!(!v1.contains(Hook::UserHasLoggedIn));
        assert_eq!(v1.len(), 2);

        let v2 = HookSet::from_advertised(&tags, 2);
        assert!(v2.contains(Hook::UserHasLoggedIn));
        assert_eq!(v2.protocol_version(), 2);
    }

    #[test]
    fn post_decision_reply_shapes() {
        assert_eq!(PostDecision::from_reply(Value::Null).unwrap(), PostDecision::keep());

        let rejected = PostDecision::from_reply(json!({ "rejection": "spam" })).unwrap();
        assert_eq!(rejected.rejection(), Some("spam"));

        let blank = PostDecision::from_reply(json!({ "rejection": "  " })).unwrap();
        assert_eq!(blank.rejection(), None);

        let replaced = PostDecision::replace(json!({ "message": "hi" }));
        assert_eq!(replaced.to_value(), json!({ "post": { "message": "hi" } }));
        assert!(PostDecision::from_reply(json!(5)).is_err());
    }
}
