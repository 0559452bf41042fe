//! Message-channel integration.
//!
//! Channels are discovered by a shared name prefix; a fixed suffix set maps
//! each channel to a role. The concrete backend lives behind [`ChannelApi`];
//! the in-tree binding is an in-memory implementation used by tests and by
//! single-host deployments that feed messages over the filesystem.
//!
//! The identity protocol: every outbound message is signed with the sending
//! agent's display name, and inbound messages signed by any of our own
//! names are skipped, so two pipelines sharing a channel never feed on each
//! other's output.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::workitem::WorkItemKind;

/// Channel roles, keyed by name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Defects,
    Features,
    Questions,
    Notifications,
    Reports,
}

impl ChannelRole {
    pub const ALL: [ChannelRole; 5] = [
        Self::Defects,
        Self::Features,
        Self::Questions,
        Self::Notifications,
        Self::Reports,
    ];

    /// The fixed suffix identifying this role.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Defects => "-defects",
            Self::Features => "-features",
            Self::Questions => "-questions",
            Self::Notifications => "-notifications",
            Self::Reports => "-reports",
        }
    }

    /// Map a channel name to its role, given the project prefix.
    pub fn for_channel(prefix: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?;
        Self::ALL.into_iter().find(|role| rest == role.suffix())
    }
}

/// A discovered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

/// One inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel_id: String,
    /// Backend timestamp, also the polling cursor.
    pub ts: String,
    pub user: Option<String>,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel backend error: {0}")]
    Backend(String),
}

/// Abstract channel backend.
#[async_trait]
pub trait ChannelApi: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>, ChannelError>;
    /// Messages strictly after `since` (all messages when `None`).
    async fn poll(&self, channel_id: &str, since: Option<&str>)
        -> Result<Vec<Message>, ChannelError>;
    async fn post(&self, channel_id: &str, text: &str) -> Result<(), ChannelError>;
    async fn save_cursor(&self, channel_id: &str, ts: &str) -> Result<(), ChannelError>;
    async fn load_cursor(&self, channel_id: &str) -> Result<Option<String>, ChannelError>;
}

/// Role-to-channel mapping discovered at startup.
#[derive(Debug, Default, Clone)]
pub struct ChannelSet {
    by_role: HashMap<ChannelRole, Channel>,
}

impl ChannelSet {
    /// Discover the project's channels by name prefix.
    pub async fn discover(api: &dyn ChannelApi, prefix: &str) -> Result<Self, ChannelError> {
        let mut by_role = HashMap::new();
        for channel in api.list_channels().await? {
            if let Some(role) = ChannelRole::for_channel(prefix, &channel.name) {
                tracing::info!(channel = %channel.name, role = ?role, "discovered channel");
                by_role.insert(role, channel);
            }
        }
        Ok(Self { by_role })
    }

    pub fn get(&self, role: ChannelRole) -> Option<&Channel> {
        self.by_role.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelRole, &Channel)> {
        self.by_role.iter().map(|(role, ch)| (*role, ch))
    }
}

/// The local agent identity: the display names we sign with and filter on.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Name used to sign outbound messages.
    pub primary: String,
    /// All names considered "ours" for the self-loop filter.
    pub display_names: Vec<String>,
}

impl Identity {
    pub fn new(primary: impl Into<String>) -> Self {
        let primary = primary.into();
        Self {
            display_names: vec![primary.clone()],
            primary,
        }
    }

    /// Sign an outbound message.
    pub fn sign(&self, text: &str) -> String {
        format!("{text}\n\n-- {}", self.primary)
    }

    /// Whether a message carries one of our own signatures.
    pub fn is_own(&self, text: &str) -> bool {
        let tail = text.trim_end();
        self.display_names
            .iter()
            .any(|name| tail.ends_with(&format!("-- {name}")))
    }

    /// Whether the message opens by addressing some other agent (`@name`).
    pub fn addresses_other_agent(&self, text: &str) -> bool {
        let Some(first) = text.trim_start().split_whitespace().next() else {
            return false;
        };
        let Some(mention) = first.strip_prefix('@') else {
            return false;
        };
        !self
            .display_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(mention))
    }
}

/// Control verbs accepted on the notifications channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerb {
    Stop,
    Pause,
    Status,
}

impl std::str::FromStr for ControlVerb {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "pause" => Ok(Self::Pause),
            "status" => Ok(Self::Status),
            _ => Err(()),
        }
    }
}

/// What an inbound message asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// Create a new work item from this text.
    NewWorkItem { kind: WorkItemKind, text: String },
    Control(ControlVerb),
    Question { text: String },
    Ignore,
}

/// Route one inbound message by its source channel's role.
pub fn route(role: ChannelRole, message: &Message, identity: &Identity) -> InboundAction {
    if identity.is_own(&message.text) {
        tracing::debug!(ts = %message.ts, "skipping our own message");
        return InboundAction::Ignore;
    }
    if identity.addresses_other_agent(&message.text) {
        tracing::debug!(ts = %message.ts, "message addresses another agent");
        return InboundAction::Ignore;
    }

    match role {
        ChannelRole::Defects => InboundAction::NewWorkItem {
            kind: WorkItemKind::Defect,
            text: message.text.clone(),
        },
        ChannelRole::Features => InboundAction::NewWorkItem {
            kind: WorkItemKind::Feature,
            text: message.text.clone(),
        },
        ChannelRole::Questions => InboundAction::Question {
            text: message.text.clone(),
        },
        ChannelRole::Notifications => match message.text.split_whitespace().next() {
            Some(word) => word
                .parse::<ControlVerb>()
                .map(InboundAction::Control)
                .unwrap_or(InboundAction::Ignore),
            None => InboundAction::Ignore,
        },
        // The reports channel is outbound-only.
        ChannelRole::Reports => InboundAction::Ignore,
    }
}

pub mod memory;

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> Message {
        Message {
            channel_id: "C1".to_owned(),
            ts: "1722340000.000100".to_owned(),
            user: Some("U1".to_owned()),
            text: text.to_owned(),
        }
    }

    #[test]
    fn suffixes_map_to_roles() {
        assert_eq!(
            ChannelRole::for_channel("acme", "acme-defects"),
            Some(ChannelRole::Defects)
        );
        assert_eq!(
            ChannelRole::for_channel("acme", "acme-notifications"),
            Some(ChannelRole::Notifications)
        );
        assert_eq!(ChannelRole::for_channel("acme", "other-defects"), None);
        assert_eq!(ChannelRole::for_channel("acme", "acme-random"), None);
    }

    #[test]
    fn own_signature_is_filtered() {
        let identity = Identity::new("acme-pipeline");
        let signed = identity.sign("plan finished");
        assert!(identity.is_own(&signed));
        assert_eq!(
            route(ChannelRole::Defects, &msg(&signed), &identity),
            InboundAction::Ignore
        );
    }

    #[test]
    fn peer_signature_is_not_ours() {
        let mut identity = Identity::new("acme-pipeline");
        identity.display_names.push("acme-reporter".to_owned());
        assert!(identity.is_own("done\n\n-- acme-reporter"));
        assert!(!identity.is_own("done\n\n-- beta-pipeline"));
    }

    #[test]
    fn messages_for_other_agents_are_skipped() {
        let identity = Identity::new("acme-pipeline");
        let action = route(
            ChannelRole::Defects,
            &msg("@beta-pipeline please look at the login crash"),
            &identity,
        );
        assert_eq!(action, InboundAction::Ignore);

        // Addressing us by name goes through.
        let action = route(
            ChannelRole::Defects,
            &msg("@acme-pipeline the login page crashes"),
            &identity,
        );
        assert!(matches!(action, InboundAction::NewWorkItem { kind: WorkItemKind::Defect, .. }));
    }

    #[test]
    fn notifications_channel_parses_control_verbs() {
        let identity = Identity::new("acme-pipeline");
        for (text, verb) in [
            ("stop", ControlVerb::Stop),
            ("Pause please", ControlVerb::Pause),
            ("STATUS", ControlVerb::Status),
        ] {
            assert_eq!(
                route(ChannelRole::Notifications, &msg(text), &identity),
                InboundAction::Control(verb)
            );
        }
        assert_eq!(
            route(ChannelRole::Notifications, &msg("hello there"), &identity),
            InboundAction::Ignore
        );
    }

    #[test]
    fn questions_route_to_answering() {
        let identity = Identity::new("acme-pipeline");
        assert_eq!(
            route(ChannelRole::Questions, &msg("what is the pipeline doing?"), &identity),
            InboundAction::Question {
                text: "what is the pipeline doing?".to_owned()
            }
        );
    }
}
