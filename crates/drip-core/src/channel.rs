use serde::{Deserialize, Serialize};

/// Delivery channel for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    /// Metered channels consume account credits per send.
    pub fn is_metered(self) -> bool {
        matches!(self, Channel::Sms)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            _ => None,
        }
    }
}

/// A message after template rendering, ready for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
    pub sender: String,
}

/// Classification of a failed send. Adapters only ever produce
/// `Transient` or `Permanent`; `Quota` is assigned by the scheduler when
/// an account runs out of credits, and such rows stay resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
    Quota,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Quota => "quota",
        }
    }
}

/// A classified send failure returned by a channel adapter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} send failure: {reason}")]
pub struct SendFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl SendFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            reason: reason.into(),
        }
    }
}
