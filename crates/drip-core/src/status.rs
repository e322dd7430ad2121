use serde::{Deserialize, Serialize};

/// Campaign lifecycle. Transitions only move forward and only the
/// scheduler writes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "sending" => Some(CampaignStatus::Sending),
            "sent" => Some(CampaignStatus::Sent),
            "failed" => Some(CampaignStatus::Failed),
            _ => None,
        }
    }

    /// DRAFT -> {SCHEDULED -> SENDING} | SENDING -> SENT|FAILED.
    /// A scheduled campaign may also fail directly when cancelled before
    /// dispatch ever starts.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled) | (Draft, Sending) | (Scheduled, Sending) | (Scheduled, Failed)
                | (Sending, Sent)
                | (Sending, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Sent | CampaignStatus::Failed)
    }
}

/// Per-recipient delivery state, the unit of truth of the ledger.
///
/// The happy path is PENDING -> QUEUED -> SENT -> DELIVERED, with OPENED
/// and CLICKED layered on top as the recipient engages. BOUNCED is the
/// provider-reported alternative to DELIVERED. FAILED and CANCELLED are
/// terminal outcomes written by the scheduler, never by webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Bounced,
    Opened,
    Clicked,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Opened => "opened",
            DeliveryStatus::Clicked => "clicked",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "queued" => Some(DeliveryStatus::Queued),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "bounced" => Some(DeliveryStatus::Bounced),
            "opened" => Some(DeliveryStatus::Opened),
            "clicked" => Some(DeliveryStatus::Clicked),
            "failed" => Some(DeliveryStatus::Failed),
            "cancelled" => Some(DeliveryStatus::Cancelled),
            _ => None,
        }
    }

    /// Ordering of the forward path. DELIVERED and BOUNCED share a rank:
    /// they are alternative outcomes, not steps of each other.
    pub fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Queued => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Delivered | DeliveryStatus::Bounced => 3,
            DeliveryStatus::Opened => 4,
            DeliveryStatus::Clicked => 5,
            // Terminal failures sit outside the forward path; see
            // `can_advance_to`.
            DeliveryStatus::Failed | DeliveryStatus::Cancelled => 6,
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, DeliveryStatus::Failed | DeliveryStatus::Cancelled)
    }

    /// The recipient reached the provider at least once.
    pub fn counts_as_sent(self) -> bool {
        self.rank() >= DeliveryStatus::Sent.rank() && !self.is_terminal_failure()
    }

    /// Monotonic advance check. Duplicate or out-of-order signals (a
    /// webhook reporting SENT after DELIVERED) are rejected here and
    /// treated as no-ops by callers.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        match next {
            DeliveryStatus::Failed => matches!(
                self,
                DeliveryStatus::Pending | DeliveryStatus::Queued | DeliveryStatus::Sent
            ),
            DeliveryStatus::Cancelled => {
                matches!(self, DeliveryStatus::Pending | DeliveryStatus::Queued)
            }
            _ => !self.is_terminal_failure() && next.rank() > self.rank(),
        }
    }

    /// Statuses a row may hold *before* legally advancing to `next`.
    /// Used to build rank guards in SQL updates.
    pub fn advance_sources(next: DeliveryStatus) -> Vec<DeliveryStatus> {
        ALL.iter()
            .copied()
            .filter(|s| s.can_advance_to(next))
            .collect()
    }
}

const ALL: [DeliveryStatus; 9] = [
    DeliveryStatus::Pending,
    DeliveryStatus::Queued,
    DeliveryStatus::Sent,
    DeliveryStatus::Delivered,
    DeliveryStatus::Bounced,
    DeliveryStatus::Opened,
    DeliveryStatus::Clicked,
    DeliveryStatus::Failed,
    DeliveryStatus::Cancelled,
];
