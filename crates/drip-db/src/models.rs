use serde::{Deserialize, Serialize};

use drip_core::{
    CampaignStatus, Channel, ConditionNode, ContactSnapshot, ContactStatus, DeliveryStatus,
};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Contact {
    pub id: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    /// JSON array of tag strings.
    pub tags: String,
    pub total_spent: f64,
    pub total_orders: i64,
    pub last_order_at: Option<i64>,
    pub emails_sent: i64,
    pub emails_opened: i64,
    pub emails_clicked: i64,
    pub custom_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Contact {
    pub fn status(&self) -> ContactStatus {
        ContactStatus::parse(&self.status).unwrap_or(ContactStatus::Suppressed)
    }

    /// Materialize the snapshot the rule evaluator runs against.
    pub fn snapshot(&self, now: i64) -> ContactSnapshot {
        let tags: Vec<String> = serde_json::from_str(&self.tags).unwrap_or_default();
        let custom = self
            .custom_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        ContactSnapshot {
            id: self.id,
            status: self.status(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            tags,
            total_spent: self.total_spent,
            total_orders: self.total_orders,
            days_since_last_order: self
                .last_order_at
                .map(|t| (now - t).max(0) / SECS_PER_DAY),
            emails_sent: self.emails_sent,
            emails_opened: self.emails_opened,
            emails_clicked: self.emails_clicked,
            custom,
        }
    }
}

/// Insert payload for contacts, used by seeding and tests.
#[derive(Debug, Clone, Default)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: Option<ContactStatus>,
    pub tags: Vec<String>,
    pub total_spent: f64,
    pub total_orders: i64,
    pub last_order_at: Option<i64>,
    pub custom_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Segment {
    pub id: i64,
    pub name: String,
    /// Condition tree, stored as JSON text and parsed on load.
    pub conditions: String,
    pub auto_update: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Segment {
    pub fn tree(&self) -> Result<ConditionNode, serde_json::Error> {
        serde_json::from_str(&self.conditions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub account_id: String,
    pub name: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub sender: String,
    pub status: String,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Campaign {
    pub fn channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }

    pub fn status(&self) -> Option<CampaignStatus> {
        CampaignStatus::parse(&self.status)
    }
}

/// One ledger row: the (campaign, contact) delivery unit.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CampaignRecipient {
    pub id: i64,
    pub campaign_id: i64,
    pub contact_id: i64,
    pub status: String,
    pub attempts: i64,
    pub message_id: Option<String>,
    pub provider_id: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_reason: Option<String>,
    pub queued_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub opened_at: Option<i64>,
    pub clicked_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub created_at: i64,
}

impl CampaignRecipient {
    pub fn status(&self) -> Option<DeliveryStatus> {
        DeliveryStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrackingRecord {
    pub id: i64,
    pub message_id: String,
    pub campaign_id: i64,
    pub contact_id: i64,
    pub open_count: i64,
    pub click_count: i64,
    pub first_open_at: Option<i64>,
    pub first_click_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ShortLink {
    pub id: i64,
    pub token: String,
    pub url: String,
    pub campaign_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LinkClick {
    pub id: i64,
    pub token: Option<String>,
    pub message_id: Option<String>,
    pub url: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub referer: Option<String>,
    pub clicked_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContactSession {
    pub id: i64,
    pub session_id: String,
    pub contact_id: Option<i64>,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionEvent {
    pub id: i64,
    pub event_id: String,
    pub session_id: String,
    pub event_type: String,
    pub event_data: Option<String>,
    pub page_url: Option<String>,
    pub created_at: i64,
}
