use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Contact subscription state. Only ACTIVE contacts are eligible
/// recipients; the pipeline flips contacts out of ACTIVE on unsubscribe
/// or bounce feedback and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Active,
    Unsubscribed,
    Bounced,
    Suppressed,
}

impl ContactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactStatus::Active => "active",
            ContactStatus::Unsubscribed => "unsubscribed",
            ContactStatus::Bounced => "bounced",
            ContactStatus::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ContactStatus::Active),
            "unsubscribed" => Some(ContactStatus::Unsubscribed),
            "bounced" => Some(ContactStatus::Bounced),
            "suppressed" => Some(ContactStatus::Suppressed),
            _ => None,
        }
    }
}

/// Read-only view of a contact that segment rules evaluate against.
/// Order and engagement aggregates are precomputed; the evaluator never
/// touches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub id: i64,
    pub status: ContactStatus,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub tags: Vec<String>,
    pub total_spent: f64,
    pub total_orders: i64,
    pub days_since_last_order: Option<i64>,
    pub emails_sent: i64,
    pub emails_opened: i64,
    pub emails_clicked: i64,
    /// Free-form attributes, addressed by rules as `custom.<key>`.
    #[serde(default)]
    pub custom: serde_json::Map<String, Value>,
}

impl ContactSnapshot {
    /// A blank active snapshot, handy as a test fixture base.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            status: ContactStatus::Active,
            email: None,
            phone: None,
            tags: Vec::new(),
            total_spent: 0.0,
            total_orders: 0,
            days_since_last_order: None,
            emails_sent: 0,
            emails_opened: 0,
            emails_clicked: 0,
            custom: serde_json::Map::new(),
        }
    }
}
