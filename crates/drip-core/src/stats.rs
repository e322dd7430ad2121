use serde::{Deserialize, Serialize};

/// Read-side aggregate over the ledger for one campaign. Rates are 0.0
/// whenever the denominator is zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub total: i64,
    pub sent: i64,
    pub delivered: i64,
    pub opened: i64,
    pub clicked: i64,
    pub bounced: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub pending: i64,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
}

impl CampaignStats {
    #[allow(clippy::too_many_arguments)]
    pub fn from_counts(
        total: i64,
        sent: i64,
        delivered: i64,
        opened: i64,
        clicked: i64,
        bounced: i64,
        failed: i64,
        cancelled: i64,
        pending: i64,
    ) -> Self {
        Self {
            total,
            sent,
            delivered,
            opened,
            clicked,
            bounced,
            failed,
            cancelled,
            pending,
            delivery_rate: ratio(delivered, total),
            open_rate: ratio(opened, sent),
            click_rate: ratio(clicked, sent),
        }
    }
}

fn ratio(num: i64, den: i64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
