use drip_core::FailureKind;

/// Progress notifications from the scheduler, consumed by the binary for
/// logging. Delivery of an event is best-effort; the ledger is the
/// source of truth.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CampaignQueued { campaign_id: i64, recipients: u64 },
    CampaignScheduled { campaign_id: i64, run_at: i64 },
    RecipientSent { campaign_id: i64, contact_id: i64, message_id: String },
    RecipientFailed { campaign_id: i64, contact_id: i64, kind: FailureKind, reason: String },
    QuotaExhausted { campaign_id: i64, account_id: String },
    CampaignCancelled { campaign_id: i64, cancelled: u64 },
    CampaignCompleted { campaign_id: i64, sent: i64, failed: i64 },
}
