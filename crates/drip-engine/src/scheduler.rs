//! Delivery scheduler: fans a campaign out into ledger rows and drives
//! them to a terminal state with a bounded worker pool.
//!
//! The ledger table is the queue of record. Workers claim PENDING rows
//! through a compare-and-swap update, so a recipient is dispatched by
//! exactly one worker; retries happen in-process while the claim is
//! held. Cancellation is cooperative: a flag consulted before every new
//! dispatch, never an interrupt of an adapter call in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use drip_core::{CampaignStatus, Channel, FailureKind, RenderedMessage, SendFailure, SendSpec};
use drip_db::{Campaign, CampaignRecipient, DbError, DripDb};

use crate::adapter::ChannelAdapter;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::resolver::AudienceResolver;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub batch_size: i64,
    pub adapter_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 16,
            adapter_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a submitted send request.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub campaign_id: i64,
    pub recipients: u64,
    pub scheduled: bool,
}

pub struct DeliveryScheduler {
    db: Arc<DripDb>,
    resolver: AudienceResolver,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    config: SchedulerConfig,
    cancelled: Mutex<HashSet<i64>>,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl DeliveryScheduler {
    pub fn new(
        db: Arc<DripDb>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        config: SchedulerConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);
        let adapters = adapters
            .into_iter()
            .map(|a| (a.channel(), a))
            .collect();
        Self {
            resolver: AudienceResolver::new(db.clone()),
            db,
            adapters,
            config,
            cancelled: Mutex::new(HashSet::new()),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.event_rx.take()
    }

    pub fn db(&self) -> &Arc<DripDb> {
        &self.db
    }

    /// Resolve the audience and enqueue one ledger row per recipient.
    /// Resolution and quota problems surface here, before any job
    /// exists; re-submitting an already-sending campaign only re-runs
    /// the idempotent enqueue.
    pub async fn submit(&self, campaign_id: i64, spec: &SendSpec) -> Result<SubmitReceipt> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        let channel = campaign_channel(&campaign)?;
        if !self.adapters.contains_key(&channel) {
            return Err(EngineError::NoAdapter(channel));
        }

        let audience = self.resolver.resolve(spec).await?;
        self.db.enqueue_recipients(campaign_id, &audience).await?;

        let now = chrono::Utc::now().timestamp();
        if let Some(run_at) = spec.scheduled_at.filter(|t| *t > now) {
            self.db.set_campaign_schedule(campaign_id, run_at).await?;
            if campaign.status() != Some(CampaignStatus::Scheduled) {
                self.db
                    .update_campaign_status(campaign_id, CampaignStatus::Scheduled)
                    .await?;
            }
            self.emit(EngineEvent::CampaignScheduled { campaign_id, run_at }).await;
            return Ok(SubmitReceipt {
                campaign_id,
                recipients: audience.len() as u64,
                scheduled: true,
            });
        }

        if campaign.status() != Some(CampaignStatus::Sending) {
            self.db
                .update_campaign_status(campaign_id, CampaignStatus::Sending)
                .await?;
        }
        self.emit(EngineEvent::CampaignQueued {
            campaign_id,
            recipients: audience.len() as u64,
        })
        .await;
        Ok(SubmitReceipt {
            campaign_id,
            recipients: audience.len() as u64,
            scheduled: false,
        })
    }

    /// Drive every open ledger row of the campaign to a terminal or
    /// engaged state, then settle the campaign status.
    pub async fn dispatch(self: &Arc<Self>, campaign_id: i64) -> Result<()> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        let channel = campaign_channel(&campaign)?;
        let adapter = self
            .adapters
            .get(&channel)
            .cloned()
            .ok_or(EngineError::NoAdapter(channel))?;

        let quota_flagged = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(self.config.worker_count);
        for _ in 0..self.config.worker_count.max(1) {
            let this = Arc::clone(self);
            let campaign = campaign.clone();
            let adapter = adapter.clone();
            let quota_flagged = quota_flagged.clone();
            workers.push(tokio::spawn(async move {
                this.work_loop(&campaign, channel, adapter, &quota_flagged).await;
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }

        self.finalize(campaign_id).await
    }

    async fn work_loop(
        &self,
        campaign: &Campaign,
        channel: Channel,
        adapter: Arc<dyn ChannelAdapter>,
        quota_flagged: &AtomicBool,
    ) {
        loop {
            if self.is_cancelled(campaign.id) {
                break;
            }
            let batch = match self.db.claim_batch(campaign.id, self.config.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(campaign_id = campaign.id, error = %e, "claim failed");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            for row in batch {
                // Cooperative cancel: undispatched claims are handed
                // back by the worker that owns them. The guarded update
                // cannot touch a row whose adapter call is in flight.
                if self.is_cancelled(campaign.id) {
                    if let Err(e) = self.db.cancel_claimed(row.id).await {
                        tracing::error!(
                            campaign_id = campaign.id,
                            recipient_id = row.id,
                            error = %e,
                            "claim handback failed"
                        );
                    }
                    continue;
                }
                if let Err(e) = self
                    .deliver_one(campaign, channel, adapter.as_ref(), &row, quota_flagged)
                    .await
                {
                    tracing::error!(
                        campaign_id = campaign.id,
                        recipient_id = row.id,
                        error = %e,
                        "recipient dispatch failed"
                    );
                }
            }
        }
    }

    async fn deliver_one(
        &self,
        campaign: &Campaign,
        channel: Channel,
        adapter: &dyn ChannelAdapter,
        row: &CampaignRecipient,
        quota_flagged: &AtomicBool,
    ) -> Result<()> {
        let contact = self.db.get_contact(row.contact_id).await?;
        let Some(address) = address_for(channel, &contact) else {
            self.db
                .mark_recipient_failed(row.id, FailureKind::Permanent, "missing destination address")
                .await?;
            self.emit(EngineEvent::RecipientFailed {
                campaign_id: campaign.id,
                contact_id: row.contact_id,
                kind: FailureKind::Permanent,
                reason: "missing destination address".into(),
            })
            .await;
            return Ok(());
        };

        // Metered channels pay before they play: the compare-and-
        // decrement either reserves a credit or fails this row with the
        // distinct quota reason, leaving it resumable.
        let mut debited = false;
        if channel.is_metered() {
            match self.db.try_debit(&campaign.account_id, channel).await {
                Ok(()) => debited = true,
                Err(DbError::InsufficientBalance { .. }) => {
                    self.db.mark_recipient_quota_failed(row.id).await?;
                    if !quota_flagged.swap(true, Ordering::SeqCst) {
                        self.emit(EngineEvent::QuotaExhausted {
                            campaign_id: campaign.id,
                            account_id: campaign.account_id.clone(),
                        })
                        .await;
                    }
                    self.emit(EngineEvent::RecipientFailed {
                        campaign_id: campaign.id,
                        contact_id: row.contact_id,
                        kind: FailureKind::Permanent,
                        reason: "insufficient balance".into(),
                    })
                    .await;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let message = RenderedMessage {
            subject: campaign.subject.clone(),
            body: campaign.body.clone(),
            sender: campaign.sender.clone(),
        };

        let mut attempt = 0u32;
        let failure = loop {
            attempt += 1;
            self.db.record_attempt(row.id).await?;

            let outcome = match tokio::time::timeout(
                self.config.adapter_timeout,
                adapter.send(&address, &message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SendFailure::transient("provider call timed out")),
            };

            match outcome {
                Ok(provider_id) => {
                    let message_id = Uuid::new_v4().simple().to_string();
                    let recorded = self
                        .db
                        .mark_recipient_sent(row.id, campaign.id, row.contact_id, &message_id, &provider_id)
                        .await?;
                    if !recorded {
                        // The row is no longer ours to complete. No
                        // tracking record, no event.
                        tracing::warn!(
                            campaign_id = campaign.id,
                            recipient_id = row.id,
                            "send finished but the claim was gone; not recorded"
                        );
                        return Ok(());
                    }
                    if channel == Channel::Email {
                        self.db.bump_contact_email_counts(row.contact_id, 1, 0, 0).await?;
                    }
                    self.emit(EngineEvent::RecipientSent {
                        campaign_id: campaign.id,
                        contact_id: row.contact_id,
                        message_id,
                    })
                    .await;
                    return Ok(());
                }
                Err(f)
                    if f.kind == FailureKind::Transient
                        && self.config.retry.should_retry(attempt) =>
                {
                    tracing::warn!(
                        campaign_id = campaign.id,
                        recipient_id = row.id,
                        attempt,
                        reason = %f.reason,
                        "transient send failure, backing off"
                    );
                    tokio::time::sleep(self.config.retry.delay_after(attempt)).await;
                }
                Err(f) => break f,
            }
        };

        // Out of attempts or permanently rejected.
        let reason = if failure.kind == FailureKind::Transient {
            format!("{} (retries exhausted)", failure.reason)
        } else {
            failure.reason.clone()
        };
        self.db
            .mark_recipient_failed(row.id, failure.kind, &reason)
            .await?;
        if debited {
            // The reserved credit was never spent on a delivery.
            self.db.credit(&campaign.account_id, channel, 1).await?;
        }
        self.emit(EngineEvent::RecipientFailed {
            campaign_id: campaign.id,
            contact_id: row.contact_id,
            kind: failure.kind,
            reason,
        })
        .await;
        Ok(())
    }

    /// Settle the campaign once the pool drains. A campaign with failed
    /// recipients still counts as SENT as long as anybody got through;
    /// FAILED means nobody did.
    async fn finalize(&self, campaign_id: i64) -> Result<()> {
        self.clear_cancel(campaign_id);
        let campaign = self.db.get_campaign(campaign_id).await?;
        if campaign.status() != Some(CampaignStatus::Sending) {
            // Resume runs against an already-settled campaign land here.
            return Ok(());
        }
        let stats = self.db.campaign_stats(campaign_id).await?;
        let next = if stats.sent > 0 {
            CampaignStatus::Sent
        } else {
            CampaignStatus::Failed
        };
        self.db.update_campaign_status(campaign_id, next).await?;
        self.emit(EngineEvent::CampaignCompleted {
            campaign_id,
            sent: stats.sent,
            failed: stats.failed + stats.cancelled + stats.bounced,
        })
        .await;
        Ok(())
    }

    /// Promote SCHEDULED campaigns whose time has come. Returns the ids
    /// now in SENDING; the caller decides how to run their dispatch.
    pub async fn promote_due(&self) -> Result<Vec<i64>> {
        let now = chrono::Utc::now().timestamp();
        let mut promoted = Vec::new();
        for campaign in self.db.due_scheduled(now).await? {
            match self
                .db
                .update_campaign_status(campaign.id, CampaignStatus::Sending)
                .await
            {
                Ok(()) => {
                    let recipients = self.db.open_ledger_rows(campaign.id).await? as u64;
                    self.emit(EngineEvent::CampaignQueued {
                        campaign_id: campaign.id,
                        recipients,
                    })
                    .await;
                    promoted.push(campaign.id);
                }
                Err(e) => {
                    tracing::warn!(campaign_id = campaign.id, error = %e, "promotion lost the race");
                }
            }
        }
        Ok(promoted)
    }

    /// Cancel a SCHEDULED or SENDING campaign: no new dispatch, pending
    /// rows flip to CANCELLED, in-flight sends complete untouched.
    pub async fn cancel(&self, campaign_id: i64) -> Result<u64> {
        let campaign = self.db.get_campaign(campaign_id).await?;
        match campaign.status() {
            Some(CampaignStatus::Scheduled) => {
                self.mark_cancelled(campaign_id);
                let cancelled = self.db.cancel_pending(campaign_id).await?;
                self.db
                    .update_campaign_status(campaign_id, CampaignStatus::Failed)
                    .await?;
                self.clear_cancel(campaign_id);
                self.emit(EngineEvent::CampaignCancelled { campaign_id, cancelled }).await;
                Ok(cancelled)
            }
            Some(CampaignStatus::Sending) => {
                self.mark_cancelled(campaign_id);
                let cancelled = self.db.cancel_pending(campaign_id).await?;
                self.emit(EngineEvent::CampaignCancelled { campaign_id, cancelled }).await;
                Ok(cancelled)
            }
            _ => Err(EngineError::NotCancellable {
                campaign_id,
                status: campaign.status,
            }),
        }
    }

    /// Give quota-starved rows another shot after a balance top-up.
    /// Returns how many rows went back to PENDING; the caller re-runs
    /// dispatch when the count is non-zero.
    pub async fn resume_quota_failures(&self, campaign_id: i64) -> Result<u64> {
        Ok(self.db.release_quota_failures(campaign_id).await?)
    }

    fn is_cancelled(&self, campaign_id: i64) -> bool {
        self.cancelled
            .lock()
            .expect("cancel set lock")
            .contains(&campaign_id)
    }

    fn mark_cancelled(&self, campaign_id: i64) {
        self.cancelled
            .lock()
            .expect("cancel set lock")
            .insert(campaign_id);
    }

    fn clear_cancel(&self, campaign_id: i64) {
        self.cancelled
            .lock()
            .expect("cancel set lock")
            .remove(&campaign_id);
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

fn campaign_channel(campaign: &Campaign) -> Result<Channel> {
    campaign.channel().ok_or_else(|| EngineError::UnknownChannel {
        campaign_id: campaign.id,
        channel: campaign.channel.clone(),
    })
}

fn address_for(channel: Channel, contact: &drip_db::Contact) -> Option<String> {
    match channel {
        Channel::Email => contact.email.clone(),
        Channel::Sms => contact.phone.clone(),
        Channel::Push => contact
            .custom_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|v| v.get("push_token").and_then(|t| t.as_str()).map(String::from)),
    }
}
