use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};

use drip_core::{CampaignStats, CampaignStatus, ContactStatus, DeliveryStatus, FailureKind};

use crate::error::{DbError, Result};
use crate::models::{
    Campaign, CampaignRecipient, Contact, ContactSession, LinkClick, NewContact, Segment,
    SessionEvent, ShortLink, TrackingRecord,
};
use crate::schema::SCHEMA;

/// Failure reason recorded for quota-starved sends. Rows carrying it can
/// be released back to PENDING once the balance is topped up.
pub(crate) const QUOTA_REASON: &str = "insufficient balance";

pub struct DripDb {
    pool: Pool<Sqlite>,
}

impl DripDb {
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path);
        let pool = SqlitePool::connect(&db_url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        tracing::info!(path, "database initialized");
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every
    /// handle on the same store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    // ---- contacts ----

    pub async fn insert_contact(&self, new: &NewContact) -> Result<Contact> {
        let now = unix_now();
        let tags = serde_json::to_string(&new.tags).unwrap_or_else(|_| "[]".into());
        let status = new.status.unwrap_or(ContactStatus::Active);

        let id = sqlx::query(
            r#"INSERT INTO contacts
               (email, phone, status, tags, total_spent, total_orders, last_order_at, custom_json, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&new.email)
        .bind(&new.phone)
        .bind(status.as_str())
        .bind(tags)
        .bind(new.total_spent)
        .bind(new.total_orders)
        .bind(new.last_order_at)
        .bind(&new.custom_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_contact(id).await
    }

    pub async fn get_contact(&self, id: i64) -> Result<Contact> {
        sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::ContactNotFound(id))
    }

    pub async fn get_contacts_by_ids(&self, ids: &[i64]) -> Result<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM contacts WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, Contact>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn list_active_contacts(&self) -> Result<Vec<Contact>> {
        Ok(
            sqlx::query_as::<_, Contact>("SELECT * FROM contacts WHERE status = 'active' ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Status flips driven by unsubscribe/bounce feedback. The pipeline
    /// never mutates contacts otherwise.
    pub async fn set_contact_status(&self, id: i64, status: ContactStatus) -> Result<()> {
        sqlx::query("UPDATE contacts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(unix_now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_contact_email_counts(
        &self,
        id: i64,
        sent: i64,
        opened: i64,
        clicked: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE contacts SET
                 emails_sent = emails_sent + ?,
                 emails_opened = emails_opened + ?,
                 emails_clicked = emails_clicked + ?,
                 updated_at = ?
               WHERE id = ?"#,
        )
        .bind(sent)
        .bind(opened)
        .bind(clicked)
        .bind(unix_now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- segments ----

    pub async fn insert_segment(
        &self,
        name: &str,
        conditions: &drip_core::ConditionNode,
        auto_update: bool,
    ) -> Result<Segment> {
        let now = unix_now();
        let raw = serde_json::to_string(conditions)
            .map_err(|source| DbError::SegmentInvalid { id: 0, source })?;
        let id = sqlx::query(
            "INSERT INTO segments (name, conditions, auto_update, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(raw)
        .bind(auto_update)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_segment(id).await
    }

    pub async fn get_segment(&self, id: i64) -> Result<Segment> {
        sqlx::query_as::<_, Segment>("SELECT * FROM segments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::SegmentNotFound(id))
    }

    // ---- campaigns ----

    pub async fn create_campaign(
        &self,
        account_id: &str,
        name: &str,
        channel: drip_core::Channel,
        subject: Option<&str>,
        body: &str,
        sender: &str,
    ) -> Result<Campaign> {
        let now = unix_now();
        let id = sqlx::query(
            r#"INSERT INTO campaigns (account_id, name, channel, subject, body, sender, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(account_id)
        .bind(name)
        .bind(channel.as_str())
        .bind(subject)
        .bind(body)
        .bind(sender)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_campaign(id).await
    }

    pub async fn get_campaign(&self, id: i64) -> Result<Campaign> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DbError::CampaignNotFound(id))
    }

    /// Advance the campaign lifecycle. The guard on the current status
    /// makes the write race-safe: a concurrent transition loses and
    /// surfaces as `InvalidTransition`.
    pub async fn update_campaign_status(&self, id: i64, next: CampaignStatus) -> Result<()> {
        let current = self.get_campaign(id).await?;
        let from = current
            .status()
            .ok_or_else(|| DbError::InvalidTransition {
                campaign_id: id,
                from: current.status.clone(),
                to: next.as_str().into(),
            })?;
        if !from.can_transition_to(next) {
            return Err(DbError::InvalidTransition {
                campaign_id: id,
                from: from.as_str().into(),
                to: next.as_str().into(),
            });
        }
        let affected = sqlx::query("UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(next.as_str())
            .bind(unix_now())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(DbError::InvalidTransition {
                campaign_id: id,
                from: from.as_str().into(),
                to: next.as_str().into(),
            });
        }
        Ok(())
    }

    pub async fn set_campaign_schedule(&self, id: i64, run_at: i64) -> Result<()> {
        sqlx::query("UPDATE campaigns SET scheduled_at = ?, updated_at = ? WHERE id = ?")
            .bind(run_at)
            .bind(unix_now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// SCHEDULED campaigns whose dispatch time has elapsed.
    pub async fn due_scheduled(&self, now: i64) -> Result<Vec<Campaign>> {
        Ok(sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    // ---- delivery ledger ----

    /// Create one PENDING row per contact, skipping pairs that already
    /// exist. Repeated enqueues are no-ops: at most one row per
    /// (campaign, contact), ever.
    pub async fn enqueue_recipients(&self, campaign_id: i64, contact_ids: &[i64]) -> Result<u64> {
        let now = unix_now();
        let mut inserted = 0;
        for contact_id in contact_ids {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO campaign_contacts (campaign_id, contact_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(campaign_id)
            .bind(contact_id)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(inserted)
    }

    /// Claim up to `limit` PENDING rows for dispatch, flipping them to
    /// QUEUED in the same statement. The guarded UPDATE is the
    /// compare-and-swap: each row is handed to exactly one worker.
    pub async fn claim_batch(&self, campaign_id: i64, limit: i64) -> Result<Vec<CampaignRecipient>> {
        Ok(sqlx::query_as::<_, CampaignRecipient>(
            r#"UPDATE campaign_contacts
               SET status = 'queued', queued_at = ?
               WHERE id IN (
                   SELECT id FROM campaign_contacts
                   WHERE campaign_id = ? AND status = 'pending'
                   ORDER BY id
                   LIMIT ?
               )
               RETURNING *"#,
        )
        .bind(unix_now())
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn record_attempt(&self, recipient_id: i64) -> Result<()> {
        sqlx::query("UPDATE campaign_contacts SET attempts = attempts + 1 WHERE id = ?")
            .bind(recipient_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a successful provider handoff. Returns false when the row
    /// no longer holds its claim; in that case no tracking record is
    /// created and the caller must not report the send.
    pub async fn mark_recipient_sent(
        &self,
        recipient_id: i64,
        campaign_id: i64,
        contact_id: i64,
        message_id: &str,
        provider_id: &str,
    ) -> Result<bool> {
        let now = unix_now();
        let updated = sqlx::query(
            r#"UPDATE campaign_contacts
               SET status = 'sent', sent_at = ?, message_id = ?, provider_id = ?,
                   failure_kind = NULL, failure_reason = NULL
               WHERE id = ? AND status = 'queued'"#,
        )
        .bind(now)
        .bind(message_id)
        .bind(provider_id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"INSERT OR IGNORE INTO tracking_records (message_id, campaign_id, contact_id, created_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(message_id)
        .bind(campaign_id)
        .bind(contact_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    pub async fn mark_recipient_failed(
        &self,
        recipient_id: i64,
        kind: FailureKind,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE campaign_contacts
               SET status = 'failed', failed_at = ?, failure_kind = ?, failure_reason = ?
               WHERE id = ? AND status IN ('pending', 'queued', 'sent')"#,
        )
        .bind(unix_now())
        .bind(kind.as_str())
        .bind(reason)
        .bind(recipient_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Quota starvation is its own failure kind, not a permanent
    /// rejection: the rows stay resumable and reporting can tell the two
    /// apart structurally.
    pub async fn mark_recipient_quota_failed(&self, recipient_id: i64) -> Result<()> {
        self.mark_recipient_failed(recipient_id, FailureKind::Quota, QUOTA_REASON)
            .await
    }

    /// Rows that failed only for lack of credits become PENDING again,
    /// ready to resume after a top-up.
    pub async fn release_quota_failures(&self, campaign_id: i64) -> Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE campaign_contacts
               SET status = 'pending', failed_at = NULL, failure_kind = NULL, failure_reason = NULL
               WHERE campaign_id = ? AND status = 'failed' AND failure_kind = ?"#,
        )
        .bind(campaign_id)
        .bind(FailureKind::Quota.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    /// Stop every unclaimed row. Claimed rows belong to their worker:
    /// the one in flight completes to its own terminal state, the rest
    /// are handed back through `cancel_claimed`.
    pub async fn cancel_pending(&self, campaign_id: i64) -> Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE campaign_contacts
               SET status = 'cancelled', failed_at = ?, failure_kind = 'permanent', failure_reason = 'cancelled'
               WHERE campaign_id = ? AND status = 'pending'"#,
        )
        .bind(unix_now())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    /// Cancel one claimed-but-undispatched row. Only the worker holding
    /// the claim may call this, so the guard never races an adapter call.
    pub async fn cancel_claimed(&self, recipient_id: i64) -> Result<bool> {
        Ok(sqlx::query(
            r#"UPDATE campaign_contacts
               SET status = 'cancelled', failed_at = ?, failure_kind = 'permanent', failure_reason = 'cancelled'
               WHERE id = ? AND status = 'queued'"#,
        )
        .bind(unix_now())
        .bind(recipient_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0)
    }

    /// Rank-guarded engagement/status advance keyed by message id.
    /// Returns whether the row actually moved; duplicate or out-of-order
    /// signals fall through as no-ops.
    pub async fn apply_engagement(&self, message_id: &str, next: DeliveryStatus) -> Result<bool> {
        let sources = DeliveryStatus::advance_sources(next);
        if sources.is_empty() {
            return Ok(false);
        }
        let now = unix_now();
        let guard = sources
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let ts_column = match next {
            DeliveryStatus::Delivered => "delivered_at",
            DeliveryStatus::Opened => "opened_at",
            DeliveryStatus::Clicked => "clicked_at",
            DeliveryStatus::Bounced | DeliveryStatus::Failed | DeliveryStatus::Cancelled => {
                "failed_at"
            }
            DeliveryStatus::Sent => "sent_at",
            DeliveryStatus::Pending | DeliveryStatus::Queued => "queued_at",
        };
        let sql = format!(
            "UPDATE campaign_contacts SET status = ?, {ts_column} = COALESCE({ts_column}, ?) \
             WHERE message_id = ? AND status IN ({guard})"
        );
        let affected = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(now)
            .bind(message_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn recipient_by_message(&self, message_id: &str) -> Result<Option<CampaignRecipient>> {
        Ok(sqlx::query_as::<_, CampaignRecipient>(
            "SELECT * FROM campaign_contacts WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// The most recent ledger row for a recipient address, used to match
    /// provider webhooks that only carry the destination.
    pub async fn latest_recipient_for_address(
        &self,
        address: &str,
    ) -> Result<Option<CampaignRecipient>> {
        Ok(sqlx::query_as::<_, CampaignRecipient>(
            r#"SELECT cc.* FROM campaign_contacts cc
               JOIN contacts c ON c.id = cc.contact_id
               WHERE (c.email = ?1 OR c.phone = ?1) AND cc.message_id IS NOT NULL
               ORDER BY cc.id DESC
               LIMIT 1"#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// PENDING + QUEUED rows still owed a dispatch attempt.
    pub async fn open_ledger_rows(&self, campaign_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM campaign_contacts WHERE campaign_id = ? AND status IN ('pending', 'queued')",
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_recipients(&self, campaign_id: i64) -> Result<Vec<CampaignRecipient>> {
        Ok(sqlx::query_as::<_, CampaignRecipient>(
            "SELECT * FROM campaign_contacts WHERE campaign_id = ? ORDER BY id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// One aggregation pass over the ledger. Open/click counts come off
    /// the engagement timestamps so they stay independent of the
    /// headline status.
    pub async fn campaign_stats(&self, campaign_id: i64) -> Result<CampaignStats> {
        let row: (i64, i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                 COUNT(*),
                 COALESCE(SUM(CASE WHEN status IN ('sent', 'delivered', 'opened', 'clicked', 'bounced') THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status IN ('delivered', 'opened', 'clicked') THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN opened_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN clicked_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'bounced' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN status IN ('pending', 'queued') THEN 1 ELSE 0 END), 0)
               FROM campaign_contacts WHERE campaign_id = ?"#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        let (total, sent, delivered, opened, clicked, bounced, failed, cancelled, pending) = row;
        Ok(CampaignStats::from_counts(
            total, sent, delivered, opened, clicked, bounced, failed, cancelled, pending,
        ))
    }

    // ---- tracking records ----

    pub async fn tracking_record(&self, message_id: &str) -> Result<Option<TrackingRecord>> {
        Ok(sqlx::query_as::<_, TrackingRecord>(
            "SELECT * FROM tracking_records WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Record an open beacon hit. The first-open timestamp is written
    /// once; the counter moves on every hit. Returns false when the
    /// message id is unknown (the beacon still serves its pixel).
    pub async fn record_open(&self, message_id: &str) -> Result<bool> {
        let now = unix_now();
        let first = sqlx::query(
            r#"UPDATE tracking_records
               SET open_count = open_count + 1, first_open_at = ?
               WHERE message_id = ? AND first_open_at IS NULL"#,
        )
        .bind(now)
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if first > 0 {
            self.apply_engagement(message_id, DeliveryStatus::Opened).await?;
            if let Some(record) = self.tracking_record(message_id).await? {
                self.bump_contact_email_counts(record.contact_id, 0, 1, 0).await?;
            }
            return Ok(true);
        }

        let repeat = sqlx::query(
            "UPDATE tracking_records SET open_count = open_count + 1 WHERE message_id = ?",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(repeat > 0)
    }

    /// Record a click-beacon hit against a sent message: appends the
    /// click event, bumps counters, and advances the ledger on first
    /// click.
    pub async fn record_click(
        &self,
        message_id: &str,
        url: &str,
        user_agent: Option<&str>,
        ip: Option<&str>,
        referer: Option<&str>,
    ) -> Result<bool> {
        let now = unix_now();
        sqlx::query(
            r#"INSERT INTO link_clicks (message_id, url, user_agent, ip, referer, clicked_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(message_id)
        .bind(url)
        .bind(user_agent)
        .bind(ip)
        .bind(referer)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let first = sqlx::query(
            r#"UPDATE tracking_records
               SET click_count = click_count + 1, first_click_at = ?
               WHERE message_id = ? AND first_click_at IS NULL"#,
        )
        .bind(now)
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if first > 0 {
            self.apply_engagement(message_id, DeliveryStatus::Clicked).await?;
            if let Some(record) = self.tracking_record(message_id).await? {
                self.bump_contact_email_counts(record.contact_id, 0, 0, 1).await?;
            }
            return Ok(true);
        }

        let repeat = sqlx::query(
            "UPDATE tracking_records SET click_count = click_count + 1 WHERE message_id = ?",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(repeat > 0)
    }

    // ---- short links ----

    pub async fn create_short_link(
        &self,
        token: &str,
        url: &str,
        campaign_id: Option<i64>,
        contact_id: Option<i64>,
        expires_at: Option<i64>,
    ) -> Result<ShortLink> {
        sqlx::query(
            r#"INSERT INTO short_links (token, url, campaign_id, contact_id, expires_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(token)
        .bind(url)
        .bind(campaign_id)
        .bind(contact_id)
        .bind(expires_at)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        self.resolve_short_link(token, 0).await
    }

    /// Resolve a redirect token, distinguishing unknown from expired.
    pub async fn resolve_short_link(&self, token: &str, now: i64) -> Result<ShortLink> {
        let link = sqlx::query_as::<_, ShortLink>("SELECT * FROM short_links WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::UnknownToken(token.into()))?;
        if let Some(expires_at) = link.expires_at {
            if now >= expires_at {
                return Err(DbError::ExpiredToken(token.into()));
            }
        }
        Ok(link)
    }

    pub async fn insert_link_click(
        &self,
        token: &str,
        url: &str,
        user_agent: Option<&str>,
        ip: Option<&str>,
        referer: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO link_clicks (token, url, user_agent, ip, referer, clicked_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(token)
        .bind(url)
        .bind(user_agent)
        .bind(ip)
        .bind(referer)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn link_clicks_for_token(&self, token: &str) -> Result<Vec<LinkClick>> {
        Ok(sqlx::query_as::<_, LinkClick>(
            "SELECT * FROM link_clicks WHERE token = ? ORDER BY id",
        )
        .bind(token)
        .fetch_all(&self.pool)
        .await?)
    }

    // ---- sessions ----

    /// Fetch or mint the session row for a client-held session id,
    /// refreshing last-seen and expiry on every touch.
    pub async fn get_or_create_session(
        &self,
        session_id: &str,
        ttl_secs: i64,
    ) -> Result<ContactSession> {
        let now = unix_now();
        sqlx::query(
            r#"INSERT INTO contact_sessions (session_id, created_at, last_seen_at, expires_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(session_id) DO UPDATE SET
                 last_seen_at = excluded.last_seen_at,
                 expires_at = excluded.expires_at"#,
        )
        .bind(session_id)
        .bind(now)
        .bind(now)
        .bind(now + ttl_secs)
        .execute(&self.pool)
        .await?;

        Ok(sqlx::query_as::<_, ContactSession>(
            "SELECT * FROM contact_sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Attach a contact to a session; the first correlation wins and is
    /// kept across later anonymous touches.
    pub async fn link_session_contact(&self, session_id: &str, contact_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE contact_sessions SET contact_id = COALESCE(contact_id, ?) WHERE session_id = ?",
        )
        .bind(contact_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_session_event(
        &self,
        event_id: &str,
        session_id: &str,
        event_type: &str,
        event_data: Option<&str>,
        page_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO session_events (event_id, session_id, event_type, event_data, page_url, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event_id)
        .bind(session_id)
        .bind(event_type)
        .bind(event_data)
        .bind(page_url)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session_events(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        Ok(sqlx::query_as::<_, SessionEvent>(
            "SELECT * FROM session_events WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ---- balances ----

    pub async fn set_balance(
        &self,
        account_id: &str,
        channel: drip_core::Channel,
        credits: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO balances (account_id, channel, credits) VALUES (?, ?, ?)
               ON CONFLICT(account_id, channel) DO UPDATE SET credits = excluded.credits"#,
        )
        .bind(account_id)
        .bind(channel.as_str())
        .bind(credits)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn balance(&self, account_id: &str, channel: drip_core::Channel) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT credits FROM balances WHERE account_id = ? AND channel = ?",
        )
        .bind(account_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    /// Atomic compare-and-decrement of one credit. The guarded UPDATE is
    /// the whole concurrency story: it either debits or touches nothing,
    /// so concurrent dispatchers can never overspend.
    pub async fn try_debit(&self, account_id: &str, channel: drip_core::Channel) -> Result<()> {
        let affected = sqlx::query(
            r#"UPDATE balances SET credits = credits - 1
               WHERE account_id = ? AND channel = ? AND credits >= 1"#,
        )
        .bind(account_id)
        .bind(channel.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(DbError::InsufficientBalance {
                account_id: account_id.into(),
            });
        }
        Ok(())
    }

    pub async fn credit(
        &self,
        account_id: &str,
        channel: drip_core::Channel,
        amount: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO balances (account_id, channel, credits) VALUES (?, ?, ?)
               ON CONFLICT(account_id, channel) DO UPDATE SET credits = credits + excluded.credits"#,
        )
        .bind(account_id)
        .bind(channel.as_str())
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
