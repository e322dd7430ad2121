//! HTTP surface of the delivery pipeline: engagement beacons, short-link
//! redirects, provider webhooks and the campaign control endpoints. All
//! routes are hit by end-user mail clients and browsers, so the beacon
//! family never fails outward.

mod cookies;
mod handlers;
mod pixel;
mod state;

pub use cookies::{SESSION_COOKIE, SESSION_TTL_SECS};
pub use pixel::TRACKING_PIXEL;
pub use state::AppState;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/track/open/{message_id}", get(handlers::track_open))
        .route("/track/click/{message_id}", get(handlers::track_click))
        .route("/l/event", post(handlers::link_event))
        .route("/l/{token}", get(handlers::follow_short_link))
        .route(
            "/webhooks/sms/status",
            get(handlers::sms_status).post(handlers::sms_status),
        )
        .route("/accounts/{account_id}/balance", get(handlers::account_balance))
        .route("/campaigns/{id}/send", post(handlers::send_campaign))
        .route("/campaigns/{id}/cancel", post(handlers::cancel_campaign))
        .route("/campaigns/{id}/stats", get(handlers::campaign_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use drip_core::{CampaignStatus, Channel, DeliveryStatus};
    use drip_db::{DripDb, NewContact};
    use drip_engine::{
        ChannelAdapter, DeliveryScheduler, EmailAdapter, MockProvider, PushAdapter, RetryPolicy,
        SchedulerConfig, SmsAdapter,
    };

    async fn test_app() -> (Router, Arc<DripDb>) {
        let db = Arc::new(DripDb::in_memory().await.unwrap());
        let provider = Arc::new(MockProvider::new());
        let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
            Arc::new(EmailAdapter::new(provider.clone())),
            Arc::new(SmsAdapter::new(provider.clone())),
            Arc::new(PushAdapter::new(provider)),
        ];
        let config = SchedulerConfig {
            worker_count: 2,
            batch_size: 8,
            adapter_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter: 0.0,
            },
        };
        let scheduler = Arc::new(DeliveryScheduler::new(db.clone(), adapters, config));
        (router(AppState::new(db.clone(), scheduler)), db)
    }

    /// A contact with a sent ledger row and tracking record, as dispatch
    /// would leave them.
    async fn seed_sent_message(db: &DripDb, channel: Channel, message_id: &str) -> (i64, i64) {
        let contact = db
            .insert_contact(&NewContact {
                email: Some("reader@example.com".into()),
                phone: Some("+15550001111".into()),
                ..NewContact::default()
            })
            .await
            .unwrap();
        let campaign = db
            .create_campaign("acct-1", "seeded", channel, Some("s"), "b", "from@example.com")
            .await
            .unwrap();
        db.enqueue_recipients(campaign.id, &[contact.id]).await.unwrap();
        let row = db.claim_batch(campaign.id, 1).await.unwrap().remove(0);
        assert!(
            db.mark_recipient_sent(row.id, campaign.id, contact.id, message_id, "prov-1")
                .await
                .unwrap()
        );
        (campaign.id, contact.id)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _db) = test_app().await;
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn open_beacon_serves_the_pixel_and_advances_the_ledger() {
        let (app, db) = test_app().await;
        let (campaign_id, _) = seed_sent_message(&db, Channel::Email, "m-open").await;

        let response = app.clone().oneshot(get("/track/open/m-open")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "image/gif"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL].to_str().unwrap(),
            "no-store"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 43);

        // Second hit bumps the counter without moving state again.
        app.oneshot(get("/track/open/m-open")).await.unwrap();
        let row = db.recipient_by_message("m-open").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(DeliveryStatus::Opened));
        let record = db.tracking_record("m-open").await.unwrap().unwrap();
        assert_eq!(record.open_count, 2);
        assert_eq!(db.campaign_stats(campaign_id).await.unwrap().opened, 1);
    }

    #[tokio::test]
    async fn open_beacon_never_fails_on_unknown_ids() {
        let (app, _db) = test_app().await;
        let response = app.oneshot(get("/track/open/no-such-message")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 43);
    }

    #[tokio::test]
    async fn click_beacon_redirects_and_records() {
        let (app, db) = test_app().await;
        seed_sent_message(&db, Channel::Email, "m-click").await;

        let response = app
            .clone()
            .oneshot(get("/track/click/m-click?url=https%3A%2F%2Fshop.example%2Fsale"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION].to_str().unwrap(),
            "https://shop.example/sale"
        );
        let row = db.recipient_by_message("m-click").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(DeliveryStatus::Clicked));

        let missing = app.oneshot(get("/track/click/m-click")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn short_link_mints_a_session_cookie_once() {
        let (app, db) = test_app().await;
        let contact = db
            .insert_contact(&NewContact {
                email: Some("visitor@example.com".into()),
                ..NewContact::default()
            })
            .await
            .unwrap();
        db.create_short_link("tok1", "https://shop.example/", None, Some(contact.id), None)
            .await
            .unwrap();

        let response = app.clone().oneshot(get("/l/tok1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("drip_session="));
        let session_id = cookie
            .strip_prefix("drip_session=")
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        // The visit correlated the session to the link's contact.
        let session = db.get_or_create_session(&session_id, 60).await.unwrap();
        assert_eq!(session.contact_id, Some(contact.id));
        assert_eq!(db.link_clicks_for_token("tok1").await.unwrap().len(), 1);

        // A returning visitor keeps their cookie.
        let request = Request::builder()
            .uri("/l/tok1")
            .header(header::COOKIE, format!("drip_session={session_id}"))
            .body(Body::empty())
            .unwrap();
        let second = app.oneshot(request).await.unwrap();
        assert_eq!(second.status(), StatusCode::MOVED_PERMANENTLY);
        assert!(!second.headers().contains_key(header::SET_COOKIE));
    }

    #[tokio::test]
    async fn short_link_distinguishes_unknown_from_expired() {
        let (app, db) = test_app().await;
        db.create_short_link("gone", "https://shop.example/", None, None, Some(1))
            .await
            .unwrap();

        let unknown = app.clone().oneshot(get("/l/nope")).await.unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        let expired = app.oneshot(get("/l/gone")).await.unwrap();
        assert_eq!(expired.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn session_events_require_their_fields() {
        let (app, db) = test_app().await;

        let bad = app
            .clone()
            .oneshot(post_json("/l/event", serde_json::json!({ "sessionId": "s-1" })))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let good = app
            .oneshot(post_json(
                "/l/event",
                serde_json::json!({
                    "sessionId": "s-1",
                    "eventType": "page_view",
                    "pageUrl": "https://shop.example/sale",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(good.status(), StatusCode::OK);
        let body = body_json(good).await;
        assert_eq!(body["success"], true);
        assert!(body["eventId"].as_str().is_some());
        let events = db.session_events("s-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "page_view");
    }

    #[tokio::test]
    async fn sms_webhook_applies_rank_guarded_updates() {
        let (app, db) = test_app().await;
        seed_sent_message(&db, Channel::Sms, "m-sms").await;

        let response = app
            .clone()
            .oneshot(get("/webhooks/sms/status?to=%2B15550001111&status=delivered"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let row = db.recipient_by_message("m-sms").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(DeliveryStatus::Delivered));

        // A late "sent" report must not regress the row, and garbage is
        // still acked.
        app.clone()
            .oneshot(get("/webhooks/sms/status?to=%2B15550001111&status=sent"))
            .await
            .unwrap();
        let row = db.recipient_by_message("m-sms").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(DeliveryStatus::Delivered));
        let garbage = app.oneshot(get("/webhooks/sms/status")).await.unwrap();
        assert_eq!(garbage.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn balance_endpoint_reports_credits() {
        let (app, db) = test_app().await;
        db.set_balance("acct-9", Channel::Sms, 42).await.unwrap();
        let response = app.oneshot(get("/accounts/acct-9/balance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["accountId"], "acct-9");
        assert_eq!(body["credits"], 42);
    }

    #[tokio::test]
    async fn send_endpoint_accepts_and_dispatches() {
        let (app, db) = test_app().await;
        for i in 0..3 {
            db.insert_contact(&NewContact {
                email: Some(format!("c{i}@example.com")),
                ..NewContact::default()
            })
            .await
            .unwrap();
        }
        let campaign = db
            .create_campaign("acct-1", "go", Channel::Email, Some("s"), "b", "n@example.com")
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/campaigns/{}/send", campaign.id),
                serde_json::json!({ "sendToAll": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["recipients"], 3);

        // Dispatch runs in the background; wait for it to settle.
        let mut settled = false;
        for _ in 0..200 {
            let current = db.get_campaign(campaign.id).await.unwrap();
            if current.status() == Some(CampaignStatus::Sent) {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled, "campaign never settled");

        let stats = app
            .oneshot(get(&format!("/campaigns/{}/stats", campaign.id)))
            .await
            .unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
        assert_eq!(body_json(stats).await["sent"], 3);
    }

    #[tokio::test]
    async fn send_endpoint_maps_errors_to_statuses() {
        let (app, db) = test_app().await;
        let campaign = db
            .create_campaign("acct-1", "nobody", Channel::Email, Some("s"), "b", "n@example.com")
            .await
            .unwrap();

        let missing = app
            .clone()
            .oneshot(post_json("/campaigns/999/send", serde_json::json!({ "sendToAll": true })))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        // No contacts exist, so resolution comes back empty.
        let empty = app
            .clone()
            .oneshot(post_json(
                &format!("/campaigns/{}/send", campaign.id),
                serde_json::json!({ "sendToAll": true }),
            ))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::CONFLICT);

        let blank = app
            .oneshot(post_json(
                &format!("/campaigns/{}/send", campaign.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_endpoint_rejects_draft_campaigns() {
        let (app, db) = test_app().await;
        let campaign = db
            .create_campaign("acct-1", "draft", Channel::Email, Some("s"), "b", "n@example.com")
            .await
            .unwrap();
        let response = app
            .oneshot(post_json(
                &format!("/campaigns/{}/cancel", campaign.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
