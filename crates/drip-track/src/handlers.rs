use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use drip_core::{Channel, DeliveryStatus, SendSpec};
use drip_db::{DbError, ShortLink};
use drip_engine::EngineError;

use crate::cookies;
use crate::pixel::TRACKING_PIXEL;
use crate::state::AppState;

pub async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// Open beacon. Always serves the pixel; the bookkeeping behind it is
/// best-effort and a broken message id is not the mail client's problem.
pub async fn track_open(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Response {
    if let Err(e) = state.db.record_open(&message_id).await {
        tracing::warn!(message_id = %message_id, error = %e, "open beacon write failed");
    }
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        TRACKING_PIXEL.as_slice(),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct ClickQuery {
    url: Option<String>,
}

/// Click beacon. The redirect must happen even when the write fails;
/// losing a click datapoint beats stranding a reader on an error page.
pub async fn track_click(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(query): Query<ClickQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(url) = query.url.filter(|u| !u.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "missing url parameter");
    };
    let user_agent = header_str(&headers, header::USER_AGENT);
    let referer = header_str(&headers, header::REFERER);
    if let Err(e) = state
        .db
        .record_click(&message_id, &url, user_agent.as_deref(), None, referer.as_deref())
        .await
    {
        tracing::warn!(message_id = %message_id, error = %e, "click beacon write failed");
    }
    redirect_permanent(&url)
}

/// Short-link redirect with session correlation. A first-time visitor
/// gets a `drip_session` cookie; the link's contact, when known, is
/// attached to that session so later browse events resolve to a person.
pub async fn follow_short_link(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    let link = match state.db.resolve_short_link(&token, now).await {
        Ok(link) => link,
        Err(DbError::UnknownToken(_)) => {
            return json_error(StatusCode::NOT_FOUND, "unknown link");
        }
        Err(DbError::ExpiredToken(_)) => {
            return json_error(StatusCode::GONE, "link expired");
        }
        Err(e) => {
            tracing::error!(token = %token, error = %e, "short link lookup failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let existing = cookies::session_from_headers(&headers);
    let minted = existing.is_none();
    let session_id =
        existing.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let user_agent = header_str(&headers, header::USER_AGENT);
    let referer = header_str(&headers, header::REFERER);
    if let Err(e) = record_link_visit(
        &state,
        &link,
        &session_id,
        user_agent.as_deref(),
        referer.as_deref(),
    )
    .await
    {
        tracing::warn!(token = %link.token, error = %e, "short link bookkeeping failed");
    }

    let mut response = redirect_permanent(&link.url);
    if minted {
        if let Ok(cookie) = HeaderValue::from_str(&cookies::set_session_cookie(&session_id)) {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        }
    }
    response
}

async fn record_link_visit(
    state: &AppState,
    link: &ShortLink,
    session_id: &str,
    user_agent: Option<&str>,
    referer: Option<&str>,
) -> drip_db::Result<()> {
    state
        .db
        .get_or_create_session(session_id, cookies::SESSION_TTL_SECS)
        .await?;
    if let Some(contact_id) = link.contact_id {
        state.db.link_session_contact(session_id, contact_id).await?;
    }
    state
        .db
        .insert_link_click(&link.token, &link.url, user_agent, None, referer)
        .await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    session_id: Option<String>,
    event_type: Option<String>,
    event_data: Option<serde_json::Value>,
    page_url: Option<String>,
}

/// Browse event reported by the client script on pages reached through a
/// short link.
pub async fn link_event(State(state): State<AppState>, Json(body): Json<EventBody>) -> Response {
    let (Some(session_id), Some(event_type)) = (
        body.session_id.filter(|s| !s.is_empty()),
        body.event_type.filter(|s| !s.is_empty()),
    ) else {
        return json_error(StatusCode::BAD_REQUEST, "sessionId and eventType are required");
    };

    let event_id = uuid::Uuid::new_v4().simple().to_string();
    let event_data = body.event_data.map(|v| v.to_string());
    let written = async {
        state
            .db
            .get_or_create_session(&session_id, cookies::SESSION_TTL_SECS)
            .await?;
        state
            .db
            .insert_session_event(
                &event_id,
                &session_id,
                &event_type,
                event_data.as_deref(),
                body.page_url.as_deref(),
            )
            .await
    }
    .await;

    match written {
        Ok(()) => Json(json!({ "success": true, "eventId": event_id })).into_response(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "session event write failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[derive(Deserialize)]
pub struct SmsStatusQuery {
    to: Option<String>,
    status: Option<String>,
}

/// Delivery-status webhook. Providers retry on anything but 200, so the
/// ack is unconditional; unusable payloads are logged and dropped.
pub async fn sms_status(
    State(state): State<AppState>,
    Query(query): Query<SmsStatusQuery>,
) -> Response {
    if let (Some(to), Some(status)) = (query.to, query.status) {
        if let Err(e) = apply_sms_status(&state, &to, &status).await {
            tracing::warn!(to = %to, status = %status, error = %e, "sms status not applied");
        }
    }
    (StatusCode::OK, "OK").into_response()
}

async fn apply_sms_status(state: &AppState, to: &str, status: &str) -> drip_db::Result<()> {
    let Some(next) = map_provider_status(status) else {
        return Ok(());
    };
    let Some(recipient) = state.db.latest_recipient_for_address(to).await? else {
        return Ok(());
    };
    let Some(message_id) = recipient.message_id else {
        return Ok(());
    };
    // Rank-guarded: stale or duplicate reports fall through as no-ops.
    state.db.apply_engagement(&message_id, next).await?;
    Ok(())
}

fn map_provider_status(status: &str) -> Option<DeliveryStatus> {
    match status.to_ascii_lowercase().as_str() {
        "delivered" => Some(DeliveryStatus::Delivered),
        "failed" | "undelivered" => Some(DeliveryStatus::Failed),
        "bounced" | "rejected" | "blocked" => Some(DeliveryStatus::Bounced),
        // "sent"/"queued"/"accepted" are already reflected by dispatch.
        _ => None,
    }
}

pub async fn account_balance(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    match state.db.balance(&account_id, Channel::Sms).await {
        Ok(credits) => {
            Json(json!({ "accountId": account_id, "credits": credits })).into_response()
        }
        Err(e) => {
            tracing::error!(account_id = %account_id, error = %e, "balance lookup failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Kick off a campaign. Resolution problems surface here as 4xx before
/// any job exists; an accepted request dispatches in the background.
pub async fn send_campaign(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(spec): Json<SendSpec>,
) -> Response {
    match state.scheduler.submit(id, &spec).await {
        Ok(receipt) => {
            if !receipt.scheduled {
                let scheduler = state.scheduler.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.dispatch(id).await {
                        tracing::error!(campaign_id = id, error = %e, "dispatch failed");
                    }
                });
            }
            let status = if receipt.scheduled { "scheduled" } else { "queued" };
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "campaignId": receipt.campaign_id,
                    "status": status,
                    "recipients": receipt.recipients,
                })),
            )
                .into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

pub async fn cancel_campaign(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.scheduler.cancel(id).await {
        Ok(cancelled) => {
            Json(json!({ "campaignId": id, "cancelled": cancelled })).into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

pub async fn campaign_stats(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(e) = state.db.get_campaign(id).await {
        return match e {
            DbError::CampaignNotFound(_) => json_error(StatusCode::NOT_FOUND, "campaign not found"),
            other => {
                tracing::error!(campaign_id = id, error = %other, "campaign lookup failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        };
    }
    match state.db.campaign_stats(id).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!(campaign_id = id, error = %e, "stats query failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn engine_error_response(err: EngineError) -> Response {
    match &err {
        EngineError::Db(DbError::CampaignNotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "campaign not found")
        }
        EngineError::EmptyAudience => json_error(StatusCode::CONFLICT, &err.to_string()),
        EngineError::NotCancellable { .. } | EngineError::Db(DbError::InvalidTransition { .. }) => {
            json_error(StatusCode::CONFLICT, &err.to_string())
        }
        EngineError::EmptySendSpec
        | EngineError::SegmentInvalid { .. }
        | EngineError::UnknownChannel { .. }
        | EngineError::NoAdapter(_)
        | EngineError::Db(DbError::SegmentNotFound(_)) => {
            json_error(StatusCode::BAD_REQUEST, &err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "campaign request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn redirect_permanent(url: &str) -> Response {
    match HeaderValue::from_str(url) {
        Ok(location) => {
            let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
            response.headers_mut().insert(header::LOCATION, location);
            response
        }
        Err(_) => json_error(StatusCode::BAD_REQUEST, "invalid redirect url"),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
