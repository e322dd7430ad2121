//! Minimal cookie plumbing for the session beacon. One cookie, one
//! format; a cookie crate would be a bigger dependency than the parsing.

use axum::http::{HeaderMap, header};

pub const SESSION_COOKIE: &str = "drip_session";

/// 30 days, matching the session row TTL.
pub const SESSION_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Pull our session id out of the Cookie header, if the client sent one.
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

pub fn set_session_cookie(session_id: &str) -> String {
    format!(
        "{SESSION_COOKIE}={session_id}; Path=/; Max-Age={SESSION_TTL_SECS}; HttpOnly; SameSite=Lax"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn finds_our_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; drip_session=abc123; lang=en"),
        );
        assert_eq!(session_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn absent_or_empty_cookie_yields_none() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_from_headers(&headers), None);
        headers.insert(header::COOKIE, HeaderValue::from_static("drip_session="));
        assert_eq!(session_from_headers(&headers), None);
    }

    #[test]
    fn set_cookie_carries_the_attributes() {
        let cookie = set_session_cookie("s-1");
        assert!(cookie.starts_with("drip_session=s-1;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=2592000"));
    }
}
