//! Cookie encoding: the `yunion_auth` session cookie and the plain helper
//! cookies (`tenant`, `scope`, `idp_*`, ...).

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};
use base64ct::{Base64Url, Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

pub const AUTH_COOKIE: &str = "yunion_auth";

/// Cookies written by login itself; request parameters may not overwrite them.
const RESERVED_COOKIES: [&str; 5] = [AUTH_COOKIE, "tenant", "scope", "isadmin", "domain"];
const RESERVED_PREFIX: &str = "idp_";

/// JSON carried (base64url wrapped) in the `yunion_auth` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCookie {
    /// Backend token expiry, RFC 3339.
    pub exp: String,
    /// Wire-encoded session token.
    pub session: String,
    pub totp_on: bool,
    pub system_totp_on: bool,
    #[serde(default)]
    pub totp_verified: bool,
    #[serde(default)]
    pub totp_init: bool,
    #[serde(default)]
    pub is_sso: bool,
}

impl AuthCookie {
    /// # Errors
    /// Returns an error if the cookie cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(encode_value(&serde_json::to_vec(self)?))
    }

    #[must_use]
    pub fn decode(value: &str) -> Option<Self> {
        serde_json::from_slice(&decode_value(value)?).ok()
    }
}

pub(super) fn encode_value(raw: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(raw)
}

/// Accept both padded and unpadded base64url.
pub(super) fn decode_value(value: &str) -> Option<Vec<u8>> {
    let value = value.trim();
    Base64UrlUnpadded::decode_vec(value)
        .or_else(|_| Base64Url::decode_vec(value))
        .ok()
}

/// Raw value of the named cookie.
pub(super) fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
                continue;
            };
            if key.trim() == name {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// Value of a cookie written with [`encode_value`].
pub(super) fn read_encoded_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = read_cookie(headers, name)?;
    decode_value(&raw)
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|value| !value.is_empty())
}

pub(super) fn is_reserved(name: &str) -> bool {
    RESERVED_COOKIES.contains(&name) || name.starts_with(RESERVED_PREFIX)
}

/// RFC 6265 `token`: visible ASCII without separators.
fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b)
        })
}

/// RFC 6265 `cookie-octet`, optionally wrapped in double quotes.
fn is_cookie_value(value: &str) -> bool {
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    inner
        .bytes()
        .all(|b| b.is_ascii_graphic() && !matches!(b, b'"' | b',' | b';' | b'\\'))
}

/// # Errors
/// `InputParameter` when the name is not a token or the value holds characters
/// a cookie cannot carry.
pub(super) fn check_cookie(name: &str, value: &str) -> ApiResult<()> {
    if !is_cookie_name(name) {
        return Err(ApiError::InputParameter(format!("invalid cookie name {name:?}")));
    }
    if !is_cookie_value(value) {
        return Err(ApiError::InputParameter(format!("invalid value for cookie {name}")));
    }
    Ok(())
}

/// `Set-Cookie` value; without `expires` the cookie lives for the browser session.
///
/// # Errors
/// See [`check_cookie`].
pub(super) fn set_cookie(
    name: &str,
    value: &str,
    domain: Option<&str>,
    expires: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ApiResult<HeaderValue> {
    check_cookie(name, value)?;
    let mut cookie = format!("{name}={value}; Path=/");
    if let Some(domain) = domain {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    if let Some(expires) = expires {
        let max_age = (expires - now).num_seconds().max(0);
        cookie.push_str(&format!(
            "; Expires={}; Max-Age={max_age}",
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    }
    HeaderValue::from_str(&cookie).map_err(ApiError::internal)
}

pub(super) fn clear_cookie(
    name: &str,
    domain: Option<&str>,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0");
    if let Some(domain) = domain {
        cookie.push_str(&format!("; Domain={domain}"));
    }
    HeaderValue::from_str(&cookie)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn auth_cookie_round_trips() {
        let cookie = AuthCookie {
            exp: "2030-01-01T00:00:00+00:00".to_string(),
            session: "abc".to_string(),
            totp_on: true,
            system_totp_on: false,
            totp_verified: false,
            totp_init: true,
            is_sso: false,
        };
        let encoded = cookie.encode().unwrap();
        assert!(!encoded.contains('='));
        assert_eq!(AuthCookie::decode(&encoded), Some(cookie));
    }

    #[test]
    fn reads_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("tenant=proj-A; yunion_auth=eyJ9; region=r1"),
        );
        assert_eq!(read_cookie(&headers, "yunion_auth").as_deref(), Some("eyJ9"));
        assert_eq!(read_cookie(&headers, "region").as_deref(), Some("r1"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn encoded_cookie_accepts_padding() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("idp_id=aWRwLTE="));
        assert_eq!(read_encoded_cookie(&headers, "idp_id").as_deref(), Some("idp-1"));
    }

    #[test]
    fn set_cookie_carries_expiry_and_domain() {
        let now = Utc::now();
        let value = set_cookie("tenant", "p1", Some("example.com"), Some(now + Duration::seconds(60)), now)
            .unwrap();
        let value = value.to_str().unwrap();
        assert!(value.starts_with("tenant=p1; Path=/; Domain=example.com; Expires="));
        assert!(value.ends_with("Max-Age=60"));

        let session_only = set_cookie("tenant", "p1", None, None, now).unwrap();
        assert_eq!(session_only.to_str().unwrap(), "tenant=p1; Path=/");
    }

    #[test]
    fn set_cookie_rejects_attribute_injection() {
        let now = Utc::now();
        for value in ["en; Domain=evil.example", "a b", "a\"b", "a,b", "a\\b"] {
            let err = set_cookie("lang", value, None, None, now).unwrap_err();
            assert!(matches!(err, ApiError::InputParameter(_)), "{value}");
        }
        for name in ["", "la ng", "lang;", "a=b", "l\"g"] {
            assert!(set_cookie(name, "en", None, None, now).is_err(), "{name}");
        }
        assert!(set_cookie("lang", "\"zh-CN\"", None, None, now).is_ok());
    }

    #[test]
    fn login_cookies_are_reserved() {
        assert!(is_reserved(AUTH_COOKIE));
        assert!(is_reserved("tenant"));
        assert!(is_reserved("idp_driver"));
        assert!(!is_reserved("lang"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let value = clear_cookie(AUTH_COOKIE, None).unwrap();
        assert!(value.to_str().unwrap().contains("Max-Age=0"));
    }
}
