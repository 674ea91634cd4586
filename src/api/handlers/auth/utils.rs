use crate::error::{ApiError, ApiResult};
use aes::Aes256;
use axum::http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{AUTHORIZATION, CACHE_CONTROL, EXPIRES, PRAGMA},
};
use base64ct::{Base64, Encoding};
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::{Rng, distributions::Alphanumeric};
use url::form_urlencoded;

const PASSWORD_KEY_LEN: usize = 32;
const AES_BLOCK_LEN: usize = 16;

pub(super) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(super) fn client_ip(headers: &HeaderMap) -> String {
    extract_client_ip(headers).unwrap_or_default()
}

/// Passwords may arrive AES-256-CBC encrypted under `key`, or just base64
/// encoded. Each decoding is tried in that order and used only when it yields
/// printable ASCII; otherwise the password is taken as sent.
pub(super) fn decode_password(key: &[u8], password: &str) -> String {
    let Ok(decoded) = Base64::decode_vec(password) else {
        return password.to_string();
    };
    if let Some(plain) = cbc_decrypt(key, &decoded).filter(|plain| is_password_text(plain)) {
        return String::from_utf8_lossy(&plain).into_owned();
    }
    if is_password_text(&decoded) {
        return String::from_utf8_lossy(&decoded).into_owned();
    }
    password.to_string()
}

/// `iv || ciphertext` with PKCS#7 padding. The key is cut or zero-padded to 32 bytes.
fn cbc_decrypt(key: &[u8], sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < 2 * AES_BLOCK_LEN || sealed.len() % AES_BLOCK_LEN != 0 {
        return None;
    }
    let (iv, ciphertext) = sealed.split_at(AES_BLOCK_LEN);
    cbc::Decryptor::<Aes256>::new_from_slices(&password_key(key), iv)
        .ok()?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .ok()
}

fn password_key(key: &[u8]) -> [u8; PASSWORD_KEY_LEN] {
    let mut sized = [0u8; PASSWORD_KEY_LEN];
    let len = key.len().min(PASSWORD_KEY_LEN);
    sized[..len].copy_from_slice(&key[..len]);
    sized
}

fn is_password_text(bytes: &[u8]) -> bool {
    !bytes.is_empty() && is_printable_ascii(bytes)
}

fn is_printable_ascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| (0x20..0x7f).contains(b))
}

/// Merge `pairs` into the query string of `url`, replacing existing keys.
pub(super) fn add_query(url: &str, pairs: &[(&str, &str)]) -> String {
    let (base, query) = url.rsplit_once('?').unwrap_or((url, ""));
    let mut merged: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .filter(|(key, _)| !pairs.iter().any(|(k, _)| k == key))
        .collect();
    merged.extend(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string())),
    );
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(merged)
        .finish();
    format!("{base}?{encoded}")
}

pub(super) fn random_state(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Token of an `Authorization: Bearer ...` header.
pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    strip_bearer(headers.get(AUTHORIZATION)?.to_str().ok()?)
}

pub(super) fn strip_bearer(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// `(client_id, client_secret)` of an `Authorization: Basic ...` header.
pub(super) fn extract_basic_auth(headers: &HeaderMap) -> ApiResult<(String, String)> {
    let illegal = || ApiError::InvalidCredential("illegal authorization header".to_string());
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(illegal)?;
    let (scheme, encoded) = value.trim().split_once(' ').ok_or_else(illegal)?;
    if scheme != "Basic" {
        return Err(ApiError::InvalidCredential(format!(
            "unsupported auth method {scheme}, only Basic supported"
        )));
    }
    let decoded = Base64::decode_vec(encoded.trim()).map_err(|_| illegal())?;
    let decoded = String::from_utf8(decoded).map_err(|_| illegal())?;
    let mut parts = decoded.split(':');
    let (Some(id), Some(secret), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(illegal());
    };
    let unescape = |value: &str| {
        form_urlencoded::parse(format!("v={value}").as_bytes())
            .next()
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    };
    Ok((unescape(id), unescape(secret)))
}

pub(super) fn no_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}

pub(super) fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
