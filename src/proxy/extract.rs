//! Metadata capture for recorded transactions
//!
//! Turns a forwarded request and the origin's response into the two snapshots
//! stored per transaction. Multi-valued query parameters, headers and cookies
//! collapse to one value here and nowhere else: the bytes sent to the client
//! are never touched by this module.

use std::collections::BTreeMap;

use http::request::Parts;
use hyper::ext::ReasonPhrase;
use hyper::header::{CONTENT_TYPE, COOKIE};
use hyper::{HeaderMap, Method, Response};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::models::{InboundRequestSnapshot, OutboundResponseSnapshot, TransactionRecord};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Request headers left out of snapshots: `Host` is the request target and
/// `Proxy-Connection` is stripped before the request is forwarded.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "proxy-connection"];

/// Capture both snapshots for one forwarded transaction.
///
/// `body` is the buffered request body; it is only parsed when the request
/// carries a url-encoded form.
pub fn capture<B>(
    request: &Parts,
    body: &[u8],
    response: &Response<B>,
) -> (InboundRequestSnapshot, OutboundResponseSnapshot) {
    (capture_request(request, body), capture_response(response))
}

pub fn capture_request(request: &Parts, body: &[u8]) -> InboundRequestSnapshot {
    let query = request
        .uri
        .query()
        .map(|q| first_pairs(url::form_urlencoded::parse(q.as_bytes())))
        .unwrap_or_default();

    let form = if carries_form(request) {
        all_pairs(url::form_urlencoded::parse(body))
    } else {
        BTreeMap::new()
    };

    InboundRequestSnapshot {
        method: request.method.as_str().to_string(),
        path: decoded_path(request.uri.path()),
        query,
        headers: first_header_values(&request.headers, SKIPPED_REQUEST_HEADERS),
        cookies: cookies(&request.headers),
        form,
    }
}

pub fn capture_response<B>(response: &Response<B>) -> OutboundResponseSnapshot {
    let status = response.status();
    let reason = response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
        .or_else(|| status.canonical_reason().map(str::to_string));

    let message = match reason {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    };

    OutboundResponseSnapshot {
        code: status.as_u16(),
        message,
        headers: first_header_values(response.headers(), &[]),
    }
}

/// Encode both snapshots into the record handed to the sink
pub fn transaction_record(
    request: &InboundRequestSnapshot,
    response: &OutboundResponseSnapshot,
) -> TransactionRecord {
    TransactionRecord::new(
        encode_snapshot(request, "request"),
        encode_snapshot(response, "response"),
    )
}

/// JSON text of a snapshot
pub fn snapshot_json<T: Serialize>(snapshot: &T) -> Result<String> {
    Ok(serde_json::to_string(snapshot)?)
}

/// JSON text of a snapshot, or an empty string if it cannot be encoded
pub fn encode_snapshot<T: Serialize>(snapshot: &T, kind: &'static str) -> String {
    match snapshot_json(snapshot) {
        Ok(text) => text,
        Err(e) => {
            warn!(snapshot = kind, error = %e, "Failed to encode snapshot");
            String::new()
        }
    }
}

/// Canonical MIME form of a header name: `x-forwarded-for` becomes `X-Forwarded-For`
pub fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Percent-decoded path; a path that does not decode to UTF-8 is kept as sent
fn decoded_path(path: &str) -> String {
    urlencoding::decode(path)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

fn first_header_values(headers: &HeaderMap, skip: &[&str]) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for name in headers.keys() {
        if skip.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = headers.get(name) {
            values
                .entry(canonical_header_key(name.as_str()))
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
    }
    values
}

fn first_pairs<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (key, value) in pairs {
        map.entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    map
}

fn all_pairs<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in pairs {
        map.entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    map
}

/// Later cookies with the same name overwrite earlier ones
fn cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for header in headers.get_all(COOKIE) {
        let raw = String::from_utf8_lossy(header.as_bytes());
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            cookies.insert(name.to_string(), value.to_string());
        }
    }
    cookies
}

fn carries_form(request: &Parts) -> bool {
    let method_has_body = matches!(request.method, Method::POST | Method::PUT | Method::PATCH);
    if !method_has_body {
        return false;
    }

    request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case(FORM_URLENCODED))
        .unwrap_or(false)
}
