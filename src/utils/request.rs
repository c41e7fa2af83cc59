use std::net::IpAddr;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderName};
use once_cell::sync::Lazy;
use pingora::{http::RequestHeader, protocols::http::ServerSession};

use crate::core::{ReliefError, ReliefResult};

/// Extracts the value of a specific query parameter from the request URI.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(req_header: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req_header.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    Some(v.trim())
                } else {
                    None
                }
            } else if pair == name {
                Some("")
            } else {
                None
            }
        })
    })
}

/// Retrieves the value of a specific header from the request.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn get_bearer_token(req_header: &RequestHeader) -> Option<&str> {
    let value = get_req_header_value(req_header, header::AUTHORIZATION.as_str())?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

/// Client address reported by a fronting proxy, if any.
///
/// `X-Forwarded-For` (first entry) wins over `X-Real-IP`.
pub fn get_forwarded_ip(req_header: &RequestHeader) -> Option<&str> {
    let forwarded = req_header
        .headers
        .get(&*HTTP_HEADER_X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next());
    let real_ip = || {
        req_header
            .headers
            .get(&*HTTP_HEADER_X_REAL_IP)
            .and_then(|v| v.to_str().ok())
    };

    forwarded
        .or_else(real_ip)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

/// Client address used to key per-client limits.
///
/// Proxy headers are only honoured when `trust_forwarded` is set, i.e. every
/// connection arrives through a proxy that overwrites them. Otherwise the
/// TCP peer address is used. Empty when nothing is known.
pub fn resolve_client_ip(
    req_header: &RequestHeader,
    peer: Option<IpAddr>,
    trust_forwarded: bool,
) -> String {
    if trust_forwarded {
        if let Some(ip) = get_forwarded_ip(req_header) {
            return ip.to_string();
        }
    }

    match peer {
        Some(ip) => ip.to_string(),
        None => {
            log::debug!("Could not determine client IP address");
            String::new()
        }
    }
}

/// IP address of the TCP peer, if the connection is an inet socket.
pub fn get_peer_ip(session: &ServerSession) -> Option<IpAddr> {
    session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|addr| addr.ip())
}

/// Read the whole request body, refusing anything larger than `limit` bytes.
pub async fn read_request_body(session: &mut ServerSession, limit: usize) -> ReliefResult<Bytes> {
    let mut body = BytesMut::new();
    loop {
        let chunk = session
            .read_request_body()
            .await
            .map_err(|e| ReliefError::Validation(format!("failed to read request body: {e}")))?;
        match chunk {
            Some(bytes) => {
                if body.len() + bytes.len() > limit {
                    return Err(ReliefError::Validation(format!(
                        "request body exceeds {limit} bytes"
                    )));
                }
                body.extend_from_slice(&bytes);
            }
            None => break,
        }
    }
    Ok(body.freeze())
}
