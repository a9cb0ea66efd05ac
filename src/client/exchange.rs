use http::header::{HeaderName, HOST};
use http::{Method, Request, Response};

use crate::client::body::IncomingBody;
use crate::client::PoolClient;
use crate::error::Error;
use crate::pool::Pooled;
use crate::uri::{pool_key_and_target, PoolKey};

/// Headers that describe the hop to the immediate peer, not the request
/// itself; these are never forwarded onto the wire unexamined.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// True when `hyper` reports the connection closed, canceled, or the
/// message left incomplete. This alone does not say whether any response
/// byte arrived before the close — that requires comparing the pooled
/// connection's byte counter across the attempt, since a close can land
/// either before the first byte (safe to retry) or mid-response (never
/// safe to retry); see `Client::request`'s use of `PoolClient::bytes_read`.
pub(crate) fn is_connection_closed(err: &hyper::Error) -> bool {
    err.is_canceled() || err.is_incomplete_message() || err.is_closed()
}

/// `GET, HEAD, PUT, DELETE, OPTIONS, TRACE` may be safely retried after a
/// connection died before any byte of the response arrived, because
/// re-sending them has no different effect than sending them once.
pub(crate) fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

/// Strip hop-by-hop headers, validate and rewrite the target, and inject
/// `Host`/`Connection` as needed. Returns the pool key the rewritten
/// request should be sent over.
pub(crate) fn normalize_request<B>(
    req: &mut Request<B>,
    set_host: bool,
) -> Result<crate::uri::PoolKey, Error> {
    let (key, target) = pool_key_and_target(req.uri())?;

    for name in HOP_BY_HOP {
        req.headers_mut().remove(*name);
    }
    req.headers_mut().remove(HOST);

    if set_host {
        let host_value = key
            .1
            .as_str()
            .parse()
            .map_err(|_| Error::url("authority is not a valid Host header value"))?;
        req.headers_mut().insert(HOST, host_value);
    }

    req.headers_mut()
        .entry(HeaderName::from_static("connection"))
        .or_insert_with(|| "keep-alive".parse().expect("static value is valid"));

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = None;
    parts.authority = None;
    parts.path_and_query = Some(target.parse().map_err(|_| Error::url("invalid request target"))?);
    *req.uri_mut() = http::Uri::from_parts(parts).map_err(|_| Error::url("invalid request target"))?;

    Ok(key)
}

/// Wrap a successful response's body in [`IncomingBody`], handing it the
/// pooled connection guard so the connection is only returned to the pool
/// once the body reaches a terminal state, not as soon as headers parse.
pub(crate) fn into_response(
    resp: Response<hyper::body::Incoming>,
    read_timeout: Option<std::time::Duration>,
    pooled: Pooled<PoolClient, PoolKey>,
) -> Response<IncomingBody> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, IncomingBody::new(body, read_timeout, pooled))
}
