//! Request routing, content negotiation and response building.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability. [`respond`] is the outer wrapper used by the server: it
//! converts handler errors into responses and stamps `X-Response-Time` on
//! everything that leaves the service.

use std::net::{IpAddr, SocketAddr};
use std::num::IntErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION,
    USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use tracing::{Instrument, debug, error, info, warn};

use crate::assets::Asset;
use crate::headers::{self, Representation};
use crate::ip_data::IpData;
use crate::rate_limit::{now_ms, rate_limit_key};
use crate::render::{format_leg, render_json, render_text, render_yaml};
use crate::server::AppState;
use crate::share;
use crate::templates::strip_ansi;
use crate::{Result, ServiceError};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased response body.
///
/// Lets the handler accept requests with arbitrary body types (`Incoming`
/// in production, `Full`/`Empty` in tests) and return a uniform response
/// type for every route.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// Milliseconds spent producing the response, set on every response.
pub const X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");

/// Fixed body of the fallback route.
pub const NOT_FOUND_BODY: &str = "Hello, I am IPsaur.";

const TEXT_PLAIN: &str = "text/plain;charset=UTF-8";
const APPLICATION_JSON: &str = "application/json;charset=UTF-8";
const APPLICATION_YAML: &str = "application/yaml;charset=UTF-8";
const TEXT_HTML: &str = "text/html;charset=UTF-8";

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn full(body: impl Into<Bytes>) -> BoxBody {
    Full::new(body.into())
        .map_err(|never| -> StdError { match never {} })
        .boxed()
}

fn empty() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| -> StdError { match never {} })
        .boxed()
}

fn with_content_type(
    status: StatusCode,
    content_type: &'static str,
    body: BoxBody,
) -> Response<BoxBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn ok(content_type: &'static str, body: impl Into<Bytes>) -> Response<BoxBody> {
    with_content_type(StatusCode::OK, content_type, full(body))
}

fn status_only(status: StatusCode) -> Response<BoxBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

fn redirect_home() -> Response<BoxBody> {
    let mut response = status_only(StatusCode::TEMPORARY_REDIRECT);
    response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_static("/"));
    response
}

fn asset_response(asset: &Asset) -> Response<BoxBody> {
    ok(asset.content_type, asset.body.clone())
}

/// Reports IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) as plain IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

/// Runs [`handle_request`] inside a request span and turns its outcome into
/// the final response.
///
/// Handler errors become plaintext responses with the status from
/// [`ServiceError::status_code`]; server-side failures are logged at ERROR.
/// `X-Response-Time` is always set.
pub async fn respond<B>(
    req: Request<B>,
    state: &AppState,
    client_addr: SocketAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        path = %req.uri().path(),
        client = %canonical_ip(client_addr.ip()),
    );

    async move {
        let start = Instant::now();
        info!("request started");

        let mut response = handle_request(req, state, client_addr)
            .await
            .unwrap_or_else(|e| {
                if e.status_code().is_server_error() {
                    error!(error = %e, "request failed");
                }
                e.into_response()
                    .map(|b| b.map_err(|never| -> StdError { match never {} }).boxed())
            });

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        response
            .headers_mut()
            .insert(X_RESPONSE_TIME, HeaderValue::from(elapsed_ms));
        info!(
            status = response.status().as_u16(),
            elapsed_ms,
            "request completed"
        );
        response
    }
    .instrument(span)
    .await
}

/// Processes a single inbound request.
///
/// 1. **Rate limiting**: the `(client ip, method, path)` key must not have
///    been seen within the configured threshold, otherwise 429.
/// 2. **Static assets**: a path naming a loaded static file is served as is.
/// 3. **Routes**:
///    - `GET /bandwidth?length=L` and `POST /bandwidth` bandwidth probes
///    - `GET /empty` for round-trip time
///    - `GET /ip` for the bare client address
///    - `GET /s?<token>` for a shared result
///    - `GET /json`, `/yaml`, `/plain` for fixed representations
///    - `GET /` for the negotiated representation
/// 4. **Fallback**: anything else gets a 404.
pub async fn handle_request<B>(
    req: Request<B>,
    state: &AppState,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let ip = canonical_ip(client_addr.ip());
    // hyper keeps `get` as an extension method; routes match any case.
    let method = Method::from_bytes(req.method().as_str().to_ascii_uppercase().as_bytes())
        .unwrap_or_else(|_| req.method().clone());
    let path = req.uri().path().to_lowercase();
    let query = req.uri().query().map(str::to_owned);
    let query = query.as_deref();

    let key = rate_limit_key(ip, &method, &path);
    state.rate_limiter.check(&key).map_err(|retry_after_ms| {
        warn!(%key, retry_after_ms, "rate limit exceeded");
        ServiceError::RateLimited { retry_after_ms }
    })?;

    if let Some(asset) = state.assets.get(&path) {
        debug!("serving static asset");
        return Ok(asset_response(asset));
    }

    let config = &state.config;
    match (&method, path.as_str()) {
        (&Method::GET, "/bandwidth") => bandwidth_download(query, state),
        (&Method::POST, "/bandwidth") => {
            if headers::content_length_exceeds(req.headers(), config.max_bandwidth_bytes) {
                warn!(
                    content_length = ?headers::content_length(req.headers()),
                    limit = config.max_bandwidth_bytes,
                    "upload exceeds size limit"
                );
                return Err(ServiceError::BodyTooLarge {
                    limit: config.max_bandwidth_bytes,
                });
            }
            let received = drain_body(req.into_body(), config.max_bandwidth_bytes).await?;
            debug!(received, "upload drained");
            Ok(status_only(StatusCode::ACCEPTED))
        }
        (&Method::GET, "/empty") => Ok(status_only(StatusCode::OK)),
        (&Method::GET, "/ip") => Ok(ok(TEXT_PLAIN, ip.to_string())),
        (&Method::GET, "/s") => shared_result(req.headers(), query, state),
        (&Method::GET, "/json") => {
            let data = live_data(&req, ip, state);
            Ok(ok(APPLICATION_JSON, render_json(&data)?))
        }
        (&Method::GET, "/yaml") => {
            let data = live_data(&req, ip, state);
            Ok(ok(APPLICATION_YAML, render_yaml(&data)?))
        }
        (&Method::GET, "/plain") => Ok(ok(
            TEXT_PLAIN,
            render_text(&live_data(&req, ip, state), false, &config.links),
        )),
        (&Method::GET, p) if p.chars().all(|c| c == '/') => {
            let data = live_data(&req, ip, state);
            let representation = headers::negotiate(req.headers(), query);
            debug!(?representation, "negotiated representation");
            render_record(&data, representation, "index", state)
        }
        _ => Ok(with_content_type(
            StatusCode::NOT_FOUND,
            TEXT_PLAIN,
            full(NOT_FOUND_BODY),
        )),
    }
}

fn live_data<B>(req: &Request<B>, ip: IpAddr, state: &AppState) -> IpData {
    IpData::live(
        ip.to_string(),
        headers::header_str(req.headers(), &USER_AGENT),
        state.geo.resolve_addr(ip),
        state.config.providers.clone(),
    )
}

/// Renders a record in the negotiated representation.
///
/// HTML goes through the named template. Without it the live page falls
/// back to a static `index.html`, then to plain text; a shared record falls
/// back to JSON.
fn render_record(
    data: &IpData,
    representation: Representation,
    template: &str,
    state: &AppState,
) -> Result<Response<BoxBody>> {
    let links = &state.config.links;
    match representation {
        Representation::Text { logo } => Ok(ok(TEXT_PLAIN, render_text(data, logo, links))),
        Representation::Json => Ok(ok(APPLICATION_JSON, render_json(data)?)),
        Representation::Yaml => Ok(ok(APPLICATION_YAML, render_yaml(data)?)),
        Representation::Html => {
            if let Some(page) = state.templates.get(template) {
                let context = page_context(data, state)?;
                return Ok(ok(TEXT_HTML, page.render(&context)));
            }
            match template {
                "share" => Ok(ok(APPLICATION_JSON, render_json(data)?)),
                _ => match state.assets.get("index.html") {
                    Some(asset) => Ok(asset_response(asset)),
                    None => Ok(ok(TEXT_PLAIN, render_text(data, false, links))),
                },
            }
        }
    }
}

/// The JSON context handed to HTML templates: the record itself plus the
/// configured links, its plain-text rendering and pre-formatted network
/// test lines.
pub fn page_context(data: &IpData, state: &AppState) -> Result<Value> {
    let mut context = serde_json::to_value(data)?;
    let nettest = data.nettest.clone().unwrap_or_default();
    let rtt = nettest
        .round_trip_time
        .map_or_else(|| crate::render::MISSING.to_owned(), |rtt| format!("{rtt}ms"));

    if let Value::Object(map) = &mut context {
        map.insert("links".into(), serde_json::to_value(&state.config.links)?);
        map.insert(
            "text_response".into(),
            Value::String(strip_ansi(&render_text(data, false, &[]))),
        );
        map.insert("rtt".into(), Value::String(rtt));
        map.insert(
            "dl_speed".into(),
            Value::String(format_leg(nettest.download.as_ref())),
        );
        map.insert(
            "ul_speed".into(),
            Value::String(format_leg(nettest.upload.as_ref())),
        );
    }
    Ok(context)
}

fn shared_result(
    headers: &HeaderMap,
    query: Option<&str>,
    state: &AppState,
) -> Result<Response<BoxBody>> {
    let payload = match share::decode(query.unwrap_or_default()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "rejected share token");
            return Ok(redirect_home());
        }
    };

    let ip_details = state.geo.resolve(&payload.ip);
    let data = payload.into_ip_data(ip_details, state.config.providers.clone());

    // Shared records never carry the logo.
    let representation = match headers::negotiate(headers, None) {
        Representation::Text { .. } => Representation::Text { logo: false },
        other => other,
    };
    render_record(&data, representation, "share", state)
}

/// Parses `length` for `GET /bandwidth`.
///
/// Absent or non-numeric values fall back to the default; negative values
/// and values above `max` are rejected, however many digits they have.
pub fn requested_length(raw: Option<&str>, default: u64, max: u64) -> Result<u64> {
    let negative = || {
        ServiceError::InvalidLength("Request size must be greater than or equal to 0".into())
    };
    let length = match raw.map(str::trim).map(str::parse::<i64>) {
        Some(Ok(length)) => length,
        Some(Err(e)) => match e.kind() {
            IntErrorKind::PosOverflow => return Err(ServiceError::BodyTooLarge { limit: max }),
            IntErrorKind::NegOverflow => return Err(negative()),
            _ => return Ok(default),
        },
        None => return Ok(default),
    };
    let length = u64::try_from(length).map_err(|_| negative())?;
    if length > max {
        return Err(ServiceError::BodyTooLarge { limit: max });
    }
    Ok(length)
}

/// Builds a bandwidth payload of exactly `length` bytes: the server time in
/// epoch milliseconds and a space, then a random alphanumeric sample
/// repeated to fill.
pub fn bandwidth_payload(length: usize) -> Bytes {
    let sample: Vec<u8> = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(36)
        .collect();

    let mut payload = Vec::with_capacity(length);
    payload.extend_from_slice(format!("{} ", now_ms()).as_bytes());
    payload.truncate(length);
    while payload.len() < length {
        let take = (length - payload.len()).min(sample.len());
        payload.extend_from_slice(&sample[..take]);
    }
    Bytes::from(payload)
}

fn bandwidth_download(query: Option<&str>, state: &AppState) -> Result<Response<BoxBody>> {
    let config = &state.config;
    let length = requested_length(
        headers::query_param(query, "length"),
        config.default_bandwidth_length,
        config.max_bandwidth_bytes,
    )
    .inspect_err(|e| warn!(error = %e, "rejected bandwidth length"))?;

    let length = usize::try_from(length)
        .map_err(|_| ServiceError::Internal(format!("length {length} does not fit in memory")))?;

    let mut response = ok(TEXT_PLAIN, bandwidth_payload(length));
    let headers = response.headers_mut();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// Reads and discards a request body, failing once more than `limit` bytes
/// have arrived. Returns the number of bytes received.
async fn drain_body<B>(body: B, limit: u64) -> Result<u64>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let mut body = body.map_err(|e| -> StdError { e.into() }).boxed();
    let mut received: u64 = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ServiceError::Body(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            received = received.saturating_add(data.len() as u64);
            if received > limit {
                warn!(received, limit, "upload exceeded size limit while streaming");
                return Err(ServiceError::BodyTooLarge { limit });
            }
        }
    }
    Ok(received)
}
