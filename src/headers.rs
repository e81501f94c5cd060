//! Request header and query helpers: content negotiation for the record
//! routes and `Content-Length` checks for the bandwidth probe.

use hyper::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, USER_AGENT};

/// How a diagnostic record is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// ANSI-coloured text, optionally preceded by the logo banner.
    Text { logo: bool },
    Json,
    Yaml,
    Html,
}

impl Representation {
    fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            "application/json" | "text/json" => Some(Self::Json),
            "application/yaml" | "text/yaml" => Some(Self::Yaml),
            "text/plain" => Some(Self::Text { logo: false }),
            _ => None,
        }
    }
}

/// Returns the header value as a string, or `""` when absent or not ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Returns the lowercased media type of a header, without parameters.
///
/// `"Application/JSON; charset=utf-8"` → `"application/json"`.
pub fn media_type(headers: &HeaderMap, name: &HeaderName) -> String {
    header_str(headers, name)
        .split([';', ','])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Returns `true` if the query string contains `name` as a key, with or
/// without a value.
pub fn has_query_flag(query: Option<&str>, name: &str) -> bool {
    query_pairs(query).any(|(key, _)| key == name)
}

/// Returns the first value of `name` in the query string.
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query_pairs(query).find(|(key, _)| *key == name).map(|(_, v)| v)
}

fn query_pairs(query: Option<&str>) -> impl Iterator<Item = (&str, &str)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

/// Picks the representation for the root and share routes.
///
/// In priority order:
/// 1. `Content-Type: text/plain`, or a `curl/` user agent with no
///    `Content-Type` → ANSI text. The logo is shown only for the curl case
///    and only without a `nologo` query flag.
/// 2. `Content-Type` JSON → JSON.
/// 3. `Content-Type` YAML → YAML.
/// 4. No `Content-Type` and an `Accept` whose first entry is JSON, YAML or
///    plain text → that representation. Browsers lead with `text/html`
///    and so still land on HTML.
/// 5. Otherwise HTML.
pub fn negotiate(headers: &HeaderMap, query: Option<&str>) -> Representation {
    let content_type = media_type(headers, &CONTENT_TYPE);
    let is_curl = header_str(headers, &USER_AGENT).starts_with("curl/");

    if content_type.is_empty() {
        if is_curl {
            return Representation::Text {
                logo: !has_query_flag(query, "nologo"),
            };
        }
        return Representation::from_media_type(&media_type(headers, &ACCEPT))
            .unwrap_or(Representation::Html);
    }

    Representation::from_media_type(&content_type).unwrap_or(Representation::Html)
}

/// Returns the declared `Content-Length`, if present and numeric.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Returns `true` if the `Content-Length` header value exceeds the given
/// maximum body size in bytes.
///
/// Returns `false` if no `Content-Length` is present or the value is
/// unparseable (hyper rejects malformed lengths at the protocol level).
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    content_length(headers).is_some_and(|len| len > max_bytes)
}
