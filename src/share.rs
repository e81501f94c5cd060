//! Stateless result sharing.
//!
//! A shared result lives entirely in the URL: the client serializes a compact
//! JSON object, Base64-encodes it and appends it as the whole query string of
//! `/s`. The server keeps nothing. Anyone holding the token can view the
//! record, and tokens never expire.
//!
//! Geolocation details are not part of the token; they are looked up again
//! from the embedded `ip` each time the result is viewed.
//!
//! Wire form:
//!
//! ```text
//! { "ip": "...", "ua": "...",
//!   "nt": { "rtt": 12, "dl": { "sz": .., "t": .., "rt": .., "s": .. }, "ul": { .. } },
//!   "btu": "...", "btl": "...", "stu": "...", "e": "...", "c": "..." }
//! ```

use std::fmt;

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Serialize};

use crate::config::Link;
use crate::geoip::IpDetails;
use crate::ip_data::{IpData, NetTest, NetTestLeg, is_ip4};

/// Standard alphabet, padding optional. URL-safe input is mapped onto it
/// before decoding.
const TOLERANT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Why a share token could not be turned into a record.
#[derive(Debug)]
pub enum ShareError {
    /// The query string was empty.
    Empty,
    /// The token is not valid Base64.
    Base64(base64::DecodeError),
    /// The decoded bytes are not the expected JSON object.
    Json(serde_json::Error),
    /// The payload carries an empty `ip`.
    MissingIp,
}

impl fmt::Display for ShareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty share token"),
            Self::Base64(e) => write!(f, "share token is not valid base64: {e}"),
            Self::Json(e) => write!(f, "share token is not a valid result: {e}"),
            Self::MissingIp => write!(f, "share token has no ip"),
        }
    }
}

impl std::error::Error for ShareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Base64(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Empty | Self::MissingIp => None,
        }
    }
}

/// Compact form of a bandwidth leg.
///
/// Browsers serialize a non-finite number as `null`, so every field may be
/// missing. A leg with a missing field is dropped rather than failing the
/// whole token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactLeg {
    #[serde(default)]
    pub sz: Option<f64>,
    #[serde(default)]
    pub t: Option<f64>,
    #[serde(default)]
    pub rt: Option<f64>,
    #[serde(default)]
    pub s: Option<f64>,
}

impl CompactLeg {
    fn into_leg(self) -> Option<NetTestLeg> {
        let finite = |v: Option<f64>| v.filter(|v| v.is_finite());
        Some(NetTestLeg {
            size: finite(self.sz)?,
            time: finite(self.t)?,
            response_time: finite(self.rt)?,
            speed: finite(self.s)?,
        })
    }
}

/// Compact form of the network test results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactNetTest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dl: Option<CompactLeg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ul: Option<CompactLeg>,
}

/// The JSON object carried by a share token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharePayload {
    pub ip: String,
    #[serde(default)]
    pub ua: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nt: Option<CompactNetTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

impl From<&NetTestLeg> for CompactLeg {
    fn from(leg: &NetTestLeg) -> Self {
        Self {
            sz: Some(leg.size),
            t: Some(leg.time),
            rt: Some(leg.response_time),
            s: Some(leg.speed),
        }
    }
}

impl From<&NetTest> for CompactNetTest {
    fn from(nt: &NetTest) -> Self {
        Self {
            rtt: nt.round_trip_time,
            dl: nt.download.as_ref().map(CompactLeg::from),
            ul: nt.upload.as_ref().map(CompactLeg::from),
        }
    }
}

impl From<CompactNetTest> for NetTest {
    fn from(nt: CompactNetTest) -> Self {
        Self {
            round_trip_time: nt.rtt,
            download: nt.dl.and_then(CompactLeg::into_leg),
            upload: nt.ul.and_then(CompactLeg::into_leg),
        }
    }
}

impl From<&IpData> for SharePayload {
    fn from(data: &IpData) -> Self {
        Self {
            ip: data.ip.clone(),
            ua: data.ua.clone(),
            nt: data.nettest.as_ref().map(CompactNetTest::from),
            btu: data.browsertimeutc.clone(),
            btl: data.browsertimelocal.clone(),
            stu: Some(data.servertime.clone()),
            e: data.saved_error.clone(),
            c: data.comment.clone(),
        }
    }
}

impl SharePayload {
    /// Expands the payload into a full record, attaching freshly resolved
    /// geolocation details and the configured providers.
    pub fn into_ip_data(self, ip_details: IpDetails, providers: Vec<Link>) -> IpData {
        IpData {
            is_ip4: is_ip4(&self.ip),
            ip: self.ip,
            ua: self.ua,
            ip_details,
            providers,
            servertime: self.stu.unwrap_or_default(),
            browsertimeutc: self.btu,
            browsertimelocal: self.btl,
            nettest: self.nt.map(NetTest::from),
            saved_error: self.e,
            comment: self.c,
        }
    }
}

/// Encodes a payload as a URL-safe, unpadded token.
pub fn encode(payload: &SharePayload) -> Result<String, ShareError> {
    let json = serde_json::to_vec(payload).map_err(ShareError::Json)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decodes the raw query string of `/s` into a payload.
///
/// Accepts the standard and URL-safe alphabets, with or without padding, and
/// tolerates the percent-escapes and `+`→space mangling a URL may pick up.
pub fn decode(token: &str) -> Result<SharePayload, ShareError> {
    let token = normalize(token);
    if token.is_empty() {
        return Err(ShareError::Empty);
    }

    let bytes = TOLERANT.decode(token.as_bytes()).map_err(ShareError::Base64)?;
    let payload: SharePayload = serde_json::from_slice(&bytes).map_err(ShareError::Json)?;
    if payload.ip.trim().is_empty() {
        return Err(ShareError::MissingIp);
    }
    Ok(payload)
}

fn normalize(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token.trim();
    while let Some(c) = rest.chars().next() {
        if c == '%' {
            let escaped = match rest.get(1..3).map(str::to_ascii_uppercase).as_deref() {
                Some("3D") => Some('='),
                Some("2B") => Some('+'),
                Some("2F") => Some('/'),
                _ => None,
            };
            if let Some(decoded) = escaped {
                out.push(decoded);
                rest = &rest[3..];
                continue;
            }
        }
        out.push(match c {
            ' ' | '-' => '+',
            '_' => '/',
            other => other,
        });
        rest = &rest[c.len_utf8()..];
    }
    out
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;

    use super::*;

    fn full_record() -> IpData {
        IpData {
            ip: "203.0.113.9".into(),
            is_ip4: true,
            ua: "Mozilla/5.0 (X11; Linux x86_64)".into(),
            ip_details: IpDetails::default(),
            providers: vec![],
            servertime: "2024-01-31T12:00:00.000Z".into(),
            browsertimeutc: Some("Wed, 31 Jan 2024 12:00:01 GMT".into()),
            browsertimelocal: Some("31/01/2024, 13:00:01".into()),
            nettest: Some(NetTest {
                round_trip_time: Some(23.0),
                download: Some(NetTestLeg {
                    size: 1_000_000.0,
                    time: 812.5,
                    response_time: 4.0,
                    speed: 9_846_153.8,
                }),
                upload: None,
            }),
            saved_error: Some("upload failed".into()),
            comment: Some("über café ✓".into()),
        }
    }

    #[test]
    fn round_trip_preserves_every_carried_field() {
        let original = full_record();
        let token = encode(&SharePayload::from(&original)).unwrap();
        let decoded = decode(&token).unwrap().into_ip_data(IpDetails::default(), vec![]);
        assert_eq!(decoded, original);
    }

    #[test]
    fn compact_names_map_to_canonical_fields() {
        let json = r#"{"ip":"::1","ua":"x","nt":{"rtt":7,"ul":{"sz":10,"t":20,"rt":1,"s":400}},
            "btu":"u","btl":"l","stu":"s","e":"err","c":"note"}"#;
        let token = STANDARD.encode(json);
        let data = decode(&token).unwrap().into_ip_data(IpDetails::default(), vec![]);

        assert!(!data.is_ip4);
        assert_eq!(data.servertime, "s");
        assert_eq!(data.browsertimeutc.as_deref(), Some("u"));
        assert_eq!(data.browsertimelocal.as_deref(), Some("l"));
        assert_eq!(data.saved_error.as_deref(), Some("err"));
        assert_eq!(data.comment.as_deref(), Some("note"));
        let nt = data.nettest.unwrap();
        assert_eq!(nt.round_trip_time, Some(7.0));
        assert!(nt.download.is_none());
        let ul = nt.upload.unwrap();
        assert_eq!((ul.size, ul.time, ul.response_time, ul.speed), (10.0, 20.0, 1.0, 400.0));
    }

    #[test]
    fn leg_with_null_speed_is_dropped() {
        let json = r#"{"ip":"1.2.3.4","nt":{"rtt":5,
            "dl":{"sz":1000,"t":0,"rt":0,"s":null},"ul":{"sz":10,"t":20,"rt":1,"s":400}}}"#;
        let data = decode(&STANDARD.encode(json))
            .unwrap()
            .into_ip_data(IpDetails::default(), vec![]);

        let nt = data.nettest.unwrap();
        assert_eq!(nt.round_trip_time, Some(5.0));
        assert!(nt.download.is_none());
        assert_eq!(nt.upload.unwrap().speed, 400.0);
    }

    #[test]
    fn accepts_standard_and_url_safe_alphabets() {
        // `?>` encodes to a '+' or '-' depending on the alphabet.
        let json = r#"{"ip":"1.2.3.4","c":"??>>"}"#;
        let standard = STANDARD.encode(json);
        let url_safe = URL_SAFE_NO_PAD.encode(json);
        assert_ne!(standard.trim_end_matches('='), url_safe);

        assert_eq!(decode(&standard).unwrap().c.as_deref(), Some("??>>"));
        assert_eq!(decode(&url_safe).unwrap().c.as_deref(), Some("??>>"));
        assert_eq!(
            decode(&standard.replace('=', "%3D")).unwrap().c.as_deref(),
            Some("??>>")
        );
        assert_eq!(
            decode(&standard.replace('+', " ")).unwrap().c.as_deref(),
            Some("??>>")
        );
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(decode(""), Err(ShareError::Empty)));
        assert!(matches!(decode("   "), Err(ShareError::Empty)));
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert!(matches!(decode("!!not*base64!!"), Err(ShareError::Base64(_))));
    }

    #[test]
    fn non_json_payload_is_rejected() {
        let token = STANDARD.encode("hello there");
        assert!(matches!(decode(&token), Err(ShareError::Json(_))));
    }

    #[test]
    fn missing_or_empty_ip_is_rejected() {
        let missing = STANDARD.encode(r#"{"ua":"x"}"#);
        assert!(matches!(decode(&missing), Err(ShareError::Json(_))));

        let empty = STANDARD.encode(r#"{"ip":"  "}"#);
        assert!(matches!(decode(&empty), Err(ShareError::MissingIp)));
    }

    #[test]
    fn encoded_tokens_are_url_safe() {
        let token = encode(&SharePayload::from(&full_record())).unwrap();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }
}
