//! The diagnostic record rendered by every representation.

use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Link;
use crate::geoip::IpDetails;

static IPV4_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}$")
        .expect("IPv4 shape pattern is valid")
});

/// Returns `true` if `ip` looks like a dotted quad.
///
/// This is a syntactic check only: `999.999.999.999` passes.
pub fn is_ip4(ip: &str) -> bool {
    IPV4_SHAPE.is_match(ip)
}

/// Server time in ISO-8601 with millisecond precision, e.g.
/// `2024-01-31T12:00:00.000Z`.
pub fn server_time_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One leg (download or upload) of a bandwidth measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetTestLeg {
    /// Transferred bytes.
    pub size: f64,
    /// Transfer time in milliseconds.
    pub time: f64,
    /// Server processing time in milliseconds, from `X-Response-Time`.
    pub response_time: f64,
    /// Measured speed in bits per second.
    pub speed: f64,
}

/// Client-side network measurements attached to a shared result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetTest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<NetTestLeg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<NetTestLeg>,
}

/// The canonical diagnostic record.
///
/// Built fresh for every response and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpData {
    pub ip: String,
    pub is_ip4: bool,
    pub ua: String,
    #[serde(default)]
    pub ip_details: IpDetails,
    #[serde(default)]
    pub providers: Vec<Link>,
    pub servertime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browsertimeutc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browsertimelocal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nettest: Option<NetTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl IpData {
    /// Builds the live record for a connection, stamped with the current
    /// server time.
    pub fn live(
        ip: impl Into<String>,
        ua: impl Into<String>,
        ip_details: IpDetails,
        providers: Vec<Link>,
    ) -> Self {
        let ip = ip.into();
        Self {
            is_ip4: is_ip4(&ip),
            ip,
            ua: ua.into(),
            ip_details,
            providers,
            servertime: server_time_now(),
            browsertimeutc: None,
            browsertimelocal: None,
            nettest: None,
            saved_error: None,
            comment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_shape_detection() {
        assert!(is_ip4("192.168.1.1"));
        assert!(is_ip4("999.999.999.999"));
        assert!(!is_ip4("::1"));
        assert!(!is_ip4("::ffff:192.168.1.1"));
        assert!(!is_ip4("1.2.3"));
        assert!(!is_ip4("1.2.3.4.5"));
        assert!(!is_ip4("1234.1.1.1"));
    }

    #[test]
    fn server_time_is_iso8601_utc() {
        let ts = server_time_now();
        assert!(ts.ends_with('Z'), "{ts}");
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn live_record_omits_shared_only_fields() {
        let data = IpData::live("10.1.2.3", "curl/8.0", IpDetails::default(), vec![]);
        assert!(data.is_ip4);

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["ip"], "10.1.2.3");
        assert_eq!(json["ua"], "curl/8.0");
        for absent in ["nettest", "saved_error", "comment", "browsertimeutc"] {
            assert!(json.get(absent).is_none(), "{absent} should be omitted");
        }
    }
}
