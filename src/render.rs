//! Response bodies for the non-HTML representations.
//!
//! The plain-text form is ANSI-coloured: every labelled span is wrapped in an
//! SGR sequence and closed with a reset. Blocks always appear in the same
//! order and optional ones are skipped when their data is absent.

use crate::Result;
use crate::config::Link;
use crate::geoip::{IpDetails, english};
use crate::ip_data::{IpData, NetTestLeg};

pub const BOLD: u8 = 1;
pub const FAINT: u8 = 2;
pub const ITALIC: u8 = 3;
pub const UNDERLINE: u8 = 4;
pub const RED: u8 = 31;
pub const GREEN: u8 = 32;
pub const YELLOW: u8 = 33;
pub const BLUE: u8 = 34;
pub const MAGENTA: u8 = 35;
pub const CYAN: u8 = 36;

/// Rendered in place of a missing measurement.
pub const MISSING: &str = "---";

const LOGO: &str = "
                          00000000000000
                        0000  000000000000
                        000000000000000000
                        000000000000000000
                        00000000
                        00000000000000
                      00000000
                    0000000000
                  0000000000000000
  00            00000000000000  00
  0000        0000000000000000
  000000    0000  00      0000
  00000000000000  00  00  0000
    000000000000  00      00
      0000000000  00  000000
        000000000000000000
          00000000000000
            000000  0000
            0000     000
            00        00
            0000      0000

";

/// Wraps `text` in an SGR sequence made of `codes`, followed by a reset.
pub fn wrap(text: &str, codes: &[u8]) -> String {
    let codes = codes
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(";");
    format!("\x1b[{codes}m{text}\x1b[0m")
}

/// The block-character banner followed by one `name: url` line per link.
pub fn logo(links: &[Link]) -> String {
    let links_text = links
        .iter()
        .map(|link| format!("  {}: {}", link.name, wrap(&link.url, &[UNDERLINE])))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}{links_text}\n\n", LOGO.replace('0', "▓"))
}

/// Human-scales a speed in bits per second.
///
/// `500` → `500`, `1500` → `1.5K`, `2500000` → `2.5M`, `3000000000` → `3G`.
/// The `M` and `G` tiers are rounded to three decimals.
pub fn format_speed(speed: f64) -> String {
    if speed >= 1_000_000_000.0 {
        format!("{}G", (speed / 1_000_000.0).round() / 1_000.0)
    } else if speed >= 1_000_000.0 {
        format!("{}M", (speed / 1_000.0).round() / 1_000.0)
    } else if speed >= 1_000.0 {
        format!("{}K", speed / 1_000.0)
    } else {
        format!("{speed}")
    }
}

/// `<speed>bit/s (<kB>kB / <s>s)`, or `---` for a missing leg.
pub fn format_leg(leg: Option<&NetTestLeg>) -> String {
    match leg {
        Some(leg) => format!(
            "{}bit/s ({}kB / {}s)",
            format_speed(leg.speed),
            leg.size / 1_000.0,
            leg.time / 1_000.0
        ),
        None => MISSING.to_owned(),
    }
}

fn country_line(details: &IpDetails) -> Option<String> {
    let (continent, country) = match (&details.city, &details.country) {
        (Some(city), _) if city.country.is_some() => {
            (city.continent.as_ref(), city.country.as_ref())
        }
        (_, Some(country)) => (country.continent.as_ref(), country.country.as_ref()),
        _ => return None,
    };
    let country = country?;

    let codes = [
        continent.and_then(|c| c.code.as_deref()),
        country.iso_code.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");

    Some(match english(country.names.as_ref()) {
        Some(name) if codes.is_empty() => name.to_owned(),
        Some(name) => format!("{codes} - {name}"),
        None => codes,
    })
}

fn geolocation_block(data: &IpData, out: &mut String) {
    let details = &data.ip_details;
    if details.asn.is_none() && details.city.is_none() && details.country.is_none() {
        return;
    }

    out.push_str(&wrap("\nIP Geolocation Details", &[BOLD, BLUE]));
    if !data.providers.is_empty() {
        let credits = data
            .providers
            .iter()
            .map(|p| format!("{} ({})", p.name, wrap(&p.url, &[UNDERLINE])))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&wrap(&format!(" Provided by {credits}"), &[ITALIC, FAINT]));
    }
    out.push('\n');

    if let Some(asn) = &details.asn {
        let org = asn.autonomous_system_organization.as_deref().unwrap_or("");
        let number = asn
            .autonomous_system_number
            .map(|n| n.to_string())
            .unwrap_or_default();
        out.push_str(&format!(
            "{}{org} (AS{number})\n",
            wrap("  Provider: ", &[BOLD])
        ));
    }
    if let Some(line) = country_line(details) {
        out.push_str(&format!("{}{line}\n", wrap("  Country:  ", &[BOLD])));
    }
    let city = details
        .city
        .as_ref()
        .and_then(|c| c.city.as_ref())
        .and_then(|c| english(c.names.as_ref()));
    if let Some(city) = city {
        out.push_str(&format!("{}{city}\n", wrap("  City:     ", &[BOLD])));
    }
    out.push('\n');
}

/// Renders `data` as ANSI-coloured text, optionally preceded by the logo
/// and `links`.
pub fn render_text(data: &IpData, with_logo: bool, links: &[Link]) -> String {
    let mut out = if with_logo { logo(links) } else { String::new() };

    let family = if data.is_ip4 { 4 } else { 6 };
    out.push_str(&wrap(&format!("IPv{family} Address: "), &[BOLD, GREEN]));
    out.push_str(&wrap(&data.ip, &[BOLD, UNDERLINE, GREEN]));
    out.push('\n');

    geolocation_block(data, &mut out);

    out.push_str(&wrap("User Agent: ", &[BOLD, YELLOW]));
    out.push_str(&data.ua);
    out.push_str("\n\n");

    out.push_str(&wrap("Server time (UTC): ", &[BOLD, CYAN]));
    out.push_str(&data.servertime);
    out.push('\n');
    if let Some(utc) = &data.browsertimeutc {
        out.push_str(&format!("{}{utc}\n", wrap("Browser time (UTC): ", &[BOLD, CYAN])));
    }
    if let Some(local) = &data.browsertimelocal {
        out.push_str(&format!(
            "{}{local}\n",
            wrap("Browser time (Local): ", &[BOLD, CYAN])
        ));
    }

    if let Some(nettest) = &data.nettest {
        let rtt = nettest
            .round_trip_time
            .map_or_else(|| MISSING.to_owned(), |rtt| format!("{rtt}ms"));
        out.push('\n');
        out.push_str(&wrap("Network Test", &[BOLD, MAGENTA]));
        out.push('\n');
        out.push_str(&format!("{}{rtt}\n", wrap("  Round-trip time: ", &[BOLD])));
        out.push_str(&format!(
            "{}{}\n",
            wrap("  Download speed:  ", &[BOLD]),
            format_leg(nettest.download.as_ref())
        ));
        out.push_str(&format!(
            "{}{}\n",
            wrap("  Upload speed:    ", &[BOLD]),
            format_leg(nettest.upload.as_ref())
        ));
    }

    if let Some(error) = &data.saved_error {
        out.push('\n');
        out.push_str(&wrap("Error: ", &[BOLD, RED]));
        out.push_str(error);
        out.push('\n');
    }
    if let Some(comment) = &data.comment {
        out.push('\n');
        out.push_str(&wrap("Comment: ", &[BOLD]));
        out.push_str(comment);
        out.push('\n');
    }

    out
}

/// Serializes `data` as JSON.
pub fn render_json(data: &IpData) -> Result<String> {
    Ok(serde_json::to_string(data)?)
}

/// Serializes `data` as YAML.
pub fn render_yaml(data: &IpData) -> Result<String> {
    Ok(serde_yaml::to_string(data)?)
}
