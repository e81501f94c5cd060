//! Offline geolocation lookups backed by MaxMind-format databases.
//!
//! Databases are opened once at startup by [`GeoResolver::load`] and are
//! read-only afterwards, so concurrent lookups need no locking. Each database
//! is optional: a missing or unreadable file is logged and left out, and the
//! matching [`IpDetails`] field is simply absent for every lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use maxminddb::Reader;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::GeoDbPaths;

/// The database kinds the resolver knows how to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GeoDatabase {
    AnonymousIp,
    Asn,
    City,
    Country,
    ConnectionType,
    Domain,
    Isp,
}

impl GeoDatabase {
    pub const ALL: [GeoDatabase; 7] = [
        Self::AnonymousIp,
        Self::Asn,
        Self::City,
        Self::Country,
        Self::ConnectionType,
        Self::Domain,
        Self::Isp,
    ];

    /// The database name as used in configuration and serialized output.
    pub fn name(self) -> &'static str {
        match self {
            Self::AnonymousIp => "anonymousIP",
            Self::Asn => "asn",
            Self::City => "city",
            Self::Country => "country",
            Self::ConnectionType => "connectionType",
            Self::Domain => "domain",
            Self::Isp => "isp",
        }
    }

    fn configured_path(self, paths: &GeoDbPaths) -> Option<&str> {
        let path = match self {
            Self::AnonymousIp => &paths.anonymous_ip,
            Self::Asn => &paths.asn,
            Self::City => &paths.city,
            Self::Country => &paths.country,
            Self::ConnectionType => &paths.connection_type,
            Self::Domain => &paths.domain,
            Self::Isp => &paths.isp,
        };
        path.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

impl fmt::Display for GeoDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Localized names keyed by language code (`en`, `de`, ...).
pub type Names = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsnRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_system_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_system_organization: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedPlace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoname_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Names>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Continent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoname_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Names>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Country {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoname_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_in_european_union: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Names>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_radius: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<NamedPlace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<Continent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<Country>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdivisions: Option<Vec<NamedPlace>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<Continent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<Country>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_country: Option<Country>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IspRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_system_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_system_organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTypeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnonymousIpRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_anonymous: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_anonymous_vpn: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_hosting_provider: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public_proxy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_residential_proxy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_tor_exit_node: Option<bool>,
}

/// Geolocation details for one address, one optional record per database.
///
/// An absent field means the database is not loaded or holds no record for
/// the address; it is never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<AsnRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<CityRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<CountryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<IspRecord>,
    #[serde(
        default,
        rename = "connectionType",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_type: Option<ConnectionTypeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainRecord>,
    #[serde(
        default,
        rename = "anonymousIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub anonymous_ip: Option<AnonymousIpRecord>,
}

impl IpDetails {
    /// Returns `true` if no database produced a record.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Returns the English name from a localized name map.
pub fn english(names: Option<&Names>) -> Option<&str> {
    names.and_then(|n| n.get("en")).map(String::as_str)
}

/// Resolves addresses against every loaded geolocation database.
#[derive(Default)]
pub struct GeoResolver {
    readers: BTreeMap<GeoDatabase, Reader<Vec<u8>>>,
}

impl fmt::Debug for GeoResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoResolver")
            .field("loaded", &self.loaded())
            .finish()
    }
}

impl GeoResolver {
    /// A resolver with no databases; every lookup yields empty details.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Opens every database with a configured path.
    ///
    /// Empty paths are skipped silently. Files that are missing or fail to
    /// parse are logged at ERROR and left unregistered.
    pub fn load(paths: &GeoDbPaths) -> Self {
        let mut readers = BTreeMap::new();
        for db in GeoDatabase::ALL {
            let Some(path) = db.configured_path(paths) else {
                continue;
            };
            match open_reader(Path::new(path)) {
                Ok(reader) => {
                    info!(database = %db, path, "opened geolocation database");
                    readers.insert(db, reader);
                }
                Err(e) => {
                    error!(database = %db, path, error = %e, "failed to open geolocation database");
                }
            }
        }
        Self { readers }
    }

    /// Returns the names of the loaded databases in lookup order.
    pub fn loaded(&self) -> Vec<GeoDatabase> {
        self.readers.keys().copied().collect()
    }

    /// Returns `true` if the given database was loaded.
    pub fn is_loaded(&self, db: GeoDatabase) -> bool {
        self.readers.contains_key(&db)
    }

    /// Looks up `ip` in every loaded database.
    ///
    /// Strings that are not valid IPv4/IPv6 addresses yield empty details.
    pub fn resolve(&self, ip: &str) -> IpDetails {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.resolve_addr(addr),
            Err(_) => {
                debug!(ip, "not an IP address, skipping geolocation");
                IpDetails::default()
            }
        }
    }

    /// Looks up a parsed address in every loaded database.
    pub fn resolve_addr(&self, ip: IpAddr) -> IpDetails {
        IpDetails {
            asn: self.lookup(GeoDatabase::Asn, ip),
            city: self.lookup(GeoDatabase::City, ip),
            country: self.lookup(GeoDatabase::Country, ip),
            isp: self.lookup(GeoDatabase::Isp, ip),
            connection_type: self.lookup(GeoDatabase::ConnectionType, ip),
            domain: self.lookup(GeoDatabase::Domain, ip),
            anonymous_ip: self.lookup(GeoDatabase::AnonymousIp, ip),
        }
    }

    fn lookup<T: DeserializeOwned>(&self, db: GeoDatabase, ip: IpAddr) -> Option<T> {
        let reader = self.readers.get(&db)?;
        let result = match reader.lookup(ip) {
            Ok(result) => result,
            Err(e) => {
                debug!(database = %db, %ip, error = %e, "geolocation lookup failed");
                return None;
            }
        };
        if !result.has_data() {
            return None;
        }
        match result.decode::<T>() {
            Ok(record) => record,
            Err(e) => {
                debug!(database = %db, %ip, error = %e, "failed to decode geolocation record");
                None
            }
        }
    }
}

fn open_reader(path: &Path) -> Result<Reader<Vec<u8>>, String> {
    let meta = std::fs::metadata(path).map_err(|e| e.to_string())?;
    if !meta.is_file() {
        return Err("not a regular file".into());
    }
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    Reader::from_source(bytes).map_err(|e| e.to_string())
}
