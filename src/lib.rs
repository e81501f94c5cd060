//! A small diagnostic HTTP service, built on [Hyper].
//!
//! For every request it reports the client's IP address, geolocation and
//! ASN details from offline MaxMind-format databases, the user agent and the
//! server time, rendered as ANSI text, JSON, YAML or HTML. It also answers
//! the latency and bandwidth probes used by the browser client, and renders
//! results shared through a self-contained `/s?<token>` link.
//!
//! [Hyper]: https://hyper.rs/

pub mod assets;
pub mod config;
pub mod error;
pub mod geoip;
pub mod handler;
pub mod headers;
pub mod ip_data;
pub mod rate_limit;
pub mod render;
pub mod server;
pub mod share;
pub mod templates;

pub use assets::StaticAssets;
pub use config::{Config, GeoDbPaths, Link, RuntimeConfig};
pub use error::ServiceError;
pub use geoip::{GeoResolver, IpDetails};
pub use handler::{BoxBody, X_RESPONSE_TIME, handle_request, respond};
pub use headers::Representation;
pub use ip_data::IpData;
pub use rate_limit::RateLimiter;
pub use server::AppState;
pub use templates::Templates;

/// A convenience `Result` alias using [`ServiceError`] as the error type.
pub type Result<T> = std::result::Result<T, ServiceError>;
