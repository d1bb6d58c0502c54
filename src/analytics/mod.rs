//! Click analytics pipeline
//!
//! Clicks are appended to a per-code buffer on the redirect path
//! ([`ingestor`]), moved into the analytics table by a periodic
//! [`worker`] that enriches them with user-agent, geo and calendar
//! fields, and read back as grouped counts by the [`reader`].

pub mod enrich;
pub mod geoip;
pub mod ingestor;
pub mod ip_extractor;
pub mod models;
pub mod reader;
pub mod user_agent;
pub mod worker;

pub use geoip::{GeoIpService, GeoLookup, GeoResolver, RemoteGeoLookup};
pub use ingestor::Ingestor;
pub use ip_extractor::extract_client_ip;
pub use models::{AggregateView, DashboardView, EnrichedClickRecord, GeoLocation, RawClickEvent};
pub use reader::{AggregationError, AggregationReader};
pub use worker::{EnrichmentWorker, TickReport, WorkerHandle};
