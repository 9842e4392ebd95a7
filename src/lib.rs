//! domain_recon library: DNS attack-surface discovery.
//!
//! This library discovers the DNS-visible footprint of an apex domain by
//! combining passive intelligence sources (certificate transparency,
//! hostsearch feeds, threat intel APIs) with active enumeration (zone
//! transfer attempts and wordlist bruteforce). Candidates flow through a
//! racing multi-server DNS resolver, wildcard/CDN/scope filters, optional
//! HTTP probing, and out to local sinks and remote collectors.
//!
//! # Example
//!
//! ```no_run
//! use domain_recon::{run_scan, Config};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut config = Config::default();
//! config.domain = "example.com".into();
//! let report = run_scan(config).await?;
//! println!("{} record(s) written", report.records_written);
//! # Ok(())
//! # }
//! ```

pub mod active;
mod app;
pub mod config;
pub mod dns;
pub mod exporter;
pub mod filters;
pub mod http_client;
mod intern;
pub mod notifier;
pub mod output;
pub mod passive;
pub mod probe;
pub mod ratelimit;
pub mod resolver;
mod run;
mod stats;

pub use app::logging::init_logger;
pub use config::{Config, Mode, OutputFormat};
pub use run::{run_scan, ScanReport};
