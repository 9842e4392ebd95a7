//! Default values shared by the CLI and library configuration.

pub const DEFAULT_USER_AGENT: &str = concat!("domain_recon/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_THREADS: usize = 50;
pub const DEFAULT_DNS_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_WATCH_INTERVAL_SECS: f64 = 300.0;
pub const DEFAULT_DNS_CACHE_SIZE: usize = 10_000;
pub const EXPORT_BATCH_SIZE: usize = 100;

pub const API_KEY_ENV: &str = "DOMAIN_RECON_API_KEY";
pub const VIRUSTOTAL_API_KEY_ENVS: [&str; 2] =
    ["DOMAIN_RECON_VIRUSTOTAL_API_KEY", "VIRUSTOTAL_API_KEY"];
