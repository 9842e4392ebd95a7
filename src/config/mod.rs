//! Runtime configuration and CLI surface.

pub mod constants;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, ValueEnum};

use constants::{
    API_KEY_ENV, DEFAULT_DNS_CACHE_SIZE, DEFAULT_DNS_TIMEOUT_SECS, DEFAULT_THREADS,
    DEFAULT_TIMEOUT_SECS, DEFAULT_WATCH_INTERVAL_SECS, VIRUSTOTAL_API_KEY_ENVS,
};

/// Which discovery subsystems to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Passive sources only
    Passive,
    /// Zone transfer and bruteforce only
    Active,
    /// Everything
    All,
}

impl Mode {
    pub fn includes_passive(self) -> bool {
        matches!(self, Mode::Passive | Mode::All)
    }
    pub fn includes_active(self) -> bool {
        matches!(self, Mode::Active | Mode::All)
    }
}

/// Output encoding for the record sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
    Txt,
}

/// Console log verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Full runtime configuration. Doubles as the CLI definition; library
/// callers construct it directly and call [`Config::validate`].
#[derive(Parser, Debug, Clone)]
#[command(
    name = "domain_recon",
    version,
    about = "DNS attack-surface discovery for a target domain",
    long_about = "Discovers the DNS-visible footprint of an apex domain through passive \
intelligence sources and active enumeration, validates candidates with a racing \
multi-server resolver, filters wildcard and CDN noise, and writes normalized \
records to local and remote sinks."
)]
pub struct Config {
    /// Target apex domain; empty reads newline-delimited targets from stdin
    #[arg(long, short = 'd', default_value = "")]
    pub domain: String,

    /// Enumeration mode
    #[arg(long, short = 'm', value_enum, default_value_t = Mode::Passive)]
    pub mode: Mode,

    /// Output encoding
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// File sink; stdout when omitted
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Indent the JSON array output
    #[arg(long)]
    pub json_pretty: bool,

    /// Passive sources to enable (full set when omitted)
    #[arg(long, value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Initial resolver/bruteforce worker count
    #[arg(long, default_value_t = DEFAULT_THREADS)]
    pub threads: usize,

    /// Enable the adaptive bruteforce controller
    #[arg(long)]
    pub auto_tune: bool,

    /// Custom DNS server (host or host:port), tried before the defaults
    #[arg(long)]
    pub dns_server: Option<String>,

    /// Per-query DNS timeout in seconds
    #[arg(long, default_value_t = DEFAULT_DNS_TIMEOUT_SECS)]
    pub dns_timeout: f64,

    /// TTL cache for DNS answers
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub dns_cache: bool,

    /// Maximum DNS cache entries
    #[arg(long, default_value_t = DEFAULT_DNS_CACHE_SIZE)]
    pub dns_cache_size: usize,

    /// Global external I/O timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: f64,

    /// Include subdomains without DNS records in the output
    #[arg(long)]
    pub show_all: bool,

    /// Bruteforce wordlist path (embedded default otherwise)
    #[arg(long)]
    pub wordlist: Option<PathBuf>,

    /// Emit numeric label permutations when bruteforcing
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub permutations: bool,

    /// Filter wildcard DNS and CDN-fronted responses
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub filter_wildcards: bool,

    /// Restrict output to matching subdomains (glob, .suffix, or substring)
    #[arg(long, value_delimiter = ',')]
    pub scope: Vec<String>,

    /// Keep only the first subdomain observed per IP address
    #[arg(long)]
    pub unique_ips: bool,

    /// Probe discovered subdomains over HTTP and HTTPS
    #[arg(long)]
    pub probe: bool,

    /// Render PNG summaries of probed services into this directory
    #[arg(long)]
    pub screenshot_dir: Option<PathBuf>,

    /// Outbound requests per second across DNS and HTTP (0 disables)
    #[arg(long, default_value_t = 0.0)]
    pub rate_limit: f64,

    /// Baseline file for change tagging (JSON array or NDJSON)
    #[arg(long)]
    pub diff: Option<PathBuf>,

    /// Repeat the scan until interrupted
    #[arg(long)]
    pub watch: bool,

    /// Seconds between watch iterations
    #[arg(long, default_value_t = DEFAULT_WATCH_INTERVAL_SECS)]
    pub watch_interval: f64,

    /// Query passive sources concurrently
    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true", action = ArgAction::Set)]
    pub parallel_sources: bool,

    /// Remote collector endpoint for batched export
    #[arg(long = "export-0xgen", value_name = "URL", default_value = "")]
    pub export_0xgen: String,

    /// Bearer token for the export endpoint (env DOMAIN_RECON_API_KEY)
    #[arg(long, default_value = "")]
    pub api_key: String,

    /// VirusTotal API key (env DOMAIN_RECON_VIRUSTOTAL_API_KEY / VIRUSTOTAL_API_KEY)
    #[arg(long, default_value = "")]
    pub virustotal_api_key: String,

    /// Webhook endpoint notified per discovered record
    #[arg(long, value_name = "URL", default_value = "")]
    pub webhook: String,

    /// HMAC-SHA256 secret for webhook signatures
    #[arg(long, default_value = "")]
    pub webhook_secret: String,

    /// Console log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Suppress console logging entirely
    #[arg(long)]
    pub silent: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            mode: Mode::Passive,
            format: OutputFormat::Json,
            output: None,
            json_pretty: false,
            sources: Vec::new(),
            threads: DEFAULT_THREADS,
            auto_tune: false,
            dns_server: None,
            dns_timeout: DEFAULT_DNS_TIMEOUT_SECS,
            dns_cache: true,
            dns_cache_size: DEFAULT_DNS_CACHE_SIZE,
            timeout: DEFAULT_TIMEOUT_SECS,
            show_all: false,
            wordlist: None,
            permutations: true,
            filter_wildcards: true,
            scope: Vec::new(),
            unique_ips: false,
            probe: false,
            screenshot_dir: None,
            rate_limit: 0.0,
            diff: None,
            watch: false,
            watch_interval: DEFAULT_WATCH_INTERVAL_SECS,
            parallel_sources: true,
            export_0xgen: String::new(),
            api_key: String::new(),
            virustotal_api_key: String::new(),
            webhook: String::new(),
            webhook_secret: String::new(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
            silent: false,
        }
    }
}

impl Config {
    /// Normalizes values and rejects inconsistent combinations. Must run
    /// before the configuration is used.
    pub fn validate(&mut self) -> Result<()> {
        if self.silent && self.verbose {
            bail!("--silent and --verbose are mutually exclusive");
        }

        self.domain = self.domain.trim().to_ascii_lowercase();

        self.sources = self
            .sources
            .iter()
            .map(|source| source.trim().to_ascii_lowercase())
            .filter(|source| !source.is_empty())
            .collect();

        self.scope = self
            .scope
            .iter()
            .map(|pattern| pattern.trim().to_string())
            .filter(|pattern| !pattern.is_empty())
            .collect();

        if let Some(server) = &self.dns_server {
            let trimmed = server.trim().to_string();
            if trimmed.is_empty() {
                self.dns_server = None;
            } else {
                // Fails fast on malformed host:port values.
                crate::resolver::parse_server(&trimmed)?;
                self.dns_server = Some(trimmed);
            }
        }

        if self.threads == 0 {
            self.threads = DEFAULT_THREADS;
        }
        if !self.dns_timeout.is_finite() || self.dns_timeout <= 0.0 {
            self.dns_timeout = DEFAULT_DNS_TIMEOUT_SECS;
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }
        if !self.watch_interval.is_finite() || self.watch_interval <= 0.0 {
            self.watch_interval = DEFAULT_WATCH_INTERVAL_SECS;
        }

        if self.api_key.trim().is_empty() {
            if let Ok(value) = std::env::var(API_KEY_ENV) {
                self.api_key = value.trim().to_string();
            }
        }
        if self.virustotal_api_key.trim().is_empty() {
            for env in VIRUSTOTAL_API_KEY_ENVS {
                if let Ok(value) = std::env::var(env) {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        self.virustotal_api_key = value;
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// True when records stream to stdout instead of a file.
    pub fn live_output(&self) -> bool {
        self.output.is_none()
    }

    pub fn dns_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.dns_timeout)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn watch_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.watch_interval)
    }

    /// Effective console log level: `--verbose` lifts the default to debug.
    pub fn effective_log_level(&self) -> log::LevelFilter {
        if self.verbose && self.log_level == LogLevel::Info {
            log::LevelFilter::Debug
        } else {
            self.log_level.into()
        }
    }
}
