//! Record serialization to stdout or file sinks.
//!
//! The writer runs a dedicated task behind a bounded queue so record
//! producers never block on disk I/O beyond the queue depth. JSON output
//! is a single array written in batches; CSV and TXT stream row by row.
//! A write error latches and fails every subsequent write.

mod diff;

pub use diff::{classify_change, load_records, normalize_record, records_equal, DiffSummary};

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::OutputFormat;

const JSON_BATCH_SIZE: usize = 100;
const QUEUE_SIZE: usize = 1024;

/// Structured discovery data shared with every downstream consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub subdomain: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub dns_records: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_services: Vec<HttpService>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub change: String,
}

/// Result of probing a single scheme for one hostname.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpService {
    pub url: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub banner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "screenshot")]
    pub screenshot_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snippet: String,
}

enum Command {
    Record(Record),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Asynchronous record sink.
pub struct RecordWriter {
    queue: mpsc::Sender<Command>,
    task: tokio::task::JoinHandle<Result<(), String>>,
}

impl RecordWriter {
    /// Creates a writer for the given format. `path` of `None` streams to
    /// stdout; a file path gets buffered writes and a created parent dir.
    pub fn new(format: OutputFormat, path: Option<&Path>, json_pretty: bool) -> Result<Self> {
        let out: Box<dyn Write + Send> = match path {
            None => Box::new(std::io::stdout()),
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).context("creating output directory")?;
                    }
                }
                let file = std::fs::File::create(path).context("opening output file")?;
                Box::new(std::io::BufWriter::with_capacity(64 * 1024, file))
            }
        };

        let sink = Sink::new(format, out, json_pretty);
        let (queue, rx) = mpsc::channel(QUEUE_SIZE);
        let task = tokio::spawn(run_sink(sink, rx));

        Ok(Self { queue, task })
    }

    /// Enqueues one record. Fails when the sink task has died on a write
    /// error.
    pub async fn write_record(&self, mut record: Record) -> Result<()> {
        if record.timestamp.is_empty() {
            record.timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        }

        self.queue
            .send(Command::Record(record))
            .await
            .map_err(|_| anyhow!("record writer closed"))
    }

    /// Drains queued records to the destination without closing it.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| anyhow!("record writer closed"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("record writer closed"))?
            .map_err(|err| anyhow!(err))
    }

    /// Finalizes the output (closing the JSON array) and surfaces any
    /// latched write error.
    pub async fn close(self) -> Result<()> {
        drop(self.queue);
        self.task
            .await
            .map_err(|err| anyhow!("record writer task failed: {err}"))?
            .map_err(|err| anyhow!(err))
    }
}

async fn run_sink(mut sink: Sink, mut rx: mpsc::Receiver<Command>) -> Result<(), String> {
    let mut latched: Option<String> = None;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => {
                if latched.is_some() {
                    continue;
                }
                if let Err(err) = sink.handle_record(&record) {
                    latched = Some(err.to_string());
                }
            }
            Command::Flush(done) => {
                let result = match &latched {
                    Some(err) => Err(err.clone()),
                    None => sink.flush(false).map_err(|err| err.to_string()),
                };
                if let Err(err) = &result {
                    latched.get_or_insert_with(|| err.clone());
                }
                let _ = done.send(result);
            }
        }
    }

    if let Some(err) = latched {
        return Err(err);
    }
    sink.flush(true).map_err(|err| err.to_string())
}

enum Sink {
    Json {
        out: Box<dyn Write + Send>,
        pretty: bool,
        batch: Vec<Record>,
        array_open: bool,
        written: usize,
    },
    Csv {
        writer: csv::Writer<Box<dyn Write + Send>>,
        header_written: bool,
    },
    Txt {
        out: Box<dyn Write + Send>,
    },
}

impl Sink {
    fn new(format: OutputFormat, out: Box<dyn Write + Send>, pretty: bool) -> Self {
        match format {
            OutputFormat::Json => Sink::Json {
                out,
                pretty,
                batch: Vec::with_capacity(JSON_BATCH_SIZE),
                array_open: false,
                written: 0,
            },
            OutputFormat::Csv => Sink::Csv {
                writer: csv::WriterBuilder::new().from_writer(out),
                header_written: false,
            },
            OutputFormat::Txt => Sink::Txt { out },
        }
    }

    fn handle_record(&mut self, record: &Record) -> Result<()> {
        match self {
            Sink::Json { batch, .. } => {
                batch.push(record.clone());
                if batch.len() >= JSON_BATCH_SIZE {
                    self.flush(false)?;
                }
                Ok(())
            }
            Sink::Csv {
                writer,
                header_written,
            } => {
                if !*header_written {
                    writer.write_record([
                        "subdomain",
                        "ip_addresses",
                        "source",
                        "timestamp",
                        "dns_records",
                        "http_services",
                        "change",
                    ])?;
                    *header_written = true;
                }
                writer.write_record([
                    record.subdomain.as_str(),
                    &record.ip_addresses.join(";"),
                    record.source.as_str(),
                    record.timestamp.as_str(),
                    &flatten_dns_records(&record.dns_records),
                    &flatten_http_services(&record.http_services),
                    record.change.as_str(),
                ])?;
                writer.flush()?;
                Ok(())
            }
            Sink::Txt { out } => {
                write_txt_record(out, record)?;
                Ok(())
            }
        }
    }

    fn flush(&mut self, final_flush: bool) -> Result<()> {
        match self {
            Sink::Json {
                out,
                pretty,
                batch,
                array_open,
                written,
            } => {
                if !batch.is_empty() {
                    if !*array_open {
                        write!(out, "[\n")?;
                        *array_open = true;
                    }
                    for record in batch.drain(..) {
                        if *written > 0 {
                            write!(out, ",\n")?;
                        }
                        if *pretty {
                            let rendered = serde_json::to_string_pretty(&record)?;
                            for (index, line) in rendered.lines().enumerate() {
                                if index > 0 {
                                    writeln!(out)?;
                                }
                                write!(out, "  {line}")?;
                            }
                        } else {
                            let rendered = serde_json::to_string(&record)?;
                            write!(out, "{rendered}")?;
                        }
                        *written += 1;
                    }
                }

                if final_flush {
                    if !*array_open {
                        writeln!(out, "[]")?;
                        *array_open = true;
                    } else {
                        if *written > 0 {
                            writeln!(out)?;
                        }
                        writeln!(out, "]")?;
                    }
                }
                out.flush()?;
                Ok(())
            }
            Sink::Csv { writer, .. } => {
                writer.flush()?;
                Ok(())
            }
            Sink::Txt { out } => {
                out.flush()?;
                Ok(())
            }
        }
    }
}

fn write_txt_record(out: &mut impl Write, record: &Record) -> Result<()> {
    writeln!(out, "Subdomain: {}", record.subdomain)?;
    writeln!(out, "Source: {}", record.source)?;
    writeln!(out, "Timestamp: {}", record.timestamp)?;
    if !record.change.is_empty() {
        writeln!(out, "Change: {}", record.change)?;
    }

    if !record.ip_addresses.is_empty() {
        writeln!(out, "IP Addresses: {}", record.ip_addresses.join(", "))?;
    }

    if !record.dns_records.is_empty() {
        writeln!(out, "DNS Records:")?;
        for (record_type, values) in &record.dns_records {
            writeln!(out, "  {record_type}: {}", values.join(", "))?;
        }
    }

    if !record.http_services.is_empty() {
        writeln!(out, "HTTP Services:")?;
        for service in &record.http_services {
            write!(out, "  {}", service.url)?;
            if service.status_code > 0 {
                write!(out, " -> {}", service.status_code)?;
            }
            if !service.error.is_empty() {
                write!(out, " (error: {})", service.error)?;
            }
            if !service.banner.is_empty() {
                write!(out, " [banner: {}]", service.banner)?;
            }
            if !service.title.is_empty() {
                write!(out, " [title: {}]", service.title)?;
            }
            if !service.screenshot_path.is_empty() {
                write!(out, " [screenshot: {}]", service.screenshot_path)?;
            }
            if !service.snippet.is_empty() {
                write!(out, " [snippet: {}]", service.snippet)?;
            }
            writeln!(out)?;
        }
    }

    writeln!(out)?;
    Ok(())
}

fn flatten_dns_records(records: &BTreeMap<String, Vec<String>>) -> String {
    records
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(record_type, values)| format!("{record_type}={}", values.join(";")))
        .collect::<Vec<_>>()
        .join("|")
}

fn flatten_http_services(services: &[HttpService]) -> String {
    services
        .iter()
        .map(|service| {
            let mut meta = Vec::new();
            if service.status_code > 0 {
                meta.push(format!("status={}", service.status_code));
            }
            if !service.error.is_empty() {
                meta.push(format!("error={}", service.error));
            }
            if !service.banner.is_empty() {
                meta.push(format!("banner={}", service.banner));
            }
            if !service.title.is_empty() {
                meta.push(format!("title={}", service.title));
            }
            if !service.screenshot_path.is_empty() {
                meta.push(format!("screenshot={}", service.screenshot_path));
            }
            if !service.snippet.is_empty() {
                meta.push(format!("snippet={}", service.snippet));
            }

            if meta.is_empty() {
                service.url.clone()
            } else {
                format!("{}({})", service.url, meta.join(";"))
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(subdomain: &str) -> Record {
        let mut dns_records = BTreeMap::new();
        dns_records.insert("A".to_string(), vec!["192.0.2.1".to_string()]);
        Record {
            subdomain: subdomain.to_string(),
            ip_addresses: vec!["192.0.2.1".to_string()],
            source: "crt.sh".to_string(),
            timestamp: "2024-06-01T00:00:00Z".to_string(),
            dns_records,
            http_services: Vec::new(),
            change: String::new(),
        }
    }

    async fn collect_output(
        format: OutputFormat,
        pretty: bool,
        records: Vec<Record>,
    ) -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let writer = RecordWriter::new(format, Some(path.as_path()), pretty).unwrap();
        for record in records {
            writer.write_record(record).await.unwrap();
        }
        writer.close().await.unwrap();
        std::fs::read_to_string(&path).unwrap()
    }

    #[tokio::test]
    async fn json_output_is_an_array() {
        let output = collect_output(
            OutputFormat::Json,
            false,
            vec![sample_record("a.example.com"), sample_record("b.example.com")],
        )
        .await;

        let parsed: Vec<Record> = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].subdomain, "a.example.com");
        assert_eq!(parsed[1].subdomain, "b.example.com");
    }

    #[tokio::test]
    async fn json_output_empty_run_is_empty_array() {
        let output = collect_output(OutputFormat::Json, false, vec![]).await;
        assert_eq!(output.trim(), "[]");
    }

    #[tokio::test]
    async fn json_pretty_indents_entries() {
        let output =
            collect_output(OutputFormat::Json, true, vec![sample_record("a.example.com")]).await;
        let parsed: Vec<Record> = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(output.contains("  {"));
    }

    #[tokio::test]
    async fn csv_output_has_header_and_rows() {
        let output =
            collect_output(OutputFormat::Csv, false, vec![sample_record("a.example.com")]).await;
        let mut lines = output.lines();
        assert_eq!(
            lines.next().unwrap(),
            "subdomain,ip_addresses,source,timestamp,dns_records,http_services,change"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("a.example.com,192.0.2.1,crt.sh,"));
        assert!(row.contains("A=192.0.2.1"));
    }

    #[tokio::test]
    async fn txt_output_renders_blocks() {
        let mut record = sample_record("a.example.com");
        record.http_services.push(HttpService {
            url: "http://a.example.com".into(),
            status_code: 200,
            banner: "nginx".into(),
            ..HttpService::default()
        });
        let output = collect_output(OutputFormat::Txt, false, vec![record]).await;

        assert!(output.contains("Subdomain: a.example.com"));
        assert!(output.contains("IP Addresses: 192.0.2.1"));
        assert!(output.contains("  A: 192.0.2.1"));
        assert!(output.contains("http://a.example.com -> 200 [banner: nginx]"));
        assert!(output.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn write_record_stamps_missing_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let writer = RecordWriter::new(OutputFormat::Json, Some(path.as_path()), false).unwrap();
        let mut record = sample_record("a.example.com");
        record.timestamp.clear();
        writer.write_record(record).await.unwrap();
        writer.close().await.unwrap();

        let parsed: Vec<Record> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(!parsed[0].timestamp.is_empty());
    }

    #[test]
    fn flatten_helpers_render_go_style() {
        let mut records = BTreeMap::new();
        records.insert("A".to_string(), vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]);
        records.insert("MX".to_string(), vec!["10 mail".to_string()]);
        assert_eq!(flatten_dns_records(&records), "A=1.1.1.1;2.2.2.2|MX=10 mail");

        let services = vec![HttpService {
            url: "http://x".into(),
            status_code: 301,
            banner: "apache".into(),
            ..HttpService::default()
        }];
        assert_eq!(
            flatten_http_services(&services),
            "http://x(status=301;banner=apache)"
        );
    }
}
