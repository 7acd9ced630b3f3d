//! ExportSink - human-readable export file
//!
//! One line per log message or metric sample, as plain text or JSON lines.
//! Other packets are skipped.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::SecondsFormat;
use contracts::{ContractError, LogMessage, MetricSample, Packet, PacketPayload, PacketSink};
use serde_json::json;
use tracing::{debug, instrument};

/// Line format of the export file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Text,
    Json,
}

/// Configuration for ExportSink
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSinkConfig {
    pub path: PathBuf,
    pub format: ExportFormat,
}

impl ExportSinkConfig {
    /// Create config from params map
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let path = params
            .get("path")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| "missing 'path' parameter".to_string())?;

        let format = match params.get("format").map(String::as_str) {
            Some("json") => ExportFormat::Json,
            Some("text") | None => ExportFormat::Text,
            Some(other) => return Err(format!("unknown format '{}'", other)),
        };

        Ok(Self { path, format })
    }
}

/// Sink that appends readable lines to a file
pub struct ExportSink {
    name: String,
    config: ExportSinkConfig,
    out: Option<BufWriter<File>>,
}

impl ExportSink {
    pub fn new(name: impl Into<String>, config: ExportSinkConfig) -> std::io::Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        Ok(Self {
            name: name.into(),
            config,
            out: Some(BufWriter::new(file)),
        })
    }

    /// Create from params map (for factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> Result<Self, ContractError> {
        let name = name.into();
        let config =
            ExportSinkConfig::from_params(params).map_err(|e| ContractError::sink_write(&name, e))?;
        Self::new(&name, config).map_err(|e| ContractError::sink_write(&name, e.to_string()))
    }

    fn render(&self, packet: &Packet) -> Option<String> {
        let time = packet.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false);
        match (&packet.payload, self.config.format) {
            (PacketPayload::LogMessage(message), ExportFormat::Text) => {
                Some(text_message(&time, packet.sequence, message))
            }
            (PacketPayload::LogMessage(message), ExportFormat::Json) => Some(
                json!({
                    "sequence": packet.sequence,
                    "timestamp": time,
                    "type": "log",
                    "severity": message.severity.as_str(),
                    "category": message.category,
                    "thread": message.thread_info().and_then(|t| t.thread_name.clone()),
                    "caption": message.caption,
                    "description": message.description,
                    "exception": message.exception,
                    "details": message.details,
                    "tags": message.tags,
                })
                .to_string(),
            ),
            (PacketPayload::MetricSample(sample), ExportFormat::Text) => {
                Some(text_sample(&time, packet.sequence, sample))
            }
            (PacketPayload::MetricSample(sample), ExportFormat::Json) => {
                let definition = sample.definition();
                Some(
                    json!({
                        "sequence": packet.sequence,
                        "timestamp": time,
                        "type": "metric",
                        "category": definition.map(|d| d.category.as_str()),
                        "name": definition.map(|d| d.name.as_str()),
                        "unit": definition.and_then(|d| d.unit.as_deref()),
                        "value": sample.value,
                        "bucket_counts": sample.bucket_counts,
                    })
                    .to_string(),
                )
            }
            _ => None,
        }
    }

    fn out(&mut self) -> Result<&mut BufWriter<File>, ContractError> {
        let name = &self.name;
        self.out
            .as_mut()
            .ok_or_else(|| ContractError::sink_write(name, "export file closed"))
    }
}

fn text_message(time: &str, sequence: u64, message: &LogMessage) -> String {
    let mut line = format!(
        "{time} #{sequence} {:<11} [{}] {}",
        message.severity.as_str().to_uppercase(),
        message.category,
        message.caption
    );
    if let Some(description) = &message.description {
        line.push_str(" - ");
        line.push_str(description);
    }
    if !message.tags.is_empty() {
        line.push_str(&format!(" {{{}}}", message.tags.join(",")));
    }
    line
}

fn text_sample(time: &str, sequence: u64, sample: &MetricSample) -> String {
    let (category, name, unit) = match sample.definition() {
        Some(d) => (d.category.as_str(), d.name.as_str(), d.unit.as_deref().unwrap_or("")),
        None => ("?", "?", ""),
    };
    format!("{time} #{sequence} METRIC      [{category}] {name} = {}{unit}", sample.value)
}

impl PacketSink for ExportSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        false
    }

    #[instrument(
        name = "export_sink_write",
        skip(self, packet),
        fields(sink = %self.name, sequence = packet.sequence)
    )]
    async fn write(&mut self, packet: &Arc<Packet>) -> Result<(), ContractError> {
        let Some(line) = self.render(packet) else {
            return Ok(());
        };
        let out = self.out()?;
        writeln!(out, "{line}")?;
        Ok(())
    }

    async fn rollover(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    #[instrument(name = "export_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), ContractError> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    #[instrument(name = "export_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        debug!(sink = %self.name, path = %self.config.path.display(), "ExportSink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{MetricDefinition, MetricKind, Severity};
    use tempfile::tempdir;

    fn config(dir: &std::path::Path, format: &str) -> HashMap<String, String> {
        HashMap::from([
            ("path".to_string(), dir.join("out/export.log").display().to_string()),
            ("format".to_string(), format.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_export_text_lines() {
        let dir = tempdir().unwrap();
        let mut sink = ExportSink::from_params("export", &config(dir.path(), "text")).unwrap();

        let message = Packet {
            sequence: 1,
            ..Packet::new(
                LogMessage::new(Severity::Warning, "Billing", "Invoice late")
                    .with_description("customer 42"),
            )
        };
        let metric = Packet::new(
            MetricDefinition::new("Process", "cpu", MetricKind::Gauge).with_unit("%"),
        )
        .shared();
        let sample = Packet {
            sequence: 3,
            ..Packet::new(MetricSample::new(&metric, 12.5).unwrap())
        };
        sink.write(&message.shared()).await.unwrap();
        sink.write(&metric).await.unwrap();
        sink.write(&sample.shared()).await.unwrap();
        sink.close().await.unwrap();

        let text = fs::read_to_string(dir.path().join("out/export.log")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("WARNING"));
        assert!(lines[0].contains("[Billing] Invoice late - customer 42"));
        assert!(lines[1].contains("[Process] cpu = 12.5%"));
    }

    #[tokio::test]
    async fn test_export_json_lines() {
        let dir = tempdir().unwrap();
        let mut sink = ExportSink::from_params("export", &config(dir.path(), "json")).unwrap();
        let message = Packet {
            sequence: 7,
            ..Packet::new(
                LogMessage::new(Severity::Error, "Db", "Timeout").with_tags(["db", "retry"]),
            )
        };
        sink.write(&message.shared()).await.unwrap();
        sink.close().await.unwrap();

        let text = fs::read_to_string(dir.path().join("out/export.log")).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["severity"], "error");
        assert_eq!(value["tags"][1], "retry");
    }

    #[test]
    fn test_export_config_rejects_unknown_format() {
        let params = HashMap::from([
            ("path".to_string(), "x.log".to_string()),
            ("format".to_string(), "xml".to_string()),
        ]);
        assert!(ExportSinkConfig::from_params(&params).is_err());
    }
}
