use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::models::ForensicRecord;

pub const COLUMNS: [&str; 9] = [
    "Server Hostname",
    "Server Username",
    "Requested Page",
    "Source IP",
    "User-Agent",
    "ViewState",
    "Decrypted ViewState",
    "Payload File Hash",
    "Suspicious Gadgets",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Tsv,
    Csv,
    Json,
    JsonPretty,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Tsv => "tsv",
            OutputFormat::Csv => "csv",
            OutputFormat::Json | OutputFormat::JsonPretty => "json",
        }
    }
}

/// Flattened report line. `None` renders as an empty cell (or `null` in JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    #[serde(rename = "Server Hostname")]
    pub hostname: Option<String>,
    #[serde(rename = "Server Username")]
    pub username: Option<String>,
    #[serde(rename = "Requested Page")]
    pub requested_page: Option<String>,
    #[serde(rename = "Source IP")]
    pub source_ip: Option<String>,
    #[serde(rename = "User-Agent")]
    pub user_agent: Option<String>,
    #[serde(rename = "ViewState")]
    pub viewstate: String,
    #[serde(rename = "Decrypted ViewState")]
    pub decrypted: Option<String>,
    #[serde(rename = "Payload File Hash")]
    pub payload_hash: Option<String>,
    #[serde(rename = "Suspicious Gadgets")]
    pub gadgets: Option<Vec<String>>,
}

impl From<&ForensicRecord> for ReportRow {
    fn from(record: &ForensicRecord) -> Self {
        let event = &record.event;
        ReportRow {
            hostname: event.hostname.clone(),
            username: event.username.clone(),
            requested_page: event.requested_page.clone(),
            source_ip: event.source_ip.clone(),
            user_agent: event.user_agent.clone(),
            viewstate: event.viewstate.clone(),
            decrypted: record.decrypted.as_ref().map(|bytes| BASE64.encode(bytes)),
            payload_hash: record.extraction.as_ref().and_then(|e| e.fingerprint.clone()),
            gadgets: record.gadgets.as_ref().map(|g| g.names.clone()),
        }
    }
}

impl ReportRow {
    pub fn cells(&self) -> Vec<String> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            opt(&self.hostname),
            opt(&self.username),
            opt(&self.requested_page),
            opt(&self.source_ip),
            opt(&self.user_agent),
            self.viewstate.clone(),
            opt(&self.decrypted),
            opt(&self.payload_hash),
            self.gadgets
                .as_ref()
                .map(|names| names.join(", "))
                .unwrap_or_default(),
        ]
    }
}

pub struct ReportWriter {
    format: OutputFormat,
}

impl ReportWriter {
    pub fn new() -> Self {
        ReportWriter {
            format: OutputFormat::Tsv,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn write(&self, records: &[ForensicRecord], path: &Path) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(records, &mut out)?;
        out.flush()
    }

    pub fn write_to<W: Write>(&self, records: &[ForensicRecord], out: &mut W) -> std::io::Result<()> {
        let rows: Vec<ReportRow> = records.iter().map(ReportRow::from).collect();
        match self.format {
            OutputFormat::Tsv => write_delimited(&rows, b'\t', out),
            OutputFormat::Csv => write_delimited(&rows, b',', out),
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &rows)?;
                Ok(())
            }
            OutputFormat::JsonPretty => {
                serde_json::to_writer_pretty(&mut *out, &rows)?;
                Ok(())
            }
        }
    }
}

impl Default for ReportWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_delimited<W: Write>(rows: &[ReportRow], delimiter: u8, out: &mut W) -> std::io::Result<()> {
    let sep = (delimiter as char).to_string();
    let header: Vec<String> = COLUMNS.iter().map(|c| escape_cell(c, delimiter)).collect();
    writeln!(out, "{}", header.join(&sep))?;
    for row in rows {
        let cells: Vec<String> = row.cells().iter().map(|c| escape_cell(c, delimiter)).collect();
        writeln!(out, "{}", cells.join(&sep))?;
    }
    Ok(())
}

fn escape_cell(value: &str, delimiter: u8) -> String {
    let flat: String = value
        .chars()
        .map(|c| if matches!(c, '\t' | '\r' | '\n') { ' ' } else { c })
        .collect();
    if delimiter == b',' && (flat.contains(',') || flat.contains('"')) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_cell() {
        assert_eq!(escape_cell("a\tb\nc", b'\t'), "a b c");
        assert_eq!(escape_cell("A, B", b'\t'), "A, B");
        assert_eq!(escape_cell("A, B", b','), "\"A, B\"");
        assert_eq!(escape_cell("say \"hi\"", b','), "\"say \"\"hi\"\"\"");
    }
}
