//! Purpose: Describe the tunnel HTTP protocol: paths, headers, JSON envelopes, error mapping.
//! Exports: `TableRef`, `PartitionSpec`, `SessionStatus`, `SessionKind`, `SessionInfo`, envelopes.
//! Role: Shared vocabulary between the client (`session`) and the in-memory service (`stub`).
//! Invariants: Envelopes are additive; unknown fields are ignored on read.
//! Invariants: Timestamps are RFC3339 UTC; block indices are u32; counts are u64.
#![allow(clippy::result_large_err)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::api::transport::TransportResponse;
use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::types::Schema;

pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const RECORD_COUNT_HEADER: &str = "x-tunnel-record-count";
pub const QUOTA_PARAM: &str = "quotaName";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Project-qualified table name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TableRef {
    pub project: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: impl Into<String>, table: impl Into<String>) -> Result<Self, Error> {
        let table_ref = Self {
            project: project.into(),
            table: table.into(),
        };
        ensure_name("project", &table_ref.project)?;
        ensure_name("table", &table_ref.table)?;
        Ok(table_ref)
    }

    fn base(&self) -> String {
        format!("projects/{}/tables/{}", self.project, self.table)
    }

    pub fn uploads_path(&self) -> String {
        format!("{}/uploads", self.base())
    }

    pub fn upload_path(&self, id: &str) -> String {
        format!("{}/uploads/{id}", self.base())
    }

    pub fn block_path(&self, id: &str, index: u32) -> String {
        format!("{}/uploads/{id}/blocks/{index}", self.base())
    }

    pub fn commit_path(&self, id: &str) -> String {
        format!("{}/uploads/{id}/commit", self.base())
    }

    pub fn downloads_path(&self) -> String {
        format!("{}/downloads", self.base())
    }

    pub fn download_path(&self, id: &str) -> String {
        format!("{}/downloads/{id}", self.base())
    }

    pub fn rows_path(&self, id: &str) -> String {
        format!("{}/downloads/{id}/rows", self.base())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.table)
    }
}

/// Path segments are restricted so they never need escaping.
pub fn ensure_name(what: &str, name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("{what} name {name:?} must match [A-Za-z0-9_]+")))
    }
}

/// Ordered `key=value` partition spec, rendered as `pt=20240101,region=east`.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct PartitionSpec {
    pairs: Vec<(String, String)>,
}

impl PartitionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, (key, value)) in self.pairs.iter().enumerate() {
            if position > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for PartitionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut spec = PartitionSpec::new();
        for part in s.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("partition entry {part:?} must be key=value")));
            };
            let key = key.trim();
            let value = value.trim().trim_matches('\'');
            if key.is_empty() || value.is_empty() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("partition entry {part:?} must be key=value")));
            }
            spec.pairs.push((key.to_string(), value.to_string()));
        }
        Ok(spec)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Normal,
    Closing,
    Closed,
    Expired,
    Critical,
}

impl SessionStatus {
    /// Only normal sessions accept new blocks or reads.
    pub fn is_open(self) -> bool {
        self == SessionStatus::Normal
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Upload,
    Download,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub schema: Schema,
    pub compression: String,
    pub created_at: String,
    pub expires_at: String,
    /// Canonical partition spec the session is bound to; empty for unpartitioned tables.
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub blocks: Vec<u32>,
    #[serde(default)]
    pub record_count: u64,
}

impl SessionInfo {
    pub fn expires_at(&self) -> Result<OffsetDateTime, Error> {
        parse_time(&self.expires_at)
    }

    pub fn created_at(&self) -> Result<OffsetDateTime, Error> {
        parse_time(&self.created_at)
    }

    pub fn partition(&self) -> Result<PartitionSpec, Error> {
        self.partition.parse().map_err(|err: Error| {
            Error::new(ErrorKind::Service)
                .with_message(format!("invalid partition {:?} in session document", self.partition))
                .with_source(err)
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub session: SessionInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateUploadRequest {
    #[serde(default)]
    pub partition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    pub compression: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateDownloadRequest {
    #[serde(default)]
    pub partition: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    pub compression: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub blocks: Vec<u32>,
    pub compression: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockReceipt {
    pub index: u32,
    pub records: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockEnvelope {
    pub block: BlockReceipt,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

pub fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn parse_time(text: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Service)
            .with_message(format!("invalid timestamp {text:?} in session document"))
            .with_source(err)
    })
}

/// Converts a non-2xx response into a client error. Codes the client knows become
/// typed errors; anything else stays a service error carrying status and code.
pub fn error_from_response(response: TransportResponse) -> Error {
    let status = response.status;
    let body = match response.read_bytes() {
        Ok(body) => body,
        Err(err) => return err.with_status(status),
    };
    let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(&body) else {
        return Error::new(ErrorKind::Service)
            .with_status(status)
            .with_message(format!("tunnel service returned status {status}"));
    };
    let ErrorBody { code, message } = envelope.error;
    let err = match ErrorCode::parse(&code) {
        Some(known) if status < 500 => Error::from_code(known),
        _ => Error::new(ErrorKind::Service),
    };
    err.with_status(status)
        .with_service_code(code)
        .with_message(message)
}
