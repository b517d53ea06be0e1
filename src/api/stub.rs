//! Purpose: In-memory tunnel service for tests and local development.
//! Exports: `TunnelStub`.
//! Role: Implements the service side of the tunnel protocol and doubles as a loopback `Transport`.
//! Invariants: Committed blocks are appended to their partition in ascending index order.
//! Invariants: A block body that fails to decode completely is never stored; the previous
//! upload of that index, if any, stays in place.
//! Invariants: Lock order is sessions, then tables; no lock is held while a body streams in.
#![allow(clippy::result_large_err)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{self, Cursor, Read};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::api::protocol::{
    BINARY_CONTENT_TYPE, BlockEnvelope, BlockReceipt, CONTENT_ENCODING, CommitRequest,
    CreateDownloadRequest, CreateUploadRequest, ACCEPT_ENCODING, ErrorBody, ErrorEnvelope,
    PartitionSpec, QUOTA_PARAM, RECORD_COUNT_HEADER, SessionEnvelope, SessionInfo, SessionKind,
    SessionStatus, ensure_name, format_time,
};
use crate::api::session::lock;
use crate::api::transport::{Method, Transport, TransportRequest, TransportResponse};
use crate::core::codec::{self, RecordDecoder};
use crate::core::compress::Compression;
use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::types::{Record, Schema};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

type TableKey = (String, String);

pub struct TunnelStub {
    sessions: Mutex<Sessions>,
    tables: Mutex<HashMap<TableKey, StubTable>>,
    faults: Mutex<Faults>,
    session_ttl: Duration,
}

struct StubTable {
    schema: Schema,
    partitions: BTreeMap<String, Vec<Record>>,
}

#[derive(Default)]
struct Sessions {
    uploads: HashMap<String, StubUpload>,
    downloads: HashMap<String, StubDownload>,
}

struct StubUpload {
    table: TableKey,
    partition: String,
    schema: Schema,
    compression: Compression,
    status: SessionStatus,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    blocks: BTreeMap<u32, Vec<Record>>,
    committed: Option<BTreeSet<u32>>,
}

struct StubDownload {
    schema: Schema,
    partition: String,
    compression: Compression,
    status: SessionStatus,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    rows: Vec<Record>,
}

#[derive(Default)]
struct Faults {
    fail_next: VecDeque<u16>,
    delay: Option<Duration>,
    cut_next_download: Option<usize>,
    requests: u64,
}

struct StubError {
    status: u16,
    code: &'static str,
    message: String,
}

impl StubError {
    fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(400, "InvalidArgument", message)
    }

    fn no_session(id: &str) -> Self {
        Self::new(404, "NoSuchSession", format!("no session {id}"))
    }

    fn expired(id: &str) -> Self {
        Self::new(410, ErrorCode::SessionExpired.as_str(), format!("session {id} has expired"))
    }

    // Codec failures keep their code so the client sees the same taxonomy.
    fn from_decode(err: Error) -> Self {
        match err.code() {
            Some(code @ (ErrorCode::MalformedRecord
            | ErrorCode::TruncatedRecord
            | ErrorCode::CompressionMismatch)) => {
                Self::new(400, code.as_str(), err.to_string())
            }
            _ if err.kind() == ErrorKind::Transport => {
                Self::invalid(format!("request body aborted: {err}"))
            }
            _ => Self::new(400, ErrorCode::MalformedRecord.as_str(), err.to_string()),
        }
    }
}

type StubResult<T> = Result<T, StubError>;

impl Default for TunnelStub {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStub {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            tables: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn create_table(&self, project: &str, table: &str, schema: Schema) -> Result<(), Error> {
        ensure_name("project", project)?;
        ensure_name("table", table)?;
        let mut tables = lock(&self.tables);
        let key = (project.to_string(), table.to_string());
        if tables.contains_key(&key) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("table {project}.{table} already exists")));
        }
        tables.insert(
            key,
            StubTable {
                schema,
                partitions: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Seeds rows directly, bypassing upload sessions.
    pub fn insert_rows(
        &self,
        project: &str,
        table: &str,
        partition: &str,
        rows: Vec<Record>,
    ) -> Result<(), Error> {
        let mut tables = lock(&self.tables);
        let entry = tables
            .get_mut(&(project.to_string(), table.to_string()))
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message(format!("no table {project}.{table}"))
            })?;
        let spec: PartitionSpec = partition.parse()?;
        let partition = canonical_partition(&entry.schema, &spec)
            .map_err(|err| Error::new(ErrorKind::Usage).with_message(err.message))?;
        for row in &rows {
            entry.schema.check_record(row)?;
        }
        entry.partitions.entry(partition).or_default().extend(rows);
        Ok(())
    }

    /// Committed rows of one partition (`""` for unpartitioned tables).
    pub fn rows(&self, project: &str, table: &str, partition: &str) -> Vec<Record> {
        let tables = lock(&self.tables);
        let Some(entry) = tables.get(&(project.to_string(), table.to_string())) else {
            return Vec::new();
        };
        let Ok(spec) = partition.parse::<PartitionSpec>() else {
            return Vec::new();
        };
        canonical_partition(&entry.schema, &spec)
            .ok()
            .and_then(|key| entry.partitions.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Forces a session into the expired state; returns false for unknown ids.
    pub fn expire_session(&self, id: &str) -> bool {
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        let mut sessions = lock(&self.sessions);
        if let Some(upload) = sessions.uploads.get_mut(id) {
            upload.status = SessionStatus::Expired;
            upload.expires_at = past;
            return true;
        }
        if let Some(download) = sessions.downloads.get_mut(id) {
            download.status = SessionStatus::Expired;
            download.expires_at = past;
            return true;
        }
        false
    }

    /// The next `times` requests fail with `status` before their body is read.
    pub fn fail_next(&self, status: u16, times: usize) {
        let mut faults = lock(&self.faults);
        faults.fail_next.extend(std::iter::repeat_n(status, times));
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).delay = delay;
    }

    /// The next row download breaks with a connection error after `bytes` body bytes.
    pub fn cut_next_download(&self, bytes: usize) {
        lock(&self.faults).cut_next_download = Some(bytes);
    }

    pub fn request_count(&self) -> u64 {
        lock(&self.faults).requests
    }

    /// Serves one protocol request. Service errors become JSON error responses.
    pub fn handle(&self, request: TransportRequest) -> TransportResponse {
        let (injected, delay) = {
            let mut faults = lock(&self.faults);
            faults.requests += 1;
            (faults.fail_next.pop_front(), faults.delay)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(status) = injected {
            warn!(method = %request.method, path = %request.path, status, "injected failure");
            return error_response(StubError::new(status, "Internal", "injected failure"));
        }

        let method = request.method;
        let path = request.path.clone();
        match self.route(request) {
            Ok(response) => {
                debug!(%method, path = %path, status = response.status, "stub request served");
                response
            }
            Err(err) => {
                debug!(%method, path = %path, status = err.status, code = err.code, "stub request rejected");
                error_response(err)
            }
        }
    }

    fn route(&self, request: TransportRequest) -> StubResult<TransportResponse> {
        let path = request.path.trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();
        // The endpoint may be mounted under a prefix such as `api/tunnel`.
        let mount = segments
            .iter()
            .position(|segment| *segment == "projects")
            .unwrap_or(0);
        let [
            "projects",
            project,
            "tables",
            table,
            rest @ ..,
        ] = &segments[mount..]
        else {
            return Err(StubError::new(404, "NotFound", format!("no route for {path}")));
        };
        let key = (project.to_string(), table.to_string());
        match (request.method, rest) {
            (Method::Post, ["uploads"]) => self.create_upload(key, request),
            (Method::Get, ["uploads", id]) => self.upload_status(id),
            (Method::Put, ["uploads", id, "blocks", index]) => {
                let index = index
                    .parse::<u32>()
                    .map_err(|_| StubError::invalid(format!("invalid block index {index}")))?;
                self.put_block(id, index, request)
            }
            (Method::Post, ["uploads", id, "commit"]) => self.commit(id, request),
            (Method::Post, ["downloads"]) => self.create_download(key, request),
            (Method::Get, ["downloads", id]) => self.download_status(id),
            (Method::Get, ["downloads", id, "rows"]) => self.download_rows(id, &request),
            _ => Err(StubError::new(
                404,
                "NotFound",
                format!("no route for {} {path}", request.method),
            )),
        }
    }

    fn table_schema(&self, key: &TableKey) -> StubResult<Schema> {
        lock(&self.tables)
            .get(key)
            .map(|table| table.schema.clone())
            .ok_or_else(|| {
                StubError::new(404, "NoSuchTable", format!("no table {}.{}", key.0, key.1))
            })
    }

    fn expiry(&self) -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        let ttl = time::Duration::try_from(self.session_ttl).unwrap_or(time::Duration::DAY);
        (now, now + ttl)
    }

    fn create_upload(&self, key: TableKey, request: TransportRequest) -> StubResult<TransportResponse> {
        let quota = request.query_param(QUOTA_PARAM).map(str::to_string);
        let body: CreateUploadRequest = read_json(request)?;
        let schema = self.table_schema(&key)?;
        let spec: PartitionSpec = body
            .partition
            .parse()
            .map_err(|_| StubError::new(400, "InvalidPartition", "unparsable partition spec"))?;
        let partition = canonical_partition(&schema, &spec)?;
        if let Some(hint) = &body.schema {
            if let Some(reason) = schema.conflicts_with(hint) {
                return Err(StubError::new(409, ErrorCode::SchemaConflict.as_str(), reason));
            }
        }
        let compression = parse_compression(&body.compression)?;

        let id = new_session_id()?;
        let (created_at, expires_at) = self.expiry();
        let upload = StubUpload {
            table: key,
            partition,
            schema,
            compression,
            status: SessionStatus::Normal,
            created_at,
            expires_at,
            blocks: BTreeMap::new(),
            committed: None,
        };
        let info = upload_info(&id, &upload);
        info!(session = %id, partition = %upload.partition, quota = ?quota, "stub upload session created");
        lock(&self.sessions).uploads.insert(id, upload);
        json_response(200, &SessionEnvelope { session: info })
    }

    fn upload_status(&self, id: &str) -> StubResult<TransportResponse> {
        let sessions = lock(&self.sessions);
        let upload = sessions
            .uploads
            .get(id)
            .ok_or_else(|| StubError::no_session(id))?;
        json_response(200, &SessionEnvelope {
            session: upload_info(id, upload),
        })
    }

    fn put_block(
        &self,
        id: &str,
        index: u32,
        request: TransportRequest,
    ) -> StubResult<TransportResponse> {
        let (schema, compression) = {
            let mut sessions = lock(&self.sessions);
            let upload = sessions
                .uploads
                .get_mut(id)
                .ok_or_else(|| StubError::no_session(id))?;
            ensure_upload_open(id, upload)?;
            (upload.schema.clone(), upload.compression)
        };
        if !compression.matches_encoding(request.header(CONTENT_ENCODING)) {
            return Err(StubError::new(
                400,
                ErrorCode::CompressionMismatch.as_str(),
                format!("session uses {compression} encoding"),
            ));
        }

        let body = compression
            .wrap_reader(request.body.into_reader())
            .map_err(StubError::from_decode)?;
        let mut decoder = RecordDecoder::new(body, schema);
        let mut records = Vec::new();
        while let Some(record) = decoder.next_record().map_err(StubError::from_decode)? {
            records.push(record);
        }
        let count = records.len() as u64;

        let mut sessions = lock(&self.sessions);
        let upload = sessions
            .uploads
            .get_mut(id)
            .ok_or_else(|| StubError::no_session(id))?;
        ensure_upload_open(id, upload)?;
        upload.blocks.insert(index, records);
        debug!(session = %id, block = index, records = count, "stub block stored");
        json_response(200, &BlockEnvelope {
            block: BlockReceipt {
                index,
                records: count,
            },
        })
    }

    fn commit(&self, id: &str, request: TransportRequest) -> StubResult<TransportResponse> {
        let body: CommitRequest = read_json(request)?;
        let requested: BTreeSet<u32> = body.blocks.iter().copied().collect();

        let mut sessions = lock(&self.sessions);
        let upload = sessions
            .uploads
            .get_mut(id)
            .ok_or_else(|| StubError::no_session(id))?;
        if let Some(committed) = &upload.committed {
            if *committed == requested {
                return json_response(200, &SessionEnvelope {
                    session: upload_info(id, upload),
                });
            }
            return Err(StubError::new(
                409,
                ErrorCode::SessionClosed.as_str(),
                "session already committed a different block set",
            ));
        }
        ensure_upload_open(id, upload)?;
        if !upload.compression.matches_encoding(Some(&body.compression)) {
            return Err(StubError::new(
                400,
                ErrorCode::CompressionMismatch.as_str(),
                format!("session uses {} encoding", upload.compression),
            ));
        }
        if let Some(missing) = requested.iter().find(|index| !upload.blocks.contains_key(index)) {
            return Err(StubError::new(
                400,
                ErrorCode::IncompleteBlock.as_str(),
                format!("block {missing} was never uploaded"),
            ));
        }

        let mut tables = lock(&self.tables);
        let table = tables.get_mut(&upload.table).ok_or_else(|| {
            StubError::new(404, "NoSuchTable", "table was dropped during the session")
        })?;
        let rows = table.partitions.entry(upload.partition.clone()).or_default();
        for index in &requested {
            if let Some(records) = upload.blocks.get(index) {
                rows.extend(records.iter().cloned());
            }
        }
        upload.committed = Some(requested);
        upload.status = SessionStatus::Closed;
        info!(session = %id, blocks = body.blocks.len(), "stub upload committed");
        json_response(200, &SessionEnvelope {
            session: upload_info(id, upload),
        })
    }

    fn create_download(
        &self,
        key: TableKey,
        request: TransportRequest,
    ) -> StubResult<TransportResponse> {
        let body: CreateDownloadRequest = read_json(request)?;
        let compression = parse_compression(&body.compression)?;
        let (schema, partition, rows) = {
            let tables = lock(&self.tables);
            let table = tables.get(&key).ok_or_else(|| {
                StubError::new(404, "NoSuchTable", format!("no table {}.{}", key.0, key.1))
            })?;
            let spec: PartitionSpec = body
                .partition
                .parse()
                .map_err(|_| StubError::new(400, "InvalidPartition", "unparsable partition spec"))?;
            let partition = canonical_partition(&table.schema, &spec)?;
            let rows = table.partitions.get(&partition).cloned().unwrap_or_default();
            if body.columns.is_empty() {
                (table.schema.clone(), partition, rows)
            } else {
                let projected = table
                    .schema
                    .project(&body.columns)
                    .map_err(|err| StubError::invalid(err.message().unwrap_or("bad column list")))?;
                let indexes: Vec<usize> = projected
                    .columns
                    .iter()
                    .filter_map(|column| table.schema.index_of(&column.name))
                    .collect();
                let rows = rows
                    .into_iter()
                    .map(|row| indexes.iter().map(|&at| row[at].clone()).collect())
                    .collect();
                (projected, partition, rows)
            }
        };

        let id = new_session_id()?;
        let (created_at, expires_at) = self.expiry();
        let download = StubDownload {
            schema,
            partition,
            compression,
            status: SessionStatus::Normal,
            created_at,
            expires_at,
            rows,
        };
        let info = download_info(&id, &download);
        info!(session = %id, records = download.rows.len(), "stub download session created");
        lock(&self.sessions).downloads.insert(id, download);
        json_response(200, &SessionEnvelope { session: info })
    }

    fn download_status(&self, id: &str) -> StubResult<TransportResponse> {
        let sessions = lock(&self.sessions);
        let download = sessions
            .downloads
            .get(id)
            .ok_or_else(|| StubError::no_session(id))?;
        json_response(200, &SessionEnvelope {
            session: download_info(id, download),
        })
    }

    fn download_rows(&self, id: &str, request: &TransportRequest) -> StubResult<TransportResponse> {
        let start = query_u64(request, "start")?;
        let count = query_u64(request, "count")?;
        let (payload, compression) = {
            let sessions = lock(&self.sessions);
            let download = sessions
                .downloads
                .get(id)
                .ok_or_else(|| StubError::no_session(id))?;
            if effective_status(download.status, download.expires_at) == SessionStatus::Expired {
                return Err(StubError::expired(id));
            }
            let total = download.rows.len() as u64;
            let end = start.checked_add(count).filter(|end| *end <= total).ok_or_else(|| {
                StubError::new(
                    400,
                    "OutOfRange",
                    format!("range {start}+{count} exceeds {total} records"),
                )
            })?;
            if let Some(accept) = request.header(ACCEPT_ENCODING) {
                if !download.compression.matches_encoding(Some(accept)) {
                    return Err(StubError::new(
                        400,
                        ErrorCode::CompressionMismatch.as_str(),
                        format!("session uses {} encoding", download.compression),
                    ));
                }
            }
            let mut payload = Vec::new();
            for row in &download.rows[start as usize..end as usize] {
                codec::encode_into(row, &download.schema, &mut payload)
                    .map_err(|err| StubError::new(500, "Internal", err.to_string()))?;
            }
            (payload, download.compression)
        };
        let payload = compression
            .compress_bytes(&payload)
            .map_err(|err| StubError::new(500, "Internal", err.to_string()))?;

        let cut = lock(&self.faults).cut_next_download.take();
        let body: Box<dyn Read + Send> = match cut {
            Some(limit) => Box::new(CutReader {
                inner: Cursor::new(payload),
                remaining: limit,
            }),
            None => Box::new(Cursor::new(payload)),
        };
        Ok(TransportResponse::new(200)
            .with_header("Content-Type", BINARY_CONTENT_TYPE)
            .with_header(CONTENT_ENCODING, compression.name())
            .with_header(RECORD_COUNT_HEADER, count.to_string())
            .with_reader(body))
    }
}

impl Transport for TunnelStub {
    fn execute(&self, request: TransportRequest) -> Result<TransportResponse, Error> {
        let delay = lock(&self.faults).delay;
        if let (Some(delay), Some(timeout)) = (delay, request.timeout) {
            if timeout < delay {
                std::thread::sleep(timeout);
                return Err(Error::new(ErrorKind::Transport)
                    .with_message(format!("{} {} timed out", request.method, request.path)));
            }
        }
        Ok(self.handle(request))
    }
}

fn ensure_upload_open(id: &str, upload: &mut StubUpload) -> StubResult<()> {
    upload.status = effective_status(upload.status, upload.expires_at);
    match upload.status {
        SessionStatus::Normal => Ok(()),
        SessionStatus::Expired => Err(StubError::expired(id)),
        status => Err(StubError::new(
            409,
            ErrorCode::SessionClosed.as_str(),
            format!("session {id} is {status:?}"),
        )),
    }
}

fn effective_status(status: SessionStatus, expires_at: OffsetDateTime) -> SessionStatus {
    if status == SessionStatus::Normal && OffsetDateTime::now_utc() >= expires_at {
        SessionStatus::Expired
    } else {
        status
    }
}

fn upload_info(id: &str, upload: &StubUpload) -> SessionInfo {
    let blocks: Vec<u32> = match &upload.committed {
        Some(committed) => committed.iter().copied().collect(),
        None => upload.blocks.keys().copied().collect(),
    };
    let record_count = blocks
        .iter()
        .filter_map(|index| upload.blocks.get(index))
        .map(|records| records.len() as u64)
        .sum();
    SessionInfo {
        id: id.to_string(),
        kind: SessionKind::Upload,
        status: effective_status(upload.status, upload.expires_at),
        schema: upload.schema.clone(),
        compression: upload.compression.name().to_string(),
        created_at: format_time(upload.created_at),
        expires_at: format_time(upload.expires_at),
        partition: upload.partition.clone(),
        blocks,
        record_count,
    }
}

fn download_info(id: &str, download: &StubDownload) -> SessionInfo {
    SessionInfo {
        id: id.to_string(),
        kind: SessionKind::Download,
        status: effective_status(download.status, download.expires_at),
        schema: download.schema.clone(),
        compression: download.compression.name().to_string(),
        created_at: format_time(download.created_at),
        expires_at: format_time(download.expires_at),
        partition: download.partition.clone(),
        blocks: Vec::new(),
        record_count: download.rows.len() as u64,
    }
}

/// Orders partition values by the table's partition columns, e.g. `pt=1,region=east`.
fn canonical_partition(schema: &Schema, spec: &PartitionSpec) -> StubResult<String> {
    if spec.pairs().len() != schema.partition_columns.len() {
        return Err(StubError::new(
            400,
            "InvalidPartition",
            format!(
                "table has {} partition columns, spec names {}",
                schema.partition_columns.len(),
                spec.pairs().len()
            ),
        ));
    }
    let mut canonical = PartitionSpec::new();
    for column in &schema.partition_columns {
        let value = spec.get(&column.name).ok_or_else(|| {
            StubError::new(
                400,
                "InvalidPartition",
                format!("partition column {} is missing", column.name),
            )
        })?;
        canonical = canonical.with(column.name.clone(), value);
    }
    Ok(canonical.to_string())
}

fn parse_compression(name: &str) -> StubResult<Compression> {
    Compression::from_name(name)
        .ok_or_else(|| StubError::invalid(format!("unsupported compression {name:?}")))
}

fn query_u64(request: &TransportRequest, key: &str) -> StubResult<u64> {
    request
        .query_param(key)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| StubError::invalid(format!("query parameter {key} must be an integer")))
}

fn read_json<T: DeserializeOwned>(request: TransportRequest) -> StubResult<T> {
    let mut body = Vec::new();
    request
        .body
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|err| StubError::invalid(format!("failed to read request body: {err}")))?;
    serde_json::from_slice(&body)
        .map_err(|err| StubError::invalid(format!("invalid request json: {err}")))
}

fn json_response<T: Serialize>(status: u16, body: &T) -> StubResult<TransportResponse> {
    let bytes = serde_json::to_vec(body)
        .map_err(|err| StubError::new(500, "Internal", format!("failed to encode json: {err}")))?;
    Ok(TransportResponse::new(status)
        .with_header("Content-Type", "application/json")
        .with_bytes(bytes))
}

fn error_response(err: StubError) -> TransportResponse {
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            code: err.code.to_string(),
            message: err.message,
        },
    };
    let bytes = serde_json::to_vec(&envelope).unwrap_or_default();
    TransportResponse::new(err.status)
        .with_header("Content-Type", "application/json")
        .with_bytes(bytes)
}

fn new_session_id() -> StubResult<String> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|err| {
        StubError::new(500, "Internal", format!("failed to generate session id: {err}"))
    })?;
    Ok(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Body that fails with a connection reset after `remaining` bytes.
struct CutReader {
    inner: Cursor<Vec<u8>>,
    remaining: usize,
}

impl Read for CutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "download connection reset",
            ));
        }
        let limit = buf.len().min(self.remaining);
        let read = self.inner.read(&mut buf[..limit])?;
        self.remaining -= read;
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::{TunnelStub, canonical_partition};
    use crate::api::protocol::{PartitionSpec, SessionEnvelope};
    use crate::api::transport::{Method, RequestBody, TransportRequest};
    use crate::core::codec;
    use crate::core::compress::Compression;
    use crate::core::types::{Column, DataType, Schema, Value};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(vec![Column::new("id", DataType::BigInt)])
    }

    fn stub() -> TunnelStub {
        let stub = TunnelStub::new();
        stub.create_table("p", "t", schema()).expect("table");
        stub
    }

    fn create_upload(stub: &TunnelStub, compression: &str) -> String {
        let request = TransportRequest::new(Method::Post, "projects/p/tables/t/uploads")
            .with_json(&json!({"compression": compression}))
            .expect("json");
        let response = stub.handle(request);
        assert_eq!(response.status, 200);
        let envelope: SessionEnvelope = response.read_json().expect("session");
        assert_eq!(envelope.session.id.len(), 32);
        envelope.session.id
    }

    fn block_body(ids: &[i64], compression: Compression) -> Vec<u8> {
        let mut raw = Vec::new();
        for id in ids {
            codec::encode_into(&[Value::BigInt(*id)], &schema(), &mut raw).expect("encode");
        }
        compression.compress_bytes(&raw).expect("compress")
    }

    fn put(stub: &TunnelStub, id: &str, index: u32, encoding: &str, body: Vec<u8>) -> u16 {
        let request = TransportRequest::new(
            Method::Put,
            format!("projects/p/tables/t/uploads/{id}/blocks/{index}"),
        )
        .with_header("Content-Encoding", encoding)
        .with_body(RequestBody::Bytes(body));
        stub.handle(request).status
    }

    fn commit(stub: &TunnelStub, id: &str, blocks: &[u32], compression: &str) -> u16 {
        let request =
            TransportRequest::new(Method::Post, format!("projects/p/tables/t/uploads/{id}/commit"))
                .with_json(&json!({"blocks": blocks, "compression": compression}))
                .expect("json");
        stub.handle(request).status
    }

    #[test]
    fn committed_blocks_land_in_index_order() {
        let stub = stub();
        let id = create_upload(&stub, "deflate");
        assert_eq!(put(&stub, &id, 2, "deflate", block_body(&[20, 21], Compression::deflate())), 200);
        assert_eq!(put(&stub, &id, 0, "deflate", block_body(&[1], Compression::deflate())), 200);
        assert_eq!(commit(&stub, &id, &[2, 0], "deflate"), 200);
        let ids: Vec<Value> = stub.rows("p", "t", "").into_iter().flatten().collect();
        assert_eq!(ids, vec![Value::BigInt(1), Value::BigInt(20), Value::BigInt(21)]);

        assert_eq!(commit(&stub, &id, &[0, 2], "deflate"), 200);
        assert_eq!(stub.rows("p", "t", "").len(), 3);
        assert_eq!(commit(&stub, &id, &[0], "deflate"), 409);
    }

    #[test]
    fn rejects_incomplete_and_mismatched_uploads() {
        let stub = stub();
        let id = create_upload(&stub, "identity");
        assert_eq!(put(&stub, &id, 0, "zstd", block_body(&[1], Compression::None)), 400);
        assert_eq!(commit(&stub, &id, &[0], "identity"), 400);

        let mut truncated = block_body(&[1, 2], Compression::None);
        truncated.pop();
        assert_eq!(put(&stub, &id, 0, "identity", truncated), 400);
        assert_eq!(commit(&stub, &id, &[0], "identity"), 400);
        assert!(stub.rows("p", "t", "").is_empty());
    }

    #[test]
    fn expired_sessions_refuse_blocks() {
        let stub = stub();
        let id = create_upload(&stub, "identity");
        assert!(stub.expire_session(&id));
        assert_eq!(put(&stub, &id, 0, "identity", block_body(&[1], Compression::None)), 410);
        assert!(!stub.expire_session("missing"));
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let stub = stub();
        stub.fail_next(503, 2);
        let request = || TransportRequest::new(Method::Get, "projects/p/tables/t/uploads/x");
        assert_eq!(stub.handle(request()).status, 503);
        assert_eq!(stub.handle(request()).status, 503);
        assert_eq!(stub.handle(request()).status, 404);
        assert_eq!(stub.request_count(), 3);
    }

    #[test]
    fn routes_under_a_mount_prefix() {
        let stub = stub();
        let request = TransportRequest::new(Method::Post, "api/tunnel/projects/p/tables/t/uploads")
            .with_json(&json!({"compression": "identity"}))
            .expect("json");
        assert_eq!(stub.handle(request).status, 200);
        let request = TransportRequest::new(Method::Get, "api/tunnel/other");
        assert_eq!(stub.handle(request).status, 404);
    }

    #[test]
    fn partitions_are_canonicalized() {
        let schema = schema()
            .with_partition_column(Column::new("pt", DataType::String))
            .with_partition_column(Column::new("region", DataType::String));
        let spec: PartitionSpec = "region=east,PT=1".parse().expect("spec");
        assert!(canonical_partition(&schema, &spec).is_ok_and(|key| key == "pt=1,region=east"));
        let partial: PartitionSpec = "pt=1".parse().expect("spec");
        assert!(canonical_partition(&schema, &partial).is_err());
    }
}
