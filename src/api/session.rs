//! Purpose: Create, reopen, inspect, and commit tunnel sessions.
//! Exports: `TunnelClient`, `UploadSession`, `DownloadSession`, `UploadOptions`, `DownloadOptions`.
//! Role: Owns the per-session block ledger; writers and readers borrow session handles.
//! Invariants: Commit sends nothing unless every requested block is flushed locally.
//! Invariants: Commit is idempotent for the same block set; a different set after commit is rejected.
//! Invariants: Expired or closed sessions reject new writers and readers.
#![allow(clippy::result_large_err)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::api::config::TunnelConfig;
use crate::api::protocol::{
    CommitRequest, CreateDownloadRequest, CreateUploadRequest, PartitionSpec, QUOTA_PARAM,
    SessionEnvelope, SessionInfo, SessionKind, SessionStatus, TableRef, error_from_response,
};
use crate::api::reader::BlockReader;
use crate::api::transport::{HttpTransport, Method, Transport, TransportRequest, TransportResponse};
use crate::api::writer::BlockWriter;
use crate::core::compress::Compression;
use crate::core::context::CallContext;
use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::types::{Record, Schema};

type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub partition: PartitionSpec,
    pub schema_hint: Option<Schema>,
    /// Falls back to the client's configured compression.
    pub compression: Option<Compression>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(mut self, partition: PartitionSpec) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_schema_hint(mut self, schema: Schema) -> Self {
        self.schema_hint = Some(schema);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DownloadOptions {
    pub partition: PartitionSpec,
    /// Empty means every column, in table order.
    pub columns: Vec<String>,
    pub compression: Option<Compression>,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(mut self, partition: PartitionSpec) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }
}

#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
    registry: Arc<Registry>,
}

/// Transport and settings shared by every session of one client.
pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: TunnelConfig,
}

#[derive(Default)]
struct Registry {
    uploads: Mutex<HashMap<String, UploadSession>>,
    downloads: Mutex<HashMap<String, DownloadSession>>,
}

impl ClientInner {
    /// Sends one request and turns non-2xx responses into errors.
    pub(crate) fn send(&self, request: TransportRequest) -> ApiResult<TransportResponse> {
        let response = self.transport.execute(request)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response))
        }
    }

    fn with_quota(&self, request: TransportRequest) -> TransportRequest {
        match &self.config.quota_name {
            Some(quota) => request.with_query(QUOTA_PARAM, quota.clone()),
            None => request,
        }
    }

    fn fetch_session(
        &self,
        path: String,
        ctx: &CallContext,
        op: &str,
    ) -> ApiResult<SessionInfo> {
        self.config.retry.run(ctx, op, |_| {
            let request = TransportRequest::new(Method::Get, path.clone())
                .with_timeout(ctx.clamp(self.config.http_timeout));
            let envelope: SessionEnvelope = self.send(request)?.read_json()?;
            Ok(envelope.session)
        })
    }
}

impl TunnelClient {
    pub fn new(transport: Arc<dyn Transport>, config: TunnelConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner { transport, config }),
            registry: Arc::new(Registry::default()),
        }
    }

    /// Client over a pooled HTTP transport for `config.endpoint`.
    pub fn http(config: TunnelConfig) -> ApiResult<Self> {
        let transport = HttpTransport::from_config(&config)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    /// Resolves `table` against the configured default project.
    pub fn table(&self, table: &str) -> ApiResult<TableRef> {
        let project = self.inner.config.project.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("no default project configured")
        })?;
        TableRef::new(project, table)
    }

    pub fn create_upload(
        &self,
        table: &TableRef,
        options: UploadOptions,
        ctx: &CallContext,
    ) -> ApiResult<UploadSession> {
        let compression = options
            .compression
            .unwrap_or(self.inner.config.compression);
        let body = CreateUploadRequest {
            partition: options.partition.to_string(),
            schema: options.schema_hint.clone(),
            compression: compression.name().to_string(),
        };
        let inner = &self.inner;
        let info = inner
            .config
            .retry
            .run(ctx, "create upload", |attempt| {
                debug!(table = %table, attempt, "creating upload session");
                let request = inner
                    .with_quota(TransportRequest::new(Method::Post, table.uploads_path()))
                    .with_json(&body)?
                    .with_timeout(ctx.clamp(inner.config.http_timeout));
                let envelope: SessionEnvelope = inner.send(request)?.read_json()?;
                Ok(envelope.session)
            })
            .map_err(|err| err.or_code(ErrorCode::SessionCreateFailed))?;

        let conflict = options
            .schema_hint
            .as_ref()
            .and_then(|hint| info.schema.conflicts_with(hint));
        if let Some(reason) = conflict {
            return Err(Error::from_code(ErrorCode::SchemaConflict)
                .with_message(reason)
                .with_session(info.id));
        }
        compression
            .ensure_encoding(Some(&info.compression))
            .map_err(|err| err.with_session(info.id.clone()))?;

        let session = UploadSession::from_info(
            Arc::clone(&self.inner),
            table.clone(),
            options.partition,
            compression,
            info,
        )?;
        info!(session = %session.id(), table = %table, compression = %compression, "upload session created");
        lock(&self.registry.uploads).insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    /// Picks up an upload session created elsewhere; the service's flushed blocks seed
    /// the local ledger.
    pub fn reopen_upload(
        &self,
        table: &TableRef,
        id: &str,
        ctx: &CallContext,
    ) -> ApiResult<UploadSession> {
        let info = self
            .inner
            .fetch_session(table.upload_path(id), ctx, "reopen upload")
            .map_err(|err| err.with_session(id))?;
        if info.kind != SessionKind::Upload {
            return Err(Error::new(ErrorKind::Service)
                .with_message("session is not an upload session")
                .with_session(id));
        }
        let compression = Compression::from_name(&info.compression).ok_or_else(|| {
            Error::from_code(ErrorCode::CompressionMismatch)
                .with_message(format!("unknown session compression {:?}", info.compression))
        })?;
        let partition = info.partition().map_err(|err| err.with_session(id))?;
        let session = UploadSession::from_info(
            Arc::clone(&self.inner),
            table.clone(),
            partition,
            compression,
            info,
        )?;
        info!(session = %session.id(), table = %table, "upload session reopened");
        lock(&self.registry.uploads).insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    pub fn create_download(
        &self,
        table: &TableRef,
        options: DownloadOptions,
        ctx: &CallContext,
    ) -> ApiResult<DownloadSession> {
        let compression = options
            .compression
            .unwrap_or(self.inner.config.compression);
        let body = CreateDownloadRequest {
            partition: options.partition.to_string(),
            columns: options.columns.clone(),
            compression: compression.name().to_string(),
        };
        let inner = &self.inner;
        let info = inner
            .config
            .retry
            .run(ctx, "create download", |attempt| {
                debug!(table = %table, attempt, "creating download session");
                let request = inner
                    .with_quota(TransportRequest::new(Method::Post, table.downloads_path()))
                    .with_json(&body)?
                    .with_timeout(ctx.clamp(inner.config.http_timeout));
                let envelope: SessionEnvelope = inner.send(request)?.read_json()?;
                Ok(envelope.session)
            })
            .map_err(|err| err.or_code(ErrorCode::SessionCreateFailed))?;
        compression
            .ensure_encoding(Some(&info.compression))
            .map_err(|err| err.with_session(info.id.clone()))?;

        let session = DownloadSession::from_info(
            Arc::clone(&self.inner),
            table.clone(),
            options.partition,
            compression,
            info,
        )?;
        info!(
            session = %session.id(),
            table = %table,
            records = session.record_count(),
            "download session created"
        );
        lock(&self.registry.downloads).insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    pub fn reopen_download(
        &self,
        table: &TableRef,
        id: &str,
        ctx: &CallContext,
    ) -> ApiResult<DownloadSession> {
        let info = self
            .inner
            .fetch_session(table.download_path(id), ctx, "reopen download")
            .map_err(|err| err.with_session(id))?;
        if info.kind != SessionKind::Download {
            return Err(Error::new(ErrorKind::Service)
                .with_message("session is not a download session")
                .with_session(id));
        }
        let compression = Compression::from_name(&info.compression).ok_or_else(|| {
            Error::from_code(ErrorCode::CompressionMismatch)
                .with_message(format!("unknown session compression {:?}", info.compression))
        })?;
        let partition = info.partition().map_err(|err| err.with_session(id))?;
        let session = DownloadSession::from_info(
            Arc::clone(&self.inner),
            table.clone(),
            partition,
            compression,
            info,
        )?;
        lock(&self.registry.downloads).insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    pub fn upload(&self, id: &str) -> ApiResult<UploadSession> {
        lock(&self.registry.uploads).get(id).cloned().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("unknown upload session")
                .with_session(id)
        })
    }

    pub fn download(&self, id: &str) -> ApiResult<DownloadSession> {
        lock(&self.registry.downloads).get(id).cloned().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("unknown download session")
                .with_session(id)
        })
    }

    pub fn open_writer(&self, id: &str, index: u32, ctx: &CallContext) -> ApiResult<BlockWriter> {
        self.upload(id)?.open_writer(index, ctx)
    }

    pub fn commit(&self, id: &str, blocks: &[u32], ctx: &CallContext) -> ApiResult<()> {
        self.upload(id)?.commit(blocks, ctx)
    }

    /// Fresh status from the service for any session created or reopened by this client.
    pub fn status(&self, id: &str, ctx: &CallContext) -> ApiResult<SessionStatus> {
        if let Ok(upload) = self.upload(id) {
            return upload.refresh_status(ctx);
        }
        self.download(id)?.refresh_status(ctx)
    }
}

/// Indices with an active writer, indices flushed by the service, and the committed set.
#[derive(Default)]
pub(crate) struct BlockLedger {
    open: Mutex<BTreeSet<u32>>,
    flushed: Mutex<BTreeSet<u32>>,
    committed: Mutex<Option<BTreeSet<u32>>>,
}

impl BlockLedger {
    fn seeded(flushed: BTreeSet<u32>, committed: Option<BTreeSet<u32>>) -> Self {
        Self {
            open: Mutex::new(BTreeSet::new()),
            flushed: Mutex::new(flushed),
            committed: Mutex::new(committed),
        }
    }

    /// Claims `index` for a new writer. A rewrite invalidates an earlier flush.
    pub(crate) fn reserve(&self, index: u32) -> ApiResult<()> {
        if !lock(&self.open).insert(index) {
            return Err(Error::from_code(ErrorCode::BlockAlreadyOpen)
                .with_message("another writer holds this block")
                .with_block(index));
        }
        lock(&self.flushed).remove(&index);
        Ok(())
    }

    pub(crate) fn release(&self, index: u32) {
        lock(&self.open).remove(&index);
    }

    pub(crate) fn mark_flushed(&self, index: u32) {
        lock(&self.flushed).insert(index);
        lock(&self.open).remove(&index);
    }

    pub(crate) fn is_committed(&self, index: u32) -> bool {
        lock(&self.committed)
            .as_ref()
            .is_some_and(|committed| committed.contains(&index))
    }

    fn flushed(&self) -> BTreeSet<u32> {
        lock(&self.flushed).clone()
    }

    fn committed(&self) -> Option<BTreeSet<u32>> {
        lock(&self.committed).clone()
    }
}

#[derive(Clone)]
pub struct UploadSession {
    pub(crate) inner: Arc<UploadInner>,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

pub(crate) struct UploadInner {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) table: TableRef,
    pub(crate) id: String,
    pub(crate) schema: Schema,
    pub(crate) compression: Compression,
    partition: PartitionSpec,
    created_at: OffsetDateTime,
    expires_at: Mutex<OffsetDateTime>,
    status: Mutex<SessionStatus>,
    pub(crate) ledger: BlockLedger,
}

impl UploadSession {
    fn from_info(
        client: Arc<ClientInner>,
        table: TableRef,
        partition: PartitionSpec,
        compression: Compression,
        info: SessionInfo,
    ) -> ApiResult<Self> {
        let created_at = info.created_at()?;
        let expires_at = info.expires_at()?;
        let blocks: BTreeSet<u32> = info.blocks.iter().copied().collect();
        let ledger = if info.status == SessionStatus::Closed {
            BlockLedger::seeded(blocks.clone(), Some(blocks))
        } else {
            BlockLedger::seeded(blocks, None)
        };
        Ok(Self {
            inner: Arc::new(UploadInner {
                client,
                table,
                id: info.id,
                schema: info.schema,
                compression,
                partition,
                created_at,
                expires_at: Mutex::new(expires_at),
                status: Mutex::new(info.status),
                ledger,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn table(&self) -> &TableRef {
        &self.inner.table
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn compression(&self) -> Compression {
        self.inner.compression
    }

    pub fn partition(&self) -> &PartitionSpec {
        &self.inner.partition
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.inner.created_at
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        *lock(&self.inner.expires_at)
    }

    /// Last known status; expiry is applied locally from `expires_at`.
    pub fn status(&self) -> SessionStatus {
        let mut status = lock(&self.inner.status);
        if *status == SessionStatus::Normal && OffsetDateTime::now_utc() >= self.expires_at() {
            *status = SessionStatus::Expired;
        }
        *status
    }

    pub fn flushed_blocks(&self) -> Vec<u32> {
        self.inner.ledger.flushed().into_iter().collect()
    }

    pub fn committed_blocks(&self) -> Option<Vec<u32>> {
        self.inner
            .ledger
            .committed()
            .map(|committed| committed.into_iter().collect())
    }

    pub fn refresh_status(&self, ctx: &CallContext) -> ApiResult<SessionStatus> {
        let path = self.inner.table.upload_path(&self.inner.id);
        let info = self
            .inner
            .client
            .fetch_session(path, ctx, "upload status")
            .map_err(|err| err.with_session(self.id()))?;
        self.apply_info(&info)?;
        Ok(info.status)
    }

    fn apply_info(&self, info: &SessionInfo) -> ApiResult<()> {
        *lock(&self.inner.expires_at) = info.expires_at()?;
        *lock(&self.inner.status) = info.status;
        if info.status == SessionStatus::Closed {
            let mut committed = lock(&self.inner.ledger.committed);
            if committed.is_none() {
                *committed = Some(info.blocks.iter().copied().collect());
            }
        }
        Ok(())
    }

    pub(crate) fn mark_status(&self, status: SessionStatus) {
        *lock(&self.inner.status) = status;
    }

    pub(crate) fn ensure_writable(&self) -> ApiResult<()> {
        match self.status() {
            SessionStatus::Normal => Ok(()),
            SessionStatus::Expired => Err(Error::from_code(ErrorCode::SessionExpired)
                .with_message("upload session has expired")
                .with_session(self.id())),
            status => Err(Error::from_code(ErrorCode::SessionClosed)
                .with_message(format!("upload session is {status:?}"))
                .with_session(self.id())),
        }
    }

    pub fn open_writer(&self, index: u32, ctx: &CallContext) -> ApiResult<BlockWriter> {
        BlockWriter::open(self.clone(), index, ctx)
    }

    /// Atomically publishes `blocks`. Repeating a successful commit with the same set is
    /// a no-op; a commit whose outcome is unknown is resolved by polling status first.
    pub fn commit(&self, blocks: &[u32], ctx: &CallContext) -> ApiResult<()> {
        let requested: BTreeSet<u32> = blocks.iter().copied().collect();
        if let Some(committed) = self.inner.ledger.committed() {
            if committed == requested {
                debug!(session = %self.id(), "commit repeated with identical block set");
                return Ok(());
            }
            return Err(Error::from_code(ErrorCode::SessionClosed)
                .with_message("session already committed a different block set")
                .with_session(self.id()));
        }
        self.ensure_writable()?;
        let flushed = self.inner.ledger.flushed();
        if let Some(missing) = requested.iter().find(|index| !flushed.contains(index)) {
            return Err(Error::from_code(ErrorCode::IncompleteBlock)
                .with_message("block has not been flushed")
                .with_session(self.id())
                .with_block(*missing));
        }

        let client = &self.inner.client;
        let body = CommitRequest {
            blocks: requested.iter().copied().collect(),
            compression: self.inner.compression.name().to_string(),
        };
        let path = self.inner.table.commit_path(&self.inner.id);
        let status_path = self.inner.table.upload_path(&self.inner.id);
        let result = client.config.retry.run(ctx, "commit", |attempt| {
            if attempt > 0 {
                let request = TransportRequest::new(Method::Get, status_path.clone())
                    .with_timeout(ctx.clamp(client.config.http_timeout));
                let envelope: SessionEnvelope = client.send(request)?.read_json()?;
                let landed: BTreeSet<u32> = envelope.session.blocks.iter().copied().collect();
                if envelope.session.status == SessionStatus::Closed && landed == requested {
                    warn!(session = %self.id(), attempt, "commit already applied by the service");
                    return Ok(envelope.session);
                }
            }
            let request = TransportRequest::new(Method::Post, path.clone())
                .with_json(&body)?
                .with_timeout(ctx.clamp(client.config.http_timeout));
            let envelope: SessionEnvelope = client.send(request)?.read_json()?;
            Ok(envelope.session)
        });
        let info = match result {
            Ok(info) => info,
            Err(err) => {
                if err.is_session_expired() {
                    self.mark_status(SessionStatus::Expired);
                }
                return Err(err.with_session(self.id()));
            }
        };
        *lock(&self.inner.ledger.committed) = Some(requested.clone());
        *lock(&self.inner.status) = info.status;
        info!(session = %self.id(), blocks = requested.len(), "upload session committed");
        Ok(())
    }
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct DownloadSession {
    pub(crate) inner: Arc<DownloadInner>,
}

pub(crate) struct DownloadInner {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) table: TableRef,
    pub(crate) id: String,
    pub(crate) schema: Schema,
    pub(crate) compression: Compression,
    partition: PartitionSpec,
    record_count: u64,
    expires_at: Mutex<OffsetDateTime>,
    status: Mutex<SessionStatus>,
}

impl DownloadSession {
    fn from_info(
        client: Arc<ClientInner>,
        table: TableRef,
        partition: PartitionSpec,
        compression: Compression,
        info: SessionInfo,
    ) -> ApiResult<Self> {
        let expires_at = info.expires_at()?;
        Ok(Self {
            inner: Arc::new(DownloadInner {
                client,
                table,
                id: info.id,
                schema: info.schema,
                compression,
                partition,
                record_count: info.record_count,
                expires_at: Mutex::new(expires_at),
                status: Mutex::new(info.status),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn table(&self) -> &TableRef {
        &self.inner.table
    }

    /// Schema of the rows served, after column projection.
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn compression(&self) -> Compression {
        self.inner.compression
    }

    pub fn partition(&self) -> &PartitionSpec {
        &self.inner.partition
    }

    pub fn record_count(&self) -> u64 {
        self.inner.record_count
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        *lock(&self.inner.expires_at)
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = lock(&self.inner.status);
        if *status == SessionStatus::Normal && OffsetDateTime::now_utc() >= self.expires_at() {
            *status = SessionStatus::Expired;
        }
        *status
    }

    pub fn refresh_status(&self, ctx: &CallContext) -> ApiResult<SessionStatus> {
        let path = self.inner.table.download_path(&self.inner.id);
        let info = self
            .inner
            .client
            .fetch_session(path, ctx, "download status")
            .map_err(|err| err.with_session(self.id()))?;
        *lock(&self.inner.expires_at) = info.expires_at()?;
        *lock(&self.inner.status) = info.status;
        Ok(info.status)
    }

    pub(crate) fn mark_status(&self, status: SessionStatus) {
        *lock(&self.inner.status) = status;
    }

    pub(crate) fn ensure_readable(&self) -> ApiResult<()> {
        match self.status() {
            SessionStatus::Normal => Ok(()),
            SessionStatus::Expired => Err(Error::from_code(ErrorCode::SessionExpired)
                .with_message("download session has expired")
                .with_session(self.id())),
            status => Err(Error::from_code(ErrorCode::SessionClosed)
                .with_message(format!("download session is {status:?}"))
                .with_session(self.id())),
        }
    }

    /// An unopened reader; see `BlockReader::open`.
    pub fn reader(&self) -> BlockReader {
        BlockReader::new(self.clone())
    }

    pub fn open_reader(&self, start: u64, count: u64, ctx: &CallContext) -> ApiResult<BlockReader> {
        let mut reader = self.reader();
        reader.open(start, count, ctx)?;
        Ok(reader)
    }

    /// Reads the whole session in one range.
    pub fn read_all(&self, ctx: &CallContext) -> ApiResult<Vec<Record>> {
        let mut reader = self.open_reader(0, self.record_count(), ctx)?;
        let mut records = Vec::with_capacity(self.record_count().min(1 << 16) as usize);
        while let Some(record) = reader.read(ctx)? {
            records.push(record);
        }
        Ok(records)
    }
}

// Ledger and registry critical sections never panic, so a poisoned lock still holds
// consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{BlockLedger, UploadOptions};
    use crate::api::protocol::PartitionSpec;
    use crate::core::compress::Compression;
    use crate::core::error::ErrorCode;

    #[test]
    fn ledger_reservations_are_exclusive() {
        let ledger = BlockLedger::default();
        ledger.reserve(3).expect("first");
        let err = ledger.reserve(3).expect_err("second");
        assert_eq!(err.code(), Some(ErrorCode::BlockAlreadyOpen));
        ledger.reserve(4).expect("other index");
        ledger.release(3);
        ledger.reserve(3).expect("after release");
    }

    #[test]
    fn rewriting_a_block_unflushes_it() {
        let ledger = BlockLedger::default();
        ledger.reserve(0).expect("reserve");
        ledger.mark_flushed(0);
        assert!(ledger.flushed().contains(&0));
        ledger.reserve(0).expect("rewrite");
        assert!(!ledger.flushed().contains(&0));
    }

    #[test]
    fn options_builders() {
        let options = UploadOptions::new()
            .with_partition(PartitionSpec::new().with("pt", "1"))
            .with_compression(Compression::deflate());
        assert_eq!(options.partition.to_string(), "pt=1");
        assert_eq!(options.compression, Some(Compression::deflate()));
        assert!(options.schema_hint.is_none());
    }
}
