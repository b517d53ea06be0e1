//! Purpose: Stream one block of records to the tunnel service.
//! Exports: `BlockWriter`, `BlockState`.
//! Role: Encodes and compresses records on the caller's thread; a worker thread owns the PUT.
//! Invariants: A record is validated in full before any of its bytes reach the stream.
//! Invariants: Only a service receipt with a matching record count makes a block Flushed.
//! Invariants: Dropping or cancelling an unfinished writer aborts the stream; a truncated
//! body is never accepted as a complete block.
#![allow(clippy::result_large_err)]

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::protocol::{
    BINARY_CONTENT_TYPE, BlockEnvelope, BlockReceipt, CONTENT_ENCODING, SessionStatus,
};
use crate::api::session::UploadSession;
use crate::api::transport::{Method, RequestBody, TransportRequest};
use crate::core::codec;
use crate::core::compress::CompressWriter;
use crate::core::context::CallContext;
use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::types::Value;

type ApiResult<T> = Result<T, Error>;

// Chunks in flight between the encoder and the transport worker.
const CHANNEL_DEPTH: usize = 4;
const RESULT_POLL: Duration = Duration::from_millis(20);
// Backpressure waits re-check the call context this often.
const SEND_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockState {
    Open,
    Writing,
    Flushed,
    Committed,
    Failed,
}

pub struct BlockWriter {
    session: UploadSession,
    index: u32,
    state: BlockState,
    records: u64,
    scratch: Vec<u8>,
    stream: Option<CompressWriter<ChunkSink>>,
    abort: Arc<AtomicBool>,
    result_rx: Option<Receiver<ApiResult<BlockReceipt>>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BlockWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriter")
            .field("session", &self.session)
            .field("index", &self.index)
            .field("state", &self.state)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl BlockWriter {
    /// Reserves `index` and starts its upload stream.
    pub fn open(session: UploadSession, index: u32, ctx: &CallContext) -> ApiResult<Self> {
        ctx.check()?;
        session.ensure_writable()?;
        session
            .inner
            .ledger
            .reserve(index)
            .map_err(|err| err.with_session(session.id()))?;

        match Self::start(&session, index) {
            Ok(writer) => {
                debug!(session = %session.id(), block = index, "block writer opened");
                Ok(writer)
            }
            Err(err) => {
                session.inner.ledger.release(index);
                Err(err.with_session(session.id()).with_block(index))
            }
        }
    }

    fn start(session: &UploadSession, index: u32) -> ApiResult<Self> {
        let inner = &session.inner;
        let config = &inner.client.config;
        let abort = Arc::new(AtomicBool::new(false));
        let (chunk_tx, chunk_rx) = mpsc::sync_channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (result_tx, result_rx) = mpsc::channel();

        let body = ChannelReader {
            rx: chunk_rx,
            chunk: Vec::new(),
            pos: 0,
            abort: Arc::clone(&abort),
        };
        let request = block_request(session, index).with_body(RequestBody::Stream(Box::new(body)));
        let client = Arc::clone(&inner.client);
        let worker = std::thread::Builder::new()
            .name(format!("tunnel-block-{index}"))
            .spawn(move || {
                let result = client.send(request).and_then(read_receipt);
                let _ = result_tx.send(result);
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn block upload worker")
                    .with_source(err)
            })?;

        let sink = ChunkSink {
            tx: Some(chunk_tx),
            chunk: Vec::with_capacity(config.chunk_size),
            chunk_size: config.chunk_size,
            replay: (config.replay_limit > 0).then(Vec::new),
            replay_limit: config.replay_limit,
            abort: Arc::clone(&abort),
            ctx: CallContext::new(),
        };
        let stream = match inner.compression.wrap_writer(sink) {
            Ok(stream) => stream,
            Err(err) => {
                abort.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };

        Ok(Self {
            session: session.clone(),
            index,
            state: BlockState::Open,
            records: 0,
            scratch: Vec::new(),
            stream: Some(stream),
            abort,
            result_rx: Some(result_rx),
            worker: Some(worker),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn state(&self) -> BlockState {
        if self.state == BlockState::Flushed && self.session.inner.ledger.is_committed(self.index)
        {
            return BlockState::Committed;
        }
        self.state
    }

    fn ensure_active(&self) -> ApiResult<()> {
        match self.state {
            BlockState::Open | BlockState::Writing => Ok(()),
            state => Err(Error::from_code(ErrorCode::InvalidWriteState)
                .with_message(format!("block writer is {state:?}"))
                .with_session(self.session.id())
                .with_block(self.index)),
        }
    }

    /// Appends one record. A record that does not conform to the schema is rejected
    /// without touching the stream; the block stays writable.
    pub fn write(&mut self, record: &[Value], ctx: &CallContext) -> ApiResult<()> {
        self.ensure_active()?;
        if let Err(err) = ctx.check() {
            self.fail();
            return Err(err.with_session(self.session.id()).with_block(self.index));
        }
        self.scratch.clear();
        codec::encode_into(record, self.session.schema(), &mut self.scratch)
            .map_err(|err| err.with_session(self.session.id()).with_block(self.index))?;

        let written = match self.stream.as_mut() {
            Some(stream) => {
                stream.get_mut().ctx = ctx.clone();
                stream.write_all(&self.scratch)
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "block stream closed")),
        };
        if let Err(err) = written {
            let err = self.stream_failure(err, ctx);
            self.fail();
            return Err(err.with_session(self.session.id()).with_block(self.index));
        }
        self.records += 1;
        self.state = BlockState::Writing;
        Ok(())
    }

    /// Adapts a generic row (array or object) to the session schema and appends it.
    pub fn write_json(&mut self, row: &serde_json::Value, ctx: &CallContext) -> ApiResult<()> {
        self.ensure_active()?;
        let record = self
            .session
            .schema()
            .adapt_record(row)
            .map_err(|err| err.with_session(self.session.id()).with_block(self.index))?;
        self.write(&record, ctx)
    }

    /// Finishes the compression frame and waits for the service receipt.
    pub fn close(&mut self, ctx: &CallContext) -> ApiResult<BlockReceipt> {
        self.ensure_active()?;
        match self.finish(ctx) {
            Ok(receipt) => {
                self.session.inner.ledger.mark_flushed(self.index);
                self.state = BlockState::Flushed;
                info!(
                    session = %self.session.id(),
                    block = self.index,
                    records = receipt.records,
                    "block flushed"
                );
                Ok(receipt)
            }
            Err(err) => {
                if err.is_session_expired() {
                    self.session.mark_status(SessionStatus::Expired);
                }
                warn!(session = %self.session.id(), block = self.index, error = %err, "block failed");
                self.fail();
                Err(err.with_session(self.session.id()).with_block(self.index))
            }
        }
    }

    fn finish(&mut self, ctx: &CallContext) -> ApiResult<BlockReceipt> {
        ctx.check()?;
        let mut stream = self.stream.take().ok_or_else(|| {
            Error::from_code(ErrorCode::InvalidWriteState).with_message("block stream closed")
        })?;
        stream.get_mut().ctx = ctx.clone();
        let replay = match stream.finish().and_then(ChunkSink::finish_stream) {
            Ok(replay) => replay,
            Err(err) => return Err(self.stream_failure(err, ctx)),
        };

        let first = self.wait_result(ctx)?;
        let receipt = match first {
            Ok(receipt) => receipt,
            Err(err) if err.is_retryable() => match replay {
                Some(bytes) => self.replay(err, bytes, ctx)?,
                None => return Err(ctx.classify(err)),
            },
            Err(err) => return Err(ctx.classify(err)),
        };
        if receipt.index != self.index || receipt.records != self.records {
            return Err(Error::new(ErrorKind::Protocol).with_message(format!(
                "receipt for block {} acknowledged {} records, wrote {}",
                receipt.index, receipt.records, self.records
            )));
        }
        Ok(receipt)
    }

    // Re-sends the buffered body once the streamed attempt has failed transiently.
    fn replay(&self, first: Error, bytes: Vec<u8>, ctx: &CallContext) -> ApiResult<BlockReceipt> {
        let client = &self.session.inner.client;
        let mut pending = Some(first);
        client.config.retry.run(ctx, "upload block", |attempt| {
            if let Some(err) = pending.take() {
                return Err(err);
            }
            debug!(session = %self.session.id(), block = self.index, attempt, "replaying block");
            let request = block_request(&self.session, self.index)
                .with_body(RequestBody::Bytes(bytes.clone()))
                .with_timeout(ctx.clamp(client.config.http_timeout));
            client.send(request).and_then(read_receipt)
        })
    }

    fn wait_result(&mut self, ctx: &CallContext) -> ApiResult<ApiResult<BlockReceipt>> {
        let rx = self.result_rx.take().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("block worker result already taken")
        })?;
        let result = loop {
            match rx.recv_timeout(RESULT_POLL) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = ctx.check() {
                        self.abort.store(true, Ordering::SeqCst);
                        return Err(err);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(Error::new(ErrorKind::Internal)
                        .with_message("block upload worker exited without a result"));
                }
            }
        };
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(result)
    }

    // A fired context wins; otherwise the worker's own error explains why the stream broke.
    fn stream_failure(&mut self, err: io::Error, ctx: &CallContext) -> Error {
        self.abort.store(true, Ordering::SeqCst);
        self.stream = None;
        if let Err(ctx_err) = ctx.check() {
            self.result_rx = None;
            return ctx_err.with_source(err);
        }
        if let Some(rx) = self.result_rx.take() {
            if let Ok(Err(worker_err)) = rx.recv_timeout(Duration::from_secs(1)) {
                return worker_err;
            }
        }
        Error::new(ErrorKind::Transport)
            .with_message("block stream broke")
            .with_source(err)
    }

    fn fail(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        self.stream = None;
        self.result_rx = None;
        self.worker = None;
        if matches!(self.state, BlockState::Open | BlockState::Writing) {
            self.session.inner.ledger.release(self.index);
        }
        self.state = BlockState::Failed;
    }
}

impl Drop for BlockWriter {
    fn drop(&mut self) {
        if matches!(self.state, BlockState::Open | BlockState::Writing) {
            debug!(session = %self.session.id(), block = self.index, "aborting unclosed block");
            self.fail();
        }
    }
}

fn block_request(session: &UploadSession, index: u32) -> TransportRequest {
    let inner = &session.inner;
    TransportRequest::new(Method::Put, inner.table.block_path(&inner.id, index))
        .with_header(CONTENT_ENCODING, inner.compression.name())
        .with_header("Content-Type", BINARY_CONTENT_TYPE)
}

fn read_receipt(response: crate::api::transport::TransportResponse) -> ApiResult<BlockReceipt> {
    let envelope: BlockEnvelope = response.read_json()?;
    Ok(envelope.block)
}

/// Cuts the compressed stream into chunks for the transport worker and keeps a replay
/// copy while it stays under the limit.
struct ChunkSink {
    tx: Option<SyncSender<Vec<u8>>>,
    chunk: Vec<u8>,
    chunk_size: usize,
    replay: Option<Vec<u8>>,
    replay_limit: usize,
    abort: Arc<AtomicBool>,
    // Context of the call currently pushing bytes through the sink.
    ctx: CallContext,
}

impl ChunkSink {
    fn send_chunk(&mut self) -> io::Result<()> {
        let mut chunk = std::mem::replace(&mut self.chunk, Vec::with_capacity(self.chunk_size));
        let delivered = loop {
            let Some(tx) = &self.tx else {
                break false;
            };
            match tx.try_send(chunk) {
                Ok(()) => break true,
                Err(TrySendError::Disconnected(_)) => break false,
                Err(TrySendError::Full(pending)) => {
                    if self.abort.load(Ordering::SeqCst) {
                        self.tx = None;
                        return Ok(());
                    }
                    if let Err(err) = self.ctx.check() {
                        self.abort.store(true, Ordering::SeqCst);
                        self.tx = None;
                        return Err(io::Error::other(err));
                    }
                    chunk = pending;
                    std::thread::sleep(SEND_POLL);
                }
            }
        };
        if !delivered {
            // The worker stopped reading; keep going only if the block can be replayed.
            self.tx = None;
        }
        if self.tx.is_none() && self.replay.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "block upload stream closed by transport",
            ));
        }
        Ok(())
    }

    /// Sends the tail chunk and closes the channel; returns the replay copy if kept.
    fn finish_stream(mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.chunk.is_empty() {
            self.send_chunk()?;
        }
        self.tx = None;
        Ok(self.replay.take())
    }
}

impl Write for ChunkSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.abort.load(Ordering::SeqCst) {
            self.tx = None;
            return Ok(buf.len());
        }
        if let Some(replay) = &mut self.replay {
            if replay.len() + buf.len() > self.replay_limit {
                self.replay = None;
            } else {
                replay.extend_from_slice(buf);
            }
        }
        self.chunk.extend_from_slice(buf);
        if self.chunk.len() >= self.chunk_size {
            self.send_chunk()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Request body fed from the chunk channel. A closed channel is end of body unless the
/// writer aborted, in which case the transport sees an error instead of a clean end.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
    abort: Arc<AtomicBool>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "block upload aborted",
                ));
            }
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) if self.abort.load(Ordering::SeqCst) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "block upload aborted",
                    ));
                }
                Err(_) => return Ok(0),
            }
        }
    }
}
