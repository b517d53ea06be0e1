//! Purpose: Pull a range of records from a download session.
//! Exports: `BlockReader`.
//! Role: Streams one ranged GET through decompression into the record decoder.
//! Invariants: Exactly `count` records are delivered, in service order, then `None` once.
//! Invariants: A transport failure mid-stream resumes at the first undelivered record.
#![allow(clippy::result_large_err)]

use std::io::Read;

use tracing::{debug, warn};

use crate::api::protocol::{ACCEPT_ENCODING, CONTENT_ENCODING, RECORD_COUNT_HEADER, SessionStatus};
use crate::api::session::DownloadSession;
use crate::api::transport::{Method, TransportRequest};
use crate::core::codec::RecordDecoder;
use crate::core::compress::DecompressReader;
use crate::core::context::CallContext;
use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::types::Record;

type ApiResult<T> = Result<T, Error>;
type BodyDecoder = RecordDecoder<DecompressReader<Box<dyn Read + Send>>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ReadState {
    Idle,
    Reading,
    Exhausted,
    Done,
    Failed,
}

pub struct BlockReader {
    session: DownloadSession,
    state: ReadState,
    start: u64,
    count: u64,
    delivered: u64,
    resumes: u32,
    decoder: Option<BodyDecoder>,
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("session", &self.session)
            .field("state", &self.state)
            .field("start", &self.start)
            .field("count", &self.count)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

impl BlockReader {
    pub fn new(session: DownloadSession) -> Self {
        Self {
            session,
            state: ReadState::Idle,
            start: 0,
            count: 0,
            delivered: 0,
            resumes: 0,
            decoder: None,
        }
    }

    pub fn session(&self) -> &DownloadSession {
        &self.session
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn remaining(&self) -> u64 {
        self.count - self.delivered
    }

    /// Starts streaming records `[start, start + count)`.
    pub fn open(&mut self, start: u64, count: u64, ctx: &CallContext) -> ApiResult<()> {
        self.state = ReadState::Failed;
        self.decoder = None;
        ctx.check()?;
        self.session.ensure_readable()?;
        let total = self.session.record_count();
        let in_range = start
            .checked_add(count)
            .is_some_and(|end| end <= total);
        if !in_range {
            return Err(Error::from_code(ErrorCode::UnexpectedEndOfStream)
                .with_message(format!(
                    "range {start}+{count} exceeds the session's {total} records"
                ))
                .with_session(self.session.id()));
        }
        self.start = start;
        self.count = count;
        self.delivered = 0;
        self.resumes = 0;
        self.decoder = Some(self.fetch(start, count, ctx)?);
        self.state = ReadState::Reading;
        debug!(session = %self.session.id(), start, count, "block reader opened");
        Ok(())
    }

    /// Next record, or `None` once the whole range has been delivered.
    pub fn read(&mut self, ctx: &CallContext) -> ApiResult<Option<Record>> {
        match self.state {
            ReadState::Idle | ReadState::Failed => {
                return Err(Error::from_code(ErrorCode::InvalidReadState)
                    .with_message("block reader is not open")
                    .with_session(self.session.id()));
            }
            ReadState::Done => {
                return Err(Error::from_code(ErrorCode::UnexpectedEndOfStream)
                    .with_message("read past the end of the requested range")
                    .with_session(self.session.id()));
            }
            ReadState::Exhausted => {
                self.state = ReadState::Done;
                return Ok(None);
            }
            ReadState::Reading => {}
        }
        if self.delivered == self.count {
            self.decoder = None;
            self.state = ReadState::Done;
            return Ok(None);
        }
        if let Err(err) = ctx.check() {
            self.state = ReadState::Failed;
            return Err(err.with_session(self.session.id()));
        }

        loop {
            let next = match self.decoder.as_mut() {
                Some(decoder) => decoder.next_record(),
                None => Err(Error::new(ErrorKind::Internal).with_message("decoder missing")),
            };
            match next {
                Ok(Some(record)) => {
                    self.delivered += 1;
                    if self.delivered == self.count {
                        self.decoder = None;
                        self.state = ReadState::Exhausted;
                    }
                    return Ok(Some(record));
                }
                Ok(None) => {
                    self.state = ReadState::Failed;
                    return Err(Error::from_code(ErrorCode::UnexpectedEndOfStream)
                        .with_message(format!(
                            "stream ended after {} of {} records",
                            self.delivered, self.count
                        ))
                        .with_session(self.session.id()));
                }
                Err(err) if err.kind() == ErrorKind::Transport && self.can_resume() => {
                    self.resumes += 1;
                    let from = self.start + self.delivered;
                    let remaining = self.count - self.delivered;
                    warn!(
                        session = %self.session.id(),
                        from,
                        remaining,
                        attempt = self.resumes,
                        error = %err,
                        "resuming interrupted download"
                    );
                    match self.fetch(from, remaining, ctx) {
                        Ok(decoder) => self.decoder = Some(decoder),
                        Err(err) => {
                            self.state = ReadState::Failed;
                            return Err(err.with_session(self.session.id()));
                        }
                    }
                }
                Err(err) => {
                    self.state = ReadState::Failed;
                    return Err(ctx.classify(err).with_session(self.session.id()));
                }
            }
        }
    }

    fn can_resume(&self) -> bool {
        self.resumes + 1 < self.session.inner.client.config.retry.max_attempts
    }

    fn fetch(&self, start: u64, count: u64, ctx: &CallContext) -> ApiResult<BodyDecoder> {
        let inner = &self.session.inner;
        let client = &inner.client;
        let compression = inner.compression;
        let response = client
            .config
            .retry
            .run(ctx, "download range", |_| {
                let request = TransportRequest::new(Method::Get, inner.table.rows_path(&inner.id))
                    .with_query("start", start.to_string())
                    .with_query("count", count.to_string())
                    .with_header(ACCEPT_ENCODING, compression.name())
                    .with_timeout(ctx.clamp(client.config.http_timeout));
                client.send(request)
            })
            .map_err(|err| {
                if err.is_session_expired() {
                    self.session.mark_status(SessionStatus::Expired);
                }
                err.with_session(self.session.id())
            })?;

        compression.ensure_encoding(response.header(CONTENT_ENCODING))?;
        if let Some(announced) = response.header(RECORD_COUNT_HEADER) {
            if announced.trim().parse::<u64>().ok() != Some(count) {
                return Err(Error::from_code(ErrorCode::UnexpectedEndOfStream)
                    .with_message(format!(
                        "service announced {announced} records, expected {count}"
                    )));
            }
        }
        let body = compression.wrap_reader(response.body)?;
        Ok(RecordDecoder::new(body, inner.schema.clone()))
    }
}
