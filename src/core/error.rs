// Error taxonomy shared by the codec, the session manager, and the in-memory service.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Transport,
    Service,
    Protocol,
    State,
    Cancelled,
    Timeout,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    TypeMismatch,
    UnsupportedJsonShape,
    MalformedRecord,
    TruncatedRecord,
    CompressionMismatch,
    SchemaArityMismatch,
    SchemaConflict,
    UnexpectedEndOfStream,
    InvalidWriteState,
    InvalidReadState,
    BlockAlreadyOpen,
    IncompleteBlock,
    SessionExpired,
    SessionClosed,
    SessionCreateFailed,
}

impl ErrorCode {
    /// Taxonomy bucket an error carrying this code is created with.
    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::TypeMismatch
            | ErrorCode::UnsupportedJsonShape
            | ErrorCode::MalformedRecord
            | ErrorCode::TruncatedRecord
            | ErrorCode::CompressionMismatch
            | ErrorCode::SchemaArityMismatch
            | ErrorCode::SchemaConflict
            | ErrorCode::UnexpectedEndOfStream => ErrorKind::Protocol,
            ErrorCode::InvalidWriteState
            | ErrorCode::InvalidReadState
            | ErrorCode::BlockAlreadyOpen
            | ErrorCode::IncompleteBlock
            | ErrorCode::SessionExpired
            | ErrorCode::SessionClosed => ErrorKind::State,
            ErrorCode::SessionCreateFailed => ErrorKind::Service,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::UnsupportedJsonShape => "UnsupportedJsonShape",
            ErrorCode::MalformedRecord => "MalformedRecord",
            ErrorCode::TruncatedRecord => "TruncatedRecord",
            ErrorCode::CompressionMismatch => "CompressionMismatch",
            ErrorCode::SchemaArityMismatch => "SchemaArityMismatch",
            ErrorCode::SchemaConflict => "SchemaConflict",
            ErrorCode::UnexpectedEndOfStream => "UnexpectedEndOfStream",
            ErrorCode::InvalidWriteState => "InvalidWriteState",
            ErrorCode::InvalidReadState => "InvalidReadState",
            ErrorCode::BlockAlreadyOpen => "BlockAlreadyOpen",
            ErrorCode::IncompleteBlock => "IncompleteBlock",
            ErrorCode::SessionExpired => "SessionExpired",
            ErrorCode::SessionClosed => "SessionClosed",
            ErrorCode::SessionCreateFailed => "SessionCreateFailed",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        let code = match code {
            "TypeMismatch" => ErrorCode::TypeMismatch,
            "UnsupportedJsonShape" => ErrorCode::UnsupportedJsonShape,
            "MalformedRecord" => ErrorCode::MalformedRecord,
            "TruncatedRecord" => ErrorCode::TruncatedRecord,
            "CompressionMismatch" => ErrorCode::CompressionMismatch,
            "SchemaArityMismatch" => ErrorCode::SchemaArityMismatch,
            "SchemaConflict" => ErrorCode::SchemaConflict,
            "UnexpectedEndOfStream" => ErrorCode::UnexpectedEndOfStream,
            "InvalidWriteState" => ErrorCode::InvalidWriteState,
            "InvalidReadState" => ErrorCode::InvalidReadState,
            "BlockAlreadyOpen" => ErrorCode::BlockAlreadyOpen,
            "IncompleteBlock" => ErrorCode::IncompleteBlock,
            "SessionExpired" => ErrorCode::SessionExpired,
            "SessionClosed" => ErrorCode::SessionClosed,
            "SessionCreateFailed" => ErrorCode::SessionCreateFailed,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    code: Option<ErrorCode>,
    message: Option<String>,
    status: Option<u16>,
    service_code: Option<String>,
    session: Option<String>,
    block: Option<u32>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            code: None,
            message: None,
            status: None,
            service_code: None,
            session: None,
            block: None,
            source: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code.kind()).with_code(code)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn service_code(&self) -> Option<&str> {
        self.service_code.as_deref()
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn block(&self) -> Option<u32> {
        self.block
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Tags the error with `code` unless a more specific code is already set.
    pub fn or_code(mut self, code: ErrorCode) -> Self {
        if self.code.is_none() {
            self.code = Some(code);
        }
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_service_code(mut self, code: impl Into<String>) -> Self {
        self.service_code = Some(code.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_block(mut self, block: u32) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Transport failures and 5xx service errors may be retried; everything else is
    /// either a caller/server bug or a caller decision.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Transport => true,
            ErrorKind::Service => match self.status {
                Some(status) => status >= 500,
                None => self.code != Some(ErrorCode::SessionCreateFailed),
            },
            _ => false,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        self.code == Some(ErrorCode::SessionExpired)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(code) = self.code {
            write!(f, "[{}]", code.as_str())?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(status) = self.status {
            write!(f, " (status: {status})")?;
        }
        if let Some(service_code) = &self.service_code {
            write!(f, " (service code: {service_code})")?;
        }
        if let Some(session) = &self.session {
            write!(f, " (session: {session})")?;
        }
        if let Some(block) = self.block {
            write!(f, " (block: {block})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}
