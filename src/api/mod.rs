//! Purpose: Define the public Rust API boundary for table tunnel clients.
//! Exports: Session manager, block writers and readers, transports, and the in-memory service.
//! Role: Public, additive-only surface over the record codec and compression layers.
//! Invariants: Callers reach core types through these re-exports.
//! Invariants: Every blocking operation takes a `CallContext`.

pub mod config;
pub mod protocol;
pub mod reader;
pub mod retry;
pub mod session;
pub mod stub;
pub mod transport;
pub mod writer;

pub use crate::core::compress::Compression;
pub use crate::core::context::{CallContext, CancelToken};
pub use crate::core::error::{Error, ErrorCode, ErrorKind};
pub use crate::core::json::JsonValue;
pub use crate::core::types::{Column, DataType, Decimal, Record, Schema, StructField, Value};
pub use config::TunnelConfig;
pub use protocol::{BlockReceipt, PartitionSpec, SessionInfo, SessionKind, SessionStatus, TableRef};
pub use reader::BlockReader;
pub use retry::RetryPolicy;
pub use session::{DownloadOptions, DownloadSession, TunnelClient, UploadOptions, UploadSession};
pub use stub::TunnelStub;
pub use transport::{HttpTransport, Method, RequestBody, Transport, TransportRequest, TransportResponse};
pub use writer::{BlockState, BlockWriter};
