//! Purpose: Block-based table tunnel client library.
//! Exports: `core` (types, record codec, compression, errors), `api` (sessions, blocks, transports),
//! `serve` (HTTP frontend for the in-memory service).
//! Role: Library backing the `tunnel-stub` binary and integration tests.
//! Invariants: Network access goes through `api::transport::Transport`; core modules do no I/O
//! beyond the readers and writers they are handed.
pub mod api;
pub mod core;
pub mod serve;
