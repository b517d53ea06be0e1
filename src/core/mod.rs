// Core modules implementing the type system, record codec, compression, and error modeling.
pub mod codec;
pub mod compress;
pub mod context;
pub mod error;
pub mod json;
pub mod types;
