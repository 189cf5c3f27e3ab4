//! ESP Exception Decoder MCP Server

pub mod config;
pub mod decoder;
pub mod error;
pub mod tools;

pub use config::Config;
pub use error::{DecodeError, Result};
pub use tools::EspExceptionDecoderToolHandler;
