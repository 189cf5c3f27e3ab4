pub mod decoder_tools;
pub mod types;

pub use decoder_tools::*;
pub use types::*;
