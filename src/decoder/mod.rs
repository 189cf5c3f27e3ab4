//! Crash log decoding: extraction, symbol resolution, parsing and reporting.

pub mod exceptions;
pub mod extract;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod runs;
pub mod target;

pub use extract::{AddressToken, ExtractedSections, TokenCategory};
pub use parser::{SymbolKind, SymbolRecord};
pub use pipeline::{decode, decode_with, DecodeOutcome, DecodePipeline, DecodeReport, DecodeState, DecodeStatus};
pub use report::{Report, ReportLine, Tag};
pub use resolver::{ProcessResolver, ReplayResolver, ResolverRun, RunOutcome, SymbolResolver};
pub use runs::{RunRegistry, RunStatus};
pub use target::{ChipInfo, Family, FirmwareTarget, ResolverVariant};
