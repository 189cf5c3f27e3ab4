//! Type definitions for ESP exception decoder MCP tools

use serde::{Deserialize, Serialize};
use schemars::JsonSchema;

use crate::decoder::{ExtractedSections, ReportLine, ResolverRun, SymbolRecord};

/// How the rendered report is returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Html,
}

// ============================================================================
// decode
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DecodeArgs {
    /// Serial console output containing the crash (exception, register dump, stack or backtrace)
    pub log: String,
    /// Chip name (esp8266, esp31b, esp32, esp32s2, esp32s3). Defaults to the server's --target
    #[serde(default)]
    pub target: Option<String>,
    /// Path to the firmware ELF. Overrides build_dir/sketch lookup
    #[serde(default)]
    pub elf: Option<String>,
    /// Sketch build directory to search for <sketch>.ino.elf / <sketch>.cpp.elf
    #[serde(default)]
    pub build_dir: Option<String>,
    /// Sketch name used to pick the ELF in build_dir
    #[serde(default)]
    pub sketch: Option<String>,
    /// Explicit addr2line/gdb executable
    #[serde(default)]
    pub tool_path: Option<String>,
    /// Toolchain install directory
    #[serde(default)]
    pub toolchain_dir: Option<String>,
    /// Resolver override: "addr2line" or "gdb"
    #[serde(default)]
    pub resolver: Option<String>,
    /// Report format: "text" (default) or "html"
    #[serde(default)]
    pub format: ReportFormat,
    /// Per-invocation resolver timeout in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Run in background and return a run_id; starting another background decode supersedes it
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Serialize, Clone)]
pub struct DecodeResult {
    pub success: bool,
    /// "Decode Success", "Decode Failed", or the error that stopped the decode
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elf: Option<String>,
    /// Rendered report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    /// Report lines as tagged spans
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<ReportLine>,
    /// Partial-result notes (resolver exit status, timeouts)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// Raw resolver output, replayable with parse_resolver_output
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transcripts: Vec<ResolverRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ============================================================================
// decode_status
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DecodeStatusArgs {
    /// Run ID from a background decode
    pub run_id: String,
    /// Report format: "text" (default) or "html"
    #[serde(default)]
    pub format: ReportFormat,
}

#[derive(Debug, Serialize)]
pub struct DecodeStatusResult {
    /// running, complete, failed, superseded or cancelled
    pub status: String,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DecodeResult>,
}

// ============================================================================
// cancel_decode
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelDecodeArgs {
    /// Run ID from a background decode
    pub run_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelDecodeResult {
    pub run_id: String,
    pub status: String,
}

// ============================================================================
// extract_addresses
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExtractAddressesArgs {
    /// Serial console output to scan
    pub log: String,
    /// Chip name; defaults to the server's --target
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExtractAddressesResult {
    pub chip: String,
    pub family: String,
    pub address_count: usize,
    pub sections: ExtractedSections,
}

// ============================================================================
// parse_resolver_output
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ParseResolverOutputArgs {
    /// Captured addr2line or gdb output
    pub output: String,
    /// Grammar to parse with: "addr2line" or "gdb"
    pub resolver: String,
}

#[derive(Debug, Serialize)]
pub struct ParseResolverOutputResult {
    pub resolver: String,
    pub records: Vec<SymbolRecord>,
    /// Records rendered as report lines
    pub report: String,
}

// ============================================================================
// list_targets
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTargetsArgs {}

#[derive(Debug, Serialize)]
pub struct ListTargetsResult {
    pub targets: Vec<TargetInfo>,
}

#[derive(Debug, Serialize, Clone)]
pub struct TargetInfo {
    /// Chip name (e.g., "esp32s3")
    pub name: String,
    /// Firmware family ("esp8266" or "esp32")
    pub family: String,
    /// Toolchain prefix (e.g., "xtensa-esp32s3-elf")
    pub toolchain_prefix: String,
    /// Resolver used unless overridden
    pub default_resolver: String,
    pub description: String,
}
