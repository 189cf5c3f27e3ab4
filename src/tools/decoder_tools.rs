//! RMCP 0.3.2 implementation for ESP exception decoder MCP tools
//!
//! Provides 6 tools that turn ESP8266/ESP32 crash dumps into source locations
//! using the Xtensa toolchain's addr2line or gdb.

use rmcp::{
    tool, tool_router, tool_handler, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    ErrorData as McpError,
    service::RequestContext,
    RoleServer,
};
use tracing::{debug, error, info};
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::types::*;
use crate::config::Config;
use crate::decoder::parser::parse_output;
use crate::decoder::report::{format, LineKind};
use crate::decoder::target::{locate_elf, locate_tool};
use crate::decoder::{
    decode, decode_with, ChipInfo, DecodeOutcome, ExtractedSections, FirmwareTarget, Family, ReplayResolver,
    ResolverVariant, RunRegistry, RunStatus,
};

/// ESP exception decoder tool handler with all 6 tools
#[derive(Clone)]
pub struct EspExceptionDecoderToolHandler {
    #[allow(dead_code)]
    tool_router: ToolRouter<EspExceptionDecoderToolHandler>,
    config: Config,
    runs: RunRegistry,
}

impl EspExceptionDecoderToolHandler {
    pub fn new(config: Config) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config,
            runs: RunRegistry::new(),
        }
    }

    /// Chip from the request, falling back to the configured default
    fn chip(&self, name: Option<&str>) -> Result<ChipInfo, McpError> {
        let name = name.unwrap_or(self.config.default_target.as_str());
        ChipInfo::find(name).map_err(|e| McpError::invalid_params(e.to_string(), None))
    }

    /// Resolver from the request, then config, then the family default
    fn variant(&self, chip: &ChipInfo, name: Option<&str>) -> Result<ResolverVariant, McpError> {
        match name.or(self.config.resolver.as_deref()) {
            Some(name) => name
                .parse::<ResolverVariant>()
                .map_err(|e| McpError::invalid_params(e.to_string(), None)),
            None => Ok(chip.family.default_variant()),
        }
    }

    /// Find the resolver tool and the ELF. Request arguments win over config.
    fn locate_target(
        &self,
        chip: &ChipInfo,
        variant: ResolverVariant,
        args: &DecodeArgs,
    ) -> crate::Result<FirmwareTarget> {
        let tool_path = args.tool_path.as_ref().map(PathBuf::from).or_else(|| self.config.tool_path.clone());
        let toolchain_dir = args
            .toolchain_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.config.toolchain_dir.clone());
        let elf = args.elf.as_ref().map(PathBuf::from).or_else(|| self.config.elf_path.clone());
        let build_dir = args.build_dir.as_ref().map(PathBuf::from).or_else(|| self.config.build_dir.clone());

        let tool = locate_tool(tool_path.as_deref(), toolchain_dir.as_deref(), chip, variant)?;
        let elf = locate_elf(elf.as_deref(), build_dir.as_deref(), args.sketch.as_deref())?;

        debug!("Using {} with {}", tool.display(), elf.display());
        Ok(FirmwareTarget::new(elf, tool, chip.family).with_variant(variant))
    }
}

/// Decode with the located toolchain, or without one when nothing needs resolving
async fn run_decode(
    log: String,
    family: Family,
    variant: ResolverVariant,
    target: Option<FirmwareTarget>,
    timeout: Duration,
) -> DecodeOutcome {
    match target {
        Some(target) => decode(&log, target, timeout).await,
        None => decode_with(&log, family, ReplayResolver::new(variant, [])).await,
    }
}

fn decode_result(outcome: &DecodeOutcome, report_format: ReportFormat) -> DecodeResult {
    DecodeResult {
        success: outcome.is_success(),
        message: outcome.message.clone(),
        run_id: None,
        chip: None,
        resolver: None,
        elf: None,
        report: outcome.report.as_ref().map(|report| match report_format {
            ReportFormat::Text => report.render_text(),
            ReportFormat::Html => report.render_html(),
        }),
        lines: outcome.report.iter().flat_map(|report| report.lines().cloned()).collect(),
        notes: outcome.notes.clone(),
        transcripts: outcome.transcripts.clone(),
        duration_ms: None,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Complete => "complete",
        RunStatus::Failed => "failed",
        RunStatus::Superseded => "superseded",
        RunStatus::Cancelled => "cancelled",
    }
}

#[tool_router]
impl EspExceptionDecoderToolHandler {
    #[tool(description = "List supported chips with their toolchain prefix and default resolver (addr2line for ESP8266, gdb for ESP32).")]
    async fn list_targets(
        &self,
        Parameters(_args): Parameters<ListTargetsArgs>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Listing supported targets");

        let targets: Vec<TargetInfo> = ChipInfo::all()
            .map(|chip| TargetInfo {
                name: chip.name.to_string(),
                family: chip.family.to_string(),
                toolchain_prefix: chip.toolchain_prefix.to_string(),
                default_resolver: chip.family.default_variant().to_string(),
                description: chip.description.to_string(),
            })
            .collect();

        let result = ListTargetsResult { targets };
        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            McpError::internal_error(format!("Serialization error: {}", e), None)
        })?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Decode an ESP8266/ESP32 crash dump pasted from the serial monitor. Resolves the exception cause, PC/EXCVADDR registers, failed allocations and the stack dump or backtrace to function, file and line. Requires the firmware ELF (elf, or build_dir + sketch) and the Xtensa toolchain. Supports background decodes.")]
    async fn decode(
        &self,
        Parameters(args): Parameters<DecodeArgs>,
    ) -> Result<CallToolResult, McpError> {
        let chip = self.chip(args.target.as_deref())?;
        let variant = self.variant(&chip, args.resolver.as_deref())?;
        let timeout = args
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.resolver_timeout);

        debug!("Decoding {} bytes of log for {} with {}", args.log.len(), chip.name, variant);

        let sections = ExtractedSections::from_log(&args.log, chip.family);
        let target = match self.locate_target(&chip, variant, &args) {
            Ok(target) => Some(target),
            Err(e) if sections.resolvable_count(chip.family) > 0 => {
                error!("Cannot decode: {}", e);
                let result = DecodeResult {
                    success: false,
                    message: e.to_string(),
                    run_id: None,
                    chip: Some(chip.name.to_string()),
                    resolver: Some(variant.to_string()),
                    elf: None,
                    report: None,
                    lines: Vec::new(),
                    notes: Vec::new(),
                    transcripts: Vec::new(),
                    duration_ms: None,
                };
                let json = serde_json::to_string_pretty(&result).map_err(|e| {
                    McpError::internal_error(format!("Serialization error: {}", e), None)
                })?;
                return Ok(CallToolResult::success(vec![Content::text(json)]));
            }
            Err(e) => {
                debug!("No addresses to resolve, skipping toolchain ({})", e);
                None
            }
        };

        let elf = target.as_ref().map(|t| t.binary_path.to_string_lossy().to_string());
        let decode = run_decode(args.log, chip.family, variant, target, timeout);

        if args.background {
            let (run_id, generation) = self.runs.start(decode).await;

            let result = DecodeResult {
                success: true,
                message: format!("Decode started in background (generation {})", generation),
                run_id: Some(run_id),
                chip: Some(chip.name.to_string()),
                resolver: Some(variant.to_string()),
                elf,
                report: None,
                lines: Vec::new(),
                notes: Vec::new(),
                transcripts: Vec::new(),
                duration_ms: None,
            };

            let json = serde_json::to_string_pretty(&result).map_err(|e| {
                McpError::internal_error(format!("Serialization error: {}", e), None)
            })?;

            return Ok(CallToolResult::success(vec![Content::text(json)]));
        }

        // Synchronous decode
        let start = Instant::now();
        let outcome = decode.await;
        let duration = start.elapsed();

        let result = DecodeResult {
            chip: Some(chip.name.to_string()),
            resolver: Some(variant.to_string()),
            elf,
            duration_ms: Some(millis(duration)),
            ..decode_result(&outcome, args.format)
        };

        if result.success {
            info!("Decode of {} log succeeded in {:?}", chip.name, duration);
        } else {
            error!("Decode of {} log failed: {}", chip.name, result.message);
        }

        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            McpError::internal_error(format!("Serialization error: {}", e), None)
        })?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Check the status of a background decode. Returns running, complete, failed, superseded or cancelled, with the report once finished.")]
    async fn decode_status(
        &self,
        Parameters(args): Parameters<DecodeStatusArgs>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Checking decode status for '{}'", args.run_id);

        let state = self.runs.get(&args.run_id).await.ok_or_else(|| {
            McpError::invalid_params(format!("Run ID not found: {}", args.run_id), None)
        })?;

        let result = DecodeStatusResult {
            status: status_name(state.status).to_string(),
            generation: state.generation,
            progress: if state.status == RunStatus::Running {
                Some(format!("Decoding ({:?} elapsed)", state.started_at.elapsed()))
            } else {
                None
            },
            result: state.outcome.as_ref().map(|outcome| DecodeResult {
                run_id: Some(args.run_id.clone()),
                duration_ms: state.elapsed.map(millis),
                ..decode_result(outcome, args.format)
            }),
        };

        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            McpError::internal_error(format!("Serialization error: {}", e), None)
        })?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Cancel a background decode. The resolver process is killed; finished runs keep their status.")]
    async fn cancel_decode(
        &self,
        Parameters(args): Parameters<CancelDecodeArgs>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Cancelling decode '{}'", args.run_id);

        let status = self.runs.cancel(&args.run_id).await.ok_or_else(|| {
            McpError::invalid_params(format!("Run ID not found: {}", args.run_id), None)
        })?;

        let result = CancelDecodeResult {
            run_id: args.run_id,
            status: status_name(status).to_string(),
        };

        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            McpError::internal_error(format!("Serialization error: {}", e), None)
        })?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Extract the exception cause, registers, failed allocations and stack/backtrace addresses from a crash dump without running any toolchain program.")]
    async fn extract_addresses(
        &self,
        Parameters(args): Parameters<ExtractAddressesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let chip = self.chip(args.target.as_deref())?;
        debug!("Extracting addresses for {}", chip.name);

        let sections = ExtractedSections::from_log(&args.log, chip.family);
        let result = ExtractAddressesResult {
            chip: chip.name.to_string(),
            family: chip.family.to_string(),
            address_count: sections.address_count(),
            sections,
        };

        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            McpError::internal_error(format!("Serialization error: {}", e), None)
        })?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Parse captured addr2line (-aipfC) or gdb (l *0x...) output into symbol records. Lines that are not answers are skipped.")]
    async fn parse_resolver_output(
        &self,
        Parameters(args): Parameters<ParseResolverOutputArgs>,
    ) -> Result<CallToolResult, McpError> {
        let variant = args
            .resolver
            .parse::<ResolverVariant>()
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let lines: Vec<&str> = args.output.lines().collect();
        let records = parse_output(&lines, variant);
        debug!("Parsed {} records from {} lines of {} output", records.len(), lines.len(), variant);

        let report = records
            .iter()
            .map(|record| format(LineKind::Symbol(record)).text())
            .collect::<Vec<_>>()
            .join("\n");

        let result = ParseResolverOutputResult {
            resolver: variant.to_string(),
            records,
            report,
        };

        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            McpError::internal_error(format!("Serialization error: {}", e), None)
        })?;

        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

impl Default for EspExceptionDecoderToolHandler {
    fn default() -> Self {
        Self::new(Config::default())
    }
}


#[tool_handler]
impl ServerHandler for EspExceptionDecoderToolHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "ESP Exception Decoder MCP Server - Decode ESP8266/ESP32 crash dumps into source locations. \
                 6 tools available: list_targets, decode, decode_status, cancel_decode, extract_addresses, parse_resolver_output."
                    .to_string(),
            ),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!("ESP Exception Decoder MCP server initialized with 6 tools");
        Ok(self.get_info())
    }
}
