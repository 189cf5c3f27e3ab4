//! Decode orchestration.
//!
//! The pipeline walks a fixed sequence of states. Sections are extracted
//! first, then resolved, then formatted into one fragment each; the fragments
//! are concatenated in section order, never interleaved.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::extract::{is_code_address, AddressToken, ExtractedSections, TokenCategory};
use super::parser::{SymbolKind, SymbolRecord};
use super::report::{format, LineKind, Report, ReportFragment, SectionKind};
use super::resolver::{ProcessResolver, Resolution, ResolverRun, SymbolResolver};
use super::target::{Family, FirmwareTarget};
use crate::error::{DecodeError, Result};

pub const STACK_HEADING: &str = "Decoding stack results";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeState {
    Idle,
    ExtractingSections,
    ResolvingSymbols,
    Formatting,
    Done,
    AbortedOnToolMissing,
}

/// Everything one decode produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodeReport {
    pub report: Report,
    /// One entry per resolver failure that left a section partial
    pub notes: Vec<String>,
    /// Resolver transcripts, in invocation order
    pub transcripts: Vec<ResolverRun>,
    pub invocations: usize,
}

/// Resolved records for each section, before formatting
#[derive(Default)]
struct Resolved {
    registers: Vec<Option<Vec<SymbolRecord>>>,
    allocations: Vec<Vec<SymbolRecord>>,
    stack: Vec<SymbolRecord>,
}

pub struct DecodePipeline<R> {
    family: Family,
    resolver: R,
    state: DecodeState,
}

impl<R: SymbolResolver> DecodePipeline<R> {
    pub fn new(family: Family, resolver: R) -> Self {
        Self {
            family,
            resolver,
            state: DecodeState::Idle,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    fn transition(&mut self, next: DecodeState) {
        debug!("Decode state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Decode one pasted log.
    ///
    /// Fatal errors (missing tool or ELF) abort with `Err`. Resolver exits and
    /// timeouts keep whatever was parsed and add a note instead.
    pub async fn run(&mut self, text: &str) -> Result<DecodeReport> {
        self.transition(DecodeState::ExtractingSections);
        let sections = ExtractedSections::from_log(text, self.family);
        debug!(
            "Extracted {} register(s), {} allocation(s), {} stack address(es)",
            sections.registers.len(),
            sections.allocations.len(),
            sections.stack.len()
        );

        let mut out = DecodeReport::default();

        self.transition(DecodeState::ResolvingSymbols);
        let resolved = match self.resolve_sections(&sections, &mut out).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if e.is_missing_toolchain() {
                    self.transition(DecodeState::AbortedOnToolMissing);
                }
                error!("Decode aborted: {}", e);
                return Err(e);
            }
        };

        self.transition(DecodeState::Formatting);
        out.report = build_report(&sections, &resolved);

        self.transition(DecodeState::Done);
        info!(
            "Decoded {} symbol line(s) with {} resolver invocation(s), {} note(s)",
            out.report.symbol_line_count(),
            out.invocations,
            out.notes.len()
        );
        Ok(out)
    }

    async fn resolve_sections(&self, sections: &ExtractedSections, out: &mut DecodeReport) -> Result<Resolved> {
        let mut resolved = Resolved::default();
        if sections.resolvable_count(self.family) == 0 {
            resolved.registers = vec![None; sections.registers.len()];
            return Ok(resolved);
        }

        self.resolver.preflight().await?;

        for token in &sections.registers {
            if !is_code_address(self.family, &token.raw) {
                resolved.registers.push(None);
                continue;
            }
            let resolution = self.resolver.resolve_one(token).await?;
            resolved.registers.push(Some(record(out, SectionKind::Registers, resolution)));
        }

        for token in &sections.allocations {
            let resolution = self.resolver.resolve_one(token).await?;
            resolved.allocations.push(record(out, SectionKind::Allocation, resolution));
        }

        if !sections.stack.is_empty() {
            let resolution = self.resolver.resolve(&sections.stack).await?;
            resolved.stack = record(out, SectionKind::Stack, resolution);
        }

        Ok(resolved)
    }
}

/// Keep the transcript and note, hand back the records
fn record(out: &mut DecodeReport, section: SectionKind, resolution: Resolution) -> Vec<SymbolRecord> {
    out.invocations += 1;
    if let Some(failure) = resolution.failure {
        warn!("{:?} section is partial: {}", section, failure);
        out.notes.push(format!("{:?}: {}", section, failure));
    }
    out.transcripts.push(resolution.run);
    resolution.records
}

fn build_report(sections: &ExtractedSections, resolved: &Resolved) -> Report {
    let mut report = Report::default();

    if let Some(info) = &sections.exception {
        let mut fragment = ReportFragment::new(SectionKind::Exception);
        fragment.lines.push(format(LineKind::Exception(info)));
        report.fragments.push(fragment);
    }

    if !sections.registers.is_empty() {
        let mut fragment = ReportFragment::new(SectionKind::Registers);
        for (token, records) in sections.registers.iter().zip(&resolved.registers) {
            let name = match &token.category {
                TokenCategory::Register { name } => name.as_str(),
                _ => "",
            };
            let records = records.as_deref().unwrap_or_default();
            fragment.lines.push(format(LineKind::Register {
                name,
                raw: &token.raw,
                record: records.first(),
            }));
            push_inlined(&mut fragment, records);
        }
        report.fragments.push(fragment);
    }

    let mut allocation = ReportFragment::new(SectionKind::Allocation);
    for (token, records) in sections.allocations.iter().zip(&resolved.allocations) {
        let size = allocation_size(token);
        match records.first() {
            Some(first) if first.is_resolved() => {
                allocation.lines.push(format(LineKind::AllocationFailure { size, record: first }));
                push_inlined(&mut allocation, records);
            }
            _ => debug!("No location for failed allocation at {}", token.raw),
        }
    }
    if !allocation.lines.is_empty() {
        report.fragments.push(allocation);
    }

    if !sections.stack.is_empty() {
        let mut fragment = ReportFragment::new(SectionKind::Stack);
        fragment.lines.push(format(LineKind::Heading(STACK_HEADING)));
        for record in &resolved.stack {
            fragment.lines.push(format(LineKind::Symbol(record)));
        }
        report.fragments.push(fragment);
    }

    report
}

fn push_inlined(fragment: &mut ReportFragment, records: &[SymbolRecord]) {
    for record in records.iter().skip(1).filter(|r| r.kind == SymbolKind::Inlined) {
        fragment.lines.push(format(LineKind::Symbol(record)));
    }
}

fn allocation_size(token: &AddressToken) -> u64 {
    match token.category {
        TokenCategory::AllocationFailure { size } => size,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecodeStatus {
    Success,
    Failed,
}

/// Two-valued result of a decode as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeOutcome {
    pub status: DecodeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transcripts: Vec<ResolverRun>,
}

impl DecodeOutcome {
    pub fn from_result(result: Result<DecodeReport>) -> Self {
        match result {
            Ok(decoded) => {
                let (status, message) = if decoded.notes.is_empty() {
                    (DecodeStatus::Success, "Decode Success")
                } else {
                    (DecodeStatus::Failed, "Decode Failed")
                };
                Self {
                    status,
                    message: message.to_string(),
                    report: Some(decoded.report),
                    notes: decoded.notes,
                    transcripts: decoded.transcripts,
                }
            }
            Err(e) => Self {
                status: DecodeStatus::Failed,
                message: e.to_string(),
                report: None,
                notes: Vec::new(),
                transcripts: Vec::new(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DecodeStatus::Success
    }
}

/// Run a whole decode with `resolver` and fold the result
pub async fn decode_with<R: SymbolResolver>(text: &str, family: Family, resolver: R) -> DecodeOutcome {
    let mut pipeline = DecodePipeline::new(family, resolver);
    DecodeOutcome::from_result(pipeline.run(text).await)
}

/// Decode `text` against `target` using the real toolchain
pub async fn decode(text: &str, target: FirmwareTarget, timeout: Duration) -> DecodeOutcome {
    let family = target.family;
    decode_with(text, family, ProcessResolver::new(target, timeout)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::resolver::{ReplayResolver, RunOutcome};
    use crate::decoder::target::ResolverVariant;

    const ESP8266_LOG: &str = "\
Exception (28):
epc1=0x40201234 epc2=0x00000000 epc3=0x00000000 excvaddr=0x00000003 depc=0x00000000

>>>stack>>>

ctx: cont
sp: 3ffffdc0 end: 3fffffc0 offset: 01a0
3ffffdc0:  40201234 3ffef1c8 3ffe8510 40202eb8
3ffffdd0:  3fffdad0 00000000 3ffee5f0 4020aa11
<<<stack<<<

last failed alloc call: 4020AB12(48)
";

    const ESP32_LOG: &str = "\
Guru Meditation Error: Core  1 panic'ed (IntegerDivideByZero). Exception was unhandled.
Core 1 register dump:
PC      : 0x400d1f5a  PS      : 0x00060e30  A0      : 0x800d2a4c  A1      : 0x3ffb1f50
EXCCAUSE: 0x00000006  EXCVADDR: 0x00000000  LBEG    : 0x400014fd  LEND    : 0x4000150d

Backtrace: 0x400d1f5a:0x3ffb1f50 0x400d2a49:0x3ffb1f70
";

    fn run(lines: &[&str], outcome: RunOutcome) -> ResolverRun {
        ResolverRun {
            command: Vec::new(),
            lines: lines.iter().map(|l| l.to_string()).collect(),
            diagnostics: Vec::new(),
            outcome,
        }
    }

    fn esp8266_runs() -> Vec<ResolverRun> {
        vec![
            run(&["0x40201234: loop at /home/me/blink/blink.ino:12"], RunOutcome::Success),
            run(&["0x4020ab12: malloc at /core/umm_malloc.cpp:5"], RunOutcome::Success),
            run(
                &[
                    "0x40201234: loop at /home/me/blink/blink.ino:12",
                    "0x40202eb8: setup at /home/me/blink/blink.ino:7",
                    " (inlined by) init at x.h:3",
                    "0x4020aa11: ?? ??:0",
                ],
                RunOutcome::Success,
            ),
        ]
    }

    #[tokio::test]
    async fn test_no_addresses_never_invokes_resolver() {
        let resolver = ReplayResolver::new(ResolverVariant::LinearAddr2Line, []);
        let mut pipeline = DecodePipeline::new(Family::Esp8266, resolver);
        let decoded = pipeline.run("ets Jan  8 2013,rst cause:2, boot mode:(3,6)").await.unwrap();

        assert!(decoded.report.is_empty());
        assert_eq!(decoded.report.symbol_line_count(), 0);
        assert_eq!(decoded.invocations, 0);
        assert_eq!(pipeline.resolver().invocations(), 0);
        assert_eq!(pipeline.state(), DecodeState::Done);
    }

    #[tokio::test]
    async fn test_non_code_register_skips_preflight() {
        // A missing toolchain must not matter when nothing needs resolving
        let target = FirmwareTarget::new("/nonexistent/a.elf", "/nonexistent/addr2line", Family::Esp8266);
        let resolver = ProcessResolver::new(target, Duration::from_secs(1));
        let mut pipeline = DecodePipeline::new(Family::Esp8266, resolver);
        let decoded = pipeline.run("Exception (6):\nexcvaddr=0x00000000").await.unwrap();

        assert_eq!(
            decoded.report.render_text(),
            "Exception 6: IntegerDivideByZero: QUOS, QUOU, REMS, or REMU divisor operand is zero\nEXCVADDR: 0x00000000\n"
        );
    }

    #[tokio::test]
    async fn test_full_esp8266_decode() {
        let resolver = ReplayResolver::new(ResolverVariant::LinearAddr2Line, esp8266_runs());
        let mut pipeline = DecodePipeline::new(Family::Esp8266, resolver);
        let decoded = pipeline.run(ESP8266_LOG).await.unwrap();

        let expected = "\
Exception 28: LoadProhibited: A load referenced a page mapped with an attribute that does not permit loads
PC: 0x40201234: loop at /home/me/blink/blink.ino line 12
EXCVADDR: 0x00000003
Memory allocation of 48 bytes failed at 0x4020ab12: malloc at /core/umm_malloc.cpp line 5
Decoding stack results
0x40201234: loop at /home/me/blink/blink.ino line 12
0x40202eb8: setup at /home/me/blink/blink.ino line 7
  (inlined by) init at x.h line 3
0x4020aa11
";
        assert_eq!(decoded.report.render_text(), expected);
        assert_eq!(decoded.invocations, 3);
        assert!(decoded.notes.is_empty());

        let sections: Vec<_> = decoded.report.fragments.iter().map(|f| f.section).collect();
        assert_eq!(
            sections,
            vec![
                SectionKind::Exception,
                SectionKind::Registers,
                SectionKind::Allocation,
                SectionKind::Stack
            ]
        );
    }

    #[tokio::test]
    async fn test_gdb_backtrace_decode() {
        let runs = vec![
            run(&["0x400d1f5a is in loop() (/s/s.ino:12)."], RunOutcome::Success),
            run(
                &[
                    "0x400d1f5a is in loop() (/s/s.ino:12).",
                    "12\t  int x = 1 / 0;",
                    "0x400d2a49 is in loopTask(void*) (/core/main.cpp:50).",
                    "50\t      loop();",
                ],
                RunOutcome::Success,
            ),
        ];
        let resolver = ReplayResolver::new(ResolverVariant::ScriptedDebugger, runs);
        let mut pipeline = DecodePipeline::new(Family::Esp32, resolver);
        let decoded = pipeline.run(ESP32_LOG).await.unwrap();

        let text = decoded.report.render_text();
        assert!(text.starts_with(
            "Exception 6: IntegerDivideByZero: QUOS, QUOU, REMS, or REMU divisor operand is zero\n\
             PC: 0x400d1f5a: loop() at /s/s.ino line 12\nEXCVADDR: 0x00000000\n"
        ));
        assert!(text.ends_with(
            "Decoding stack results\n0x400d1f5a: loop() at /s/s.ino line 12\n0x400d2a49: loopTask(void*) at /core/main.cpp line 50\n"
        ));
        assert_eq!(decoded.invocations, 2);
    }

    #[tokio::test]
    async fn test_partial_stack_keeps_records_and_notes_failure() {
        let runs = vec![run(
            &[
                "0x400d1f5a is in loop() (/s/s.ino:12).",
            ],
            RunOutcome::Exited { code: Some(1) },
        )];
        let resolver = ReplayResolver::new(ResolverVariant::ScriptedDebugger, runs);
        let mut pipeline = DecodePipeline::new(Family::Esp32, resolver);
        let decoded = pipeline
            .run("Backtrace: 0x400d1f5a:0x3ffb1f50 0x400d2a49:0x3ffb1f70 0x40088dbd:0x3ffb1f90")
            .await
            .unwrap();

        let stack = decoded.report.fragments.last().unwrap();
        // heading plus exactly the one record parsed before the failure
        assert_eq!(stack.lines.len(), 2);
        assert_eq!(decoded.notes, vec!["Stack: Resolver exited with status 1".to_string()]);

        let outcome = DecodeOutcome::from_result(Ok(decoded));
        assert_eq!(outcome.status, DecodeStatus::Failed);
        assert_eq!(outcome.message, "Decode Failed");
        assert!(outcome.report.is_some());
    }

    #[tokio::test]
    async fn test_missing_tool_aborts() {
        let target = FirmwareTarget::new(
            "/nonexistent/blink.ino.elf",
            "/nonexistent/xtensa-lx106-elf-addr2line",
            Family::Esp8266,
        );
        let mut pipeline = DecodePipeline::new(Family::Esp8266, ProcessResolver::new(target, Duration::from_secs(1)));
        let result = pipeline.run(ESP8266_LOG).await;

        assert!(matches!(result, Err(DecodeError::ToolNotFound(_))));
        assert_eq!(pipeline.state(), DecodeState::AbortedOnToolMissing);

        let outcome = DecodeOutcome::from_result(result);
        assert_eq!(outcome.message, "ERROR: xtensa-lx106-elf-addr2line not found!");
        assert!(outcome.report.is_none());
    }

    #[tokio::test]
    async fn test_replaying_transcripts_reproduces_report() {
        let resolver = ReplayResolver::new(ResolverVariant::LinearAddr2Line, esp8266_runs());
        let mut first = DecodePipeline::new(Family::Esp8266, resolver);
        let original = first.run(ESP8266_LOG).await.unwrap();

        let replay = ReplayResolver::new(ResolverVariant::LinearAddr2Line, original.transcripts.clone());
        let mut second = DecodePipeline::new(Family::Esp8266, replay);
        let replayed = second.run(ESP8266_LOG).await.unwrap();

        assert_eq!(replayed.report, original.report);
        assert_eq!(replayed.transcripts, original.transcripts);
    }

    #[tokio::test]
    async fn test_unresolved_allocation_skipped() {
        let runs = vec![run(&["0x40201111: ?? ??:0"], RunOutcome::Success)];
        let resolver = ReplayResolver::new(ResolverVariant::LinearAddr2Line, runs);
        let mut pipeline = DecodePipeline::new(Family::Esp8266, resolver);
        let decoded = pipeline.run("last failed alloc call: 40201111(16)").await.unwrap();

        assert!(decoded.report.is_empty());
        assert_eq!(decoded.invocations, 1);
    }

    #[test]
    fn test_outcome_success_message() {
        let outcome = DecodeOutcome::from_result(Ok(DecodeReport::default()));
        assert!(outcome.is_success());
        assert_eq!(outcome.message, "Decode Success");
    }
}
