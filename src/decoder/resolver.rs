//! External symbol resolvers.
//!
//! A resolver turns addresses into raw output lines by running
//! `xtensa-*-addr2line` or `xtensa-*-gdb`. The process plumbing lives in
//! [`ProcessResolver`]; [`ReplayResolver`] serves output captured from an
//! earlier run, which makes every decode reproducible from its transcript.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::extract::AddressToken;
use super::parser::{align, parse_output, SymbolKind, SymbolRecord};
use super::target::{FirmwareTarget, ResolverVariant};
use crate::error::{DecodeError, Result};

/// How one resolver invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Exited { code: Option<i32> },
    TimedOut { after_ms: u64 },
}

impl RunOutcome {
    /// The non-fatal error this outcome stands for, if any
    pub fn error(&self) -> Option<DecodeError> {
        match *self {
            RunOutcome::Success => None,
            RunOutcome::Exited { code } => Some(DecodeError::ResolverExit { code }),
            RunOutcome::TimedOut { after_ms } => {
                Some(DecodeError::ResolverTimeout(Duration::from_millis(after_ms)))
            }
        }
    }
}

/// Transcript of one external invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverRun {
    pub command: Vec<String>,
    /// Captured stdout (plus stderr for resolvers that interleave the two)
    pub lines: Vec<String>,
    /// stderr kept off the report
    #[serde(default)]
    pub diagnostics: Vec<String>,
    pub outcome: RunOutcome,
}

/// Parsed answer to one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub records: Vec<SymbolRecord>,
    /// Set when the resolver failed after producing `records`
    pub failure: Option<String>,
    pub run: ResolverRun,
}

#[async_trait]
pub trait SymbolResolver: Send + Sync {
    fn variant(&self) -> ResolverVariant;

    /// Checked once before the first invocation of a decode
    async fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// Run the resolver once for all of `addresses`. Only fatal problems are
    /// errors; exit status and timeouts are reported in the run's outcome.
    async fn invoke(&self, addresses: &[AddressToken]) -> Result<ResolverRun>;

    /// Batch mode: one invocation, records aligned with `addresses`
    async fn resolve(&self, addresses: &[AddressToken]) -> Result<Resolution> {
        let run = self.invoke(addresses).await?;
        let records = parse_output(&run.lines, self.variant());
        let failure = run.outcome.error();

        if let Some(err) = &failure {
            warn!("{}; keeping {} records parsed before the failure", err, records.len());
        }

        let records = align(addresses, records, failure.is_none());
        Ok(Resolution {
            records,
            failure: failure.map(|e| e.to_string()),
            run,
        })
    }

    /// Single-address mode: the first direct answer and its inlined chain
    async fn resolve_one(&self, address: &AddressToken) -> Result<Resolution> {
        let mut resolution = self.resolve(std::slice::from_ref(address)).await?;
        let keep = resolution
            .records
            .iter()
            .skip(1)
            .take_while(|r| r.kind == SymbolKind::Inlined)
            .count()
            + 1;
        resolution.records.truncate(keep);
        Ok(resolution)
    }
}

/// Command line arguments (without the program) for one invocation
pub fn command_args(target: &FirmwareTarget, addresses: &[AddressToken]) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    match target.variant {
        ResolverVariant::LinearAddr2Line => {
            args.push("-aipfC".into());
            args.push("-e".into());
            args.push(target.binary_path.clone().into_os_string());
            args.extend(addresses.iter().map(|a| OsString::from(&a.raw)));
        }
        ResolverVariant::ScriptedDebugger => {
            args.push("--batch".into());
            args.push(target.binary_path.clone().into_os_string());
            args.push("-ex".into());
            args.push("set listsize 1".into());
            for address in addresses {
                args.push("-ex".into());
                args.push(format!("l *0x{}", address.raw).into());
            }
            args.push("-ex".into());
            args.push("q".into());
        }
    }
    args
}

/// Runs the toolchain binary named by a [`FirmwareTarget`]
#[derive(Debug, Clone)]
pub struct ProcessResolver {
    target: FirmwareTarget,
    timeout: Duration,
}

impl ProcessResolver {
    pub fn new(target: FirmwareTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }
}

#[async_trait]
impl SymbolResolver for ProcessResolver {
    fn variant(&self) -> ResolverVariant {
        self.target.variant
    }

    async fn preflight(&self) -> Result<()> {
        if !self.target.resolver_tool_path.is_file() {
            return Err(DecodeError::ToolNotFound(self.target.tool_display_name()));
        }
        if !self.target.binary_path.is_file() {
            return Err(DecodeError::BinaryNotFound(format!(
                "{} was not found!",
                self.target.binary_path.display()
            )));
        }
        Ok(())
    }

    async fn invoke(&self, addresses: &[AddressToken]) -> Result<ResolverRun> {
        let args = command_args(&self.target, addresses);
        let command: Vec<String> = std::iter::once(self.target.resolver_tool_path.as_os_str())
            .chain(args.iter().map(|a| a.as_os_str()))
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        debug!("Running: {}", command.join(" "));

        let mut child = Command::new(&self.target.resolver_tool_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    DecodeError::ToolNotFound(self.target.tool_display_name())
                }
                _ => DecodeError::IoError(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecodeError::InternalError("resolver stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DecodeError::InternalError("resolver stderr was not captured".to_string()))?;

        // Both pipes drain concurrently so a chatty stderr can't stall stdout
        let (tx, mut rx) = mpsc::unbounded_channel();
        let merge = self.target.variant.merges_stderr();
        let stdout_task = tokio::spawn(pump(stdout, Some(tx.clone())));
        let mut stderr_task = tokio::spawn(pump(stderr, merge.then(|| tx.clone())));
        drop(tx);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut lines = Vec::new();
        let mut timed_out = false;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => lines.push(line),
                    None => break,
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }

        let status = if timed_out {
            None
        } else {
            tokio::select! {
                status = child.wait() => Some(status?),
                _ = &mut deadline => None,
            }
        };

        let (outcome, diagnostics) = match status {
            Some(status) => {
                let diagnostics = tokio::select! {
                    diagnostics = &mut stderr_task => diagnostics.unwrap_or_default(),
                    _ = &mut deadline => {
                        stderr_task.abort();
                        Vec::new()
                    }
                };
                let outcome = if status.success() {
                    RunOutcome::Success
                } else {
                    RunOutcome::Exited { code: status.code() }
                };
                (outcome, diagnostics)
            }
            None => {
                warn!("Resolver did not finish within {:?}, killing it", self.timeout);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill resolver: {}", e);
                }
                stdout_task.abort();
                stderr_task.abort();
                let after_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                (RunOutcome::TimedOut { after_ms }, Vec::new())
            }
        };

        info!(
            "Resolver produced {} lines ({} diagnostics), outcome {:?}",
            lines.len(),
            diagnostics.len(),
            outcome
        );

        Ok(ResolverRun {
            command,
            lines,
            diagnostics,
            outcome,
        })
    }
}

/// Read `reader` line by line until EOF. Lines go to `sink` when one is
/// given, otherwise they are logged and returned as diagnostics.
async fn pump<R>(reader: R, sink: Option<mpsc::UnboundedSender<String>>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut diagnostics = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(|c: char| c == '\r' || c == '\n')
                    .to_string();
                match &sink {
                    // A closed receiver means the run was abandoned; keep draining anyway
                    Some(tx) => {
                        let _ = tx.send(line);
                    }
                    None => {
                        debug!("resolver stderr: {}", line);
                        diagnostics.push(line);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read resolver output: {}", e);
                break;
            }
        }
    }

    diagnostics
}

/// Serves previously captured [`ResolverRun`]s in order
#[derive(Debug)]
pub struct ReplayResolver {
    variant: ResolverVariant,
    runs: Mutex<VecDeque<ResolverRun>>,
    invocations: AtomicUsize,
}

impl ReplayResolver {
    pub fn new(variant: ResolverVariant, runs: impl IntoIterator<Item = ResolverRun>) -> Self {
        Self {
            variant,
            runs: Mutex::new(runs.into_iter().collect()),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Replay raw tool output as a single successful run
    pub fn from_output(variant: ResolverVariant, output: &str) -> Self {
        let run = ResolverRun {
            command: Vec::new(),
            lines: output.lines().map(str::to_string).collect(),
            diagnostics: Vec::new(),
            outcome: RunOutcome::Success,
        };
        Self::new(variant, [run])
    }

    /// How many times `invoke` was called
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SymbolResolver for ReplayResolver {
    fn variant(&self) -> ResolverVariant {
        self.variant
    }

    async fn invoke(&self, addresses: &[AddressToken]) -> Result<ResolverRun> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let next = self
            .runs
            .lock()
            .map_err(|_| DecodeError::InternalError("replay queue poisoned".to_string()))?
            .pop_front();
        next.ok_or_else(|| {
            DecodeError::InternalError(format!(
                "no captured resolver output left for {} addresses",
                addresses.len()
            ))
        })
    }
}
