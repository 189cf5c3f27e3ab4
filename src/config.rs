//! Configuration for the esp-exception-decoder MCP server

use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;

pub const DEFAULT_TARGET: &str = "esp8266";
pub const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 30;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "esp-exception-decoder")]
#[command(about = "MCP server for decoding ESP8266/ESP32 exception stack traces")]
#[command(version)]
pub struct Args {
    /// Default chip (esp8266, esp31b, esp32, esp32s2, esp32s3)
    #[arg(short, long, default_value = DEFAULT_TARGET)]
    pub target: String,

    /// Toolchain install directory (searched as <dir>/bin and <dir>)
    #[arg(long)]
    pub toolchain_dir: Option<PathBuf>,

    /// Explicit addr2line/gdb executable
    #[arg(long)]
    pub tool_path: Option<PathBuf>,

    /// Sketch build directory holding <sketch>.ino.elf
    #[arg(short, long)]
    pub build_dir: Option<PathBuf>,

    /// Explicit firmware ELF
    #[arg(long)]
    pub elf: Option<PathBuf>,

    /// Resolver override (addr2line or gdb); defaults per chip family
    #[arg(long)]
    pub resolver: Option<String>,

    /// Seconds before a resolver invocation is killed
    #[arg(long, default_value_t = DEFAULT_RESOLVER_TIMEOUT_SECS)]
    pub resolver_timeout: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
pub struct Config {
    pub default_target: String,
    pub toolchain_dir: Option<PathBuf>,
    pub tool_path: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub elf_path: Option<PathBuf>,
    pub resolver: Option<String>,
    pub resolver_timeout: Duration,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        Self {
            default_target: args.target.clone(),
            toolchain_dir: args.toolchain_dir.clone(),
            tool_path: args.tool_path.clone(),
            build_dir: args.build_dir.clone(),
            elf_path: args.elf.clone(),
            resolver: args.resolver.clone(),
            resolver_timeout: Duration::from_secs(args.resolver_timeout),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_target: DEFAULT_TARGET.to_string(),
            toolchain_dir: None,
            tool_path: None,
            build_dir: None,
            elf_path: None,
            resolver: None,
            resolver_timeout: Duration::from_secs(DEFAULT_RESOLVER_TIMEOUT_SECS),
        }
    }
}
