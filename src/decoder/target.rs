//! Firmware targets: chip families, resolver tool selection and ELF location.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DecodeError, Result};

/// Firmware family. Address ranges, register dump syntax and the stack
/// section marker all depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Esp8266,
    Esp32,
}

impl Family {
    pub fn default_variant(self) -> ResolverVariant {
        match self {
            Family::Esp8266 => ResolverVariant::LinearAddr2Line,
            Family::Esp32 => ResolverVariant::ScriptedDebugger,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Esp8266 => write!(f, "esp8266"),
            Family::Esp32 => write!(f, "esp32"),
        }
    }
}

/// Which external resolver runs, and therefore which output grammar is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolverVariant {
    /// `addr2line -aipfC`, many addresses per call
    LinearAddr2Line,
    /// `gdb --batch` with one `l *0x...` command per address
    ScriptedDebugger,
}

impl ResolverVariant {
    /// Tool name suffix appended to the toolchain prefix
    pub fn tool_suffix(self) -> &'static str {
        match self {
            ResolverVariant::LinearAddr2Line => "addr2line",
            ResolverVariant::ScriptedDebugger => "gdb",
        }
    }

    /// gdb mixes diagnostics and answers across stdout/stderr
    pub fn merges_stderr(self) -> bool {
        matches!(self, ResolverVariant::ScriptedDebugger)
    }
}

impl FromStr for ResolverVariant {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "addr2line" | "linear" => Ok(ResolverVariant::LinearAddr2Line),
            "gdb" | "debugger" => Ok(ResolverVariant::ScriptedDebugger),
            other => Err(DecodeError::InvalidResolver(other.to_string())),
        }
    }
}

impl fmt::Display for ResolverVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_suffix())
    }
}

/// Supported chips: (name, family, toolchain prefix, description)
pub const CHIPS: &[(&str, Family, &str, &str)] = &[
    ("esp8266", Family::Esp8266, "xtensa-lx106-elf", "ESP8266 (single-core Xtensa LX106)"),
    ("esp31b", Family::Esp8266, "xtensa-esp108-elf", "ESP31B (ESP32 beta, Xtensa LX108)"),
    ("esp32", Family::Esp32, "xtensa-esp32-elf", "ESP32 (dual-core Xtensa LX6)"),
    ("esp32s2", Family::Esp32, "xtensa-esp32s2-elf", "ESP32-S2 (single-core Xtensa LX7)"),
    ("esp32s3", Family::Esp32, "xtensa-esp32s3-elf", "ESP32-S3 (dual-core Xtensa LX7)"),
];

/// One row of [`CHIPS`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub name: &'static str,
    pub family: Family,
    pub toolchain_prefix: &'static str,
    pub description: &'static str,
}

impl ChipInfo {
    pub fn all() -> impl Iterator<Item = ChipInfo> {
        CHIPS.iter().map(|&(name, family, toolchain_prefix, description)| ChipInfo {
            name,
            family,
            toolchain_prefix,
            description,
        })
    }

    /// Look up a chip by name, case-insensitively
    pub fn find(name: &str) -> Result<ChipInfo> {
        let wanted = name.trim();
        Self::all()
            .find(|chip| chip.name.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DecodeError::UnsupportedTarget(wanted.to_string()))
    }

    /// Executable name of the resolver for this chip, e.g. `xtensa-esp32-elf-gdb`
    pub fn tool_name(&self, variant: ResolverVariant) -> String {
        let name = format!("{}-{}", self.toolchain_prefix, variant.tool_suffix());
        if cfg!(windows) {
            format!("{}.exe", name)
        } else {
            name
        }
    }
}

/// Everything a decode session needs to know about the firmware and toolchain.
/// Built once per session and passed into the pipeline explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareTarget {
    pub binary_path: PathBuf,
    pub resolver_tool_path: PathBuf,
    pub family: Family,
    pub variant: ResolverVariant,
}

impl FirmwareTarget {
    /// Target using the family's default resolver
    pub fn new(binary_path: impl Into<PathBuf>, resolver_tool_path: impl Into<PathBuf>, family: Family) -> Self {
        Self {
            binary_path: binary_path.into(),
            resolver_tool_path: resolver_tool_path.into(),
            family,
            variant: family.default_variant(),
        }
    }

    pub fn with_variant(mut self, variant: ResolverVariant) -> Self {
        self.variant = variant;
        self
    }

    /// File name of the resolver tool, for status messages
    pub fn tool_display_name(&self) -> String {
        self.resolver_tool_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.resolver_tool_path.display().to_string())
    }
}

/// Find the resolver executable.
///
/// Search order: explicit path, `<toolchain_dir>/bin/<name>`,
/// `<toolchain_dir>/<name>`, then every `PATH` entry.
pub fn locate_tool(
    explicit: Option<&Path>,
    toolchain_dir: Option<&Path>,
    chip: &ChipInfo,
    variant: ResolverVariant,
) -> Result<PathBuf> {
    let tool_name = chip.tool_name(variant);

    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(DecodeError::ToolNotFound(path.display().to_string()));
    }

    if let Some(dir) = toolchain_dir {
        for candidate in [dir.join("bin").join(&tool_name), dir.join(&tool_name)] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(&tool_name);
            if candidate.is_file() {
                debug!("Found {} on PATH at {}", tool_name, candidate.display());
                return Ok(candidate);
            }
        }
    }

    Err(DecodeError::ToolNotFound(tool_name))
}

/// Find the firmware ELF.
///
/// An explicit path wins. Otherwise the build directory is searched for
/// `<sketch>.ino.elf` then `<sketch>.cpp.elf`; without a sketch name the most
/// recently modified file with either suffix is used.
pub fn locate_elf(explicit: Option<&Path>, build_dir: Option<&Path>, sketch: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(DecodeError::BinaryNotFound(format!("{} was not found!", path.display())));
    }

    let build_dir = build_dir.ok_or_else(|| {
        DecodeError::BinaryNotFound(
            "no firmware ELF selected and no build directory configured".to_string(),
        )
    })?;

    if let Some(sketch) = sketch {
        let ino = build_dir.join(format!("{}.ino.elf", sketch));
        if ino.is_file() {
            return Ok(ino);
        }
        let cpp = build_dir.join(format!("{}.cpp.elf", sketch));
        if cpp.is_file() {
            return Ok(cpp);
        }
        return Err(DecodeError::BinaryNotFound(format!(
            "neither {0}.ino.elf or {0}.cpp.elf were found! Did you forget to compile the sketch?",
            sketch
        )));
    }

    let newest = std::fs::read_dir(build_dir)
        .map_err(|e| DecodeError::BinaryNotFound(format!("{}: {}", build_dir.display(), e)))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            path.is_file() && (name.ends_with(".ino.elf") || name.ends_with(".cpp.elf"))
        })
        .max_by_key(|path| path.metadata().and_then(|m| m.modified()).ok());

    newest.ok_or_else(|| {
        DecodeError::BinaryNotFound(format!(
            "no .ino.elf or .cpp.elf found in {}! Did you forget to compile the sketch?",
            build_dir.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_find_chip() {
        let chip = ChipInfo::find("ESP32").unwrap();
        assert_eq!(chip.family, Family::Esp32);
        assert_eq!(chip.toolchain_prefix, "xtensa-esp32-elf");

        let err = ChipInfo::find("avr").unwrap_err();
        assert_eq!(err.to_string(), "Not Supported on avr");
    }

    #[test]
    fn test_default_variants() {
        assert_eq!(Family::Esp8266.default_variant(), ResolverVariant::LinearAddr2Line);
        assert_eq!(Family::Esp32.default_variant(), ResolverVariant::ScriptedDebugger);
        let target = FirmwareTarget::new("/tmp/a.elf", "/tmp/gdb", Family::Esp32)
            .with_variant(ResolverVariant::LinearAddr2Line);
        assert_eq!(target.variant, ResolverVariant::LinearAddr2Line);
    }

    #[test]
    fn test_variant_from_str() {
        assert_eq!("addr2line".parse::<ResolverVariant>().unwrap(), ResolverVariant::LinearAddr2Line);
        assert_eq!("GDB".parse::<ResolverVariant>().unwrap(), ResolverVariant::ScriptedDebugger);
        assert!("lldb".parse::<ResolverVariant>().is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_tool_name() {
        let chip = ChipInfo::find("esp8266").unwrap();
        assert_eq!(chip.tool_name(ResolverVariant::LinearAddr2Line), "xtensa-lx106-elf-addr2line");
        assert_eq!(chip.tool_name(ResolverVariant::ScriptedDebugger), "xtensa-lx106-elf-gdb");
    }

    #[test]
    fn test_locate_tool_in_toolchain_bin() {
        let tmp = TempDir::new().unwrap();
        let chip = ChipInfo::find("esp8266").unwrap();
        let bin = tmp.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let tool = bin.join(chip.tool_name(ResolverVariant::LinearAddr2Line));
        fs::write(&tool, "").unwrap();

        let found = locate_tool(None, Some(tmp.path()), &chip, ResolverVariant::LinearAddr2Line).unwrap();
        assert_eq!(found, tool);
    }

    #[test]
    fn test_locate_tool_explicit_missing() {
        let chip = ChipInfo::find("esp32").unwrap();
        let result = locate_tool(
            Some(Path::new("/nonexistent/xtensa-esp32-elf-gdb")),
            None,
            &chip,
            ResolverVariant::ScriptedDebugger,
        );
        assert!(matches!(result, Err(DecodeError::ToolNotFound(_))));
    }

    #[test]
    fn test_locate_elf_prefers_ino() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("blink.ino.elf"), b"\x7fELF").unwrap();
        fs::write(tmp.path().join("blink.cpp.elf"), b"\x7fELF").unwrap();

        let found = locate_elf(None, Some(tmp.path()), Some("blink")).unwrap();
        assert_eq!(found.file_name().unwrap(), "blink.ino.elf");
    }

    #[test]
    fn test_locate_elf_cpp_fallback() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("blink.cpp.elf"), b"\x7fELF").unwrap();

        let found = locate_elf(None, Some(tmp.path()), Some("blink")).unwrap();
        assert_eq!(found.file_name().unwrap(), "blink.cpp.elf");
    }

    #[test]
    fn test_locate_elf_missing_sketch() {
        let tmp = TempDir::new().unwrap();
        let err = locate_elf(None, Some(tmp.path()), Some("blink")).unwrap_err();
        assert!(err.to_string().contains("neither blink.ino.elf or blink.cpp.elf"));
    }

    #[test]
    fn test_locate_elf_scan_without_sketch() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), b"").unwrap();
        fs::write(tmp.path().join("wifi.ino.elf"), b"\x7fELF").unwrap();

        let found = locate_elf(None, Some(tmp.path()), None).unwrap();
        assert_eq!(found.file_name().unwrap(), "wifi.ino.elf");
    }

    #[test]
    fn test_locate_elf_nothing_configured() {
        let result = locate_elf(None, None, None);
        assert!(matches!(result, Err(DecodeError::BinaryNotFound(_))));
    }
}
