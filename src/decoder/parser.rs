//! Parsers for resolver output.
//!
//! Both grammars are pure functions over a single line. Lines that do not
//! look like an answer (banners, warnings, source listings, `?? ??:0`) are
//! skipped, never reported as errors: toolchain output varies too much across
//! releases to treat anything unexpected as fatal.

use serde::{Deserialize, Serialize};

use super::extract::AddressToken;
use super::target::ResolverVariant;

const INLINED_MARKER: &str = "(inlined by)";
const AT_SEPARATOR: &str = " at ";
const IS_IN_MARKER: &str = "is in ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Direct,
    Inlined,
}

/// One resolved (or unresolvable) code location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    /// Hex digits without `0x`
    pub address: String,
    pub function_name: String,
    pub file_path: String,
    pub line_number: String,
    pub kind: SymbolKind,
}

impl SymbolRecord {
    /// Placeholder for an address the resolver had nothing for
    pub fn unresolved(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            function_name: String::new(),
            file_path: String::new(),
            line_number: String::new(),
            kind: SymbolKind::Direct,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.function_name.is_empty() || !self.file_path.is_empty()
    }

    pub fn address_value(&self) -> Option<u64> {
        u64::from_str_radix(&self.address, 16).ok()
    }

    fn answers(&self, token: &AddressToken) -> bool {
        self.kind == SymbolKind::Direct && self.address_value().is_some() && self.address_value() == token.value()
    }
}

/// Parse one line with the grammar of `variant`
pub fn parse_line(line: &str, variant: ResolverVariant) -> Option<SymbolRecord> {
    match variant {
        ResolverVariant::LinearAddr2Line => parse_addr2line_line(line),
        ResolverVariant::ScriptedDebugger => parse_gdb_line(line),
    }
}

/// `0x40201234: loop at /path/sketch.ino:12` or
/// ` (inlined by) helper at /path/util.h:7`
pub fn parse_addr2line_line(line: &str) -> Option<SymbolRecord> {
    let line = line.trim_end();

    let (address, kind, rest) = if let Some(stripped) = line.strip_prefix("0x") {
        let (address, rest) = stripped.split_once(':')?;
        if !is_hex(address) {
            return None;
        }
        (address.to_string(), SymbolKind::Direct, rest.trim_start())
    } else {
        let rest = line.trim_start().strip_prefix(INLINED_MARKER)?;
        (String::new(), SymbolKind::Inlined, rest.trim_start())
    };

    let (function_name, location) = rest.split_once(AT_SEPARATOR)?;
    let (file_path, line_number) = match location.rsplit_once(':') {
        Some((file, number)) => (file, strip_discriminator(number)),
        None => (location, ""),
    };

    Some(SymbolRecord {
        address,
        function_name: function_name.trim().to_string(),
        file_path: file_path.trim().to_string(),
        line_number: line_number.trim().to_string(),
        kind,
    })
}

/// `0x400d1f5a is in loop() (/path/sketch.ino:12).`
pub fn parse_gdb_line(line: &str) -> Option<SymbolRecord> {
    let line = line.trim_end();
    let stripped = line.strip_prefix("0x")?;
    let (address, rest) = stripped.split_once(' ')?;
    if !is_hex(address) {
        return None;
    }
    let marker = rest.find(IS_IN_MARKER)?;
    let after = &rest[marker + IS_IN_MARKER.len()..];

    let strict = || {
        let open = after.rfind('(')?;
        let close = after.rfind(')')?;
        if close < open {
            return None;
        }
        let (file_path, line_number) = after[open + 1..close].rsplit_once(':')?;
        Some(SymbolRecord {
            address: address.to_string(),
            function_name: after[..open].trim().to_string(),
            file_path: file_path.trim().to_string(),
            line_number: line_number.trim().to_string(),
            kind: SymbolKind::Direct,
        })
    };

    // Odd gdb output: still report what we have
    Some(strict().unwrap_or_else(|| SymbolRecord {
        address: address.to_string(),
        function_name: rest.trim().to_string(),
        file_path: String::new(),
        line_number: String::new(),
        kind: SymbolKind::Direct,
    }))
}

/// Parse a whole output stream. Inlined records inherit the address of the
/// direct record they belong to.
pub fn parse_output<S: AsRef<str>>(lines: &[S], variant: ResolverVariant) -> Vec<SymbolRecord> {
    let mut records: Vec<SymbolRecord> = Vec::new();
    for line in lines {
        if let Some(mut record) = parse_line(line.as_ref(), variant) {
            if record.kind == SymbolKind::Inlined {
                if let Some(parent) = records.last() {
                    record.address = parent.address.clone();
                }
            }
            records.push(record);
        }
    }
    records
}

/// Line parsed records up with the addresses that were asked for.
///
/// With `complete` set (the resolver exited cleanly) every requested address
/// ends up in the result, unresolved ones as empty records. Without it the
/// parsed records are returned untouched so a failed run never grows
/// placeholder entries past its failure point.
pub fn align(requested: &[AddressToken], records: Vec<SymbolRecord>, complete: bool) -> Vec<SymbolRecord> {
    if !complete {
        return records;
    }

    let mut out = Vec::with_capacity(requested.len().max(records.len()));
    let mut pending = records.into_iter().peekable();

    for (index, token) in requested.iter().enumerate() {
        loop {
            let Some(next) = pending.peek() else {
                out.push(SymbolRecord::unresolved(&token.raw));
                break;
            };

            if next.answers(token) {
                out.extend(pending.next());
                while pending.peek().is_some_and(|r| r.kind == SymbolKind::Inlined) {
                    out.extend(pending.next());
                }
                break;
            }

            let later = requested[index + 1..].iter().any(|t| next.answers(t));
            if next.kind == SymbolKind::Inlined || !later {
                // Belongs to nothing we asked for; keep it rather than drop it
                out.extend(pending.next());
                continue;
            }

            out.push(SymbolRecord::unresolved(&token.raw));
            break;
        }
    }

    out.extend(pending);
    out
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

// `12 (discriminator 3)` -> `12`
fn strip_discriminator(number: &str) -> &str {
    match number.find(" (discriminator") {
        Some(index) => &number[..index],
        None => number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, function: &str, file: &str, line: &str) -> SymbolRecord {
        SymbolRecord {
            address: address.to_string(),
            function_name: function.to_string(),
            file_path: file.to_string(),
            line_number: line.to_string(),
            kind: SymbolKind::Direct,
        }
    }

    #[test]
    fn test_addr2line_direct() {
        let parsed = parse_addr2line_line("0x4020ab12: funcname at path/to/file.c:42").unwrap();
        assert_eq!(parsed, record("4020ab12", "funcname", "path/to/file.c", "42"));
    }

    #[test]
    fn test_addr2line_inlined() {
        let parsed = parse_addr2line_line(" (inlined by) setup at /home/user/blink/blink.ino:10").unwrap();
        assert_eq!(parsed.kind, SymbolKind::Inlined);
        assert_eq!(parsed.function_name, "setup");
        assert_eq!(parsed.file_path, "/home/user/blink/blink.ino");
        assert_eq!(parsed.line_number, "10");
    }

    #[test]
    fn test_addr2line_windows_path() {
        let parsed = parse_addr2line_line("0x40201234: loop at C:\\Users\\me\\sketch\\sketch.ino:7").unwrap();
        assert_eq!(parsed.file_path, "C:\\Users\\me\\sketch\\sketch.ino");
        assert_eq!(parsed.line_number, "7");
    }

    #[test]
    fn test_addr2line_discriminator() {
        let parsed = parse_addr2line_line("0x40201234: loop at /a/b.cpp:12 (discriminator 3)").unwrap();
        assert_eq!(parsed.line_number, "12");
    }

    #[test]
    fn test_addr2line_demangled_function_with_spaces() {
        let parsed =
            parse_addr2line_line("0x40201234: String::concat(char const*, unsigned int) at core/WString.cpp:300")
                .unwrap();
        assert_eq!(parsed.function_name, "String::concat(char const*, unsigned int)");
        assert_eq!(parsed.file_path, "core/WString.cpp");
    }

    #[test]
    fn test_addr2line_missing_separator_skipped() {
        assert!(parse_addr2line_line("0x40201234: ?? ??:0").is_none());
        assert!(parse_addr2line_line("0x40201234: something odd").is_none());
    }

    #[test]
    fn test_addr2line_noise_skipped() {
        assert!(parse_addr2line_line("").is_none());
        assert!(parse_addr2line_line("BFD: warning: section .bss size mismatch").is_none());
        assert!(parse_addr2line_line("0xZZZ: a at b:1").is_none());
    }

    #[test]
    fn test_gdb_direct() {
        let parsed = parse_gdb_line("0x4020ab12 <junk+4> is in funcname (path/to/file.c:42).").unwrap();
        assert_eq!(parsed, record("4020ab12", "funcname", "path/to/file.c", "42"));
    }

    #[test]
    fn test_gdb_function_with_parens() {
        let parsed = parse_gdb_line("0x400d1f5a is in loop() (/home/me/sketch/sketch.ino:12).").unwrap();
        assert_eq!(parsed.function_name, "loop()");
        assert_eq!(parsed.file_path, "/home/me/sketch/sketch.ino");
        assert_eq!(parsed.line_number, "12");
    }

    #[test]
    fn test_gdb_fallback_keeps_raw_text() {
        let parsed = parse_gdb_line("0x400d1f5a is in loop without location").unwrap();
        assert_eq!(parsed.address, "400d1f5a");
        assert_eq!(parsed.function_name, "is in loop without location");
        assert!(parsed.file_path.is_empty());
        assert!(parsed.line_number.is_empty());
    }

    #[test]
    fn test_gdb_missing_marker_skipped() {
        assert!(parse_gdb_line("0x400d1f5a <loop+2>: mov a2, a3").is_none());
        assert!(parse_gdb_line("12\t  int x = 1 / 0;").is_none());
        assert!(parse_gdb_line("No line number information available for address 0x400d1f5a").is_none());
    }

    #[test]
    fn test_parse_line_dispatch() {
        let a2l = "0x40201234: loop at a.c:1";
        let gdb = "0x40201234 is in loop (a.c:1).";
        assert!(parse_line(a2l, ResolverVariant::LinearAddr2Line).is_some());
        assert!(parse_line(a2l, ResolverVariant::ScriptedDebugger).is_none());
        assert!(parse_line(gdb, ResolverVariant::ScriptedDebugger).is_some());
        assert!(parse_line(gdb, ResolverVariant::LinearAddr2Line).is_none());
    }

    #[test]
    fn test_parse_output_inherits_inlined_address() {
        let lines = [
            "0x40201234: inner at a.h:3",
            " (inlined by) outer at a.c:9",
            "0x40205678: ?? ??:0",
        ];
        let records = parse_output(&lines, ResolverVariant::LinearAddr2Line);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].kind, SymbolKind::Inlined);
        assert_eq!(records[1].address, "40201234");
    }

    #[test]
    fn test_align_backfills_unresolved() {
        let requested = vec![
            AddressToken::code("40201234"),
            AddressToken::code("40205678"),
            AddressToken::code("40201234"),
        ];
        let records = vec![
            record("40201234", "loop", "a.c", "1"),
            record("40201234", "loop", "a.c", "1"),
        ];
        let aligned = align(&requested, records, true);
        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[0].function_name, "loop");
        assert_eq!(aligned[1], SymbolRecord::unresolved("40205678"));
        assert_eq!(aligned[2].function_name, "loop");
    }

    #[test]
    fn test_align_keeps_inlined_chain() {
        let requested = vec![AddressToken::code("40201234"), AddressToken::code("40209999")];
        let mut inlined = record("40201234", "outer", "a.c", "9");
        inlined.kind = SymbolKind::Inlined;
        let records = vec![record("40201234", "inner", "a.h", "3"), inlined.clone()];
        let aligned = align(&requested, records, true);
        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[1], inlined);
        assert!(!aligned[2].is_resolved());
    }

    #[test]
    fn test_align_case_insensitive_match() {
        let requested = vec![AddressToken::code("4020AB12")];
        let aligned = align(&requested, vec![record("4020ab12", "f", "x.c", "2")], true);
        assert_eq!(aligned.len(), 1);
        assert_eq!(aligned[0].function_name, "f");
    }

    #[test]
    fn test_align_incomplete_never_backfills() {
        let requested = vec![AddressToken::code("40201234"), AddressToken::code("40205678")];
        let records = vec![record("40201234", "loop", "a.c", "1")];
        let aligned = align(&requested, records, false);
        assert_eq!(aligned.len(), 1);
    }
}
