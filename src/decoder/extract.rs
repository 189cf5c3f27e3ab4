//! Address extraction from pasted serial console output.
//!
//! Every section of a crash log is searched in its own bounded slice of the
//! input: the stack dump (or backtrace line) on one side, everything else on
//! the other. That keeps stack addresses out of the register and allocation
//! sections and vice versa.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::target::Family;

const STACK_BEGIN: &str = ">>>stack>>>";
const STACK_END: &str = "<<<stack<<<";
const BACKTRACE_PREFIX: &str = "Backtrace:";

static ESP8266_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"40[0-2][0-9a-fA-F]{5}\b").expect("valid code address regex"));
static ESP32_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"4[0-3][0-9a-fA-F]{6}\b").expect("valid code address regex"));

static ESP8266_ALLOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"last failed alloc call: (40[0-2][0-9a-fA-F]{5})\((\d+)\)").expect("valid alloc regex")
});
static ESP32_ALLOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"last failed alloc call: (4[0-3][0-9a-fA-F]{6})\((\d+)\)").expect("valid alloc regex")
});

// Inline style: `epc1=0x40201234 epc2=0x00000000 ... excvaddr=0x00000000`
static ESP8266_REGISTERS: LazyLock<[(&'static str, Regex); 2]> = LazyLock::new(|| {
    [
        ("PC", Regex::new(r"epc1=0x([0-9a-fA-F]{8})").expect("valid register regex")),
        ("EXCVADDR", Regex::new(r"excvaddr=0x([0-9a-fA-F]{8})").expect("valid register regex")),
    ]
});

// Tabular style: `PC      : 0x400d2f3e  PS      : 0x00060830`
static ESP32_REGISTERS: LazyLock<[(&'static str, Regex); 2]> = LazyLock::new(|| {
    [
        ("PC", Regex::new(r"\bPC\s*:\s*(?:0x)?([0-9a-fA-F]{8})").expect("valid register regex")),
        ("EXCVADDR", Regex::new(r"\bEXCVADDR\s*:\s*(?:0x)?([0-9a-fA-F]{8})").expect("valid register regex")),
    ]
});

/// What an extracted address stands for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenCategory {
    CodeAddress,
    Register { name: String },
    AllocationFailure { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressToken {
    /// Hex digits exactly as they appeared in the log, without `0x`
    pub raw: String,
    pub category: TokenCategory,
}

impl AddressToken {
    pub fn code(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            category: TokenCategory::CodeAddress,
        }
    }

    pub fn value(&self) -> Option<u64> {
        u64::from_str_radix(&self.raw, 16).ok()
    }
}

/// How a pattern's captures turn into tokens
#[derive(Debug, Clone, Copy)]
enum Capture {
    /// whole match is the address
    Whole,
    /// group 1 is the register value
    Register(&'static str),
    /// group 1 is the address, group 2 the decimal size
    Allocation,
}

/// A compiled address pattern for one section of one family
#[derive(Debug, Clone, Copy)]
pub struct AddressPattern {
    regex: &'static Regex,
    capture: Capture,
}

impl AddressPattern {
    /// Instruction-space addresses for the family
    pub fn code(family: Family) -> Self {
        let regex: &'static Regex = match family {
            Family::Esp8266 => &*ESP8266_CODE,
            Family::Esp32 => &*ESP32_CODE,
        };
        Self { regex, capture: Capture::Whole }
    }

    /// `last failed alloc call: <addr>(<size>)`
    pub fn allocation(family: Family) -> Self {
        let regex: &'static Regex = match family {
            Family::Esp8266 => &*ESP8266_ALLOC,
            Family::Esp32 => &*ESP32_ALLOC,
        };
        Self { regex, capture: Capture::Allocation }
    }

    /// One pattern per register the family dumps, in report order
    pub fn registers(family: Family) -> Vec<Self> {
        let table: &'static [(&'static str, Regex); 2] = match family {
            Family::Esp8266 => &*ESP8266_REGISTERS,
            Family::Esp32 => &*ESP32_REGISTERS,
        };
        table
            .iter()
            .map(|(name, regex)| Self {
                regex,
                capture: Capture::Register(*name),
            })
            .collect()
    }
}

/// All tokens matching `pattern`, in order of appearance
pub fn extract(text: &str, pattern: &AddressPattern) -> Vec<AddressToken> {
    pattern
        .regex
        .captures_iter(text)
        .filter_map(|caps| match pattern.capture {
            Capture::Whole => caps.get(0).map(|m| AddressToken::code(m.as_str())),
            Capture::Register(name) => caps.get(1).map(|m| AddressToken {
                raw: m.as_str().to_string(),
                category: TokenCategory::Register { name: name.to_string() },
            }),
            Capture::Allocation => {
                let addr = caps.get(1)?;
                let size = caps.get(2)?.as_str().parse::<u64>().ok()?;
                Some(AddressToken {
                    raw: addr.as_str().to_string(),
                    category: TokenCategory::AllocationFailure { size },
                })
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackKind {
    /// `>>>stack>>>` ... `<<<stack<<<` memory dump
    Dump,
    /// single `Backtrace:` line
    Backtrace,
}

/// Byte range of the stack section inside the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRegion {
    pub kind: StackKind,
    pub range: Range<usize>,
}

/// Locate the stack dump, or failing that the backtrace line.
pub fn find_stack_region(text: &str) -> Option<StackRegion> {
    if let Some(begin) = text.find(STACK_BEGIN) {
        let start = begin + STACK_BEGIN.len();
        let end = text[start..]
            .find(STACK_END)
            .map(|offset| start + offset)
            .unwrap_or(text.len());
        return Some(StackRegion {
            kind: StackKind::Dump,
            range: start..end,
        });
    }

    let begin = text.find(BACKTRACE_PREFIX)?;
    let start = begin + BACKTRACE_PREFIX.len();
    let end = text[start..]
        .find('\n')
        .map(|offset| start + offset)
        .unwrap_or(text.len());
    Some(StackRegion {
        kind: StackKind::Backtrace,
        range: start..end,
    })
}

/// Everything the pipeline pulls out of one log before talking to a resolver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractedSections {
    pub exception: Option<super::exceptions::ExceptionInfo>,
    pub registers: Vec<AddressToken>,
    pub allocations: Vec<AddressToken>,
    pub stack_kind: Option<StackKind>,
    pub stack: Vec<AddressToken>,
}

impl ExtractedSections {
    /// Split the log into bounded sections and run each section's patterns.
    pub fn from_log(text: &str, family: Family) -> Self {
        let region = find_stack_region(text);

        let outside = match &region {
            Some(region) => {
                let before = &text[..region.range.start];
                let after = &text[region.range.end..];
                format!("{}\n{}", before, after)
            }
            None => text.to_string(),
        };

        let registers = AddressPattern::registers(family)
            .iter()
            .filter_map(|pattern| extract(&outside, pattern).into_iter().next())
            .collect();

        let (stack_kind, stack) = match &region {
            Some(region) => (
                Some(region.kind),
                extract(&text[region.range.clone()], &AddressPattern::code(family)),
            ),
            None => (None, Vec::new()),
        };

        Self {
            exception: super::exceptions::find_exception(&outside, family),
            registers,
            allocations: extract(&outside, &AddressPattern::allocation(family)),
            stack_kind,
            stack,
        }
    }

    /// Number of addresses found in any section
    pub fn address_count(&self) -> usize {
        self.registers.len() + self.allocations.len() + self.stack.len()
    }

    /// Addresses a resolver would be asked about. Registers holding data
    /// addresses (EXCVADDR usually) are reported raw and never resolved.
    pub fn resolvable_count(&self, family: Family) -> usize {
        let registers = self
            .registers
            .iter()
            .filter(|token| is_code_address(family, &token.raw))
            .count();
        registers + self.allocations.len() + self.stack.len()
    }
}

/// Whether `raw` lies in the family's instruction address range
pub fn is_code_address(family: Family, raw: &str) -> bool {
    !extract(raw, &AddressPattern::code(family)).is_empty()
}
