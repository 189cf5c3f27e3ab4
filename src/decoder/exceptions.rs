//! Xtensa exception cause table

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::target::Family;

/// EXCCAUSE descriptions, indexed by cause code
pub const EXCEPTIONS: [&str; 30] = [
    "Illegal instruction",
    "SYSCALL instruction",
    "InstructionFetchError: Processor internal physical address or data error during instruction fetch",
    "LoadStoreError: Processor internal physical address or data error during load or store",
    "Level1Interrupt: Level-1 interrupt as indicated by set level-1 bits in the INTERRUPT register",
    "Alloca: MOVSP instruction, if caller's registers are not in the register file",
    "IntegerDivideByZero: QUOS, QUOU, REMS, or REMU divisor operand is zero",
    "reserved",
    "Privileged: Attempt to execute a privileged operation when CRING ? 0",
    "LoadStoreAlignmentCause: Load or store to an unaligned address",
    "reserved",
    "reserved",
    "InstrPIFDataError: PIF data error during instruction fetch",
    "LoadStorePIFDataError: Synchronous PIF data error during LoadStore access",
    "InstrPIFAddrError: PIF address error during instruction fetch",
    "LoadStorePIFAddrError: Synchronous PIF address error during LoadStore access",
    "InstTLBMiss: Error during Instruction TLB refill",
    "InstTLBMultiHit: Multiple instruction TLB entries matched",
    "InstFetchPrivilege: An instruction fetch referenced a virtual address at a ring level less than CRING",
    "reserved",
    "InstFetchProhibited: An instruction fetch referenced a page mapped with an attribute that does not permit instruction fetch",
    "reserved",
    "reserved",
    "reserved",
    "LoadStoreTLBMiss: Error during TLB refill for a load or store",
    "LoadStoreTLBMultiHit: Multiple TLB entries matched for a load or store",
    "LoadStorePrivilege: A load or store referenced a virtual address at a ring level less than CRING",
    "reserved",
    "LoadProhibited: A load referenced a page mapped with an attribute that does not permit loads",
    "StoreProhibited: A store referenced a page mapped with an attribute that does not permit stores",
];

static EXCEPTION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Exception \((-?\d+)\):").expect("valid exception regex"));

static EXCCAUSE_REGISTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bEXCCAUSE\s*:\s*(?:0x)?([0-9a-fA-F]{8})").expect("valid EXCCAUSE regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub code: u8,
    pub description: &'static str,
}

impl ExceptionInfo {
    pub fn from_code(code: i64) -> Option<Self> {
        let index = usize::try_from(code).ok()?;
        EXCEPTIONS.get(index).map(|description| ExceptionInfo {
            code: index as u8,
            description,
        })
    }
}

/// First exception cause in `text`: the decimal `Exception (N):` marker on
/// ESP8266, the hex `EXCCAUSE:` register on ESP32. Unparsable or out-of-range
/// codes count as no exception.
pub fn find_exception(text: &str, family: Family) -> Option<ExceptionInfo> {
    let code = match family {
        Family::Esp8266 => {
            let caps = EXCEPTION_MARKER.captures(text)?;
            caps.get(1)?.as_str().parse::<i64>().ok()?
        }
        Family::Esp32 => {
            let caps = EXCCAUSE_REGISTER.captures(text)?;
            i64::from_str_radix(caps.get(1)?.as_str(), 16).ok()?
        }
    };
    ExceptionInfo::from_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size() {
        assert_eq!(EXCEPTIONS.len(), 30);
    }

    #[test]
    fn test_divide_by_zero() {
        let info = find_exception("\nException (6):\nepc1=0x40201234", Family::Esp8266).unwrap();
        assert_eq!(info.code, 6);
        assert_eq!(
            info.description,
            "IntegerDivideByZero: QUOS, QUOU, REMS, or REMU divisor operand is zero"
        );
    }

    #[test]
    fn test_last_entry() {
        let info = find_exception("Exception (29):", Family::Esp8266).unwrap();
        assert!(info.description.starts_with("StoreProhibited"));
    }

    #[test]
    fn test_out_of_range_ignored() {
        assert!(find_exception("Exception (30):", Family::Esp8266).is_none());
        assert!(find_exception("Exception (-1):", Family::Esp8266).is_none());
        assert!(find_exception("Exception (99999999999999999999999):", Family::Esp8266).is_none());
    }

    #[test]
    fn test_esp32_exccause_register() {
        let dump = "PC      : 0x400d1f5a  PS      : 0x00060e30\nEXCCAUSE: 0x0000001c  EXCVADDR: 0x00000000";
        let info = find_exception(dump, Family::Esp32).unwrap();
        assert_eq!(info.code, 28);
        assert!(info.description.starts_with("LoadProhibited"));

        let info = find_exception("EXCCAUSE: 0x00000006", Family::Esp32).unwrap();
        assert_eq!(info.code, 6);
    }

    #[test]
    fn test_esp32_exccause_out_of_range() {
        assert!(find_exception("EXCCAUSE: 0x0000001e", Family::Esp32).is_none());
        assert!(find_exception("EXCCAUSE: 0xffffffff", Family::Esp32).is_none());
    }

    #[test]
    fn test_markers_are_family_specific() {
        assert!(find_exception("Exception (6):", Family::Esp32).is_none());
        assert!(find_exception("EXCCAUSE: 0x00000006", Family::Esp8266).is_none());
    }

    #[test]
    fn test_no_marker() {
        assert!(find_exception("Soft WDT reset", Family::Esp8266).is_none());
    }
}
