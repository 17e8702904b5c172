//! Byte quantities
//!
//! Parsing and formatting of the size strings that appear in configuration
//! and in tool output (`findmnt`, `lvs --units B`), plus rounding to the
//! LVM extent quantum.

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

pub const KIB: i64 = 1024;
pub const MIB: i64 = KIB * 1024;
pub const GIB: i64 = MIB * 1024;
pub const TIB: i64 = GIB * 1024;

/// LVM physical extent size; every LV size is a multiple of it
pub const LVM_QUANTUM: i64 = 4 * MIB;

fn unit_multiplier(unit: &str) -> Option<i64> {
    let mult = match unit {
        "" | "b" | "B" => 1,
        "k" => 1_000,
        "K" | "KB" | "Ki" | "KiB" => KIB,
        "m" => 1_000_000,
        "M" | "MB" | "Mi" | "MiB" => MIB,
        "g" => 1_000_000_000,
        "G" | "GB" | "Gi" | "GiB" => GIB,
        "t" => 1_000_000_000_000,
        "T" | "TB" | "Ti" | "TiB" => TIB,
        _ => return None,
    };
    Some(mult)
}

// =============================================================================
// Parsing & Formatting
// =============================================================================

/// Parse a size such as `10G`, `512MiB`, `1.5G` or `4096` into bytes.
///
/// Upper-case units are binary, lower-case single letters are decimal.
pub fn parse_bytes(s: &str) -> Result<i64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    if number.is_empty() {
        return Err(Error::CapacityParse(format!("missing number in {:?}", s)));
    }
    let mult = unit_multiplier(unit.trim())
        .ok_or_else(|| Error::CapacityParse(format!("unknown unit in {:?}", s)))?;

    if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|_| Error::CapacityParse(format!("invalid number in {:?}", s)))?;
        let bytes = (value * mult as f64).round();
        if !bytes.is_finite() || bytes > i64::MAX as f64 {
            return Err(Error::CapacityParse(format!("{:?} overflows", s)));
        }
        return Ok(bytes as i64);
    }

    let value: i64 = number
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number in {:?}", s)))?;
    value
        .checked_mul(mult)
        .ok_or_else(|| Error::CapacityParse(format!("{:?} overflows", s)))
}

/// Canonical `<int><unit>` form using the largest binary unit that divides
/// `bytes` exactly
pub fn format_bytes(bytes: i64) -> String {
    if bytes != 0 {
        for (unit, size) in [("T", TIB), ("G", GIB), ("M", MIB), ("K", KIB)] {
            if bytes % size == 0 {
                return format!("{}{}", bytes / size, unit);
            }
        }
    }
    format!("{}B", bytes)
}

/// Human-readable size for log lines
pub fn human_bytes(bytes: i64) -> String {
    let b = bytes as f64;
    if bytes >= TIB {
        format!("{:.2}TiB", b / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2}GiB", b / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MiB", b / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KiB", b / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

// =============================================================================
// LVM
// =============================================================================

/// Round up to the LVM quantum, never below one extent
pub fn to_lvm_bytes(bytes: i64) -> i64 {
    if bytes <= LVM_QUANTUM {
        return LVM_QUANTUM;
    }
    (bytes + LVM_QUANTUM - 1) / LVM_QUANTUM * LVM_QUANTUM
}

/// Parse the `<n>B` byte strings of `lvs/vgs/pvs --units B`
pub fn parse_lvm_bytes(s: &str) -> Result<i64> {
    let s = s.trim();
    let digits = s.strip_suffix('B').unwrap_or(s);
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid LVM size {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_parse_bytes_units() {
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
        assert_eq!(parse_bytes("10B").unwrap(), 10);
        assert_eq!(parse_bytes("1K").unwrap(), 1024);
        assert_eq!(parse_bytes("1k").unwrap(), 1000);
        assert_eq!(parse_bytes("2MB").unwrap(), 2 * MIB);
        assert_eq!(parse_bytes("10G").unwrap(), 10 * GIB);
        assert_eq!(parse_bytes("1Ti").unwrap(), TIB);
        assert_eq!(parse_bytes("1.5G").unwrap(), GIB + GIB / 2);
        assert_eq!(parse_bytes(" 512M\n").unwrap(), 512 * MIB);
    }

    #[test]
    fn test_parse_bytes_errors() {
        assert_matches!(parse_bytes("G"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("10X"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("99999999999T"), Err(Error::CapacityParse(_)));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(1000), "1000B");
        assert_eq!(format_bytes(1024), "1K");
        assert_eq!(format_bytes(10 * GIB), "10G");
        assert_eq!(format_bytes(1536 * MIB), "1536M");
        assert_eq!(format_bytes(TIB), "1T");
    }

    #[test]
    fn test_lvm_bytes() {
        assert_eq!(to_lvm_bytes(0), LVM_QUANTUM);
        assert_eq!(to_lvm_bytes(1), LVM_QUANTUM);
        assert_eq!(to_lvm_bytes(LVM_QUANTUM), LVM_QUANTUM);
        assert_eq!(to_lvm_bytes(LVM_QUANTUM + 1), 2 * LVM_QUANTUM);
        assert_eq!(to_lvm_bytes(10 * GIB), 10 * GIB);

        assert_eq!(parse_lvm_bytes("1073741824B").unwrap(), GIB);
        assert_eq!(parse_lvm_bytes("").unwrap(), 0);
        assert!(parse_lvm_bytes("12.5g").is_err());
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(500), "500B");
        assert_eq!(human_bytes(GIB), "1.00GiB");
    }

    proptest! {
        #[test]
        fn prop_canonical_round_trip(n in 0i64..(1i64 << 50)) {
            prop_assert_eq!(parse_bytes(&format_bytes(n)).unwrap(), n);
        }

        #[test]
        fn prop_unit_forms_round_trip(
            n in 0i64..100_000,
            unit in prop::sample::select(vec!["B", "K", "M", "G", "T", "KB", "MB", "GB", "TB"]),
        ) {
            let mult = unit_multiplier(unit).unwrap();
            prop_assert_eq!(parse_bytes(&format!("{}{}", n, unit)).unwrap(), n * mult);
        }

        #[test]
        fn prop_lvm_bytes_covers_request(n in 0i64..(1i64 << 45)) {
            let rounded = to_lvm_bytes(n);
            prop_assert!(rounded >= n);
            prop_assert_eq!(rounded % LVM_QUANTUM, 0);
            prop_assert!(rounded - n < LVM_QUANTUM || n == 0);
        }
    }
}
