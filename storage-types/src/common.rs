// SPDX-License-Identifier: GPL-3.0-only

//! Common utility types shared across models

use anyhow::Result;
use num_format::{Locale, ToFormattedString};

/// Smallest block device that may be surfaced as an `Available` drive (16 MiB)
pub const MIN_SUPPORTED_DEVICE_SIZE: u64 = 16 * 1024 * 1024;

const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps < UNITS.len() - 1 {
        val /= 1024.;
        steps += 1;
    }

    let unit = UNITS[steps];

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}

/// Parse human-readable sizes to bytes, base 1024.
///
/// Accepts both the spaced form produced by [`bytes_to_pretty`] ("1.50 GB") and the
/// compact suffix form printed by quota tools ("1.5G", "512K", "3.0Mi"). A bare number is
/// taken as bytes.
pub fn pretty_to_bytes(pretty: &str) -> Result<u64> {
    let pretty = pretty.trim();
    if pretty.is_empty() {
        return Err(anyhow::anyhow!("Invalid input"));
    }

    let split_at = pretty
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(pretty.len());
    let (number, unit) = pretty.split_at(split_at);

    let mut val: f64 = number.parse()?;
    let unit = unit.trim().trim_end_matches('B').trim_end_matches('i');

    let mut steps = match unit.to_ascii_uppercase().as_str() {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        "Z" => 7,
        "Y" => 8,
        _ => return Err(anyhow::anyhow!("Invalid unit: {}", unit)),
    };

    while steps > 0 {
        val *= 1024.;
        steps -= 1;
    }

    Ok(val.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_prints_binary_units() {
        assert_eq!(bytes_to_pretty(&512, false), "512.00 B");
        assert_eq!(bytes_to_pretty(&(5 * 1024 * 1024 * 1024), false), "5.00 GB");
        assert_eq!(
            bytes_to_pretty(&(16 * 1024 * 1024 + 1), true),
            "16.00 MB (16,777,217 bytes)"
        );
    }

    #[test]
    fn parses_compact_and_spaced_suffixes() {
        assert_eq!(pretty_to_bytes("1.5G").expect("compact"), 1_610_612_736);
        assert_eq!(pretty_to_bytes("512K").expect("kibi"), 524_288);
        assert_eq!(pretty_to_bytes("2.00 MB").expect("spaced"), 2_097_152);
        assert_eq!(pretty_to_bytes("4Mi").expect("iec"), 4_194_304);
        assert_eq!(pretty_to_bytes("0").expect("zero"), 0);
    }

    #[test]
    fn rejects_unknown_units() {
        assert!(pretty_to_bytes("12Q").is_err());
        assert!(pretty_to_bytes("").is_err());
        assert!(pretty_to_bytes("G").is_err());
    }
}
