// SPDX-License-Identifier: GPL-3.0-only

//! Range expansion for node and drive selectors
//!
//! `sd{a...c}{1...2}` expands to `sda1 sda2 sdb1 sdb2 sdc1 sdc2`. Ranges are either both
//! unsigned decimal numbers or both lowercase words; words count in base 26 without a zero
//! digit, so `z` is followed by `aa` and `az` by `ba`.

use crate::{Result, SysError};

/// Most names one pattern may expand to
pub const MAX_EXPANSION: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Range { start: u64, end: u64, alpha: bool },
}

impl Segment {
    /// `None` when the count does not fit in a `u64`
    fn len(&self) -> Option<u64> {
        match self {
            Self::Text(_) => Some(1),
            Self::Range { start, end, .. } => (end - start).checked_add(1),
        }
    }

    fn values(&self) -> Vec<String> {
        match self {
            Self::Text(text) => vec![text.clone()],
            Self::Range { start, end, alpha } => (*start..=*end)
                .map(|value| {
                    if *alpha {
                        int_to_alpha(value)
                    } else {
                        value.to_string()
                    }
                })
                .collect(),
        }
    }
}

fn alpha_to_int(value: &str) -> Option<u64> {
    value.bytes().try_fold(0u64, |acc, b| {
        acc.checked_mul(26)?.checked_add(u64::from(b - b'a' + 1))
    })
}

fn int_to_alpha(mut value: u64) -> String {
    let mut out = Vec::new();
    while value > 0 {
        let rem = (value - 1) % 26;
        out.push(b'a' + rem as u8);
        value = (value - 1) / 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_bound(pattern: &str, token: &str) -> Result<(u64, bool)> {
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        let value = token
            .parse::<u64>()
            .map_err(|e| SysError::invalid_pattern(pattern, format!("invalid number '{token}': {e}")))?;
        return Ok((value, false));
    }

    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_lowercase()) {
        let value = alpha_to_int(token)
            .ok_or_else(|| SysError::invalid_pattern(pattern, format!("word '{token}' is too long")))?;
        return Ok((value, true));
    }

    Err(SysError::invalid_pattern(
        pattern,
        format!("invalid range value '{token}'"),
    ))
}

fn parse_range(pattern: &str, body: &str, at: usize) -> Result<Segment> {
    let tokens: Vec<&str> = body.split("...").collect();
    if tokens.len() != 2 {
        return Err(SysError::invalid_pattern(
            pattern,
            format!("invalid ellipsis {{{body}}} at {at}"),
        ));
    }

    let (first, first_alpha) = parse_bound(pattern, tokens[0])?;
    let (second, second_alpha) = parse_bound(pattern, tokens[1])?;
    if first_alpha != second_alpha {
        return Err(SysError::invalid_pattern(
            pattern,
            format!("invalid ellipsis {{{body}}} at {at}; start/end must be same kind"),
        ));
    }

    Ok(Segment::Range {
        start: first.min(second),
        end: first.max(second),
        alpha: first_alpha,
    })
}

fn parse_segments(pattern: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut open: Option<usize> = None;

    for (index, c) in pattern.char_indices() {
        match c {
            '{' => {
                if open.is_some() {
                    return Err(SysError::invalid_pattern(
                        pattern,
                        format!("nested ellipsis pattern at {}", index + 1),
                    ));
                }
                if text_start < index {
                    segments.push(Segment::Text(pattern[text_start..index].to_string()));
                }
                open = Some(index);
            }
            '}' => {
                let start = open.take().ok_or_else(|| {
                    SysError::invalid_pattern(pattern, format!("unbalanced '}}' at {}", index + 1))
                })?;
                segments.push(parse_range(pattern, &pattern[start + 1..index], start)?);
                text_start = index + 1;
            }
            _ => {}
        }
    }

    if let Some(start) = open {
        return Err(SysError::invalid_pattern(
            pattern,
            format!("unbalanced '{{' at {}", start + 1),
        ));
    }

    if text_start < pattern.len() {
        segments.push(Segment::Text(pattern[text_start..].to_string()));
    }

    Ok(segments)
}

/// Expands every `{A...B}` range in `pattern`, leftmost range varying slowest.
///
/// A pattern without ranges expands to itself. Patterns expanding to more than
/// [`MAX_EXPANSION`] names are rejected before anything is allocated.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    let segments = parse_segments(pattern)?;
    let total = segments
        .iter()
        .try_fold(1u64, |total, segment| total.checked_mul(segment.len()?))
        .filter(|total| *total <= MAX_EXPANSION);
    if total.is_none() {
        return Err(SysError::invalid_pattern(
            pattern,
            format!("expands to more than {MAX_EXPANSION} names"),
        ));
    }

    let mut names = vec![String::new()];
    for segment in &segments {
        let values = segment.values();
        names = names
            .iter()
            .flat_map(|prefix| values.iter().map(move |value| format!("{prefix}{value}")))
            .collect();
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn alpha_numbering_has_no_zero_digit() {
        assert_eq!(alpha_to_int("a"), Some(1));
        assert_eq!(alpha_to_int("z"), Some(26));
        assert_eq!(alpha_to_int("aa"), Some(27));
        assert_eq!(alpha_to_int("ba"), Some(53));
        assert_eq!(int_to_alpha(26), "z");
        assert_eq!(int_to_alpha(27), "aa");
        assert_eq!(int_to_alpha(52), "az");
        assert_eq!(int_to_alpha(53), "ba");
        assert_eq!(int_to_alpha(702), "zz");
        assert_eq!(int_to_alpha(703), "aaa");
    }

    #[test]
    fn expands_mixed_segments_in_odometer_order() {
        let names = expand("{a...c}p{0...2}9").expect("expand");
        assert_eq!(
            names,
            vec!["ap09", "ap19", "ap29", "bp09", "bp19", "bp29", "cp09", "cp19", "cp29"]
        );
    }

    #[test]
    fn expands_multi_letter_words_across_z() {
        let names = expand("node{y...ab}").expect("expand");
        assert_eq!(names, vec!["nodey", "nodez", "nodeaa", "nodeab"]);

        let names = expand("node{aa...bb}").expect("expand");
        assert_eq!(names.len(), 28);
        assert_eq!(names.first().map(String::as_str), Some("nodeaa"));
        assert_eq!(names.last().map(String::as_str), Some("nodebb"));
    }

    #[test]
    fn reversed_bounds_are_normalised() {
        assert_eq!(expand("sd{c...a}").expect("expand"), vec!["sda", "sdb", "sdc"]);
        assert_eq!(expand("{3...1}").expect("expand"), vec!["1", "2", "3"]);
    }

    #[test]
    fn plain_text_expands_to_itself() {
        assert_eq!(expand("/dev/sdb").expect("expand"), vec!["/dev/sdb"]);
        assert_eq!(expand("").expect("expand"), vec![""]);
    }

    #[test]
    fn output_size_is_product_and_distinct() {
        let names = expand("sd{a...f}{1...3}x{10...12}").expect("expand");
        assert_eq!(names.len(), 6 * 3 * 3);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn oversized_expansion_is_refused() {
        for pattern in ["/dev/sd{a...z}{0...99999}{0...99999}", "{0...18446744073709551615}"] {
            let err = expand(pattern).expect_err(pattern);
            assert!(matches!(err, SysError::InvalidPattern { .. }), "{pattern}: unexpected {err:?}");
        }
        assert_eq!(expand("{1...1000000}").expect("at the limit").len(), 1_000_000);
    }

    #[test]
    fn rejects_malformed_patterns() {
        for pattern in [
            "{a...{b...c}}",
            "sd{a...c",
            "sda}",
            "{a..c}",
            "{a}",
            "{a...b...c}",
            "{a...3}",
            "{A...C}",
            "{...3}",
            "{1...}",
        ] {
            let err = expand(pattern).expect_err(pattern);
            assert!(
                matches!(err, SysError::InvalidPattern { .. }),
                "{pattern}: unexpected {err:?}"
            );
        }
    }
}
