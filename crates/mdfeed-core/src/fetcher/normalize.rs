//! Symbol normalization: `NNNNNN.XX` with `XX` derived from the
//! 6-digit code's leading digit.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("could not extract a 6-digit security code from {0:?}")]
    NoCodeFound(String),

    #[error("unrecognized exchange prefix {0:?}")]
    UnrecognizedExchange(String),
}

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d{6})").unwrap())
}

/// Normalize a security identifier to canonical `NNNNNN.XX` form.
///
/// Accepts `600519`, `SH600519`, `600519SH`, `sh600519`, `000001.SZ`, and
/// any other single space-less token that embeds a 6-digit code.
pub fn normalize(code: &str) -> Result<String, NormalizeError> {
    let captures = code_pattern()
        .captures(code)
        .ok_or_else(|| NormalizeError::NoCodeFound(code.to_string()))?;
    let digits = &captures[1];

    let exchange = match digits.as_bytes()[0] {
        b'6' => "SH",
        b'0' | b'3' => "SZ",
        b'4' | b'8' | b'9' => "BJ",
        _ => return Err(NormalizeError::UnrecognizedExchange(digits.to_string())),
    };

    Ok(format!("{digits}.{exchange}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_input_forms() {
        for (input, expected) in [
            ("600519", "600519.SH"),
            ("SH600519", "600519.SH"),
            ("600519SH", "600519.SH"),
            ("sh600519", "600519.SH"),
            ("000001.SZ", "000001.SZ"),
        ] {
            assert_eq!(normalize(input).unwrap(), expected);
        }
    }

    #[test]
    fn exchange_mapping_covers_all_leading_digits() {
        assert_eq!(normalize("600000").unwrap(), "600000.SH");
        assert_eq!(normalize("000001").unwrap(), "000001.SZ");
        assert_eq!(normalize("300750").unwrap(), "300750.SZ");
        assert_eq!(normalize("430047").unwrap(), "430047.BJ");
        assert_eq!(normalize("830799").unwrap(), "830799.BJ");
        assert_eq!(normalize("920819").unwrap(), "920819.BJ");
    }

    #[test]
    fn unrecognized_prefix_is_a_parameter_error() {
        let err = normalize("712345").unwrap_err();
        assert!(matches!(err, NormalizeError::UnrecognizedExchange(_)));
    }

    #[test]
    fn missing_code_is_a_parameter_error() {
        let err = normalize("INVALID").unwrap_err();
        assert!(matches!(err, NormalizeError::NoCodeFound(_)));
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["600519", "SH600519", "000001.SZ", "830799"] {
            let once = normalize(input).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice);
        }
    }
}
