//! Resource quantity encoding: decimal numbers with unit suffixes, as used
//! by the platform ("100m", "2Gi", "1.5G", "500").

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("negative quantity {0:?}")]
    Negative(String),
}

/// Parses a quantity into base units. Binary suffixes (Ki, Mi, Gi, Ti, Pi)
/// multiply by powers of 1024; decimal suffixes (k, M, G, T, P) by powers of
/// 1000; `m` divides by 1000.
pub fn parse_quantity(s: &str) -> Result<f64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (number, multiplier) = split_suffix(s)?;
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(s.to_string()))?;
    if value < 0.0 {
        return Err(QuantityError::Negative(s.to_string()));
    }
    Ok(value * multiplier)
}

/// Parses a CPU quantity into millicores: "2" -> 2000, "100m" -> 100.
pub fn parse_cpu_millis(s: &str) -> Result<f64, QuantityError> {
    Ok(parse_quantity(s)? * 1000.0)
}

fn split_suffix(s: &str) -> Result<(&str, f64), QuantityError> {
    for (suffix, multiplier) in [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0_f64.powi(4)),
        ("Pi", 1024.0_f64.powi(5)),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ] {
        if let Some(number) = s.strip_suffix(suffix) {
            if number.is_empty() {
                return Err(QuantityError::Invalid(s.to_string()));
            }
            return Ok((number, multiplier));
        }
    }
    Ok((s, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(parse_quantity("4").unwrap(), 4.0);
        assert_eq!(parse_quantity("0").unwrap(), 0.0);
        assert_eq!(parse_quantity("1.5").unwrap(), 1.5);
    }

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(parse_quantity("2Gi").unwrap(), 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(parse_quantity("512Mi").unwrap(), 512.0 * 1024.0 * 1024.0);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024.0);
    }

    #[test]
    fn test_decimal_suffixes() {
        assert_eq!(parse_quantity("1k").unwrap(), 1000.0);
        assert_eq!(parse_quantity("2G").unwrap(), 2e9);
    }

    #[test]
    fn test_cpu_millis() {
        assert_eq!(parse_cpu_millis("2").unwrap(), 2000.0);
        assert_eq!(parse_cpu_millis("100m").unwrap(), 100.0);
        assert_eq!(parse_cpu_millis("1.5").unwrap(), 1500.0);
    }

    #[test]
    fn test_invalid() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("abc").is_err());
        assert_eq!(
            parse_quantity("-1"),
            Err(QuantityError::Negative("-1".to_string()))
        );
    }
}
