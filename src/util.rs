use crate::error::CfdevError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Parse a memory amount like `"8G"`, `"4096M"` or `"4096"` into mebibytes.
///
/// A bare number is already in MiB, matching `memory_mb` in the config file.
/// Other suffixes use binary units and must resolve to a whole number of MiB.
pub fn parse_memory_mb(s: &str) -> Result<u64, CfdevError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CfdevError::Validation {
            message: "memory size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.trim().parse().map_err(|_| CfdevError::Validation {
        message: format!("invalid memory size: '{s}'"),
    })?;

    let bytes_per_unit = match suffix.as_str() {
        "" | "M" | "MB" => MIB,
        "K" | "KB" => KIB,
        "G" | "GB" => GIB,
        "T" | "TB" => TIB,
        _ => {
            return Err(CfdevError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use K, M, G or T)"),
            });
        }
    };

    let bytes = num
        .checked_mul(bytes_per_unit)
        .ok_or_else(|| CfdevError::Validation {
            message: format!("memory size overflows: '{s}'"),
        })?;

    if bytes % MIB != 0 {
        return Err(CfdevError::Validation {
            message: format!("memory size must be a whole number of MiB: '{s}'"),
        });
    }
    Ok(bytes / MIB)
}

/// Human-readable byte count, e.g. `1.5 GB`.
pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_mebibytes() {
        assert_eq!(parse_memory_mb("4096").unwrap(), 4096);
        assert_eq!(parse_memory_mb("512M").unwrap(), 512);
    }

    #[test]
    fn gibibytes_convert() {
        assert_eq!(parse_memory_mb("8G").unwrap(), 8192);
        assert_eq!(parse_memory_mb("2gb").unwrap(), 2048);
        assert_eq!(parse_memory_mb("1T").unwrap(), 1024 * 1024);
    }

    #[test]
    fn rejects_partial_mebibytes() {
        assert!(parse_memory_mb("100K").is_err());
        assert_eq!(parse_memory_mb("1024K").unwrap(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_mb("").is_err());
        assert!(parse_memory_mb("lots").is_err());
        assert!(parse_memory_mb("10X").is_err());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
