use crate::error::CorralError;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;
const TIB: u64 = 1024 * 1024 * 1024 * 1024;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ bytes).
pub fn parse_size(s: &str) -> Result<u64, CorralError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CorralError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| CorralError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => KIB,
        "M" | "MB" => MIB,
        "G" | "GB" => GIB,
        "T" | "TB" => TIB,
        _ => {
            return Err(CorralError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| CorralError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Render a byte count with the largest binary unit that divides it cleanly
/// enough to stay readable. Used by the `list` table.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0".into();
    }
    for (unit, label) in [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")] {
        if bytes >= unit {
            let whole = bytes / unit;
            let tenths = (bytes % unit) * 10 / unit;
            return if tenths == 0 {
                format!("{whole} {label}")
            } else {
                format!("{whole}.{tenths} {label}")
            };
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_binary_units() {
        assert_eq!(parse_size("20G").unwrap(), 20 * GIB);
        assert_eq!(parse_size("1GB").unwrap(), GIB);
        assert_eq!(parse_size("512M").unwrap(), 512 * MIB);
        assert_eq!(parse_size("100K").unwrap(), 100 * KIB);
    }

    #[test]
    fn parse_size_plain_bytes() {
        assert_eq!(parse_size("1073741824").unwrap(), GIB);
    }

    #[test]
    fn parse_size_rejects_empty_and_bad_suffix() {
        assert!(parse_size("").is_err());
        assert!(parse_size("10X").is_err());
    }

    #[test]
    fn format_size_picks_unit() {
        assert_eq!(format_size(0), "0");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2 * GIB), "2 GiB");
        assert_eq!(format_size(GIB + GIB / 2), "1.5 GiB");
        assert_eq!(format_size(640 * MIB), "640 MiB");
    }
}
