use crate::error::AppError;

/// Parse a size with an optional binary unit, e.g. `8MB`, `512k`, `1.5GiB`.
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_lowercase();
    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    let split = size_str
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(size_str.len());
    let (numeric_part, unit_part) = size_str.split_at(split);

    if unit_part.is_empty() {
        return numeric_part
            .parse::<u64>()
            .map_err(|_| AppError::ParseError(format!("Invalid number: {numeric_part}")));
    }

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number: {numeric_part}")))?;

    let multiplier: u64 = match unit_part.trim() {
        "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        unit => return Err(AppError::ParseError(format!("Invalid unit: {unit}"))),
    };
    Ok((value * multiplier as f64) as u64)
}

/// Parse a half-open `START-END` byte range. Either side takes a unit.
pub fn parse_range(range_str: &str) -> Result<(u64, u64), AppError> {
    let Some((start, end)) = range_str.split_once('-') else {
        return Err(AppError::ParseError(format!(
            "Invalid range '{range_str}'. Expected START-END"
        )));
    };
    let start = parse_size(start)?;
    let end = parse_size(end)?;
    if start >= end {
        return Err(AppError::InvalidInput(format!(
            "Range start {start} must be below end {end}"
        )));
    }
    Ok((start, end))
}

/// Convert bytes to a human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("8MB").unwrap(), 8 << 20);
        assert_eq!(parse_size(" 512k ").unwrap(), 512 << 10);
        assert_eq!(parse_size("1.5GiB").unwrap(), 3 << 29);
        assert!(parse_size("").is_err());
        assert!(parse_size("12parsecs").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("0-1024").unwrap(), (0, 1024));
        assert_eq!(parse_range("8MB-16MB").unwrap(), (8 << 20, 16 << 20));
        assert!(parse_range("100").is_err());
        assert!(parse_range("20-10").is_err());
        assert!(parse_range("5-5").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(20 << 20), "20.00 MB");
        assert_eq!(format_bytes(3 << 30), "3.00 GB");
    }
}
