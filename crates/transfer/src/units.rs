use crate::TransferError;

const SUFFIXES: [char; 7] = ['B', 'K', 'M', 'G', 'T', 'P', 'E'];

/// Parses sizes like `"512"`, `"1.5M"`, `"2g"` (1024-based) into bytes.
pub fn parse_byte_size(value: &str) -> Result<u64, TransferError> {
    let value = value.trim();
    let invalid = || TransferError::InvalidByteSize(value.to_string());

    let last = value.chars().last().ok_or_else(invalid)?;
    let (digits, exponent) = if last.is_ascii_digit() {
        (value, 0)
    } else {
        let unit = last.to_ascii_uppercase();
        let exponent = SUFFIXES.iter().position(|&s| s == unit).ok_or_else(invalid)?;
        (&value[..value.len() - last.len_utf8()], exponent as i32)
    };

    let number: f64 = digits.trim().parse().map_err(|_| invalid())?;
    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }
    Ok((number * 1024f64.powi(exponent)) as u64)
}

/// Formats bytes as `"512B"`, `"1.5K"`, `"2.0M"`.
pub fn format_byte_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    for (i, suffix) in SUFFIXES.iter().enumerate() {
        let unit = 1024f64.powi(i as i32 + 1);
        if (bytes / unit * 1024.0).round() < 1024.0 || i == SUFFIXES.len() - 1 {
            let value = bytes / 1024f64.powi(i as i32);
            return if i == 0 {
                format!("{value:.0}{suffix}")
            } else {
                format!("{value:.1}{suffix}")
            };
        }
    }
    unreachable!("the last suffix always matches")
}
