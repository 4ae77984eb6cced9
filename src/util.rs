use std::time::SystemTime;

use crate::error::SnapError;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ = 1,073,741,824 bytes).
pub fn parse_size(s: &str) -> Result<u64, SnapError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SnapError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.trim().parse().map_err(|_| SnapError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(SnapError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| SnapError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Parse a size string into whole mebibytes, the unit the snapshot API uses.
/// Bare numbers are taken as MB already.
pub fn parse_size_mb(s: &str) -> Result<u64, SnapError> {
    if s.trim().chars().all(|c| c.is_ascii_digit()) && !s.trim().is_empty() {
        return parse_size(s);
    }
    let bytes = parse_size(s)?;
    let mb = bytes / (1024 * 1024);
    if mb == 0 {
        return Err(SnapError::Validation {
            message: format!("size must be at least 1M (got '{}')", s.trim()),
        });
    }
    Ok(mb)
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Civil (year, month, day, hour, minute, second) from unix seconds.
fn civil_from_unix(secs: u64) -> (i64, u64, u64, u64, u64, u64) {
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    (y, m, d, hours, minutes, seconds)
}

/// ISO-8601 UTC timestamp, e.g. `2026-10-16T09:30:00Z`.
pub fn iso8601(secs: u64) -> String {
    let (y, m, d, hh, mm, ss) = civil_from_unix(secs);
    format!("{y:04}-{m:02}-{d:02}T{hh:02}:{mm:02}:{ss:02}Z")
}

/// Filename-safe UTC timestamp `YYYY-MM-DDTHH-MM-SS.mmm` for the current time.
pub fn utc_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let (y, m, d, hh, mm, ss) = civil_from_unix(now.as_secs());
    let ms = now.subsec_millis();
    format!("{y:04}-{m:02}-{d:02}T{hh:02}-{mm:02}-{ss:02}.{ms:03}")
}
