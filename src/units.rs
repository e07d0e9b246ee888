//! Suffixed size/rate parsing and human-readable quantity formatting.

/// Parse a byte count with an optional binary suffix: `10M` or `10MB` is
/// 10 MiB. Bare numbers are bytes.
pub fn parse_size(s: &str) -> Option<u64> {
    let (value, suffix) = split_suffix(s)?;
    let factor = match suffix {
        None => 1.0,
        Some('k') => 1024.0,
        Some('m') => 1024.0 * 1024.0,
        Some('g') => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor) as u64)
}

/// Parse a bit rate with an optional decimal suffix: `1M` is 1_000_000 bits/s.
pub fn parse_rate(s: &str) -> Option<u64> {
    let (value, suffix) = split_suffix(s)?;
    let factor = match suffix {
        None => 1.0,
        Some('k') => 1e3,
        Some('m') => 1e6,
        Some('g') => 1e9,
        _ => return None,
    };
    Some((value * factor) as u64)
}

fn split_suffix(s: &str) -> Option<(f64, Option<char>)> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let value: f64 = s[..digits_end].parse().ok()?;
    let suffix = s[digits_end..].chars().next().map(|c| c.to_ascii_lowercase());
    Some((value, suffix))
}

/// Valid `-f` format characters
pub fn valid_format(c: char) -> bool {
    matches!(c, 'k' | 'K' | 'm' | 'M' | 'g' | 'G' | 'a' | 'A')
}

const BIT_LABELS: [&str; 4] = ["bits", "Kbits", "Mbits", "Gbits"];
const BYTE_LABELS: [&str; 4] = ["Bytes", "KBytes", "MBytes", "GBytes"];

fn scaled(value: f64, base: f64, labels: &[&str; 4], exp: Option<usize>) -> String {
    let (value, label) = match exp {
        Some(e) => (value / base.powi(e as i32), labels[e]),
        None => {
            let mut v = value;
            let mut e = 0;
            while v.abs() >= base && e < labels.len() - 1 {
                v /= base;
                e += 1;
            }
            (v, labels[e])
        }
    };
    if value.abs() < 10.0 {
        format!("{:.2} {}", value, label)
    } else if value.abs() < 100.0 {
        format!("{:.1} {}", value, label)
    } else {
        format!("{:.0} {}", value, label)
    }
}

/// Format a transfer amount in bytes, scale chosen adaptively.
pub fn format_bytes(bytes: f64) -> String {
    scaled(bytes, 1024.0, &BYTE_LABELS, None)
}

/// Format a bandwidth figure according to the `-f` format character:
/// lower-case renders bits (decimal scale), upper-case bytes (binary scale),
/// `a`/`A` pick the scale adaptively.
pub fn format_rate(bytes_per_sec: f64, format: char) -> String {
    let quantity = match format {
        'k' | 'm' | 'g' | 'a' => scaled(
            bytes_per_sec * 8.0,
            1000.0,
            &BIT_LABELS,
            match format {
                'k' => Some(1),
                'm' => Some(2),
                'g' => Some(3),
                _ => None,
            },
        ),
        _ => scaled(
            bytes_per_sec,
            1024.0,
            &BYTE_LABELS,
            match format {
                'K' => Some(1),
                'M' => Some(2),
                'G' => Some(3),
                _ => None,
            },
        ),
    };
    format!("{}/sec", quantity)
}
