//! Duration grammar for moderation commands.
//!
//! Accepts concatenated integer-unit pairs (`2h30m`, `3d12h`), an optional
//! sign prefix, and the units `ns us ms s m|min h d w M y`. No fractional
//! values. Internally everything is signed nanoseconds so negative spans
//! survive the round trip.

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

const SECOND: i64 = NANOS_PER_SEC;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

fn unit_value(unit: &str) -> Option<i64> {
    match unit {
        "ns" => Some(1),
        "us" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(SECOND),
        "m" | "min" => Some(MINUTE),
        "h" => Some(HOUR),
        "d" => Some(DAY),
        "w" => Some(WEEK),
        "M" => Some(MONTH),
        "y" => Some(YEAR),
        _ => None,
    }
}

/// Parse a duration string into nanoseconds.
pub fn parse(s: &str) -> Result<i64, String> {
    if s.is_empty() || s == "0" {
        return Ok(0);
    }

    let mut rest = s;
    let mut neg = false;
    if let Some(stripped) = rest.strip_prefix('-') {
        neg = true;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }

    let mut accum: i64 = 0;
    while !rest.is_empty() {
        let num_len = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if num_len == 0 {
            return Err(format!("expected a number at '{rest}'"));
        }
        let val: i64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("number out of range at '{rest}'"))?;
        rest = &rest[num_len..];

        let unit_len = rest.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
        if unit_len == 0 {
            return Err(format!("missing unit after {val}"));
        }
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let u = unit_value(unit).ok_or_else(|| format!("bad unit: {unit}"))?;
        accum = accum.saturating_add(val.saturating_mul(u));
    }

    Ok(if neg { -accum } else { accum })
}

/// Render a duration the way moderation replies expect (`1h30m`, `2d`, ...).
pub fn format(mut nanos: i64) -> String {
    if nanos == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    if nanos < 0 {
        out.push('-');
        nanos = nanos.saturating_abs();
    }

    for (unit, size) in [
        ("y", YEAR),
        ("M", MONTH),
        ("w", WEEK),
        ("d", DAY),
        ("h", HOUR),
        ("m", MINUTE),
        ("s", SECOND),
        ("ms", 1_000_000),
        ("us", 1_000),
        ("ns", 1),
    ] {
        let q = nanos / size;
        if q != 0 {
            out.push_str(&q.to_string());
            out.push_str(unit);
            nanos -= q * size;
        }
    }
    out
}

pub fn to_secs(nanos: i64) -> i64 {
    nanos / NANOS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse("5s").unwrap(), 5 * SECOND);
        assert_eq!(parse("10min").unwrap(), 10 * MINUTE);
        assert_eq!(parse("2h").unwrap(), 2 * HOUR);
        assert_eq!(parse("1y").unwrap(), YEAR);
    }

    #[test]
    fn parses_concatenations() {
        assert_eq!(parse("2h30m").unwrap(), 2 * HOUR + 30 * MINUTE);
        assert_eq!(parse("3d12h").unwrap(), 3 * DAY + 12 * HOUR);
        assert_eq!(parse("1w2d3h4m5s").unwrap(), WEEK + 2 * DAY + 3 * HOUR + 4 * MINUTE + 5 * SECOND);
    }

    #[test]
    fn parses_signs_and_zero() {
        assert_eq!(parse("-1h").unwrap(), -HOUR);
        assert_eq!(parse("+45s").unwrap(), 45 * SECOND);
        assert_eq!(parse("0").unwrap(), 0);
        assert_eq!(parse("").unwrap(), 0);
    }

    #[test]
    fn rejects_fractions_and_bad_units() {
        assert!(parse("5.5h").is_err());
        assert!(parse("10").is_err());
        assert!(parse("h").is_err());
        assert!(parse("3parsecs").is_err());
    }

    #[test]
    fn formats_round_trip() {
        for s in ["2h30m", "3d12h", "1y2M", "45s", "-1h"] {
            let n = parse(s).unwrap();
            assert_eq!(parse(&format(n)).unwrap(), n, "through {s}");
        }
        assert_eq!(format(0), "0s");
        assert_eq!(format(90 * MINUTE), "1h30m");
    }
}
