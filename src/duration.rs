use std::fmt::{Display, Formatter};
use std::time::Duration;

const MILLISECOND: u64 = 1;
const SECOND: u64 = 1000 * MILLISECOND;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseDurationError {
    InvalidDuration,
    MissingUnit,
    UnknownUnit,
}

impl Display for ParseDurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseDurationError::InvalidDuration => f.write_str("invalid duration"),
            ParseDurationError::MissingUnit => f.write_str("missing unit in duration"),
            ParseDurationError::UnknownUnit => f.write_str("unknown unit in duration"),
        }
    }
}

impl std::error::Error for ParseDurationError {}

/// Parses a Prometheus style duration string, a sequence of decimal numbers
/// with unit suffixes, such as "30s", "2h45m" or "1d".
pub fn parse_duration(text: &str) -> Result<Duration, ParseDurationError> {
    let mut total = 0u64;
    let mut s = text.as_bytes();

    if s.is_empty() {
        return Err(ParseDurationError::InvalidDuration);
    }
    if s == b"0" {
        return Ok(Duration::ZERO);
    }

    while !s.is_empty() {
        let digits = s.iter().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(ParseDurationError::InvalidDuration);
        }

        let value = std::str::from_utf8(&s[..digits])
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or(ParseDurationError::InvalidDuration)?;
        s = &s[digits..];

        let unit_len = s.iter().take_while(|c| !c.is_ascii_digit()).count();
        if unit_len == 0 {
            return Err(ParseDurationError::MissingUnit);
        }

        let unit = match &s[..unit_len] {
            b"ms" => MILLISECOND,
            b"s" => SECOND,
            b"m" => MINUTE,
            b"h" => HOUR,
            b"d" => DAY,
            _ => return Err(ParseDurationError::UnknownUnit),
        };
        s = &s[unit_len..];

        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or(ParseDurationError::InvalidDuration)?;
    }

    Ok(Duration::from_millis(total))
}

/// Formats a duration the way [`parse_duration`] reads it, largest unit
/// first, zero components skipped.
pub fn format_duration(duration: Duration) -> String {
    let mut remain = duration.as_millis() as u64;
    if remain == 0 {
        return "0s".into();
    }

    let mut out = String::new();
    for (value, suffix) in [
        (DAY, "d"),
        (HOUR, "h"),
        (MINUTE, "m"),
        (SECOND, "s"),
        (MILLISECOND, "ms"),
    ] {
        if remain >= value {
            out.push_str(&format!("{}{}", remain / value, suffix));
            remain %= value;
        }
    }

    out
}

/// Serialize/deserialize `std::time::Duration` as a duration string, for
/// `#[serde(with = "duration::serde")]`.
pub mod serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse() {
        let tests = [
            ("0", Duration::ZERO),
            ("5s", Duration::from_secs(5)),
            ("30s", Duration::from_secs(30)),
            ("1478s", Duration::from_secs(1478)),
            ("100ms", Duration::from_millis(100)),
            ("15m", Duration::from_secs(15 * 60)),
            ("16h", Duration::from_secs(16 * 3600)),
            ("3h30m", Duration::from_secs(3 * 3600 + 30 * 60)),
            ("1d12h", Duration::from_secs(36 * 3600)),
            ("1m30s500ms", Duration::from_millis(90_500)),
        ];

        for (input, want) in tests {
            assert_eq!(parse_duration(input).unwrap(), want, "input: {input}");
        }
    }

    #[test]
    fn parse_invalid() {
        assert_eq!(parse_duration(""), Err(ParseDurationError::InvalidDuration));
        assert_eq!(parse_duration("30"), Err(ParseDurationError::MissingUnit));
        assert_eq!(parse_duration("30x"), Err(ParseDurationError::UnknownUnit));
        assert_eq!(parse_duration("s"), Err(ParseDurationError::InvalidDuration));
        assert_eq!(
            parse_duration("-5s"),
            Err(ParseDurationError::InvalidDuration)
        );
    }

    #[test]
    fn format() {
        let tests = [
            (Duration::ZERO, "0s"),
            (Duration::from_secs(30), "30s"),
            (Duration::from_secs(90), "1m30s"),
            (Duration::from_secs(3 * 3600 + 30 * 60), "3h30m"),
            (Duration::from_millis(90_500), "1m30s500ms"),
        ];

        for (input, want) in tests {
            assert_eq!(format_duration(input), want);
        }
    }

    #[test]
    fn round_trip_through_serde() {
        // `use super::*` pulls in the local `serde` module, the crate needs
        // the leading `::`
        #[derive(::serde::Deserialize, ::serde::Serialize)]
        struct Wrapper {
            #[serde(with = "super::serde")]
            interval: Duration,
        }

        let wrapper = serde_yaml::from_str::<Wrapper>("interval: 2m30s").unwrap();
        assert_eq!(wrapper.interval, Duration::from_secs(150));

        let out = serde_yaml::to_string(&wrapper).unwrap();
        assert_eq!(out.trim(), "interval: 2m30s");
    }
}
