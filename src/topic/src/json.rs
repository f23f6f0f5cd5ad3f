//! Helpers for the structured-document representations used on the wire:
//! canonical UUID strings and ISO-8601 durations.

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

pub fn uuid_to_value(id: Uuid) -> Value {
    Value::String(id.to_string())
}

pub fn uuid_from_value(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

/// Format a duration as an ISO-8601 duration string (e.g. `PT1M30S`).
pub fn duration_to_iso(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    let millis = duration.subsec_millis();

    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if millis > 0 {
        out.push_str(&format!("{}.{:03}S", seconds, millis));
    } else if seconds > 0 || out == "PT" {
        out.push_str(&format!("{}S", seconds));
    }
    out
}

/// Parse an ISO-8601 duration of the `PnDTnHnMnS` family.
///
/// Covers the subset produced by `duration_to_iso` plus day components;
/// years and months are rejected since they have no fixed length.
pub fn duration_from_iso(input: &str) -> Option<Duration> {
    let rest = input.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = Duration::ZERO;

    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else if c == 'D' {
            let days: u64 = number.parse().ok()?;
            total += Duration::from_secs(days * 86_400);
            number.clear();
        } else {
            return None;
        }
    }
    if !number.is_empty() {
        return None;
    }

    for c in time_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            match c {
                'H' => {
                    let hours: u64 = number.parse().ok()?;
                    total += Duration::from_secs(hours * 3600);
                }
                'M' => {
                    let minutes: u64 = number.parse().ok()?;
                    total += Duration::from_secs(minutes * 60);
                }
                'S' => {
                    let seconds: f64 = number.parse().ok()?;
                    if seconds < 0.0 {
                        return None;
                    }
                    total += Duration::from_secs_f64(seconds);
                }
                _ => return None,
            }
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(uuid_from_value(&uuid_to_value(id)), Some(id));
        assert_eq!(uuid_from_value(&Value::String("nope".into())), None);
        assert_eq!(uuid_from_value(&Value::Null), None);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(duration_to_iso(Duration::ZERO), "PT0S");
        assert_eq!(duration_to_iso(Duration::from_secs(60)), "PT1M");
        assert_eq!(duration_to_iso(Duration::from_secs(90)), "PT1M30S");
        assert_eq!(duration_to_iso(Duration::from_secs(3600)), "PT1H");
        assert_eq!(duration_to_iso(Duration::from_millis(1500)), "PT1.500S");
        assert_eq!(duration_to_iso(Duration::from_secs(3661)), "PT1H1M1S");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(duration_from_iso("PT0S"), Some(Duration::ZERO));
        assert_eq!(duration_from_iso("PT1M30S"), Some(Duration::from_secs(90)));
        assert_eq!(duration_from_iso("P1DT1H"), Some(Duration::from_secs(90_000)));
        assert_eq!(duration_from_iso("PT1.500S"), Some(Duration::from_millis(1500)));
        assert_eq!(duration_from_iso("1M"), None);
        assert_eq!(duration_from_iso("PT1W"), None);
        assert_eq!(duration_from_iso("PT5"), None);
    }

    #[test]
    fn duration_round_trip() {
        for secs in [0u64, 1, 59, 60, 61, 3599, 3600, 86_461] {
            let d = Duration::from_secs(secs);
            assert_eq!(duration_from_iso(&duration_to_iso(d)), Some(d));
        }
    }
}
