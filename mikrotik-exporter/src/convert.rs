//! Value conversions applied between a raw device field and a gauge value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A named conversion from a raw field value to a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Conversion {
    /// RouterOS duration text (`2w3d4h5m6s`, `04:05:06`) to seconds.
    Uptime,
    /// Truthy status words to 1, everything else to 0.
    Boolean,
    /// Unrecognised name. Every value converts to 0.
    Unknown(String),
}

impl Conversion {
    pub fn as_str(&self) -> &str {
        match self {
            Conversion::Uptime => "uptime",
            Conversion::Boolean => "boolean",
            Conversion::Unknown(name) => name,
        }
    }
}

impl From<String> for Conversion {
    fn from(value: String) -> Self {
        match value.as_str() {
            "uptime" => Conversion::Uptime,
            "boolean" => Conversion::Boolean,
            _ => Conversion::Unknown(value),
        }
    }
}

impl From<Conversion> for String {
    fn from(value: Conversion) -> Self {
        match value {
            Conversion::Unknown(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// Apply `conversion` to a raw value. Never fails.
pub fn convert(conversion: &Conversion, raw: &Value) -> f64 {
    match conversion {
        Conversion::Uptime => match raw {
            Value::String(s) => parse_uptime(s),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        },
        Conversion::Boolean => match raw {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::String(s) => {
                let truthy = matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "true" | "yes" | "up" | "running" | "enabled"
                );
                f64::from(u8::from(truthy))
            }
            Value::Number(n) => f64::from(u8::from(n.as_f64().is_some_and(|v| v != 0.0))),
            _ => 0.0,
        },
        Conversion::Unknown(name) => {
            warn!(conversion = %name, "Unknown conversion, reporting 0");
            0.0
        }
    }
}

/// Parse a RouterOS duration into seconds.
///
/// Each digit run is scaled by the unit that follows it (`w`, `d`, `h`, `m`,
/// `s`, `ms`). A trailing `hh:mm:ss` clock is read right to left. A number
/// with no unit counts as seconds. Text before the first digit is ignored.
pub fn parse_uptime(text: &str) -> f64 {
    const CLOCK: [f64; 3] = [1.0, 60.0, 3600.0];

    let mut total = 0.0;
    let mut clock: Vec<f64> = Vec::new();

    for (number, unit) in tokens(text) {
        let unit = unit.trim().to_ascii_lowercase();
        if unit.starts_with(':') || (unit.is_empty() && !clock.is_empty()) {
            clock.push(number);
            continue;
        }

        let scale = match unit.as_str() {
            "" | "s" => 1.0,
            "ms" => 0.001,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86_400.0,
            "w" => 604_800.0,
            _ => match unit.chars().next() {
                Some('w') => 604_800.0,
                Some('d') => 86_400.0,
                Some('h') => 3600.0,
                Some('m') => 60.0,
                _ => 1.0,
            },
        };
        total += number * scale;
    }

    for (value, scale) in clock.iter().rev().zip(CLOCK) {
        total += value * scale;
    }

    total
}

/// Split text into (digit run, following non-digit run) pairs.
fn tokens(text: &str) -> Vec<(f64, &str)> {
    let mut out = Vec::new();
    let mut rest = text.trim_start_matches(|c: char| !c.is_ascii_digit());

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (digits, tail) = rest.split_at(digits_end);
        let unit_end = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        if let Ok(number) = digits.parse::<f64>() {
            out.push((number, unit));
        }
        rest = next;
    }

    out
}

/// Default coercion when no conversion is configured.
///
/// Numbers pass through, numeric strings are parsed, and `true`/`yes` and
/// `false`/`no` map to 1 and 0. Anything else yields `None`.
pub fn coerce(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::String(s) => {
            let s = s.trim();
            match s.to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(1.0),
                "false" | "no" => Some(0.0),
                _ => s.parse::<f64>().ok().filter(|v| v.is_finite()),
            }
        }
        _ => None,
    }
}

/// The gauge value for a raw field: converted when a conversion is set,
/// coerced otherwise.
pub fn observe(conversion: Option<&Conversion>, raw: &Value) -> Option<f64> {
    match conversion {
        Some(conversion) => Some(convert(conversion, raw)),
        None => coerce(raw),
    }
}
