//! .NET JSON date decoding
//!
//! `ConvertTo-Json` in Windows PowerShell renders `DateTime` values with the
//! legacy ASP.NET encoding `"\/Date(<epoch-millis>)\/"`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::fmt;

use super::{ParseError, ParseResult};

/// Matches the raw JSON literal, escaped slashes and quotes included.
static DOTNET_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"\\/Date\((\d+)\)\\/"$"#).expect("Invalid dotnet date regex"));

/// A timestamp decoded from a .NET JSON date.
///
/// `null` and `""` decode to the zero value, which holds no timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DotnetTime(pub Option<DateTime<Utc>>);

impl DotnetTime {
    /// Parses the raw JSON text of a date value.
    pub fn parse_json(raw: &str) -> ParseResult<Self> {
        let raw = raw.trim();
        if raw == "null" || raw == r#""""# {
            return Ok(Self::default());
        }

        let millis = DOTNET_DATE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .ok_or_else(|| invalid(raw, "expected \"\\/Date(<millis>)\\/\""))?
            .as_str()
            .parse::<i64>()
            .map_err(|e| invalid(raw, &e.to_string()))?;

        let time = DateTime::from_timestamp(millis / 1000, 0)
            .ok_or_else(|| invalid(raw, "timestamp out of range"))?;

        Ok(Self(Some(time)))
    }

    /// True for the zero value produced by `null` or `""`.
    pub fn is_zero(&self) -> bool {
        self.0.is_none()
    }

    /// The decoded timestamp, if any.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.0
    }
}

fn invalid(input: &str, reason: &str) -> ParseError {
    ParseError::DotnetTime {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

impl From<DateTime<Utc>> for DotnetTime {
    fn from(t: DateTime<Utc>) -> Self {
        Self(Some(t))
    }
}

impl fmt::Display for DotnetTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(t) => write!(f, "{}", t.to_rfc3339()),
            None => Ok(()),
        }
    }
}

// The escape check needs the undecoded JSON text, so this only works with
// serde_json's deserializer.
impl<'de> Deserialize<'de> for DotnetTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Self::parse_json(raw.get()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_reference_date() {
        let t = DotnetTime::parse_json(r#""\/Date(1701379505092)\/""#).unwrap();
        assert_eq!(
            t.time(),
            Some(Utc.with_ymd_and_hms(2023, 11, 30, 21, 25, 5).unwrap())
        );
    }

    #[test]
    fn test_null_and_empty_are_zero() {
        assert!(DotnetTime::parse_json("null").unwrap().is_zero());
        assert!(DotnetTime::parse_json(r#""""#).unwrap().is_zero());
        assert_eq!(DotnetTime::default().to_string(), "");
    }

    #[test]
    fn test_malformed_dates_are_rejected() {
        for bad in [
            r#""/Date(1701379505092)/""#,
            r#""\/Date(abc)\/""#,
            r#""\/Date(-5)\/""#,
            r#""\/Date()\/""#,
            r#"\/Date(1701379505092)\/"#,
            r#"'\/Date(1701379505092)\/'"#,
            r#""\/Date(1701379505092)\/" "x""#,
            "1701379505092",
            r#""2023-11-30T21:25:05Z""#,
        ] {
            assert!(
                matches!(DotnetTime::parse_json(bad), Err(ParseError::DotnetTime { .. })),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_millis_are_truncated() {
        let t = DotnetTime::parse_json(r#""\/Date(1999)\/""#).unwrap();
        assert_eq!(t.time().unwrap().timestamp(), 1);
    }

    #[test]
    fn test_overflowing_millis() {
        let raw = r#""\/Date(99999999999999999999999)\/""#;
        assert!(DotnetTime::parse_json(raw).is_err());
    }

    #[test]
    fn test_deserialize_in_struct() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(rename = "Created")]
            created: DotnetTime,
            #[serde(rename = "Expires")]
            expires: DotnetTime,
        }

        let row: Row =
            serde_json::from_str(r#"{"Created": "\/Date(0)\/", "Expires": null}"#).unwrap();
        assert_eq!(row.created.time().unwrap().timestamp(), 0);
        assert!(row.expires.is_zero());
    }
}
