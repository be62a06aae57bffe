//! CIM value decoding
//!
//! Cmdlets built on CIM classes (DHCP, DNS) serialize a few property types in
//! shapes that need custom handling:
//!
//! - durations as objects with `Days`/`Hours`/`Minutes`/`Seconds`/`Milliseconds`
//! - class qualifiers as a `key = value` blob, sometimes wrapped in an array
//! - IPv4 addresses as a bare little-endian integer
//!
//! Like `DotnetTime`, every type here decodes `null` to its zero value, so an
//! unset property needs no `Option` wrapper.

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Deref;

use super::{ParseError, ParseResult};

// ============================================================================
// CimTimeDuration
// ============================================================================

/// Duration components as `ConvertTo-Json` renders a `TimeSpan`.
///
/// `Ticks`, `TotalDays` and the other derived fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DurationParts {
    #[serde(default)]
    days: i64,
    #[serde(default)]
    hours: i64,
    #[serde(default)]
    minutes: i64,
    #[serde(default)]
    seconds: i64,
    #[serde(default)]
    milliseconds: i64,
}

impl DurationParts {
    /// Weighted sum in milliseconds. Components are not range checked.
    fn total_millis(&self) -> Option<i64> {
        let days = self.days.checked_mul(86_400_000)?;
        let hours = self.hours.checked_mul(3_600_000)?;
        let minutes = self.minutes.checked_mul(60_000)?;
        let seconds = self.seconds.checked_mul(1_000)?;

        days.checked_add(hours)?
            .checked_add(minutes)?
            .checked_add(seconds)?
            .checked_add(self.milliseconds)
    }

    fn into_duration(self) -> ParseResult<CimTimeDuration> {
        self.total_millis()
            .and_then(Duration::try_milliseconds)
            .map(CimTimeDuration)
            .ok_or_else(|| ParseError::CimDuration(format!("{:?} overflows a duration", self)))
    }
}

/// A duration decoded from a CIM/`TimeSpan` JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CimTimeDuration(pub Duration);

impl Default for CimTimeDuration {
    fn default() -> Self {
        Self(Duration::zero())
    }
}

impl CimTimeDuration {
    /// Parses the JSON text of a duration object. `null` is a zero duration.
    pub fn parse_json(raw: &str) -> ParseResult<Self> {
        let parts: Option<DurationParts> =
            serde_json::from_str(raw).map_err(|e| ParseError::CimDuration(e.to_string()))?;
        parts.unwrap_or_default().into_duration()
    }

    /// The wrapped duration.
    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for CimTimeDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<DurationParts>::deserialize(deserializer)?
            .unwrap_or_default()
            .into_duration()
            .map_err(D::Error::custom)
    }
}

// ============================================================================
// CimClassKeyVal
// ============================================================================

/// One `key = value` token. The value is double-quoted, single-quoted or bare.
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)'|(\S+))"#).expect("Invalid key/value regex")
});

/// Properties decoded from a CIM class qualifier blob such as
/// `dynamic = True provider = "DnsServerPSProvider"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CimClassKeyVal(pub HashMap<String, String>);

impl CimClassKeyVal {
    /// Tokenizes a blob. Text that is not part of a `key = value` token is skipped.
    pub fn parse_blob(blob: &str) -> Self {
        let map = KEY_VALUE
            .captures_iter(blob)
            .filter_map(|caps| {
                let key = caps.get(1)?.as_str().to_string();
                let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?;
                Some((key, value.as_str().to_string()))
            })
            .collect();
        Self(map)
    }

    /// Parses the JSON text of a blob: a string, a one-element array holding a
    /// string, or an empty value.
    pub fn parse_json(raw: &str) -> ParseResult<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ParseError::CimKeyVal(e.to_string()))?;
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> ParseResult<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(s) => Ok(Self::parse_blob(s)),
            Value::Array(items) => match items.as_slice() {
                [] => Ok(Self::default()),
                [Value::String(s)] => Ok(Self::parse_blob(s)),
                [Value::Null] => Ok(Self::default()),
                [other] => Err(ParseError::CimKeyVal(format!(
                    "expected a string inside the array, got {}",
                    other
                ))),
                _ => Err(ParseError::CimKeyVal(format!(
                    "expected a one-element array, got {} elements",
                    items.len()
                ))),
            },
            other => Err(ParseError::CimKeyVal(format!(
                "expected a string or array, got {}",
                other
            ))),
        }
    }

    /// Looks up a single property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl Deref for CimClassKeyVal {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for CimClassKeyVal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}

// ============================================================================
// CimIpAddress
// ============================================================================

/// An IPv4 address encoded as a little-endian 32-bit JSON integer.
///
/// `861627402` is `0x335B640A`, read low byte first as `10.100.91.51`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CimIpAddress(pub Ipv4Addr);

impl Default for CimIpAddress {
    fn default() -> Self {
        Self(Ipv4Addr::UNSPECIFIED)
    }
}

impl CimIpAddress {
    /// Converts the integer form. Values above `u32::MAX` are rejected.
    pub fn from_integer(n: u64) -> ParseResult<Self> {
        let n = u32::try_from(n).map_err(|_| ParseError::CimIpAddress {
            input: n.to_string(),
            reason: "value does not fit in 32 bits".to_string(),
        })?;
        Ok(Self(Ipv4Addr::from(n.to_le_bytes())))
    }

    /// Parses the JSON text of an address: a bare integer, or `null` for
    /// `0.0.0.0`.
    pub fn parse_json(raw: &str) -> ParseResult<Self> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ParseError::CimIpAddress {
            input: raw.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> ParseResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        match value.as_u64() {
            Some(n) => Self::from_integer(n),
            None => Err(ParseError::CimIpAddress {
                input: value.to_string(),
                reason: "expected a non-negative JSON integer".to_string(),
            }),
        }
    }

    /// The wrapped address.
    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for CimIpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for CimIpAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_hours_minutes() {
        let d = CimTimeDuration::parse_json(
            r#"{"Days":0,"Hours":1,"Minutes":30,"Seconds":0,"Milliseconds":0}"#,
        )
        .unwrap();
        assert_eq!(d.duration(), Duration::minutes(90));
    }

    #[test]
    fn test_duration_all_components() {
        let d = CimTimeDuration::parse_json(
            r#"{"Days":4,"Hours":2,"Minutes":30,"Seconds":5,"Milliseconds":10}"#,
        )
        .unwrap();
        let expected = Duration::hours(98)
            + Duration::minutes(30)
            + Duration::seconds(5)
            + Duration::milliseconds(10);
        assert_eq!(d.duration(), expected);
    }

    #[test]
    fn test_duration_negative_and_extra_fields() {
        let d = CimTimeDuration::parse_json(
            r#"{"Days":0,"Hours":-1,"Minutes":0,"Seconds":0,"Milliseconds":0,"Ticks":-36000000000,"TotalHours":-1.0}"#,
        )
        .unwrap();
        assert_eq!(d.duration(), Duration::hours(-1));
    }

    #[test]
    fn test_duration_rejects_non_integer() {
        assert!(CimTimeDuration::parse_json(r#"{"Hours":"one"}"#).is_err());
        assert!(CimTimeDuration::parse_json(r#"{"Hours":1.5}"#).is_err());
    }

    #[test]
    fn test_duration_overflow() {
        let raw = format!(r#"{{"Days":{}}}"#, i64::MAX);
        assert!(matches!(
            CimTimeDuration::parse_json(&raw),
            Err(ParseError::CimDuration(_))
        ));
    }

    #[test]
    fn test_duration_null_is_zero() {
        assert_eq!(CimTimeDuration::parse_json("null").unwrap(), CimTimeDuration::default());
        assert_eq!(CimTimeDuration::parse_json("{}").unwrap().duration(), Duration::zero());
    }

    #[test]
    fn test_keyval_mixed_quoting() {
        let kv = CimClassKeyVal::parse_blob(r#"a = 1 b = "two words" c='three' d= x"#);
        assert_eq!(kv.get("a"), Some("1"));
        assert_eq!(kv.get("b"), Some("two words"));
        assert_eq!(kv.get("c"), Some("three"));
        assert_eq!(kv.get("d"), Some("x"));
        assert_eq!(kv.len(), 4);
    }

    #[test]
    fn test_keyval_empty_values() {
        for raw in [r#""""#, "null", "[]", r#"[""]"#] {
            let kv = CimClassKeyVal::parse_json(raw).unwrap();
            assert!(kv.is_empty(), "{raw}");
        }
    }

    #[test]
    fn test_keyval_rejects_other_shapes() {
        assert!(CimClassKeyVal::parse_json("42").is_err());
        assert!(CimClassKeyVal::parse_json(r#"["a = 1", "b = 2"]"#).is_err());
        assert!(CimClassKeyVal::parse_json(r#"{"a": "1"}"#).is_err());
    }

    #[test]
    fn test_ip_known_values() {
        assert_eq!(
            CimIpAddress::parse_json("861627402").unwrap().addr(),
            Ipv4Addr::new(10, 100, 91, 51)
        );
        assert_eq!(
            CimIpAddress::parse_json("16777343").unwrap().addr(),
            Ipv4Addr::LOCALHOST
        );
        assert_eq!(
            CimIpAddress::parse_json("0").unwrap().addr(),
            Ipv4Addr::UNSPECIFIED
        );
        assert_eq!(
            CimIpAddress::parse_json("4294967295").unwrap().addr(),
            Ipv4Addr::BROADCAST
        );
    }

    #[test]
    fn test_ip_rejects_non_integers() {
        for raw in [r#""861627402""#, "8616274.02", "[1]", "{}"] {
            assert!(CimIpAddress::parse_json(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_ip_null_is_unspecified() {
        assert_eq!(
            CimIpAddress::parse_json("null").unwrap().addr(),
            Ipv4Addr::UNSPECIFIED
        );
    }

    #[test]
    fn test_null_fields_decode_to_zero_values() {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Scope {
            lease_duration: CimTimeDuration,
            scope_id: CimIpAddress,
            cim_class: CimClassKeyVal,
        }

        let scope: Scope = serde_json::from_str(
            r#"{"LeaseDuration": null, "ScopeId": null, "CimClass": null}"#,
        )
        .unwrap();
        assert_eq!(scope.lease_duration, CimTimeDuration::default());
        assert_eq!(scope.scope_id, CimIpAddress::default());
        assert!(scope.cim_class.is_empty());
    }

    #[test]
    fn test_ip_rejects_out_of_range() {
        assert!(CimIpAddress::parse_json("4294967296").is_err());
        assert!(CimIpAddress::parse_json("-1").is_err());
        assert!(CimIpAddress::from_integer(u64::MAX).is_err());
    }
}
