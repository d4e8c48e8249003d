//! JSON encodings for values HireFire payloads may carry besides integers.
//!
//! Date/times render as ECMA-262 strings (`2024-05-01T12:30:00.123Z`),
//! fixed-point decimals as strings so no precision is lost to floats.
//!
//! ```ignore
//! #[derive(Serialize)]
//! struct Backlog {
//!     #[serde(with = "hirefire::utils::utils_time::iso8601")]
//!     oldest: DateTime<Utc>,
//!     #[serde(serialize_with = "hirefire::utils::utils_time::as_string")]
//!     latency: Decimal,
//! }
//! ```

use std::fmt::Display;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serializer;

/// `2024-05-01T12:30:00.123Z`: UTC, millisecond precision.
pub fn format_iso8601(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses any RFC 3339 timestamp and normalizes it to UTC.
pub fn parse_iso8601(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc))
}

pub mod iso8601 {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_iso8601(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_iso8601(&raw).map_err(de::Error::custom)
    }

    /// Same encoding for optional fields; `None` is `null`.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(at: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => super::serialize(at, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::super::parse_iso8601(&raw)
                    .map(Some)
                    .map_err(de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Serializes any `Display` value as a JSON string.
pub fn as_string<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
