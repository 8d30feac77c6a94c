//! Timestamped reading vectors and their wire encoding.
//!
//! A [`Reading`] is one sample across a fixed channel list: the value at
//! index `i` belongs to the `i`-th channel of the owning series or monitor.
//! Failed channel reads are carried as NaN, so the JSON encoding must handle
//! non-finite floats: they are emitted as the strings `"NaN"`, `"+Inf"` and
//! `"-Inf"`, and times are UTC RFC 3339 with nanosecond precision.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped vector of channel values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(with = "rfc3339_nanos")]
    pub time: DateTime<Utc>,
    #[serde(with = "wire_floats")]
    pub values: Vec<f64>,
}

/// UTC RFC 3339 timestamps with full nanosecond precision.
///
/// The fixed-width form also sorts lexicographically, which the store relies
/// on for time-ordered queries.
pub mod rfc3339_nanos {
    use super::*;
    use serde::de::Error;
    use serde::{Deserializer, Serializer};

    pub fn format(time: &DateTime<Utc>) -> String {
        time.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn parse(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(de)?;
        parse(&s).map_err(D::Error::custom)
    }
}

/// Optional timestamps in the same RFC 3339 form; `None` maps to `null`.
pub mod rfc3339_nanos_opt {
    use super::*;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        time: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => ser.serialize_str(&super::rfc3339_nanos::format(t)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s = Option::<String>::deserialize(de)?;
        match s.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => super::rfc3339_nanos::parse(s)
                .map(Some)
                .map_err(D::Error::custom),
        }
    }
}

/// Float vectors where non-finite members become marker strings.
pub mod wire_floats {
    use serde::de::Error;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// A single float in wire form.
    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    pub(super) enum WireFloat {
        Number(f64),
        Marker(String),
    }

    impl WireFloat {
        pub(super) fn encode(v: f64) -> Self {
            if v.is_nan() {
                WireFloat::Marker("NaN".to_string())
            } else if v == f64::INFINITY {
                WireFloat::Marker("+Inf".to_string())
            } else if v == f64::NEG_INFINITY {
                WireFloat::Marker("-Inf".to_string())
            } else {
                WireFloat::Number(v)
            }
        }

        pub(super) fn decode(self) -> Result<f64, String> {
            match self {
                WireFloat::Number(v) => Ok(v),
                WireFloat::Marker(m) => match m.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "+Inf" => Ok(f64::INFINITY),
                    "-Inf" => Ok(f64::NEG_INFINITY),
                    other => Err(format!("invalid float marker: {other:?}")),
                },
            }
        }
    }

    pub fn serialize<S: Serializer>(values: &[f64], ser: S) -> Result<S::Ok, S::Error> {
        let mut seq = ser.serialize_seq(Some(values.len()))?;
        for v in values {
            seq.serialize_element(&WireFloat::encode(*v))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<f64>, D::Error> {
        let wire = Vec::<WireFloat>::deserialize(de)?;
        wire.into_iter()
            .map(|w| w.decode().map_err(D::Error::custom))
            .collect()
    }
}

/// A single float with the same non-finite marker encoding.
pub mod wire_float {
    use super::wire_floats::WireFloat;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, ser: S) -> Result<S::Ok, S::Error> {
        WireFloat::encode(*value).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
        WireFloat::deserialize(de)?.decode().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap() + chrono::Duration::nanoseconds(123)
    }

    #[test]
    fn finite_values_serialize_as_numbers() {
        let r = Reading {
            time: sample_time(),
            values: vec![1.5, -2.0],
        };
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(
            json,
            r#"{"time":"2024-03-01T10:20:30.000000123Z","values":[1.5,-2.0]}"#
        );
    }

    #[test]
    fn non_finite_values_serialize_as_markers() {
        let r = Reading {
            time: sample_time(),
            values: vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY],
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains(r#"["NaN","+Inf","-Inf"]"#));
    }

    #[test]
    fn round_trip_preserves_markers() {
        let r = Reading {
            time: sample_time(),
            values: vec![3.25, f64::NAN, f64::NEG_INFINITY],
        };
        let json = serde_json::to_string(&r).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back.time, r.time);
        assert_eq!(back.values[0], 3.25);
        assert!(back.values[1].is_nan());
        assert_eq!(back.values[2], f64::NEG_INFINITY);
    }

    #[test]
    fn rejects_unknown_marker() {
        let json = r#"{"time":"2024-03-01T10:20:30Z","values":["Infinity"]}"#;
        assert!(serde_json::from_str::<Reading>(json).is_err());
    }

    #[test]
    fn timestamps_keep_nanosecond_width() {
        let t = rfc3339_nanos::format(&sample_time());
        assert_eq!(t, "2024-03-01T10:20:30.000000123Z");
        assert_eq!(rfc3339_nanos::parse(&t).unwrap(), sample_time());
    }
}
