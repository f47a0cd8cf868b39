//! Line parsers for the ingestion boundary

use super::{Dimensions, Fact};
use crate::{Error, Result};
use serde_json::Value;
use std::str::FromStr;

/// Supported line formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// One JSON object per line, values are dimension values
    Json,
    /// Wireshark field export: `field:value,field:value,...`
    Wireshark,
}

impl LineFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Wireshark => "wireshark",
        }
    }
}

impl FromStr for LineFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "wireshark" | "tshark" => Ok(Self::Wireshark),
            other => Err(Error::Config(format!(
                "unknown line format '{}'; expected one of json, wireshark",
                other
            ))),
        }
    }
}

/// Parse a JSON object line into a fact.
///
/// Strings, numbers and booleans become dimension values; nulls are skipped.
/// If `timestamp_field` names a numeric member, it becomes the fact
/// timestamp and is removed from the dimensions; otherwise `now` is used.
pub fn parse_json_line(line: &str, timestamp_field: Option<&str>, now: i64) -> Result<Fact> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(map) = value else {
        return Err(Error::InvalidFact(format!(
            "expected a JSON object, got '{}'",
            truncate(line)
        )));
    };

    let mut timestamp = now;
    let mut dimensions = Dimensions::new();
    for (name, value) in map {
        if Some(name.as_str()) == timestamp_field {
            timestamp = match &value {
                Value::Number(n) => n.as_i64().ok_or_else(|| {
                    Error::InvalidFact(format!("timestamp '{}' is not an integer", n))
                })?,
                Value::String(s) => s.trim().parse::<i64>().map_err(|e| {
                    Error::InvalidFact(format!("timestamp '{}' is not an integer: {}", s, e))
                })?,
                other => {
                    return Err(Error::InvalidFact(format!(
                        "timestamp has unsupported type: {}",
                        other
                    )))
                }
            };
            continue;
        }
        match value {
            Value::String(s) => {
                dimensions.insert(name, s);
            }
            Value::Number(n) => {
                dimensions.insert(name, n.to_string());
            }
            Value::Bool(b) => {
                dimensions.insert(name, b.to_string());
            }
            Value::Null => {}
            Value::Array(_) | Value::Object(_) => {
                return Err(Error::InvalidFact(format!(
                    "dimension '{}' must be a scalar",
                    name
                )));
            }
        }
    }

    Ok(Fact::from_dimensions(timestamp, dimensions))
}

/// Parse a Wireshark/tshark field line into a network fact.
///
/// Produces `src`, `dst`, `ipv` from the IP layer, `spt`, `dpt`, `app` from
/// the transport layer and `rs` (captured length), `rl` (time delta) when
/// present. Fields without a `name:value` shape are ignored.
pub fn parse_wireshark_line(line: &str, now: i64) -> Result<Fact> {
    let wire: Dimensions = line
        .split(',')
        .filter_map(|field| field.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .collect();

    if wire.is_empty() {
        return Err(Error::InvalidFact(format!(
            "no fields in packet line '{}'",
            truncate(line)
        )));
    }

    let mut dimensions = Dimensions::new();
    if let (Some(src), Some(dst)) = (wire.get("ip.src"), wire.get("ip.dst")) {
        dimensions.insert("src".to_string(), src.clone());
        dimensions.insert("dst".to_string(), dst.clone());
        dimensions.insert("ipv".to_string(), "IPv4".to_string());
    } else if let (Some(src), Some(dst)) = (wire.get("ipv6.src"), wire.get("ipv6.dst")) {
        dimensions.insert("src".to_string(), src.clone());
        dimensions.insert("dst".to_string(), dst.clone());
        dimensions.insert("ipv".to_string(), "IPv6".to_string());
    }

    if let (Some(spt), Some(dpt)) = (wire.get("tcp.srcport"), wire.get("tcp.dstport")) {
        dimensions.insert("spt".to_string(), spt.clone());
        dimensions.insert("dpt".to_string(), dpt.clone());
        dimensions.insert("app".to_string(), "TCP".to_string());
    } else if let (Some(spt), Some(dpt)) = (wire.get("udp.srcport"), wire.get("udp.dstport")) {
        dimensions.insert("spt".to_string(), spt.clone());
        dimensions.insert("dpt".to_string(), dpt.clone());
        dimensions.insert("app".to_string(), "UDP".to_string());
    }

    if let Some(len) = wire.get("frame.cap_len") {
        dimensions.insert("rs".to_string(), len.clone());
    }
    if let Some(delta) = wire.get("frame.time_delta") {
        dimensions.insert("rl".to_string(), delta.clone());
    }

    Ok(Fact::from_dimensions(now, dimensions))
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(80) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
