//! Built-in harmonization types and their sanitize/validate rules.
//!
//! Every type maps a raw [`FieldValue`] to exactly one canonical normalized
//! form. `sanitize` either produces a value `validate` accepts or fails; it
//! never hands back something un-validatable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use super::value::FieldValue;

/// Members of the closed `ClassificationType` set.
pub const CLASSIFICATION_TYPES: &[&str] = &[
    "backdoor",
    "blacklist",
    "botnet drone",
    "brute-force",
    "c&c",
    "compromised",
    "ddos",
    "defacement",
    "dropzone",
    "exploit",
    "ids alert",
    "malware",
    "malware configuration",
    "other",
    "phishing",
    "ransomware",
    "scanner",
    "spam",
    "test",
    "unknown",
    "vulnerable service",
];

/// The closed set of declarable field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarmonizationType {
    String,
    Base64,
    Url,
    Fqdn,
    IpAddress,
    IpNetwork,
    DateTime,
    Boolean,
    Integer,
    Float,
    Uuid,
    ClassificationType,
    JsonBlob,
}

impl HarmonizationType {
    pub const ALL: [HarmonizationType; 13] = [
        HarmonizationType::String,
        HarmonizationType::Base64,
        HarmonizationType::Url,
        HarmonizationType::Fqdn,
        HarmonizationType::IpAddress,
        HarmonizationType::IpNetwork,
        HarmonizationType::DateTime,
        HarmonizationType::Boolean,
        HarmonizationType::Integer,
        HarmonizationType::Float,
        HarmonizationType::Uuid,
        HarmonizationType::ClassificationType,
        HarmonizationType::JsonBlob,
    ];

    /// Name used in schema documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            HarmonizationType::String => "String",
            HarmonizationType::Base64 => "Base64",
            HarmonizationType::Url => "URL",
            HarmonizationType::Fqdn => "FQDN",
            HarmonizationType::IpAddress => "IPAddress",
            HarmonizationType::IpNetwork => "IPNetwork",
            HarmonizationType::DateTime => "DateTime",
            HarmonizationType::Boolean => "Boolean",
            HarmonizationType::Integer => "Integer",
            HarmonizationType::Float => "Float",
            HarmonizationType::Uuid => "UUID",
            HarmonizationType::ClassificationType => "ClassificationType",
            HarmonizationType::JsonBlob => "JSONBlob",
        }
    }

    /// Whether values of this type are text subject to a `max_length` bound.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            HarmonizationType::String
                | HarmonizationType::Base64
                | HarmonizationType::Url
                | HarmonizationType::Fqdn
                | HarmonizationType::JsonBlob
        )
    }

    /// Coerce a raw input into this type's canonical normalized form.
    ///
    /// On failure the error carries a short human-readable reason.
    pub fn sanitize(&self, raw: &FieldValue) -> Result<FieldValue, String> {
        let normalized = match self {
            HarmonizationType::String => sanitize_string(raw)?,
            HarmonizationType::Base64 => {
                let text = text_of(raw)?;
                FieldValue::String(BASE64.encode(text.as_bytes()))
            }
            HarmonizationType::Url => sanitize_url(raw)?,
            HarmonizationType::Fqdn => {
                let text = text_of(raw)?;
                FieldValue::String(text.trim().trim_end_matches('.').to_lowercase())
            }
            HarmonizationType::IpAddress => {
                let text = text_of(raw)?;
                let addr = IpAddr::from_str(text.trim())
                    .map_err(|_| format!("'{}' is not an IP address", text))?;
                FieldValue::String(addr.to_string())
            }
            HarmonizationType::IpNetwork => {
                let text = text_of(raw)?;
                FieldValue::String(canonical_network(text.trim())?)
            }
            HarmonizationType::DateTime => sanitize_datetime(raw)?,
            HarmonizationType::Boolean => sanitize_bool(raw)?,
            HarmonizationType::Integer => sanitize_integer(raw)?,
            HarmonizationType::Float => sanitize_float(raw)?,
            HarmonizationType::Uuid => {
                let text = text_of(raw)?;
                let uuid = uuid::Uuid::parse_str(text.trim())
                    .map_err(|e| format!("invalid UUID: {}", e))?;
                FieldValue::String(uuid.hyphenated().to_string())
            }
            HarmonizationType::ClassificationType => {
                let text = text_of(raw)?;
                FieldValue::String(text.trim().to_lowercase())
            }
            HarmonizationType::JsonBlob => sanitize_json(raw)?,
        };

        if self.validate(&normalized) {
            Ok(normalized)
        } else {
            Err(format!("'{}' is not a valid {}", raw, self))
        }
    }

    /// Check that an already-normalized value conforms to this type.
    pub fn validate(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (HarmonizationType::String, FieldValue::String(s)) => !s.is_empty(),
            (HarmonizationType::Base64, FieldValue::String(s)) => {
                !s.is_empty() && BASE64.decode(s.as_bytes()).is_ok()
            }
            (HarmonizationType::Url, FieldValue::String(s)) => match url::Url::parse(s) {
                Ok(parsed) => parsed.host_str().is_some() && parsed.as_str() == s,
                Err(_) => false,
            },
            (HarmonizationType::Fqdn, FieldValue::String(s)) => is_fqdn(s),
            (HarmonizationType::IpAddress, FieldValue::String(s)) => IpAddr::from_str(s)
                .map(|addr| addr.to_string() == *s)
                .unwrap_or(false),
            (HarmonizationType::IpNetwork, FieldValue::String(s)) => {
                s.contains('/') && canonical_network(s).map(|c| c == *s).unwrap_or(false)
            }
            (HarmonizationType::DateTime, FieldValue::String(s)) => {
                match DateTime::parse_from_rfc3339(s) {
                    Ok(dt) => {
                        dt.offset().local_minus_utc() == 0
                            && format_utc(&dt.with_timezone(&Utc)) == *s
                    }
                    Err(_) => false,
                }
            }
            (HarmonizationType::Boolean, FieldValue::Bool(_)) => true,
            (HarmonizationType::Integer, FieldValue::Int(_)) => true,
            (HarmonizationType::Float, FieldValue::Float(f)) => f.is_finite(),
            (HarmonizationType::Uuid, FieldValue::String(s)) => uuid::Uuid::parse_str(s)
                .map(|u| u.hyphenated().to_string() == *s)
                .unwrap_or(false),
            (HarmonizationType::ClassificationType, FieldValue::String(s)) => {
                CLASSIFICATION_TYPES.contains(&s.as_str())
            }
            (HarmonizationType::JsonBlob, FieldValue::String(s)) => {
                match serde_json::from_str::<serde_json::Value>(s) {
                    Ok(v) => serde_json::to_string(&v).map(|c| c == *s).unwrap_or(false),
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for HarmonizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarmonizationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HarmonizationType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Text form of a raw value; scalars are rendered, empty text is rejected.
fn text_of(raw: &FieldValue) -> Result<String, String> {
    let text = raw.to_string();
    if text.trim().is_empty() {
        return Err("empty value".to_string());
    }
    Ok(text)
}

fn sanitize_string(raw: &FieldValue) -> Result<FieldValue, String> {
    match raw {
        FieldValue::String(s) if s.is_empty() => Err("empty value".to_string()),
        FieldValue::String(s) => Ok(FieldValue::String(s.clone())),
        other => Ok(FieldValue::String(other.to_string())),
    }
}

fn sanitize_url(raw: &FieldValue) -> Result<FieldValue, String> {
    let text = text_of(raw)?;
    let trimmed = text.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    let parsed = url::Url::parse(&candidate).map_err(|e| format!("invalid URL: {}", e))?;
    if parsed.host_str().is_none() {
        return Err(format!("URL '{}' has no host", trimmed));
    }
    Ok(FieldValue::String(parsed.to_string()))
}

fn fqdn_label() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[a-z0-9_]([a-z0-9_-]{0,61}[a-z0-9_])?$").expect("static regex compiles")
    })
}

fn is_fqdn(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 || s.ends_with('.') || IpAddr::from_str(s).is_ok() {
        return false;
    }
    let labels: Vec<&str> = s.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| fqdn_label().is_match(label))
}

/// Canonical `address/prefix` form with host bits cleared. A bare address
/// is treated as a single-host network.
fn canonical_network(text: &str) -> Result<String, String> {
    let (addr_text, prefix_text) = match text.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (text, None),
    };
    let addr = IpAddr::from_str(addr_text)
        .map_err(|_| format!("'{}' is not a network address", addr_text))?;
    let max_prefix: u8 = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix_text {
        Some(p) => p
            .parse::<u8>()
            .map_err(|_| format!("invalid prefix length '{}'", p))?,
        None => max_prefix,
    };
    if prefix > max_prefix {
        return Err(format!("prefix /{} out of range for {}", prefix, addr_text));
    }

    let network = match addr {
        IpAddr::V4(v4) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            IpAddr::from(std::net::Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            IpAddr::from(std::net::Ipv6Addr::from(u128::from(v6) & mask))
        }
    };
    Ok(format!("{}/{}", network, prefix))
}

fn format_utc(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse the ISO-8601-like inputs feeds commonly use. Inputs without an
/// explicit offset are taken to be UTC.
fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(stripped) = text.strip_suffix('Z').or_else(|| text.strip_suffix('z')) {
        if let Some(dt) = parse_naive(stripped) {
            return Some(dt);
        }
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    parse_naive(text)
}

fn parse_naive(text: &str) -> Option<DateTime<Utc>> {
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn sanitize_datetime(raw: &FieldValue) -> Result<FieldValue, String> {
    let parsed = match raw {
        FieldValue::String(s) => parse_datetime(s.trim()),
        FieldValue::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
        FieldValue::Float(secs) if secs.is_finite() => {
            // Floor division keeps the fraction positive before the epoch.
            let whole = secs.div_euclid(1.0);
            let nanos = (secs.rem_euclid(1.0) * 1e9).round() as u32;
            Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
        }
        _ => None,
    };
    parsed
        .map(|dt| FieldValue::String(format_utc(&dt)))
        .ok_or_else(|| format!("'{}' is not a recognizable date-time", raw))
}

fn sanitize_bool(raw: &FieldValue) -> Result<FieldValue, String> {
    match raw {
        FieldValue::Bool(b) => Ok(FieldValue::Bool(*b)),
        FieldValue::Int(0) => Ok(FieldValue::Bool(false)),
        FieldValue::Int(1) => Ok(FieldValue::Bool(true)),
        FieldValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(FieldValue::Bool(true)),
            "false" | "0" | "no" | "n" | "off" => Ok(FieldValue::Bool(false)),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        other => Err(format!("'{}' is not a boolean", other)),
    }
}

fn sanitize_integer(raw: &FieldValue) -> Result<FieldValue, String> {
    match raw {
        FieldValue::Int(i) => Ok(FieldValue::Int(*i)),
        FieldValue::Float(f) if f.is_finite() && f.fract() == 0.0 => {
            if *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                Ok(FieldValue::Int(*f as i64))
            } else {
                Err(format!("{} is out of integer range", f))
            }
        }
        FieldValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map(FieldValue::Int)
            .map_err(|e| format!("'{}' is not an integer: {}", s, e)),
        other => Err(format!("'{}' is not an integer", other)),
    }
}

fn sanitize_float(raw: &FieldValue) -> Result<FieldValue, String> {
    let value = match raw {
        FieldValue::Float(f) => *f,
        FieldValue::Int(i) => *i as f64,
        FieldValue::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("'{}' is not a number: {}", s, e))?,
        FieldValue::Bool(_) => return Err(format!("'{}' is not a number", raw)),
    };
    if value.is_finite() {
        Ok(FieldValue::Float(value))
    } else {
        Err(format!("'{}' is not a finite number", raw))
    }
}

fn sanitize_json(raw: &FieldValue) -> Result<FieldValue, String> {
    let parsed = match raw {
        FieldValue::String(s) => serde_json::from_str::<serde_json::Value>(s)
            .map_err(|e| format!("invalid JSON: {}", e))?,
        other => other.to_json(),
    };
    serde_json::to_string(&parsed)
        .map(FieldValue::String)
        .map_err(|e| format!("cannot serialize JSON: {}", e))
}
