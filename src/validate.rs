//! Two-phase validation of mapped records.
//!
//! The critical pre-check rejects the two most common defects (no timestamp,
//! unrooted path) with a fixed message before the full pass runs. The full
//! pass collects every violation across all fields.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};

use crate::ident::is_canonical_id;
use crate::record::{MappedRecord, PageviewAttributes, ValidatedRecord};

const MAX_PATH: usize = 2048;
const MAX_HOSTNAME: usize = 255;
const MAX_QUERY: usize = 2048;
const MAX_REFERRER: usize = 2048;
const MAX_TITLE: usize = 512;
const MAX_SESSION: usize = 128;
const MAX_SHORT: usize = 255;
const MAX_DIMENSION: i64 = 100_000;
const MAX_DURATION_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// Failed the pre-check; the full pass never ran.
    Critical(String),
    /// Every violation found by the full pass, in field order.
    Schema(Vec<FieldViolation>),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::Critical(msg) => f.write_str(msg),
            ValidationFailure::Schema(violations) => {
                for (i, v) in violations.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationFailure {}

pub fn validate(record: MappedRecord) -> Result<ValidatedRecord, ValidationFailure> {
    precheck(&record)?;

    let mut v = Violations::default();

    if !is_canonical_id(&record.id) {
        v.push("id", "must be 'c' followed by 24 lowercase alphanumeric characters");
    }

    let timestamp = record.timestamp.as_deref().and_then(|raw| match parse_timestamp(raw) {
        Some(ts) => Some(ts),
        None => {
            v.push("timestamp", format!("'{raw}' is not a valid RFC 3339 timestamp"));
            None
        }
    });

    let path = record.path.as_deref().unwrap_or_default();
    v.max_len("path", Some(path), MAX_PATH);
    if path.chars().any(char::is_control) {
        v.push("path", "must not contain control characters");
    }

    v.max_len("hostname", record.hostname.as_deref(), MAX_HOSTNAME);
    if let Some(host) = record.hostname.as_deref() {
        if host.contains(char::is_whitespace) || host.contains('/') {
            v.push("hostname", "must be a bare host name");
        }
    }
    v.max_len("session_id", record.session_id.as_deref(), MAX_SESSION);
    v.range("duration_seconds", Some(record.duration_seconds), 0, MAX_DURATION_SECONDS);
    check_attributes(&record.attributes, &mut v);

    if !v.0.is_empty() {
        return Err(ValidationFailure::Schema(v.0));
    }

    let (Some(timestamp), Some(path)) = (timestamp, record.path) else {
        // Both were established by the pre-check and the timestamp parse.
        return Err(ValidationFailure::Critical("Missing required field: timestamp".into()));
    };

    Ok(ValidatedRecord {
        id: record.id,
        timestamp,
        path,
        hostname: record.hostname,
        session_id: record.session_id,
        device_type: record.device_type,
        referrer_category: record.referrer_category,
        duration_seconds: record.duration_seconds,
        visibility_changed: record.visibility_changed,
        is_unique: record.is_unique,
        is_robot: record.is_robot,
        attributes: record.attributes,
    })
}

fn precheck(record: &MappedRecord) -> Result<(), ValidationFailure> {
    if record.timestamp.is_none() {
        return Err(ValidationFailure::Critical(
            "Missing required field: timestamp".into(),
        ));
    }
    match record.path.as_deref() {
        None => Err(ValidationFailure::Critical("Missing required field: path".into())),
        Some(p) if !p.starts_with('/') => Err(ValidationFailure::Critical(format!(
            "Invalid path '{p}': must start with '/'"
        ))),
        Some(_) => Ok(()),
    }
}

/// RFC 3339 with or without fractional seconds, normalised to UTC and
/// truncated to microseconds, the precision stores keep. A key that carried
/// finer digits would never match its own stored row.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc).trunc_subsecs(6))
}

fn check_attributes(a: &PageviewAttributes, v: &mut Violations) {
    v.max_len("query", a.query.as_deref(), MAX_QUERY);
    v.max_len("referrer", a.referrer.as_deref(), MAX_REFERRER);
    v.max_len("page_title", a.page_title.as_deref(), MAX_TITLE);

    let short = [
        ("referrer_domain", &a.referrer_domain),
        ("utm_source", &a.utm_source),
        ("utm_medium", &a.utm_medium),
        ("utm_campaign", &a.utm_campaign),
        ("utm_term", &a.utm_term),
        ("utm_content", &a.utm_content),
        ("region", &a.region),
        ("city", &a.city),
        ("browser_name", &a.browser_name),
        ("browser_version", &a.browser_version),
        ("os_name", &a.os_name),
        ("os_version", &a.os_version),
        ("device_vendor", &a.device_vendor),
        ("device_model", &a.device_model),
        ("language", &a.language),
        ("language_region", &a.language_region),
        ("timezone", &a.timezone),
    ];
    for (field, value) in short {
        v.max_len(field, value.as_deref(), MAX_SHORT);
    }

    if let Some(cc) = a.country_code.as_deref() {
        if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_uppercase()) {
            v.push("country_code", "must be two uppercase letters");
        }
    }

    v.range("screen_width", a.screen_width, 0, MAX_DIMENSION);
    v.range("screen_height", a.screen_height, 0, MAX_DIMENSION);
    v.range("viewport_width", a.viewport_width, 0, MAX_DIMENSION);
    v.range("viewport_height", a.viewport_height, 0, MAX_DIMENSION);
    v.range("scrolled_percentage", a.scrolled_percentage, 0, 100);
}

#[derive(Default)]
struct Violations(Vec<FieldViolation>);

impl Violations {
    fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldViolation {
            field,
            message: message.into(),
        });
    }

    fn max_len(&mut self, field: &'static str, value: Option<&str>, max: usize) {
        if let Some(value) = value {
            let len = value.chars().count();
            if len > max {
                self.push(field, format!("must be at most {max} characters (got {len})"));
            }
        }
    }

    fn range(&mut self, field: &'static str, value: Option<i64>, min: i64, max: i64) {
        if let Some(n) = value {
            if !(min..=max).contains(&n) {
                self.push(field, format!("must be between {min} and {max} (got {n})"));
            }
        }
    }
}
