//! Record shapes flowing through the pipeline.
//!
//! `MappedRecord` is what the field mapper produces from one CSV row; it is
//! loosely typed where the validator still has work to do (timestamp is kept
//! as text). `ValidatedRecord` is the only shape a store accepts and cannot be
//! built outside this crate except through [`crate::validate`].

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Tv,
    Bot,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Bot => "bot",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Case-insensitive parse of an exported device label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "desktop" | "laptop" => Some(DeviceType::Desktop),
            "mobile" | "phone" | "smartphone" => Some(DeviceType::Mobile),
            "tablet" => Some(DeviceType::Tablet),
            "tv" | "smarttv" => Some(DeviceType::Tv),
            "bot" | "robot" => Some(DeviceType::Bot),
            _ => None,
        }
    }

    /// Classification from a known viewport or screen width in CSS pixels.
    pub fn from_width(width: i64) -> Self {
        if width < 768 {
            DeviceType::Mobile
        } else if width < 1024 {
            DeviceType::Tablet
        } else {
            DeviceType::Desktop
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferrerCategory {
    Direct,
    Search,
    Social,
    Email,
    Referral,
}

impl ReferrerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferrerCategory::Direct => "direct",
            ReferrerCategory::Search => "search",
            ReferrerCategory::Social => "social",
            ReferrerCategory::Email => "email",
            ReferrerCategory::Referral => "referral",
        }
    }
}

/// Optional attributes carried verbatim from the export.
///
/// Every string here is either absent or non-empty; the mapper never
/// produces `Some("")`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageviewAttributes {
    pub query: Option<String>,
    pub referrer: Option<String>,
    pub referrer_domain: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub device_vendor: Option<String>,
    pub device_model: Option<String>,
    pub language: Option<String>,
    pub language_region: Option<String>,
    pub timezone: Option<String>,
    pub page_title: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub viewport_width: Option<i64>,
    pub viewport_height: Option<i64>,
    pub scrolled_percentage: Option<i64>,
}

/// One CSV row after field mapping, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord {
    pub id: String,
    /// Raw RFC 3339 text; parsed by the validator.
    pub timestamp: Option<String>,
    pub path: Option<String>,
    pub hostname: Option<String>,
    pub session_id: Option<String>,
    pub device_type: DeviceType,
    pub referrer_category: ReferrerCategory,
    pub duration_seconds: i64,
    pub visibility_changed: bool,
    pub is_unique: bool,
    pub is_robot: bool,
    pub attributes: PageviewAttributes,
    /// Identifier found in the file when it was replaced by a generated one.
    /// Audit only, never stored.
    pub replaced_id: Option<String>,
}

impl MappedRecord {
    pub fn id_was_replaced(&self) -> bool {
        self.replaced_id.is_some()
    }
}

/// A record that passed schema validation. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRecord {
    pub(crate) id: String,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) path: String,
    pub(crate) hostname: Option<String>,
    pub(crate) session_id: Option<String>,
    pub(crate) device_type: DeviceType,
    pub(crate) referrer_category: ReferrerCategory,
    pub(crate) duration_seconds: i64,
    pub(crate) visibility_changed: bool,
    pub(crate) is_unique: bool,
    pub(crate) is_robot: bool,
    pub(crate) attributes: PageviewAttributes,
}

impl ValidatedRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn referrer_category(&self) -> ReferrerCategory {
        self.referrer_category
    }

    pub fn duration_seconds(&self) -> i64 {
        self.duration_seconds
    }

    pub fn visibility_changed(&self) -> bool {
        self.visibility_changed
    }

    pub fn is_unique(&self) -> bool {
        self.is_unique
    }

    pub fn is_robot(&self) -> bool {
        self.is_robot
    }

    pub fn attributes(&self) -> &PageviewAttributes {
        &self.attributes
    }

    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            timestamp: self.timestamp,
            path: self.path.clone(),
            session_id: self.session_id.clone(),
            hostname: self.hostname.clone(),
        }
    }
}

/// Natural key of a pageview: (timestamp, path, session, hostname).
///
/// Equality here is null-safe (`None == None`), which is what the existence
/// lookup against already-stored rows needs. Candidates inside one batch are
/// never compared with each other by key; the store's unique index, where a
/// NULL component never equals another NULL, is the only collision check
/// between new rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub session_id: Option<String>,
    pub hostname: Option<String>,
}

impl CompositeKey {
    /// Whether the key can collide under SQL uniqueness rules.
    pub fn is_fully_specified(&self) -> bool {
        self.session_id.is_some() && self.hostname.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_labels_are_case_insensitive() {
        assert_eq!(DeviceType::from_label("Mobile"), Some(DeviceType::Mobile));
        assert_eq!(DeviceType::from_label(" DESKTOP "), Some(DeviceType::Desktop));
        assert_eq!(DeviceType::from_label("fridge"), None);
    }

    #[test]
    fn width_classification_boundaries() {
        assert_eq!(DeviceType::from_width(767), DeviceType::Mobile);
        assert_eq!(DeviceType::from_width(768), DeviceType::Tablet);
        assert_eq!(DeviceType::from_width(1024), DeviceType::Desktop);
    }
}
