//! Raw CSV row → `MappedRecord`. Pure apart from identifier generation.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat};
use csv_async::StringRecord;
use url::Url;

use crate::ident::{generate_id, is_canonical_id};
use crate::record::{DeviceType, MappedRecord, PageviewAttributes, ReferrerCategory};

/// Country values some exporters and GeoIP databases use for "unknown".
const COUNTRY_PLACEHOLDERS: &[&str] = &["XX", "ZZ", "T1", "A1", "A2", "O1", "EU", "AP", "--"];

const EMAIL_HOSTS: &[&str] = &[
    "mail.google.com",
    "outlook.live.com",
    "outlook.office.com",
    "mail.yahoo.com",
    "mail.proton.me",
    "webmail.",
];
const SEARCH_HOSTS: &[&str] = &[
    "google.",
    "bing.com",
    "duckduckgo.com",
    "search.yahoo.com",
    "yahoo.",
    "baidu.com",
    "yandex.",
    "ecosia.org",
    "search.brave.com",
    "startpage.com",
    "kagi.com",
];
const SOCIAL_HOSTS: &[&str] = &[
    "facebook.com",
    "t.co",
    "twitter.com",
    "x.com",
    "linkedin.com",
    "lnkd.in",
    "reddit.com",
    "instagram.com",
    "youtube.com",
    "pinterest.",
    "news.ycombinator.com",
    "mastodon.",
    "threads.net",
    "bsky.app",
];

/// Header name → column position for one file.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    pub fn from_headers(headers: &StringRecord) -> Self {
        let positions = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (normalize_header(h), i))
            .collect();
        Self { positions }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.positions.contains_key(column)
    }
}

fn normalize_header(h: &str) -> String {
    h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase()
}

/// Borrowed view of one CSV line keyed by column name.
///
/// Ragged rows are fine: a column past the end of the record reads as absent.
#[derive(Debug, Clone, Copy)]
pub struct RawRow<'a> {
    columns: &'a ColumnIndex,
    record: &'a StringRecord,
}

impl<'a> RawRow<'a> {
    pub fn new(columns: &'a ColumnIndex, record: &'a StringRecord) -> Self {
        Self { columns, record }
    }

    /// Trimmed, non-empty value of `column`.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self.columns.position(column)?;
        let value = self.record.get(idx)?.trim();
        (!value.is_empty()).then_some(value)
    }

    fn string(&self, column: &str) -> Option<String> {
        self.get(column).map(str::to_string)
    }

    /// Integer column. Fractional or non-numeric content reads as absent.
    fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(|v| v.parse::<i64>().ok())
    }

    fn flag(&self, column: &str) -> bool {
        self.get(column)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Map one row. Never fails; anything unusable becomes absent and is left
/// for the validator to judge.
pub fn map_row(row: &RawRow<'_>) -> MappedRecord {
    let (id, replaced_id) = match row.get("uuid") {
        None => (generate_id(), None),
        Some(id) if is_canonical_id(id) => (id.to_string(), None),
        Some(legacy) => (generate_id(), Some(legacy.to_string())),
    };

    let hostname = row.get("hostname").map(|h| h.to_ascii_lowercase());
    let referrer = row.string("document_referrer");
    let (referrer_domain, referrer_category) =
        derive_referrer(referrer.as_deref(), hostname.as_deref());

    let attributes = PageviewAttributes {
        query: row.string("query"),
        referrer,
        referrer_domain,
        utm_source: row.string("utm_source"),
        utm_medium: row.string("utm_medium"),
        utm_campaign: row.string("utm_campaign"),
        utm_term: row.string("utm_term"),
        utm_content: row.string("utm_content"),
        country_code: row.get("country_code").and_then(country_code),
        region: row.string("region"),
        city: row.string("city"),
        browser_name: row.string("browser_name"),
        browser_version: row.string("browser_version"),
        os_name: row.string("os_name"),
        os_version: row.string("os_version"),
        device_vendor: row.string("device_vendor"),
        device_model: row.string("device_model"),
        language: row.string("lang_language"),
        language_region: row.string("lang_region"),
        timezone: row.string("timezone"),
        page_title: row.string("page_title"),
        screen_width: row.int("screen_width"),
        screen_height: row.int("screen_height"),
        viewport_width: row.int("viewport_width"),
        viewport_height: row.int("viewport_height"),
        scrolled_percentage: row.int("scrolled_percentage"),
    };

    let device_type = row
        .get("device_type")
        .and_then(DeviceType::from_label)
        .or_else(|| {
            attributes
                .viewport_width
                .or(attributes.screen_width)
                .map(DeviceType::from_width)
        })
        .unwrap_or(DeviceType::Unknown);

    MappedRecord {
        id,
        timestamp: timestamp(row),
        path: row.string("path"),
        hostname,
        session_id: row.string("session_id"),
        device_type,
        referrer_category,
        duration_seconds: row.int("duration_seconds").unwrap_or(0),
        visibility_changed: row.flag("visibility_changed"),
        is_unique: row.flag("is_unique"),
        is_robot: row.flag("is_robot"),
        attributes,
        replaced_id,
    }
}

/// `added_iso` verbatim, else `added_unix` seconds rendered as RFC 3339.
fn timestamp(row: &RawRow<'_>) -> Option<String> {
    if let Some(iso) = row.string("added_iso") {
        return Some(iso);
    }
    let secs = row.int("added_unix")?;
    DateTime::from_timestamp(secs, 0).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn country_code(raw: &str) -> Option<String> {
    if raw.chars().count() != 2 {
        return None;
    }
    let code = raw.to_ascii_uppercase();
    (!COUNTRY_PLACEHOLDERS.contains(&code.as_str())).then_some(code)
}

/// Referrer domain and category. A referrer on the site's own host counts
/// as no external referrer.
pub fn derive_referrer(
    referrer: Option<&str>,
    own_hostname: Option<&str>,
) -> (Option<String>, ReferrerCategory) {
    let Some(host) = referrer.and_then(referrer_host) else {
        return (None, ReferrerCategory::Direct);
    };
    let own = own_hostname.map(strip_www);
    if own.is_some_and(|own| own.eq_ignore_ascii_case(&host)) {
        return (None, ReferrerCategory::Direct);
    }
    let category = categorize(&host);
    (Some(host), category)
}

fn referrer_host(referrer: &str) -> Option<String> {
    let parsed = Url::parse(referrer)
        .or_else(|_| Url::parse(&format!("https://{referrer}")))
        .ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(strip_www(&host).to_string())
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn categorize(host: &str) -> ReferrerCategory {
    let matches = |list: &[&str]| {
        list.iter().any(|pat| {
            if pat.ends_with('.') {
                host.starts_with(pat) || host.contains(&format!(".{pat}"))
            } else {
                host == *pat || host.ends_with(&format!(".{pat}"))
            }
        })
    };
    // Webmail hosts live under search-engine domains, so check them first.
    if matches(EMAIL_HOSTS) {
        ReferrerCategory::Email
    } else if matches(SEARCH_HOSTS) {
        ReferrerCategory::Search
    } else if matches(SOCIAL_HOSTS) {
        ReferrerCategory::Social
    } else {
        ReferrerCategory::Referral
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn row_fixture(pairs: &[(&str, &str)]) -> (ColumnIndex, StringRecord) {
        let headers = StringRecord::from(pairs.iter().map(|(k, _)| *k).collect::<Vec<_>>());
        let record = StringRecord::from(pairs.iter().map(|(_, v)| *v).collect::<Vec<_>>());
        (ColumnIndex::from_headers(&headers), record)
    }

    fn mapped(pairs: &[(&str, &str)]) -> MappedRecord {
        let (idx, rec) = row_fixture(pairs);
        map_row(&RawRow::new(&idx, &rec))
    }

    #[test]
    fn missing_identifier_is_generated_without_audit_trail() {
        let rec = mapped(&[("path", "/")]);
        assert!(is_canonical_id(&rec.id));
        assert!(!rec.id_was_replaced());
    }

    #[test]
    fn legacy_identifier_is_replaced_and_remembered() {
        let legacy = "6f1c9a52-5f4e-4b0e-9a57-0b1f0c3e2d11";
        let rec = mapped(&[("uuid", legacy)]);
        assert!(is_canonical_id(&rec.id));
        assert_eq!(rec.replaced_id.as_deref(), Some(legacy));
    }

    #[test]
    fn canonical_identifier_is_kept() {
        let rec = mapped(&[("uuid", "ckz8m3x1a0000abcdefghijkl")]);
        assert_eq!(rec.id, "ckz8m3x1a0000abcdefghijkl");
        assert!(rec.replaced_id.is_none());
    }

    #[test]
    fn numbers_fail_open_to_absent() {
        let rec = mapped(&[
            ("screen_width", "1440"),
            ("screen_height", ""),
            ("viewport_width", "12.5"),
            ("viewport_height", "tall"),
        ]);
        assert_eq!(rec.attributes.screen_width, Some(1440));
        assert_eq!(rec.attributes.screen_height, None);
        assert_eq!(rec.attributes.viewport_width, None);
        assert_eq!(rec.attributes.viewport_height, None);
    }

    #[test]
    fn defaults_for_duration_and_flags() {
        let rec = mapped(&[("path", "/a")]);
        assert_eq!(rec.duration_seconds, 0);
        assert!(!rec.visibility_changed);
        assert!(!rec.is_unique);
        assert!(!rec.is_robot);
    }

    #[test]
    fn booleans_only_accept_true() {
        let rec = mapped(&[
            ("visibility_changed", "TRUE"),
            ("is_unique", "yes"),
            ("is_robot", "1"),
        ]);
        assert!(rec.visibility_changed);
        assert!(!rec.is_unique);
        assert!(!rec.is_robot);
    }

    #[test]
    fn empty_strings_become_absent() {
        let rec = mapped(&[("utm_source", ""), ("city", "   "), ("region", "Bavaria")]);
        assert_eq!(rec.attributes.utm_source, None);
        assert_eq!(rec.attributes.city, None);
        assert_eq!(rec.attributes.region.as_deref(), Some("Bavaria"));
    }

    #[test]
    fn country_codes() {
        assert_eq!(country_code("de"), Some("DE".to_string()));
        assert_eq!(country_code("XX"), None);
        assert_eq!(country_code("--"), None);
        assert_eq!(country_code("DEU"), None);
    }

    #[test]
    fn ragged_rows_read_missing_columns_as_absent() {
        let headers = StringRecord::from(vec!["path", "hostname", "session_id"]);
        let record = StringRecord::from(vec!["/only-path"]);
        let idx = ColumnIndex::from_headers(&headers);
        let rec = map_row(&RawRow::new(&idx, &record));
        assert_eq!(rec.path.as_deref(), Some("/only-path"));
        assert_eq!(rec.hostname, None);
        assert_eq!(rec.session_id, None);
    }

    #[test]
    fn unix_timestamp_fallback() {
        let rec = mapped(&[("added_unix", "1700000000")]);
        assert_eq!(rec.timestamp.as_deref(), Some("2023-11-14T22:13:20Z"));
        let iso = mapped(&[("added_iso", "2024-01-01T00:00:00Z"), ("added_unix", "1")]);
        assert_eq!(iso.timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn device_type_falls_back_to_width() {
        assert_eq!(mapped(&[("device_type", "Tablet")]).device_type, DeviceType::Tablet);
        assert_eq!(mapped(&[("viewport_width", "390")]).device_type, DeviceType::Mobile);
        assert_eq!(mapped(&[("screen_width", "1920")]).device_type, DeviceType::Desktop);
        assert_eq!(mapped(&[]).device_type, DeviceType::Unknown);
    }

    #[test]
    fn header_bom_and_case_are_ignored() {
        let (idx, rec) = row_fixture(&[("\u{feff}Path", "/bom")]);
        assert_eq!(RawRow::new(&idx, &rec).get("path"), Some("/bom"));
    }

    #[test]
    fn referrer_classification() {
        assert_eq!(
            derive_referrer(Some("https://www.google.com/search?q=x"), Some("example.com")),
            (Some("google.com".to_string()), ReferrerCategory::Search)
        );
        assert_eq!(
            derive_referrer(Some("https://mail.google.com/mail/u/0"), None),
            (Some("mail.google.com".to_string()), ReferrerCategory::Email)
        );
        assert_eq!(
            derive_referrer(Some("https://t.co/abc"), Some("example.com")).1,
            ReferrerCategory::Social
        );
        assert_eq!(
            derive_referrer(Some("blog.rust-lang.org/2024"), Some("example.com")),
            (Some("blog.rust-lang.org".to_string()), ReferrerCategory::Referral)
        );
    }

    #[test]
    fn same_host_referrer_is_direct() {
        assert_eq!(
            derive_referrer(Some("https://www.example.com/pricing"), Some("example.com")),
            (None, ReferrerCategory::Direct)
        );
        assert_eq!(derive_referrer(None, Some("example.com")), (None, ReferrerCategory::Direct));
        assert_eq!(derive_referrer(Some("::::"), None), (None, ReferrerCategory::Direct));
    }
}
