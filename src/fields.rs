//! Contact field extraction from engine payloads.
//!
//! Both engines produce a JSON object. The local engine only fills `text`,
//! in which case emails, phones and tags are mined from the text. The vision
//! engine fills `Name`/`Email`/`Phone`/`Tags` directly and those values are
//! normalized instead.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::model::{ContactRecord, ItemId};
use crate::traits::FieldExtractor;

/// Phone-like tokens shorter than this are discarded.
pub const MIN_PHONE_LEN: usize = 10;

/// Separator for multi-valued fields.
pub const JOIN_SEPARATOR: &str = "; ";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}").expect("valid email regex")
});

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?[0-9]{10,15}").expect("valid phone regex"));

static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([\w-]+)").expect("valid hashtag regex"));

/// Letters OCR engines commonly return in place of digits.
const OCR_CONFUSIONS: &[(char, char)] = &[
    ('S', '5'),
    ('O', '0'),
    ('I', '1'),
    ('l', '1'),
    ('B', '8'),
    ('G', '6'),
    ('Z', '2'),
];

/// Prefixes where a leading `4` is a misread `+`.
const MISREAD_PLUS_PREFIXES: &[&str] = &["441", "447", "449"];

/// Regex-based [`FieldExtractor`] for business-card style images.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContactFieldExtractor;

impl ContactFieldExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FieldExtractor for ContactFieldExtractor {
    fn extract(&self, payload: &Value, source: &ItemId) -> Option<ContactRecord> {
        let fields = payload.as_object()?;
        let name = string_field(fields, "name");
        let text = string_field(fields, "text");

        let record = if !text.trim().is_empty() {
            ContactRecord {
                filename: source.to_string(),
                name,
                email: extract_emails(&text),
                phone: extract_phones(&text),
                tags: extract_hashtags(&text),
                text,
            }
        } else {
            ContactRecord {
                filename: source.to_string(),
                name,
                email: extract_emails(&string_field(fields, "email")),
                phone: extract_phones(&string_field(fields, "phone")),
                tags: tag_list(field(fields, "tags")),
                text: String::new(),
            }
        };
        Some(record)
    }
}

fn field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn string_field(fields: &Map<String, Value>, key: &str) -> String {
    match field(fields, key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn tag_list(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty() && seen.insert(tag.clone()))
        .collect()
}

/// All email addresses in `text`, joined with `"; "`.
pub fn extract_emails(text: &str) -> String {
    EMAIL_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(JOIN_SEPARATOR)
}

/// Phone numbers in `text`, corrected for OCR confusions and deduplicated.
///
/// Candidates are matched on the raw text and on the confusion-corrected
/// text; nothing is returned unless the raw text has at least one match.
pub fn extract_phones(text: &str) -> String {
    let raw: Vec<&str> = PHONE_RE.find_iter(text).map(|m| m.as_str()).collect();
    if raw.is_empty() {
        return String::new();
    }

    let corrected = correct_ocr_confusions(text);
    let candidates = raw
        .into_iter()
        .chain(PHONE_RE.find_iter(&corrected).map(|m| m.as_str()));

    let mut seen = HashSet::new();
    let mut phones = Vec::new();
    for candidate in candidates {
        let mut phone = correct_ocr_confusions(candidate);
        if phone.len() >= 11 && MISREAD_PLUS_PREFIXES.iter().any(|p| phone.starts_with(p)) {
            phone.replace_range(0..1, "+");
        }
        if phone.len() >= MIN_PHONE_LEN && seen.insert(phone.clone()) {
            phones.push(phone);
        }
    }
    phones.join(JOIN_SEPARATOR)
}

/// `#tags` found in free text, without the leading `#`, in first-seen order.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HASHTAG_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Replaces letters commonly misread for digits.
pub fn correct_ocr_confusions(text: &str) -> String {
    text.chars()
        .map(|c| {
            OCR_CONFUSIONS
                .iter()
                .find(|(wrong, _)| *wrong == c)
                .map(|(_, right)| *right)
                .unwrap_or(c)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(payload: Value) -> Option<ContactRecord> {
        ContactFieldExtractor::new().extract(&payload, &ItemId::from("cards/one.png"))
    }

    #[test]
    fn test_text_payload_mines_fields() {
        let record = extract(json!({
            "text": "Jane Roe jane@acme.io, sales@acme.io Call 0791234567 #vip #lead #vip"
        }))
        .unwrap();

        assert_eq!(record.filename, "cards/one.png");
        assert_eq!(record.email, "jane@acme.io; sales@acme.io");
        assert_eq!(record.phone, "0791234567");
        assert_eq!(record.tags, vec!["vip", "lead"]);
        assert!(record.text.starts_with("Jane Roe"));
    }

    #[test]
    fn test_structured_payload_is_normalized() {
        let record = extract(json!({
            "Name": "Sandra",
            "Email": "de@gmail.com",
            "Phone": "+41799123123",
            "Tags": [" player ", "", "player", "vip"]
        }))
        .unwrap();

        assert_eq!(record.name, "Sandra");
        assert_eq!(record.email, "de@gmail.com");
        assert_eq!(record.phone, "+41799123123");
        assert_eq!(record.tags, vec!["player", "vip"]);
        assert!(record.text.is_empty());
    }

    #[test]
    fn test_tags_accept_single_string() {
        let record = extract(json!({"Tags": "Age: 54, Birthday: May 14th, 1971"})).unwrap();
        assert_eq!(record.tags, vec!["Age: 54, Birthday: May 14th, 1971"]);
    }

    #[test]
    fn test_non_object_payload_yields_none() {
        assert!(extract(json!("just a string")).is_none());
        assert!(extract(Value::Null).is_none());
    }

    #[test]
    fn test_phone_confusion_correction() {
        let phones = extract_phones("Tel 0791234567 alt O7S1234567");
        assert_eq!(phones, "0791234567; 0751234567");
    }

    #[test]
    fn test_leading_four_read_as_plus() {
        assert_eq!(extract_phones("441799123123"), "+41799123123");
    }

    #[test]
    fn test_short_numbers_ignored() {
        assert_eq!(extract_phones("ext 12345 room 678"), "");
    }

    #[test]
    fn test_no_email_is_empty() {
        assert_eq!(extract_emails("no address here"), "");
    }

    #[test]
    fn test_confusion_table() {
        assert_eq!(correct_ocr_confusions("SOIlBGZ"), "5011862");
    }
}
