use std::sync::LazyLock;

use regex::Regex;

static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").expect("script pattern"));
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern"));
static JS_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript:").expect("uri pattern"));
static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)on\w+\s*=").expect("handler pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Email,
    TextArea,
}

impl FieldType {
    pub fn max_len(self) -> usize {
        match self {
            FieldType::Text => 100,
            FieldType::Email => 320,
            FieldType::TextArea => 5000,
        }
    }

    pub fn for_field(name: &str) -> Self {
        match name {
            "email" => FieldType::Email,
            "message" | "expectations" => FieldType::TextArea,
            _ => FieldType::Text,
        }
    }
}

/// Strips markup and script vectors, then cuts to the field's maximum length.
pub fn sanitize(input: &str, field: FieldType) -> String {
    let mut s = SCRIPT_TAG.replace_all(input, "").into_owned();
    s = ANY_TAG.replace_all(&s, "").into_owned();
    s = JS_URI.replace_all(&s, "").into_owned();
    s = EVENT_HANDLER.replace_all(&s, "").into_owned();

    truncate_chars(s, field.max_len())
}

pub fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s,
    }
}

pub fn char_len(s: &str) -> usize {
    s.chars().count()
}
