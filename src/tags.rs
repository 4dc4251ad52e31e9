use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use crate::models::Metadata;

pub const TAGS_KEY: &str = "tags";
pub const HAS_TAGS_KEY: &str = "has_tags";
const TAG_FLAG_PREFIX: &str = "tag:";

/// Metadata key holding the boolean flag for a single tag.
pub fn tag_key(tag: &str) -> String {
    format!("{TAG_FLAG_PREFIX}{}", normalize_tag(tag))
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

pub fn is_internal_key(key: &str) -> bool {
    key == HAS_TAGS_KEY || key.starts_with(TAG_FLAG_PREFIX)
}

pub fn parse_tag_list(raw: &str) -> Vec<String> {
    dedup_tags(raw.split(',').map(str::to_string))
}

pub fn dedup_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let tag = normalize_tag(&tag);
        if tag.is_empty() || tag.contains(',') {
            continue;
        }
        if seen.insert(tag.clone()) {
            out.push(tag);
        }
    }
    out
}

pub fn apply_tags(metadata: &mut Metadata, tags: &[String]) {
    metadata.retain(|key, _| !key.starts_with(TAG_FLAG_PREFIX));

    let tags = dedup_tags(tags.iter().cloned());
    metadata.insert(HAS_TAGS_KEY.to_string(), Value::Bool(!tags.is_empty()));
    if tags.is_empty() {
        metadata.remove(TAGS_KEY);
        return;
    }

    for tag in &tags {
        metadata.insert(tag_key(tag), Value::Bool(true));
    }
    metadata.insert(TAGS_KEY.to_string(), Value::String(tags.join(",")));
}

pub fn tags_from_metadata(metadata: &Metadata) -> Vec<String> {
    match metadata.get(TAGS_KEY) {
        Some(Value::String(joined)) => parse_tag_list(joined),
        Some(Value::Array(items)) => dedup_tags(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string)),
        ),
        _ => vec![],
    }
}

/// Turns a free-form model reply (one tag per line) into clean, hyphenated tags.
pub fn clean_suggested_tags(response: &str, max_tags: usize) -> Vec<String> {
    let numbering = Regex::new(r"^\d+[.)]\s*").unwrap_or_else(|_| Regex::new("^$").unwrap());
    let mut cleaned = Vec::new();

    for line in response.lines() {
        let lowered = line.trim().to_lowercase();
        let tag = numbering
            .replace(&lowered, "")
            .replace("- ", "")
            .replace("* ", "")
            .replace("• ", "")
            .replace(['"', '\'', '`'], "");
        let tag = tag.trim().trim_end_matches(',').trim();

        let length = tag.chars().count();
        if length > 1 && length < 30 {
            cleaned.push(tag.split_whitespace().collect::<Vec<_>>().join("-"));
        }
    }

    let mut out = dedup_tags(cleaned);
    out.truncate(max_tags);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_comma_separated_tags() {
        assert_eq!(
            parse_tag_list(" House, rules,,important ,house"),
            vec!["house", "rules", "important"]
        );
        assert!(parse_tag_list(" , ").is_empty());
    }

    #[test]
    fn apply_tags_writes_flags_and_joined_list() {
        let mut metadata = Metadata::new();
        metadata.insert("tag:stale".to_string(), json!(true));
        apply_tags(&mut metadata, &["House".to_string(), "rules".to_string()]);

        assert_eq!(metadata.get("tags"), Some(&json!("house,rules")));
        assert_eq!(metadata.get("has_tags"), Some(&json!(true)));
        assert_eq!(metadata.get("tag:house"), Some(&json!(true)));
        assert!(!metadata.contains_key("tag:stale"));
        assert_eq!(tags_from_metadata(&metadata), vec!["house", "rules"]);
    }

    #[test]
    fn untagged_metadata_is_marked() {
        let mut metadata = Metadata::new();
        apply_tags(&mut metadata, &[]);
        assert_eq!(metadata.get("has_tags"), Some(&json!(false)));
        assert!(tags_from_metadata(&metadata).is_empty());
    }

    #[test]
    fn suggestion_cleanup_strips_bullets_and_hyphenates() {
        let reply = "- Machine Learning\n* \"data-analysis\"\n1. python\n3d-printing\n\nx\n• machine learning\nthis line is far too long to be a useful tag at all";
        assert_eq!(
            clean_suggested_tags(reply, 8),
            vec!["machine-learning", "data-analysis", "python", "3d-printing"]
        );
        assert_eq!(clean_suggested_tags(reply, 1), vec!["machine-learning"]);
    }
}
