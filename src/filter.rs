//! Metadata filters in Chroma's `where` dialect.
//!
//! Request bodies carry raw JSON filters; they are parsed into [`Filter`] so that bad
//! filters are rejected before reaching the vector store, `tags` conditions can be
//! rewritten onto the per-tag flag keys, and the in-process store can evaluate them.

use std::cmp::Ordering;

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::models::Metadata;
use crate::tags::{self, HAS_TAGS_KEY, TAGS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl Op {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "$eq" => Op::Eq,
            "$ne" => Op::Ne,
            "$gt" => Op::Gt,
            "$gte" => Op::Gte,
            "$lt" => Op::Lt,
            "$lte" => Op::Lte,
            "$in" => Op::In,
            "$nin" => Op::Nin,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "$eq",
            Op::Ne => "$ne",
            Op::Gt => "$gt",
            Op::Gte => "$gte",
            Op::Lt => "$lt",
            Op::Lte => "$lte",
            Op::In => "$in",
            Op::Nin => "$nin",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { key: String, op: Op, value: Value },
}

impl Filter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Field {
            key: key.into(),
            op: Op::Eq,
            value: value.into(),
        }
    }

    /// Retrieval filter for a tag selection. `None` means "no restriction".
    pub fn for_tags(tag_list: &[String], include_untagged: bool) -> Option<Self> {
        let tag_list = tags::dedup_tags(tag_list.iter().cloned());
        if tag_list.is_empty() {
            return None;
        }

        let mut any_of: Vec<Filter> = tag_list
            .iter()
            .map(|tag| Filter::eq(tags::tag_key(tag), true))
            .collect();
        if include_untagged {
            any_of.push(Filter::eq(HAS_TAGS_KEY, false));
        }
        Some(Filter::Or(any_of))
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(object) = value else {
            bail!("filter must be a JSON object");
        };
        if object.is_empty() {
            bail!("filter object must not be empty");
        }

        let mut clauses = Vec::with_capacity(object.len());
        for (key, condition) in object {
            clauses.push(parse_clause(key, condition)?);
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Filter::And(clauses))
        }
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut items) => {
                items.push(other);
                Filter::And(items)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn to_chroma(&self) -> Value {
        match self {
            Filter::And(items) => logical_to_chroma("$and", items),
            Filter::Or(items) => logical_to_chroma("$or", items),
            Filter::Field { key, op, value } => {
                let mut condition = Map::new();
                condition.insert(op.as_str().to_string(), value.clone());
                let mut field = Map::new();
                field.insert(key.clone(), Value::Object(condition));
                Value::Object(field)
            }
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|item| item.matches(metadata)),
            Filter::Or(items) => items.iter().any(|item| item.matches(metadata)),
            Filter::Field { key, op, value } => {
                let Some(actual) = metadata.get(key) else {
                    return false;
                };
                match op {
                    Op::Eq => values_equal(actual, value),
                    Op::Ne => !values_equal(actual, value),
                    Op::In => as_list(value).iter().any(|v| values_equal(actual, v)),
                    Op::Nin => !as_list(value).iter().any(|v| values_equal(actual, v)),
                    Op::Gt => compare(actual, value) == Some(Ordering::Greater),
                    Op::Gte => matches!(
                        compare(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    Op::Lt => compare(actual, value) == Some(Ordering::Less),
                    Op::Lte => matches!(
                        compare(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
        }
    }
}

fn logical_to_chroma(op: &str, items: &[Filter]) -> Value {
    if items.len() == 1 {
        return items[0].to_chroma();
    }
    json!({ op: items.iter().map(Filter::to_chroma).collect::<Vec<_>>() })
}

fn parse_clause(key: &str, condition: &Value) -> Result<Filter> {
    match key {
        "$and" | "$or" => {
            let Value::Array(items) = condition else {
                bail!("{key} expects an array of filters");
            };
            if items.is_empty() {
                bail!("{key} expects at least one filter");
            }
            let parsed = items
                .iter()
                .map(Filter::from_json)
                .collect::<Result<Vec<_>>>()?;
            Ok(if key == "$and" {
                Filter::And(parsed)
            } else {
                Filter::Or(parsed)
            })
        }
        other if other.starts_with('$') => bail!("unsupported logical operator {other}"),
        field => {
            let (op, value) = parse_condition(field, condition)?;
            if field == TAGS_KEY {
                return tag_clause(op, &value);
            }
            Ok(Filter::Field {
                key: field.to_string(),
                op,
                value,
            })
        }
    }
}

fn parse_condition(field: &str, condition: &Value) -> Result<(Op, Value)> {
    let (op, value) = match condition {
        Value::Object(object) => {
            let mut entries = object.iter();
            let (Some((raw_op, value)), None) = (entries.next(), entries.next()) else {
                bail!("condition on {field} must contain exactly one operator");
            };
            let Some(op) = Op::parse(raw_op) else {
                bail!("unsupported operator {raw_op} on {field}");
            };
            (op, value.clone())
        }
        scalar => (Op::Eq, scalar.clone()),
    };

    match op {
        Op::In | Op::Nin => {
            let Value::Array(items) = &value else {
                bail!("{} on {field} expects an array", op.as_str());
            };
            if items.iter().any(|item| !is_scalar(item)) {
                bail!("{} on {field} expects an array of scalars", op.as_str());
            }
        }
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            if !value.is_number() {
                bail!("{} on {field} expects a number", op.as_str());
            }
        }
        Op::Eq | Op::Ne => {
            if !is_scalar(&value) {
                bail!("{} on {field} expects a string, number or bool", op.as_str());
            }
        }
    }

    Ok((op, value))
}

fn tag_clause(op: Op, value: &Value) -> Result<Filter> {
    let wanted: Vec<String> = match (op, value) {
        (Op::Eq, Value::String(tag)) => vec![tag.clone()],
        (Op::In, Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => bail!("tags filters support only $eq and $in with string values"),
    };

    match Filter::for_tags(&wanted, false) {
        Some(filter) => Ok(filter),
        None => bail!("tags filter must name at least one tag"),
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn as_list(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items,
        _ => &[],
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    left.as_f64()?.partial_cmp(&right.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn scalar_condition_means_equality() {
        let filter = Filter::from_json(&json!({ "source": "rules.pdf" })).unwrap();
        assert_eq!(filter, Filter::eq("source", "rules.pdf"));
        assert_eq!(
            filter.to_chroma(),
            json!({ "source": { "$eq": "rules.pdf" } })
        );
    }

    #[test]
    fn several_fields_become_explicit_and() {
        let filter = Filter::from_json(&json!({ "source": "a.txt", "chunk": { "$gte": 2 } })).unwrap();
        let Filter::And(items) = &filter else {
            panic!("expected $and, got {filter:?}");
        };
        assert_eq!(items.len(), 2);

        let hit = metadata(json!({ "source": "a.txt", "chunk": 3 }));
        let miss = metadata(json!({ "source": "a.txt", "chunk": 1 }));
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }

    #[test]
    fn tags_in_is_rewritten_to_tag_flags() {
        let filter = Filter::from_json(&json!({ "tags": { "$in": ["House", "pool"] } })).unwrap();
        assert_eq!(
            filter.to_chroma(),
            json!({ "$or": [ { "tag:house": { "$eq": true } }, { "tag:pool": { "$eq": true } } ] })
        );

        let tagged = metadata(json!({ "tags": "house,rules", "tag:house": true, "tag:rules": true }));
        let other = metadata(json!({ "tags": "garden", "tag:garden": true }));
        assert!(filter.matches(&tagged));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn single_tag_collapses_without_or() {
        let filter = Filter::from_json(&json!({ "tags": "house" })).unwrap();
        assert_eq!(filter.to_chroma(), json!({ "tag:house": { "$eq": true } }));
    }

    #[test]
    fn negative_tag_operators_are_rejected() {
        let err = Filter::from_json(&json!({ "tags": { "$nin": ["house"] } })).unwrap_err();
        assert!(err.to_string().contains("tags filters"));
    }

    #[test]
    fn include_untagged_adds_has_tags_branch() {
        let filter = Filter::for_tags(&["house".to_string()], true).unwrap();
        let untagged = metadata(json!({ "has_tags": false }));
        let wrong_tag = metadata(json!({ "has_tags": true, "tag:garden": true }));
        assert!(filter.matches(&untagged));
        assert!(!filter.matches(&wrong_tag));
        assert!(Filter::for_tags(&[], true).is_none());
    }

    #[test]
    fn missing_key_never_matches() {
        let filter = Filter::from_json(&json!({ "page": { "$ne": 3 } })).unwrap();
        assert!(!filter.matches(&metadata(json!({ "source": "x" }))));
        assert!(filter.matches(&metadata(json!({ "page": 4 }))));
    }

    #[test]
    fn invalid_filters_are_rejected() {
        assert!(Filter::from_json(&json!([])).is_err());
        assert!(Filter::from_json(&json!({})).is_err());
        assert!(Filter::from_json(&json!({ "page": { "$gt": "3" } })).is_err());
        assert!(Filter::from_json(&json!({ "page": { "$like": 3 } })).is_err());
        assert!(Filter::from_json(&json!({ "page": { "$in": 3 } })).is_err());
        assert!(Filter::from_json(&json!({ "$not": [] })).is_err());
        assert!(Filter::from_json(&json!({ "$or": [] })).is_err());
    }

    #[test]
    fn integer_and_float_compare_equal() {
        let filter = Filter::from_json(&json!({ "page": 2.0 })).unwrap();
        assert!(filter.matches(&metadata(json!({ "page": 2 }))));
    }
}
