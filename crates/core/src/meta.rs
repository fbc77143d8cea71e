//! Accessors for the metadata/status fields every kind shares.

use serde_json::Value;

pub fn name(obj: &Value) -> Option<&str> {
    obj.get("metadata")?.get("name")?.as_str()
}

pub fn namespace(obj: &Value) -> Option<&str> {
    obj.get("metadata")?.get("namespace")?.as_str()
}

pub fn uid(obj: &Value) -> Option<&str> {
    obj.get("metadata")?.get("uid")?.as_str()
}

pub fn resource_version(obj: &Value) -> Option<&str> {
    obj.get("metadata")?.get("resourceVersion")?.as_str()
}

pub fn generation(obj: &Value) -> Option<i64> {
    obj.get("metadata")?.get("generation")?.as_i64()
}

pub fn observed_generation(obj: &Value) -> Option<i64> {
    obj.get("status")?.get("observedGeneration")?.as_i64()
}

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get("annotations")?.get(key)?.as_str()
}

/// True when any `metadata.ownerReferences[].uid` equals `owner_uid`.
pub fn is_owned_by(obj: &Value, owner_uid: &str) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .map(|refs| refs.iter().any(|r| r.get("uid").and_then(Value::as_str) == Some(owner_uid)))
        .unwrap_or(false)
}

/// Compare two resource versions. Numeric versions compare numerically;
/// anything else only compares equal or unknown.
pub fn resource_version_cmp(a: &str, b: &str) -> Option<std::cmp::Ordering> {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => Some(x.cmp(&y)),
        _ if a == b => Some(std::cmp::Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn owner_references_match_by_uid() {
        let rs = json!({"metadata": {"ownerReferences": [{"kind": "Deployment", "uid": "u-1"}]}});
        assert!(is_owned_by(&rs, "u-1"));
        assert!(!is_owned_by(&rs, "u-2"));
        assert!(!is_owned_by(&json!({}), "u-1"));
    }

    #[test]
    fn resource_versions_compare_numerically() {
        assert_eq!(resource_version_cmp("9", "10"), Some(Ordering::Less));
        assert_eq!(resource_version_cmp("abc", "abc"), Some(Ordering::Equal));
        assert_eq!(resource_version_cmp("abc", "abd"), None);
    }
}
