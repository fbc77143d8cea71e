//! Three-way patch computation.
//!
//! `last` is what was submitted before, `current` what is submitted now and
//! `live` what the cluster holds. Keys dropped between `last` and `current`
//! become deletions; everything else is diffed against `live`, so fields the
//! server or other writers own are left alone. A missing `live` means
//! "unknown": the patch then carries all of `current` plus every deletion.

use serde_json::{Map, Value};

use crate::schema::MergeSchema;

type Object = Map<String, Value>;

const SET_ELEMENT_ORDER: &str = "$setElementOrder";
const PATCH_DIRECTIVE: &str = "$patch";

/// The documents cannot be expressed as a strategic patch under the schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("strategic merge not possible: {0}")]
pub struct Fallback(pub String);

/// RFC 7386 merge patch: objects recurse, arrays are replaced wholesale.
pub fn json_merge(last: Option<&Object>, current: &Object, live: Option<&Object>) -> Value {
    let differ = Differ { schema: None, live_known: live.is_some() };
    // Without a schema there are no keyed lists, so nothing can fall back.
    Value::Object(differ.object(&mut Vec::new(), last, current, live).unwrap_or_default())
}

/// Strategic merge patch: lists the schema keys are merged element by element.
pub fn strategic_merge(
    last: Option<&Object>,
    current: &Object,
    live: Option<&Object>,
    schema: &MergeSchema,
) -> Result<Value, Fallback> {
    let differ = Differ { schema: Some(schema), live_known: live.is_some() };
    differ.object(&mut Vec::new(), last, current, live).map(Value::Object)
}

struct Differ<'s> {
    schema: Option<&'s MergeSchema>,
    live_known: bool,
}

impl Differ<'_> {
    fn object(&self, path: &mut Vec<String>, last: Option<&Object>, cur: &Object, live: Option<&Object>) -> Result<Object, Fallback> {
        let mut out = Object::new();
        for (key, cv) in cur {
            path.push(key.clone());
            let res = self.field(path, key, last.and_then(|m| m.get(key)), cv, live.and_then(|m| m.get(key)), &mut out);
            path.pop();
            res?;
        }
        if let Some(last) = last {
            for key in last.keys().filter(|k| !cur.contains_key(*k)) {
                if self.may_exist(live.map(|l| l.contains_key(key))) {
                    out.insert(key.clone(), Value::Null);
                }
            }
        }
        Ok(out)
    }

    fn field(
        &self,
        path: &mut Vec<String>,
        key: &str,
        last: Option<&Value>,
        cur: &Value,
        live: Option<&Value>,
        out: &mut Object,
    ) -> Result<(), Fallback> {
        let merge_key = self.schema.and_then(|s| s.merge_key(path));
        match (cur, live) {
            (Value::Object(c), Some(Value::Object(l))) => {
                let sub = self.object(path, last.and_then(Value::as_object), c, Some(l))?;
                if !sub.is_empty() {
                    out.insert(key.to_string(), Value::Object(sub));
                }
            }
            (Value::Object(c), None) => {
                let sub = self.object(path, last.and_then(Value::as_object), c, None)?;
                out.insert(key.to_string(), Value::Object(sub));
            }
            (Value::Array(c), _) if merge_key.is_some() => {
                let mk = merge_key.unwrap_or_default();
                self.keyed_list(path, key, mk, last, c, live, out)?;
            }
            _ if live != Some(cur) => {
                out.insert(key.to_string(), cur.clone());
            }
            _ => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn keyed_list(
        &self,
        path: &mut Vec<String>,
        key: &str,
        merge_key: &str,
        last: Option<&Value>,
        cur: &[Value],
        live: Option<&Value>,
        out: &mut Object,
    ) -> Result<(), Fallback> {
        let id = |v: &Value| v.as_object().and_then(|m| m.get(merge_key)).cloned();
        let missing = || Fallback(format!("element of {} without {merge_key}", path.join(".")));
        let live_items: &[Value] = live.and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
        let last_items: &[Value] = last.and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
        let find = |items: &'_ [Value], want: &Value| items.iter().find(|v| id(v).as_ref() == Some(want)).cloned();

        let mut cur_ids = Vec::with_capacity(cur.len());
        for item in cur {
            cur_ids.push(id(item).ok_or_else(missing)?);
        }
        let mut last_ids = Vec::with_capacity(last_items.len());
        for item in last_items {
            last_ids.push(id(item).ok_or_else(missing)?);
        }

        let mut entries = Vec::new();
        for (item, item_id) in cur.iter().zip(&cur_ids) {
            let live_item = find(live_items, item_id);
            match (item.as_object(), live_item.as_ref().and_then(Value::as_object)) {
                (Some(c), Some(l)) => {
                    let last_item = find(last_items, item_id);
                    let mut sub = self.object(path, last_item.as_ref().and_then(Value::as_object), c, Some(l))?;
                    if !sub.is_empty() {
                        sub.insert(merge_key.to_string(), item_id.clone());
                        entries.push(Value::Object(sub));
                    }
                }
                _ => entries.push(item.clone()),
            }
        }
        for item_id in last_ids.iter().filter(|i| !cur_ids.contains(i)) {
            if self.may_exist(live.map(|_| find(live_items, item_id).is_some())) {
                let mut del = keyed(merge_key, item_id);
                del.insert(PATCH_DIRECTIVE.to_string(), Value::String("delete".into()));
                entries.push(Value::Object(del));
            }
        }

        let live_ids: Vec<Value> = live_items.iter().filter_map(|v| id(v)).collect();
        let live_order: Vec<&Value> = live_ids.iter().filter(|i| cur_ids.contains(i)).collect();
        let cur_order: Vec<&Value> = cur_ids.iter().filter(|i| live_ids.contains(i)).collect();
        if entries.is_empty() && live_order == cur_order {
            return Ok(());
        }
        let order = cur_ids.iter().map(|i| Value::Object(keyed(merge_key, i))).collect();
        out.insert(format!("{SET_ELEMENT_ORDER}/{key}"), Value::Array(order));
        if !entries.is_empty() {
            out.insert(key.to_string(), Value::Array(entries));
        }
        Ok(())
    }

    /// Deletions are sent when the live document still has the field, or is unknown.
    fn may_exist(&self, in_live: Option<bool>) -> bool {
        !self.live_known || in_live.unwrap_or(false)
    }
}

fn keyed(merge_key: &str, id: &Value) -> Object {
    let mut m = Object::new();
    m.insert(merge_key.to_string(), id.clone());
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use kready_core::KindRef;
    use serde_json::json;

    fn obj(v: Value) -> Object {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn json_merge_deletes_dropped_keys_and_keeps_foreign_ones() {
        let last = obj(json!({"data": {"a": "1", "b": "2"}}));
        let cur = obj(json!({"data": {"a": "1"}}));
        let live = obj(json!({"data": {"a": "1", "b": "2", "c": "server"}}));
        let patch = json_merge(Some(&last), &cur, Some(&live));
        assert_eq!(patch, json!({"data": {"b": null}}));
    }

    #[test]
    fn json_merge_skips_deletions_the_live_object_no_longer_has() {
        let last = obj(json!({"data": {"a": "1", "b": "2"}}));
        let cur = obj(json!({"data": {"a": "1"}}));
        let live = obj(json!({"data": {"a": "1"}}));
        assert_eq!(json_merge(Some(&last), &cur, Some(&live)), json!({}));
        // Unknown live: send everything.
        assert_eq!(json_merge(Some(&last), &cur, None), json!({"data": {"a": "1", "b": null}}));
    }

    #[test]
    fn json_merge_replaces_arrays_wholesale() {
        let cur = obj(json!({"spec": {"ports": [{"port": 80}, {"port": 443}]}}));
        let live = obj(json!({"spec": {"ports": [{"port": 80}]}}));
        let patch = json_merge(None, &cur, Some(&live));
        assert_eq!(patch, json!({"spec": {"ports": [{"port": 80}, {"port": 443}]}}));
    }

    fn deploy_schema() -> &'static MergeSchema {
        schema::for_kind(&KindRef::new("apps", "v1", "Deployment")).unwrap()
    }

    fn containers(list: Value) -> Object {
        obj(json!({"spec": {"template": {"spec": {"containers": list}}}}))
    }

    #[test]
    fn strategic_merge_patches_elements_by_key() {
        let last = containers(json!([{"name": "app", "image": "web:1"}, {"name": "sidecar", "image": "proxy:1"}]));
        let cur = containers(json!([{"name": "app", "image": "web:2"}]));
        let live = containers(json!([{"name": "app", "image": "web:1", "imagePullPolicy": "IfNotPresent"},
                                     {"name": "sidecar", "image": "proxy:1"}]));
        let patch = strategic_merge(Some(&last), &cur, Some(&live), deploy_schema()).unwrap();
        assert_eq!(
            patch,
            json!({"spec": {"template": {"spec": {
                "$setElementOrder/containers": [{"name": "app"}],
                "containers": [{"name": "app", "image": "web:2"}, {"name": "sidecar", "$patch": "delete"}]
            }}}})
        );
    }

    #[test]
    fn strategic_merge_recurses_into_nested_keyed_lists() {
        let last = containers(json!([{"name": "app", "env": [{"name": "A", "value": "1"}]}]));
        let cur = containers(json!([{"name": "app", "env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]}]));
        let live = last.clone();
        let patch = strategic_merge(Some(&last), &cur, Some(&live), deploy_schema()).unwrap();
        assert_eq!(
            patch["spec"]["template"]["spec"],
            json!({
                "$setElementOrder/containers": [{"name": "app"}],
                "containers": [{"name": "app", "$setElementOrder/env": [{"name": "A"}, {"name": "B"}], "env": [{"name": "B", "value": "2"}]}]
            })
        );
    }

    #[test]
    fn strategic_merge_reports_reordering() {
        let cur = containers(json!([{"name": "b"}, {"name": "a"}]));
        let live = containers(json!([{"name": "a"}, {"name": "b"}]));
        let patch = strategic_merge(None, &cur, Some(&live), deploy_schema()).unwrap();
        assert_eq!(patch["spec"]["template"]["spec"], json!({"$setElementOrder/containers": [{"name": "b"}, {"name": "a"}]}));
    }

    #[test]
    fn element_without_merge_key_falls_back() {
        let cur = containers(json!([{"image": "web:2"}]));
        let err = strategic_merge(None, &cur, None, deploy_schema()).unwrap_err();
        assert!(err.0.contains("spec.template.spec.containers"), "{err}");
    }

    #[test]
    fn unchanged_documents_give_an_empty_patch() {
        let doc = containers(json!([{"name": "app", "image": "web:1"}]));
        assert_eq!(strategic_merge(Some(&doc), &doc, Some(&doc), deploy_schema()).unwrap(), json!({}));
        assert_eq!(json_merge(Some(&doc), &doc, Some(&doc)), json!({}));
    }
}
