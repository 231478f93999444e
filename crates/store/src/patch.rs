//! JSON merge patches (RFC 7386) between a base and a target document.

use serde_json::{Map, Value as Json};

/// Smallest merge patch turning `base` into `target`. Removed keys become
/// `null`; arrays and scalars are replaced wholesale.
pub fn merge_patch(base: &Json, target: &Json) -> Json {
    match (base, target) {
        (Json::Object(bo), Json::Object(to)) => {
            let mut out = Map::new();
            for (k, tv) in to.iter() {
                match bo.get(k) {
                    Some(bv) if bv == tv => {}
                    Some(bv) if bv.is_object() && tv.is_object() => {
                        out.insert(k.clone(), merge_patch(bv, tv));
                    }
                    _ => {
                        out.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in bo.keys() {
                if !to.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(out)
        }
        (_, t) => t.clone(),
    }
}

/// Apply a merge patch in place.
pub fn apply_merge_patch(doc: &mut Json, patch: &Json) {
    let Json::Object(po) = patch else {
        *doc = patch.clone();
        return;
    };
    if !doc.is_object() {
        *doc = Json::Object(Map::new());
    }
    if let Json::Object(dobj) = doc {
        for (k, pv) in po.iter() {
            if pv.is_null() {
                dobj.remove(k);
            } else {
                apply_merge_patch(dobj.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

/// Status-subresource patch guarded by the base resource version. The API
/// server rejects it with a conflict when the stored version moved on.
pub fn status_patch(resource_version: Option<&str>, base_status: &Json, target_status: &Json) -> Json {
    let mut out = Map::new();
    if let Some(rv) = resource_version {
        out.insert("metadata".into(), serde_json::json!({ "resourceVersion": rv }));
    }
    out.insert("status".into(), merge_patch(base_status, target_status));
    Json::Object(out)
}

pub fn is_empty_patch(patch: &Json) -> bool {
    patch.as_object().map(|m| m.is_empty()).unwrap_or(false)
}
