//! JSON helpers for comparing desired fields against live objects.
//!
//! Comparison is subset-based: a desired value matches when every field it sets
//! is present with the same value in the live object. Extra live fields come from
//! platform defaulting or other actors and are never drift.

use serde_json::{Map, Value as Json};

/// JSON-pointer paths (RFC 6901) under `prefix` where `desired` is not a subset of `live`.
pub fn subset_diff(desired: &Json, live: &Json, prefix: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut path = prefix.to_string();
    walk(desired, Some(live), &mut path, &mut out);
    out
}

fn walk(desired: &Json, live: Option<&Json>, path: &mut String, out: &mut Vec<String>) {
    match (desired, live) {
        (Json::Object(d), Some(Json::Object(l))) => {
            for (k, dv) in d.iter() {
                let len = path.len();
                path.push('/');
                path.push_str(&escape(k));
                walk(dv, l.get(k), path, out);
                path.truncate(len);
            }
        }
        (Json::Array(d), Some(Json::Array(l))) => {
            if d.len() != l.len() {
                out.push(path.clone());
                return;
            }
            for (i, (dv, lv)) in d.iter().zip(l.iter()).enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&i.to_string());
                walk(dv, Some(lv), path, out);
                path.truncate(len);
            }
        }
        // null in desired means "unset"; an absent live field satisfies it
        (Json::Null, None) => {}
        (dv, Some(lv)) => {
            if !scalar_eq(dv, lv) { out.push(path.clone()); }
        }
        (_, None) => out.push(path.clone()),
    }
}

fn scalar_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn escape(k: &str) -> String { k.replace('~', "~0").replace('/', "~1") }

pub fn unescape(seg: &str) -> String { seg.replace("~1", "/").replace("~0", "~") }

/// `true` when `path` equals `prefix` or lies beneath it.
pub fn path_within(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() { return true; }
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Set `value` at `pointer`, creating intermediate objects. Returns false when a
/// segment crosses a non-container or an out-of-range array index.
pub fn set_pointer(root: &mut Json, pointer: &str, value: Json) -> bool {
    if pointer.is_empty() {
        *root = value;
        return true;
    }
    let segs: Vec<String> = pointer.trim_start_matches('/').split('/').map(unescape).collect();
    let mut cur = root;
    for (i, seg) in segs.iter().enumerate() {
        let last = i + 1 == segs.len();
        cur = match cur {
            Json::Object(map) => {
                if last {
                    map.insert(seg.clone(), value);
                    return true;
                }
                map.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new()))
            }
            Json::Array(arr) => {
                let Ok(idx) = seg.parse::<usize>() else { return false };
                let Some(slot) = arr.get_mut(idx) else { return false };
                if last {
                    *slot = value;
                    return true;
                }
                slot
            }
            _ => return false,
        };
    }
    false
}

/// Remove the value at `pointer`; absent paths are a no-op.
pub fn remove_pointer(root: &mut Json, pointer: &str) {
    let Some((parent, leaf)) = pointer.rsplit_once('/') else { return };
    let leaf = unescape(leaf);
    match root.pointer_mut(parent) {
        Some(Json::Object(map)) => { map.remove(&leaf); }
        Some(Json::Array(arr)) => {
            if let Ok(i) = leaf.parse::<usize>() { if i < arr.len() { arr.remove(i); } }
        }
        _ => {}
    }
}

/// Merge `patch` into `base`: objects merge recursively, everything else replaces.
pub fn deep_merge(base: &mut Json, patch: &Json) {
    match (base, patch) {
        (Json::Object(b), Json::Object(p)) => {
            for (k, pv) in p.iter() {
                match b.get_mut(k) {
                    Some(bv) => deep_merge(bv, pv),
                    None => { b.insert(k.clone(), pv.clone()); }
                }
            }
        }
        (b, p) => *b = p.clone(),
    }
}
