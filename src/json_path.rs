//! Dotted-path walker over a [`serde_json::Value`] tree (§9).
//!
//! Resolves dotted attribute paths (`choices.0.message.content`) against a
//! JSON tree. A path is a dot-separated sequence of components; a component
//! that parses as an integer indexes an array (negative indices count from
//! the end, `-1` is the last element); any other component is an object key.

use serde_json::Value;

/// Splits a dotted path into components, e.g. `"choices.0.delta.content"`.
fn components(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

fn array_index(len: usize, idx: i64) -> Option<usize> {
    if idx >= 0 {
        let idx = idx as usize;
        (idx < len).then_some(idx)
    } else {
        let from_end = (-idx) as usize;
        (from_end <= len).then(|| len - from_end)
    }
}

/// Reads the value at `path`, or `None` if any segment is missing/out of range.
pub fn get_field_value<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for comp in components(path) {
        current = match current {
            Value::Object(map) => map.get(comp)?,
            Value::Array(arr) => {
                let idx: i64 = comp.parse().ok()?;
                let idx = array_index(arr.len(), idx)?;
                &arr[idx]
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Convenience: reads a string at `path`.
pub fn get_str<'a>(root: &'a Value, path: &str) -> Option<&'a str> {
    get_field_value(root, path).and_then(Value::as_str)
}

/// Convenience: reads a u64 at `path` (accepts numbers only).
pub fn get_u64(root: &Value, path: &str) -> Option<u64> {
    get_field_value(root, path).and_then(Value::as_u64)
}

/// Writes `value` at `path`, creating intermediate objects/array slots as
/// needed. Array components beyond the current length extend the array with
/// `Value::Null` padding; negative indices require the slot to already exist.
pub fn set_field_value(root: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let comps = components(path);
    if comps.is_empty() {
        return Err("empty path".to_string());
    }
    set_recursive(root, &comps, value)
}

fn set_recursive(current: &mut Value, comps: &[&str], value: Value) -> Result<(), String> {
    let (head, rest) = (comps[0], &comps[1..]);

    if let Ok(idx) = head.parse::<i64>() {
        if !current.is_array() {
            *current = Value::Array(Vec::new());
        }
        let arr = current.as_array_mut().unwrap();
        if idx >= 0 {
            let idx = idx as usize;
            while arr.len() <= idx {
                arr.push(Value::Null);
            }
            if rest.is_empty() {
                arr[idx] = value;
                return Ok(());
            }
            return set_recursive(&mut arr[idx], rest, value);
        } else {
            let idx = array_index(arr.len(), idx)
                .ok_or_else(|| format!("negative index {idx} out of range for length {}", arr.len()))?;
            if rest.is_empty() {
                arr[idx] = value;
                return Ok(());
            }
            return set_recursive(&mut arr[idx], rest, value);
        }
    }

    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    let map = current.as_object_mut().unwrap();
    if rest.is_empty() {
        map.insert(head.to_string(), value);
        return Ok(());
    }
    let entry = map.entry(head.to_string()).or_insert(Value::Null);
    set_recursive(entry, rest, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_nested_object_path() {
        let v = json!({"choices": [{"delta": {"content": "hi"}}]});
        assert_eq!(get_str(&v, "choices.0.delta.content"), Some("hi"));
    }

    #[test]
    fn negative_index_reads_last_element() {
        let v = json!({"content": [{"text": "a"}, {"text": "b"}]});
        assert_eq!(get_str(&v, "content.-1.text"), Some("b"));
    }

    #[test]
    fn missing_path_returns_none() {
        let v = json!({"a": 1});
        assert_eq!(get_field_value(&v, "a.b.c"), None);
    }

    #[test]
    fn set_creates_intermediate_structures() {
        let mut v = json!({});
        set_field_value(&mut v, "messages.0.content", json!("hi")).unwrap();
        assert_eq!(v["messages"][0]["content"], json!("hi"));
    }

    #[test]
    fn set_overwrites_existing_array_element() {
        let mut v = json!({"messages": [{"role": "user", "content": "old"}]});
        set_field_value(&mut v, "messages.0.content", json!("new")).unwrap();
        assert_eq!(v["messages"][0]["content"], json!("new"));
        assert_eq!(v["messages"][0]["role"], json!("user"));
    }
}
