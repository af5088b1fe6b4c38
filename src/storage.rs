//! Web storage helpers shared by engines and the script runner.

use std::collections::BTreeMap;

use serde_json::Value;

pub use crate::browser::StorageKind;
use crate::error::{PagewrightError, Result};

/// Expression returning the storage contents (optionally only `keys`) as an object.
pub fn get_expression(kind: StorageKind, keys: Option<&[String]>) -> Result<String> {
    let storage = kind.js_object();
    Ok(match keys {
        Some(keys) => format!(
            r#"(() => {{
                const storage = window.{storage};
                const result = {{}};
                for (const key of {keys}) {{
                    const value = storage.getItem(key);
                    if (value !== null) result[key] = value;
                }}
                return result;
            }})()"#,
            storage = storage,
            keys = serde_json::to_string(keys)?,
        ),
        None => format!(
            r#"(() => {{
                const storage = window.{storage};
                const result = {{}};
                for (let i = 0; i < storage.length; i++) {{
                    const key = storage.key(i);
                    result[key] = storage.getItem(key);
                }}
                return result;
            }})()"#,
            storage = storage,
        ),
    })
}

pub fn set_expression(kind: StorageKind, items: &BTreeMap<String, String>) -> Result<String> {
    Ok(format!(
        r#"(() => {{
            const storage = window.{storage};
            for (const [key, value] of Object.entries({items})) {{
                storage.setItem(key, value);
            }}
            return true;
        }})()"#,
        storage = kind.js_object(),
        items = serde_json::to_string(items)?,
    ))
}

pub fn clear_expression(kind: StorageKind, keys: Option<&[String]>) -> Result<String> {
    let storage = kind.js_object();
    Ok(match keys {
        Some(keys) => format!(
            "(() => {{ for (const key of {keys}) window.{storage}.removeItem(key); return true; }})()",
            keys = serde_json::to_string(keys)?,
            storage = storage,
        ),
        None => format!("(() => {{ window.{}.clear(); return true; }})()", storage),
    })
}

/// Coerce a JSON object into storage items; non-string values are stored as JSON text,
/// `null` as the empty string.
pub fn items_from_json(value: &Value) -> Result<BTreeMap<String, String>> {
    let object = value.as_object().ok_or_else(|| {
        PagewrightError::InvalidActionParameters("storage items must be a JSON object".to_string())
    })?;

    Ok(object
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_expression_targets_the_right_storage() {
        let all = get_expression(StorageKind::Session, None).unwrap();
        assert!(all.contains("window.sessionStorage"));

        let keys = vec!["token".to_string()];
        let some = get_expression(StorageKind::Local, Some(&keys)).unwrap();
        assert!(some.contains("window.localStorage"));
        assert!(some.contains(r#"["token"]"#));
    }

    #[test]
    fn set_expression_embeds_items_as_json() {
        let mut items = BTreeMap::new();
        items.insert("theme".to_string(), "dark \"mode\"".to_string());
        let expr = set_expression(StorageKind::Local, &items).unwrap();
        assert!(expr.contains(r#"{"theme":"dark \"mode\""}"#));
    }

    #[test]
    fn items_from_json_stringifies_values() {
        let items = items_from_json(&json!({"a": "x", "b": 3, "c": null})).unwrap();
        assert_eq!(items["a"], "x");
        assert_eq!(items["b"], "3");
        assert_eq!(items["c"], "");

        assert!(items_from_json(&json!(["a"])).is_err());
    }
}
