//! Cache key derivation.
//!
//! A key is the hex SHA-256 of the request method, the normalised path and
//! a canonical rendering of the request options, so logically equal
//! requests share one entry regardless of parameter order.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Opaque response cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(method: &str, path: &str, options: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(normalize_path(path).as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_json(options).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a key received over the API.
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sort query parameters so `?b=2&a=1` and `?a=1&b=2` collide.
pub fn normalize_path(path_and_query: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };

    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort();

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{path}?{query}")
}

/// JSON text with object keys sorted and null members dropped.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> =
                map.iter().filter(|(_, value)| !value.is_null()).collect();
            members.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (index, (key, value)) in members.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_order_does_not_matter() {
        assert_eq!(normalize_path("/a?b=2&a=1"), "/a?a=1&b=2");
        assert_eq!(
            CacheKey::for_request("GET", "/a?b=2&a=1", &Value::Null),
            CacheKey::for_request("get", "/a?a=1&b=2", &Value::Null)
        );
    }

    #[test]
    fn empty_query_is_dropped() {
        assert_eq!(normalize_path("/a?"), "/a");
        assert_eq!(normalize_path("/a"), "/a");
    }

    #[test]
    fn option_order_and_nulls_do_not_matter() {
        let left = json!({"lang": "en", "depth": 2, "style": null});
        let right = json!({"depth": 2, "lang": "en"});
        assert_eq!(canonical_json(&left), r#"{"depth":2,"lang":"en"}"#);
        assert_eq!(
            CacheKey::for_request("POST", "/summarize", &left),
            CacheKey::for_request("POST", "/summarize", &right)
        );
    }

    #[test]
    fn different_requests_get_different_keys() {
        let base = CacheKey::for_request("GET", "/a", &json!({"x": 1}));
        assert_ne!(base, CacheKey::for_request("GET", "/b", &json!({"x": 1})));
        assert_ne!(base, CacheKey::for_request("POST", "/a", &json!({"x": 1})));
        assert_ne!(base, CacheKey::for_request("GET", "/a", &json!({"x": 2})));
        assert_eq!(base.as_str().len(), 64);
    }
}
