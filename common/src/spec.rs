//! Helpers for the opaque per-core tunnel spec.
//!
//! A spec is a JSON object whose keys differ per core and per mode. The
//! cores accept several aliases for the same field (`proxy_port` /
//! `remote_port` / `listen_port`), so lookups take a key list and return the
//! first usable value.

use serde_json::{Map, Value};

/// Opaque per-core configuration mapping.
pub type Spec = Map<String, Value>;

pub trait SpecExt {
    /// First non-empty string value among `keys`.
    fn str_at(&self, keys: &[&str]) -> Option<String>;

    /// First value among `keys` that is a number or numeric string in u16
    /// range.
    fn port_at(&self, keys: &[&str]) -> Option<u16>;

    /// First integer value among `keys`.
    fn int_at(&self, keys: &[&str]) -> Option<i64>;

    /// First boolean among `keys`; accepts JSON booleans only.
    fn bool_at(&self, keys: &[&str]) -> bool;

    fn set_str(&mut self, key: &str, value: &str);
    fn set_port(&mut self, key: &str, value: u16);
}

impl SpecExt for Spec {
    fn str_at(&self, keys: &[&str]) -> Option<String> {
        for key in keys {
            if let Some(Value::String(s)) = self.get(*key) {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
        None
    }

    fn port_at(&self, keys: &[&str]) -> Option<u16> {
        for key in keys {
            match self.get(*key) {
                Some(Value::Number(n)) => {
                    if let Some(port) = n.as_u64().and_then(|v| u16::try_from(v).ok()) {
                        return Some(port);
                    }
                }
                Some(Value::String(s)) => {
                    if let Ok(port) = s.trim().parse::<u16>() {
                        return Some(port);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn int_at(&self, keys: &[&str]) -> Option<i64> {
        for key in keys {
            match self.get(*key) {
                Some(Value::Number(n)) => {
                    if let Some(v) = n.as_i64() {
                        return Some(v);
                    }
                }
                Some(Value::String(s)) => {
                    if let Ok(v) = s.trim().parse::<i64>() {
                        return Some(v);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn bool_at(&self, keys: &[&str]) -> bool {
        keys.iter()
            .any(|key| matches!(self.get(*key), Some(Value::Bool(true))))
    }

    fn set_str(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), Value::String(value.to_string()));
    }

    fn set_port(&mut self, key: &str, value: u16) {
        self.insert(key.to_string(), Value::Number(value.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: Value) -> Spec {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn str_at_skips_empty_and_missing() {
        let s = spec(json!({"token": "  ", "auth": "user:pass"}));
        assert_eq!(s.str_at(&["token", "auth"]), Some("user:pass".into()));
        assert_eq!(s.str_at(&["missing"]), None);
    }

    #[test]
    fn port_at_accepts_numbers_and_numeric_strings() {
        let s = spec(json!({"listen_port": "7000", "remote_port": 8080}));
        assert_eq!(s.port_at(&["proxy_port", "remote_port"]), Some(8080));
        assert_eq!(s.port_at(&["listen_port"]), Some(7000));
        let bad = spec(json!({"listen_port": 70000}));
        assert_eq!(bad.port_at(&["listen_port"]), None);
    }

    #[test]
    fn bool_at_requires_true() {
        let s = spec(json!({"sniffer": false, "accept_udp": true}));
        assert!(s.bool_at(&["accept_udp"]));
        assert!(!s.bool_at(&["sniffer"]));
        assert!(!s.bool_at(&["missing"]));
    }
}
