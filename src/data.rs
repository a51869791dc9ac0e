//! Named value storage for workflow data.
//!
//! Workflows keep two maps: `data`, which the repository persists, and
//! `transient_data`, which never survives a reload. Both are plain
//! string-keyed [`serde_json::Value`] maps so any repository backend can
//! (de)serialize `data` uniformly regardless of what a particular workflow
//! type stores in it.

use std::collections::HashMap;

use serde_json::Value;

/// A string-keyed bag of JSON values, used for both persistent and transient
/// workflow storage.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct NamedValues(HashMap<String, Value>);

impl NamedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.0.get(name).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn set_serialize<T: serde::Serialize>(&mut self, name: impl Into<String>, value: &T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.0.insert(name.into(), v);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn merge_from(&mut self, other: NamedValues) {
        self.0.extend(other.0);
    }
}

impl From<HashMap<String, Value>> for NamedValues {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_values() {
        let mut values = NamedValues::new();
        values.set_serialize("count", &42u32);
        assert_eq!(values.get_as::<u32>("count"), Some(42));
    }

    #[test]
    fn missing_key_is_none() {
        let values = NamedValues::new();
        assert_eq!(values.get("missing"), None);
    }

    #[test]
    fn merge_overwrites_matching_keys() {
        let mut a = NamedValues::new();
        a.set("x", 1);
        let mut b = NamedValues::new();
        b.set("x", 2);
        a.merge_from(b);
        assert_eq!(a.get_as::<i32>("x"), Some(2));
    }
}
