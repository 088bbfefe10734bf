//! Per-job execution context.
//!
//! A single-level map of string keys to JSON values. Dotted paths
//! address nested keys for reads; results from automations and
//! plugins are deep-merged in, with `incident` overlaid at the second
//! level so enrichment steps never clobber each other's incident
//! fields.

use serde_json::{Map, Value};

/// Key whose value is merged at the second level instead of replaced.
pub const INCIDENT_KEY: &str = "incident";

/// Script results may carry incident changes under this key; they are
/// folded into `incident` and removed from the result.
pub const INCIDENT_UPDATES_KEY: &str = "incident_updates";

/// Mutable context owned by exactly one evaluator for one job.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    map: Map<String, Value>,
}

impl ContextStore {
    pub fn new(initial: Map<String, Value>) -> Self {
        let mut store = Self::default();
        store.set(initial);
        store
    }

    /// Replace the current map. An input consisting of a single
    /// `context` key holding a map is flattened to top level.
    pub fn set(&mut self, input: Map<String, Value>) {
        if input.len() == 1 {
            if let Some(Value::Object(inner)) = input.get("context") {
                self.map = inner.clone();
                return;
            }
        }
        self.map = input;
    }

    pub fn get(&self) -> &Map<String, Value> {
        &self.map
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.map
    }

    /// Resolve a dotted path. Empty segments are ignored; traversal
    /// through a non-object value yields `None`.
    pub fn resolve_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let first = segments.next()?;
        let mut current = self.map.get(first)?;
        for segment in segments {
            match current {
                Value::Object(obj) => current = obj.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Merge a result object into the context: `incident` is merged as
    /// a second-level overlay, every other key is deep-merged (object
    /// values combine recursively, scalars and arrays replace).
    pub fn merge_result(&mut self, result: Map<String, Value>) {
        let mut rest = Map::new();
        for (key, value) in result {
            if key == INCIDENT_KEY {
                self.merge_incident(value);
            } else {
                rest.insert(key, value);
            }
        }
        deep_merge(&mut self.map, &rest);
    }

    /// Overlay a value onto `incident` at the second level: existing
    /// subkeys are preserved unless the overlay names them.
    pub fn merge_incident(&mut self, overlay: Value) {
        let Value::Object(overlay) = overlay else {
            // Non-map incident payloads replace wholesale
            self.map.insert(INCIDENT_KEY.to_string(), overlay);
            return;
        };

        match self.map.get_mut(INCIDENT_KEY) {
            Some(Value::Object(existing)) => {
                for (k, v) in overlay {
                    existing.insert(k, v);
                }
            }
            _ => {
                self.map
                    .insert(INCIDENT_KEY.to_string(), Value::Object(overlay));
            }
        }
    }
}

/// Recursively merge `overlay` into `base`: object values merge
/// key-by-key, everything else is replaced. Used to build invocation
/// payloads (params atop context) without mutating either input's owner.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_set_flattens_single_context_key() {
        let mut store = ContextStore::default();
        store.set(obj(json!({"context": {"a": 1, "b": 2}})));
        assert_eq!(store.get().get("a"), Some(&json!(1)));
        assert!(store.get().get("context").is_none());
    }

    #[test]
    fn test_set_keeps_context_key_among_others() {
        let mut store = ContextStore::default();
        store.set(obj(json!({"context": {"a": 1}, "extra": true})));
        assert!(store.get().get("context").is_some());
    }

    #[test]
    fn test_resolve_path_nested() {
        let store = ContextStore::new(obj(json!({
            "incident": {"severity": {"score": 80}}
        })));
        assert_eq!(
            store.resolve_path("incident.severity.score"),
            Some(&json!(80))
        );
        assert_eq!(store.resolve_path("incident..severity..score"), Some(&json!(80)));
        assert!(store.resolve_path("incident.severity.missing").is_none());
    }

    #[test]
    fn test_resolve_path_through_scalar_fails() {
        let store = ContextStore::new(obj(json!({"a": 5})));
        assert!(store.resolve_path("a.b").is_none());
    }

    #[test]
    fn test_merge_result_replaces_scalars() {
        let mut store = ContextStore::new(obj(json!({"count": 1, "keep": true})));
        store.merge_result(obj(json!({"count": 2})));
        assert_eq!(store.get().get("count"), Some(&json!(2)));
        assert_eq!(store.get().get("keep"), Some(&json!(true)));
    }

    #[test]
    fn test_merge_result_deep_merges_objects() {
        let mut store = ContextStore::new(obj(json!({"lookup": {"asn": 64500}})));
        store.merge_result(obj(json!({"lookup": {"cc": "US"}})));

        let lookup = store.get().get("lookup").unwrap();
        assert_eq!(lookup["asn"], json!(64500));
        assert_eq!(lookup["cc"], json!("US"));
    }

    #[test]
    fn test_merge_incident_preserves_existing_subkeys() {
        let mut store = ContextStore::new(obj(json!({
            "incident": {"id": "INC-1", "severity": "low"}
        })));
        store.merge_result(obj(json!({"incident": {"severity": "high", "owner": "soc"}})));

        let incident = store.get().get("incident").unwrap();
        assert_eq!(incident["id"], json!("INC-1"));
        assert_eq!(incident["severity"], json!("high"));
        assert_eq!(incident["owner"], json!("soc"));
    }

    #[test]
    fn test_repeated_incident_merges_accumulate() {
        let mut store = ContextStore::default();
        store.merge_incident(json!({"a": 1}));
        store.merge_incident(json!({"b": 2}));
        store.merge_incident(json!({"a": 3}));

        let incident = store.get().get("incident").unwrap();
        assert_eq!(incident["a"], json!(3));
        assert_eq!(incident["b"], json!(2));
    }

    #[test]
    fn test_deep_merge_recurses_into_objects() {
        let mut base = obj(json!({"a": {"x": 1, "y": 2}, "b": 1}));
        let overlay = obj(json!({"a": {"y": 9, "z": 3}, "c": true}));
        deep_merge(&mut base, &overlay);

        assert_eq!(base["a"]["x"], json!(1));
        assert_eq!(base["a"]["y"], json!(9));
        assert_eq!(base["a"]["z"], json!(3));
        assert_eq!(base["b"], json!(1));
        assert_eq!(base["c"], json!(true));
    }
}
