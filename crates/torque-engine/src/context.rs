use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use torque_core::error::{Result, TorqueError};
use torque_core::plan::Step;
use torque_core::types::{ErrorKind, StepError};

/// Per-run store of step outputs, keyed by `step_id`.
///
/// Each key is written at most once, on success. The map is sharded, so
/// parallel steps writing disjoint keys and descendants reading earlier
/// outputs never contend on a single lock. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    entries: Arc<DashMap<String, serde_json::Value>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's payload. A second write for the same step is an error.
    pub fn write(&self, step_id: &str, payload: serde_json::Value) -> Result<()> {
        match self.entries.entry(step_id.to_string()) {
            Entry::Occupied(_) => Err(TorqueError::ContextAlreadyWritten(step_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(payload);
                Ok(())
            }
        }
    }

    pub fn get(&self, step_id: &str) -> Option<serde_json::Value> {
        self.entries.get(step_id).map(|v| v.value().clone())
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.entries.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the context object a step receives: each bound upstream output
    /// under its binding key. Fails if any bound output was never written.
    pub fn bind(
        &self,
        step: &Step,
    ) -> std::result::Result<serde_json::Map<String, serde_json::Value>, StepError> {
        let mut bound = serde_json::Map::new();
        for (upstream, key) in &step.context_bindings {
            match self.get(upstream) {
                Some(value) => {
                    bound.insert(key.clone(), value);
                }
                None => {
                    return Err(StepError::new(
                        ErrorKind::MissingContextBinding,
                        format!("no output from {} for binding {}", upstream, key),
                    ));
                }
            }
        }
        Ok(bound)
    }

    /// Ordered copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_once() {
        let ctx = ExecutionContext::new();
        ctx.write("validate_ro", serde_json::json!({"roNumber": "RO_001"}))
            .unwrap();
        let err = ctx
            .write("validate_ro", serde_json::json!("again"))
            .unwrap_err();
        assert!(matches!(err, TorqueError::ContextAlreadyWritten(_)));
        assert_eq!(ctx.get("validate_ro").unwrap()["roNumber"], "RO_001");
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn bind_uses_binding_keys() {
        let ctx = ExecutionContext::new();
        ctx.write("validate_part", serde_json::json!({"unitPrice": 45.99}))
            .unwrap();
        let step = Step::new("reserve_part", "parts").bind("validate_part", "part");
        let bound = ctx.bind(&step).unwrap();
        assert_eq!(bound["part"]["unitPrice"], 45.99);
        assert_eq!(bound.len(), 1);
    }

    #[test]
    fn bind_reports_missing_output() {
        let ctx = ExecutionContext::new();
        let step = Step::new("create_payment", "payment").bind("validate_ro", "ro");
        let err = ctx.bind(&step).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingContextBinding);
        assert!(err.message.contains("validate_ro"));
    }

    #[test]
    fn no_bindings_gives_empty_context() {
        let ctx = ExecutionContext::new();
        let step = Step::new("a", "parts");
        assert!(ctx.bind(&step).unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_disjoint_writes() {
        let ctx = ExecutionContext::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.write(&format!("step_{i}"), serde_json::json!(i))
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(ctx.len(), 32);
        assert_eq!(ctx.snapshot()["step_7"], serde_json::json!(7));
    }
}
