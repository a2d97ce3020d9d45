//! Tool Registry (spec §4.2): a thread-safe id -> descriptor map populated
//! once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::types::ToolDescriptor;

/// Registered tools, keyed by their stable dotted id.
///
/// Registration happens once during startup wiring; lookups happen on
/// every invocation and every `tools.list` call, so the map is held
/// behind a `RwLock` rather than a `Mutex`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, ToolDescriptor>>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, overwriting any existing descriptor under the same
    /// id (spec §4.2: re-registration is how a running gateway picks up a
    /// tool's updated schema or description).
    pub async fn register(&self, descriptor: ToolDescriptor) {
        self.tools.write().await.insert(descriptor.id.clone(), descriptor);
    }

    /// Remove a tool from the registry. Fails if no tool is registered
    /// under `id`.
    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        self.tools
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Look up a single tool descriptor by id.
    pub async fn get(&self, id: &str) -> Result<ToolDescriptor, RegistryError> {
        self.tools
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// List every registered tool, sorted by id for a stable `tools.list`
    /// response.
    pub async fn list(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().await;
        let mut out: Vec<ToolDescriptor> = tools.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Whether a tool with `id` is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.tools.read().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaType;

    fn descriptor(id: &str) -> ToolDescriptor {
        ToolDescriptor {
            id: id.to_string(),
            description: "test tool".to_string(),
            input_schema: SchemaType::Object {
                properties: Default::default(),
                required: Vec::new(),
            },
            requires_approval: false,
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("fs.read")).await;
        let got = registry.get("fs.read").await.unwrap();
        assert_eq!(got.id, "fs.read");
    }

    #[tokio::test]
    async fn re_registration_overwrites_the_descriptor() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("fs.read")).await;
        let mut updated = descriptor("fs.read");
        updated.description = "updated tool".to_string();
        registry.register(updated).await;

        let got = registry.get("fs.read").await.unwrap();
        assert_eq!(got.description, "updated tool");
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_a_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("fs.read")).await;
        registry.unregister("fs.read").await.unwrap();
        assert!(!registry.contains("fs.read").await);
    }

    #[tokio::test]
    async fn unregister_unknown_tool_fails() {
        let registry = ToolRegistry::new();
        let err = registry.unregister("does.not.exist").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_tool_lookup_fails() {
        let registry = ToolRegistry::new();
        let err = registry.get("does.not.exist").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("z.tool")).await;
        registry.register(descriptor("a.tool")).await;
        let ids: Vec<_> = registry.list().await.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a.tool", "z.tool"]);
    }
}
