use std::collections::HashMap;
use std::sync::Arc;

use ensemble_core::tools::{Tool, ToolDefinition};

/// Where a registered tool came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    BuiltIn,
    /// Supplied by an embedding application or plugin, tagged with its origin.
    External(String),
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Registry of callable tools, passed explicitly to each dispatcher.
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        self.tools.insert(name, ToolEntry { tool, source });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.get(name).map(|e| &e.source)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ensemble_core::tools::{ToolContext, ToolError, ToolOutput};

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("search")), ToolSource::BuiltIn);

        assert!(registry.contains("search"));
        assert!(!registry.contains("fetch"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("search").is_some());
        assert_eq!(registry.source("search"), Some(&ToolSource::BuiltIn));
    }

    #[test]
    fn unregister() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("search")), ToolSource::BuiltIn);
        assert!(registry.unregister("search"));
        assert!(!registry.unregister("search"));
    }

    #[test]
    fn names_and_definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("write_file")), ToolSource::BuiltIn);
        registry.register(
            Arc::new(NamedTool("browse")),
            ToolSource::External("browser-plugin".into()),
        );
        registry.register(Arc::new(NamedTool("search")), ToolSource::BuiltIn);

        assert_eq!(registry.names(), vec!["browse", "search", "write_file"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "browse");
        assert_eq!(defs[2].name, "write_file");
        assert_eq!(
            registry.source("browse"),
            Some(&ToolSource::External("browser-plugin".into()))
        );
    }

    #[test]
    fn re_register_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(NamedTool("search")), ToolSource::BuiltIn);
        registry.register(
            Arc::new(NamedTool("search")),
            ToolSource::External("override".into()),
        );
        assert_eq!(registry.count(), 1);
        assert_eq!(
            registry.source("search"),
            Some(&ToolSource::External("override".into()))
        );
    }
}
