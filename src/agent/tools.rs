use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::skills::SkillCatalog;
use crate::protocol::openai_chat::{OpenAiTool, OpenAiToolFunction};

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
}

impl ToolOutput {
    #[must_use]
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: Some(error.into()),
        }
    }

    /// Text handed back to the model and the client.
    #[must_use]
    pub fn into_text(self) -> String {
        match self.error {
            Some(error) if !self.success => format!("Error: {error}"),
            _ => self.content,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn execute(&self, arguments: &Value) -> ToolOutput;
}

/// Tools available to the orchestrator, in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.iter().map(|t| t.name())).finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any earlier one with the same name in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(pos) => self.tools[pos] = tool,
            None => self.tools.push(tool),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    /// Function declarations sent to the upstream.
    #[must_use]
    pub fn schemas(&self) -> Vec<OpenAiTool> {
        self.tools
            .iter()
            .map(|tool| OpenAiTool {
                type_: "function".to_string(),
                function: OpenAiToolFunction {
                    name: tool.name().to_string(),
                    description: Some(tool.description().to_string()),
                    parameters: Some(tool.parameters()),
                },
            })
            .collect()
    }

    /// Run `name`. Unknown names yield a failed output rather than an error.
    pub async fn execute(&self, name: &str, arguments: &Value) -> ToolOutput {
        match self.get(name) {
            Some(tool) => {
                let output = tool.execute(arguments).await;
                tracing::debug!(tool = name, success = output.success, "tool executed");
                output
            }
            None => {
                tracing::warn!(tool = name, "model requested an unknown tool");
                ToolOutput::failure(format!("Tool '{name}' not found"))
            }
        }
    }
}

/// Built-in tool returning the full document of a named skill.
#[derive(Debug, Clone)]
pub struct ReadSkillTool {
    skills: Arc<SkillCatalog>,
}

impl ReadSkillTool {
    #[must_use]
    pub fn new(skills: Arc<SkillCatalog>) -> Self {
        Self { skills }
    }
}

#[async_trait]
impl Tool for ReadSkillTool {
    fn name(&self) -> &str {
        "read_skill"
    }

    fn description(&self) -> &str {
        "Read full usage instructions and examples for a specific skill"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {
                    "type": "string",
                    "description": "The name of the skill to read (e.g., 'weather', 'obsidian', 'github')"
                }
            },
            "required": ["skill_name"]
        })
    }

    async fn execute(&self, arguments: &Value) -> ToolOutput {
        let Some(skill_name) = arguments
            .get("skill_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
        else {
            return ToolOutput::failure("skill_name is required");
        };

        match self.skills.get(skill_name) {
            Some(skill) => ToolOutput::ok(skill.render()),
            None => {
                let available = self.skills.names().collect::<Vec<_>>().join(", ");
                ToolOutput::failure(format!(
                    "Skill '{skill_name}' not found. Available skills: {available}"
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::skills::Skill;

    fn registry() -> ToolRegistry {
        let catalog = Arc::new(SkillCatalog::from_skills(vec![Skill {
            name: "github".into(),
            description: "Repos".into(),
            instructions: "Use gh".into(),
            tags: vec![],
            version: "1.0.0".into(),
        }]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ReadSkillTool::new(catalog)));
        registry
    }

    #[tokio::test]
    async fn test_read_skill_found() {
        let output = registry()
            .execute("read_skill", &json!({"skill_name": "github"}))
            .await;
        assert!(output.success);
        assert!(output.content.starts_with("# Skill: github\n\n"));
    }

    #[tokio::test]
    async fn test_read_skill_missing_lists_available() {
        let output = registry()
            .execute("read_skill", &json!({"skill_name": "nope"}))
            .await;
        assert!(!output.success);
        assert_eq!(
            output.into_text(),
            "Error: Skill 'nope' not found. Available skills: github"
        );
    }

    #[tokio::test]
    async fn test_read_skill_requires_name() {
        let output = registry().execute("read_skill", &json!({})).await;
        assert_eq!(output.error.as_deref(), Some("skill_name is required"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_failed_output() {
        let output = registry().execute("launch_rockets", &json!({})).await;
        assert!(!output.success);
        assert!(output.into_text().contains("launch_rockets"));
    }

    #[test]
    fn test_schemas_keep_registration_order() {
        let schemas = registry().schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].function.name, "read_skill");
        assert_eq!(schemas[0].type_, "function");
    }
}
