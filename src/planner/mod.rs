//! Planner (spec §4.7): turns a user chat message into a [`Plan`] of tool
//! invocations, either by prompting an LLM or, when none is configured, by
//! falling back to a small deterministic keyword mapping.

mod parse;
mod provider;

pub use provider::LlmProvider;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PlannerError;
use crate::registry::ToolRegistry;
use crate::schema;
use crate::types::{Plan, PlanStep};

const SYSTEM_PROMPT_PREAMBLE: &str = "You are the planning component of a local tool-calling agent gateway. \
Given the user's message, respond with a JSON object {\"steps\": [...]} where each step has \
step_id, description, and optionally tool_id/input/depends_on. Only use the tools listed below. \
If no tool applies, return a single step with no tool_id that simply describes the answer.";

const SAFETY_RULES: &str = "Safety rules: never invent a tool id that isn't listed below. Tools marked \
\"requires approval\" will pause for a human decision before they run; plan around that latency rather \
than assuming approval. Never plan a step that bypasses the tool catalog (e.g. by asking the user to run \
a command themselves) as a substitute for an approval-gated tool.";

/// Maps tool id aliases an LLM might use (legacy or guessed names) onto the
/// canonical id actually registered, so the Executor never sees a `tool_id`
/// the registry doesn't recognize.
fn default_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("filesystem.read".to_string(), "fs.read".to_string()),
        ("filesystem.write".to_string(), "fs.write".to_string()),
        ("file.read".to_string(), "fs.read".to_string()),
        ("file.write".to_string(), "fs.write".to_string()),
        ("shell".to_string(), "system.run".to_string()),
        ("bash".to_string(), "system.run".to_string()),
        ("exec".to_string(), "system.run".to_string()),
    ])
}

/// Deterministic keyword → tool-id fallback used when no provider is
/// configured (spec §4.7: "a deterministic keyword-based fallback plan MUST
/// be produced if no provider is available").
const KEYWORD_FALLBACKS: &[(&str, &str)] = &[
    ("read", "fs.read"),
    ("open", "fs.read"),
    ("write", "fs.write"),
    ("save", "fs.write"),
    ("run", "system.run"),
    ("execute", "system.run"),
    ("list", "fs.list"),
];

/// Produces a [`Plan`] from a user's chat message.
#[derive(Clone)]
pub struct Planner {
    provider: Option<Arc<dyn LlmProvider>>,
    registry: ToolRegistry,
    aliases: HashMap<String, String>,
    workspace_root: Option<std::path::PathBuf>,
}

impl Planner {
    /// Build a planner over `registry`'s tool catalog. Pass `None` as the
    /// provider to always use the deterministic fallback (e.g. tests, or a
    /// fully offline deployment).
    pub fn new(registry: ToolRegistry, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            provider,
            registry,
            aliases: default_aliases(),
            workspace_root: None,
        }
    }

    /// Include the workspace root's path in the system prompt's workspace
    /// description (spec §4.7).
    #[must_use]
    pub fn with_workspace_root(mut self, root: std::path::PathBuf) -> Self {
        self.workspace_root = Some(root);
        self
    }

    /// Produce a plan for `user_message`, with no user context.
    pub async fn plan(&self, user_message: &str) -> Result<Plan, PlannerError> {
        self.plan_with_context(user_message, None).await
    }

    /// Produce a plan for `user_message`, naming `user_context` (typically
    /// the requesting user's id) in the system prompt so the model can
    /// tailor its plan to who is asking (spec §4.7).
    pub async fn plan_with_context(&self, user_message: &str, user_context: Option<&str>) -> Result<Plan, PlannerError> {
        let Some(provider) = &self.provider else {
            return Ok(self.fallback_plan(user_message).await);
        };

        let system_prompt = self.build_system_prompt(user_context).await;
        let response = provider.complete(&system_prompt, user_message).await?;
        let mut plan = parse::parse_plan_response(&response).ok_or(PlannerError::Unparseable)?;
        self.normalize_aliases(&mut plan);
        Ok(plan)
    }

    async fn build_system_prompt(&self, user_context: Option<&str>) -> String {
        let mut prompt = String::from(SYSTEM_PROMPT_PREAMBLE);
        prompt.push_str("\n\nAvailable tools:\n");
        for descriptor in self.registry.list().await {
            prompt.push_str(&schema::render_for_prompt(&descriptor));
            prompt.push('\n');
        }
        prompt.push('\n');
        prompt.push_str(SAFETY_RULES);
        if let Some(root) = &self.workspace_root {
            prompt.push_str(&format!("\n\nWorkspace root: {}. Paths outside it are out of scope.", root.display()));
        }
        if let Some(user) = user_context {
            prompt.push_str(&format!("\n\nRequesting user: {user}."));
        }
        prompt
    }

    fn normalize_aliases(&self, plan: &mut Plan) {
        for step in &mut plan.steps {
            if let Some(tool_id) = &step.tool_id {
                if let Some(canonical) = self.aliases.get(tool_id) {
                    step.tool_id = Some(canonical.clone());
                }
            }
        }
    }

    async fn fallback_plan(&self, user_message: &str) -> Plan {
        let lowercased = user_message.to_lowercase();
        for (keyword, tool_id) in KEYWORD_FALLBACKS {
            if lowercased.contains(keyword) && self.registry.contains(tool_id).await {
                return Plan {
                    steps: vec![PlanStep {
                        step_id: "step-1".to_string(),
                        description: format!("respond to: {user_message}"),
                        tool_id: Some((*tool_id).to_string()),
                        input: Some(serde_json::json!({})),
                        depends_on: Vec::new(),
                    }],
                };
            }
        }

        Plan {
            steps: vec![PlanStep {
                step_id: "step-1".to_string(),
                description: format!("respond to: {user_message}"),
                tool_id: None,
                input: None,
                depends_on: Vec::new(),
            }],
        }
    }
}
