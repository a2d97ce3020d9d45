//! The seam between the Planner and a concrete LLM client (spec §4.7).
//!
//! Concrete provider clients (Anthropic, OpenAI, local models, ...) are out
//! of scope for this core (spec §1); this trait is the only thing the
//! Planner depends on, so any provider can be plugged in without touching
//! plan generation or response parsing.

use async_trait::async_trait;

use crate::error::PlannerError;

/// A chat-completion-shaped call to an LLM, used by the Planner to turn a
/// system prompt (tool catalog + safety rules + user message) into a plan
/// response (spec §4.7).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send `system_prompt` and `user_message` to the model, returning its
    /// raw text response for the Planner to parse.
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, PlannerError>;
}
