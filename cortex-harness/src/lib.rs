#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::float_cmp)]

//! # Cortex Harness
//!
//! The agent control loop and its collaborators for the Cortex
//! self-improving harness:
//!
//! - [`provider`]: the LLM request/response seam and the Anthropic client
//! - [`domain`]: the adapter protocol every tool domain plugs into
//! - [`validation`]: structural tool-input checks with step-shared retries
//! - [`skills`]: skill discovery, manifest, and routing
//! - [`evaluator`]: deterministic contract scoring
//! - [`judge`]: independent LLM verdicts
//! - [`critic`]: post-run lesson generation with quality filtering
//! - [`improve`]: the legacy, trend-gated skill-patch pipeline
//! - [`escalation`]: critic model-tier escalation under repeated failure
//! - [`agent`]: the per-session state machine tying everything together
//!
//! The memory subsystem itself lives in `cortex-memory`; this crate drives
//! it — pre-run retrieval into the system prompt, on-error retrieval into
//! failing tool results, and outcome application after every run.

pub mod agent;
pub mod config;
pub mod critic;
pub mod domain;
pub mod error;
pub mod escalation;
pub mod evaluator;
pub mod improve;
pub mod judge;
pub mod provider;
pub mod skills;
pub mod validation;

pub use agent::{
    AgentRunConfig, AgentRunResult, ArchitectureMode, FinalVerdict, HINT_MARKER, HarnessPaths,
    LearningMode, PosttaskMode, run_agent,
};
pub use config::CortexConfig;
pub use domain::{
    DomainAdapter, DomainWorkspace, ErrorStyle, READ_SKILL_TOOL_NAME, SHOW_FIXTURE_TOOL_NAME,
    StandardAliases, ToolAlias, ToolResult, VERIFY_CONTRACT_TOOL_NAME,
};
pub use error::{Error, Result};
pub use escalation::{EscalationConfig, EscalationState, Tier};
pub use evaluator::{Evaluation, TaskContract, evaluate_session, load_contract};
pub use judge::{JudgeResult, default_judge_model, llm_judge};
pub use provider::{
    AnthropicProvider, ChatMessage, ContentBlock, LlmProvider, LlmRequest, LlmResponse,
    ScriptedProvider, ToolSpec, Usage,
};
