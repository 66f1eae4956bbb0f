#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::float_cmp)]

//! # Cortex Memory
//!
//! The lesson memory subsystem for a self-improving agent harness.
//!
//! Agents fail, and most failures repeat. This crate turns failures into
//! durable, retrievable *lessons*:
//!
//! - **Error capture** ([`capture`]): normalizes raw failure text into a
//!   stable fingerprint plus a tag set, so equivalent failures collapse into
//!   one equivalence class.
//! - **Lesson store V2** ([`store`]): a JSONL store of [`LessonRecord`]s
//!   with a stable identity model, deterministic upsert/merge semantics,
//!   conflict linking, and atomic whole-file rewrites.
//! - **Retrieval** ([`retrieval`]): two-lane ranked retrieval (strict
//!   same-domain plus an optional down-weighted cross-domain transfer lane)
//!   with quota and conflict guards.
//! - **Promotion** ([`promotion`]): folds run outcomes into reliability and
//!   the `candidate → promoted | suppressed | archived` status machine.
//! - **Session memory** ([`session`]): per-session artifact directories and
//!   the append-only event log.
//! - **Knowledge provider** ([`knowledge`]): local-doc retrieval for
//!   strict-mode critic context.
//!
//! Nothing in this crate issues LLM calls or executes tools; it only
//! measures whether injecting a lesson empirically helps.

pub mod capture;
pub mod error;
pub mod knowledge;
pub mod promotion;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod text;

pub use capture::{ErrorChannel, ErrorEvent, fingerprint_of, tags_of};
pub use error::{Error, Result};
pub use knowledge::{DomainDoc, KnowledgeProvider, LocalDocsKnowledgeProvider, RetrievedChunk};
pub use promotion::{
    LessonOutcome, OutcomeSummary, PromotionConfig, apply_outcomes, compute_utility,
};
pub use retrieval::{
    Lane, OnErrorQuery, PreRunQuery, RetrievalConfig, RetrievalMatch, RetrievalScore,
    TransferOptions, retrieve_on_error, retrieve_pre_run,
};
pub use session::{
    Event, HintScore, InjectedLesson, MemoryAnnotation, SessionPaths, ensure_session, read_events,
    write_event, write_jsonl_line, write_metrics,
};
pub use store::{
    LessonRecord, LessonSeed, LessonStatus, LessonStore, UpsertSummary, normalize_rule_text,
};
