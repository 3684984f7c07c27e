//! Inbound message processing: the glue between a device session and the
//! auto-reply policy.
//!
//! Flow: transport event → allow-list filter → dedup → persist message →
//! upsert conversation → (bot mode) retrieval-gated reply engine → send the
//! answer, or hand the conversation over to a human.

pub mod engine;
pub mod error;
pub mod filter;
pub mod handover;
pub mod inbound;
pub mod prompt;

pub use {
    engine::{NoAnswerReason, ReplyEngine, ReplyOutcome, ReplySettings},
    error::{Error, Result},
    filter::{DropReason, InboundMessage, accept},
    handover::{HandoverCoordinator, HandoverReport},
    inbound::{InboundPipeline, PipelineOutcome},
};
