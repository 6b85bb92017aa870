//! DocVerify Daemon Library
//!
//! Orchestration core for applicant document verification:
//! - Session records with monotonic status and revision-checked writes
//! - Bounded dispatch of verification pipelines with timeout retries
//! - Progress fan-out from a publish/subscribe channel to live subscribers
//! - Multi-stage pipeline fanning out to independent agents
//! - Cross-validation of fields extracted by different agents

pub mod orchestration;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod session;
pub mod storage;
pub mod validation;

/// Boxed `Send` future, used where traits must return futures.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
