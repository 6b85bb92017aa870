//! Agent fan-out and fan-in.
//!
//! Each unit of work runs [`Agent::process`] on its own OS thread. Results come
//! back over a channel and are recorded per agent as they arrive, so one
//! failing or slow agent never blocks the others from being recorded.
//!
//! Cancellation is cooperative: a thread whose agent is still running when the
//! deadline passes or the job is cancelled is signalled through
//! [`AgentInput::cancel`] and then abandoned. Whatever it eventually returns
//! is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::BoxFuture;

use super::agents::{Agent, AgentInput, AgentKind, RawAgentOutput};
use super::error::AgentError;

/// Outcome per dispatched agent. Agents that were not dispatched are absent.
pub type AgentResults = BTreeMap<AgentKind, Result<RawAgentOutput, AgentError>>;

/// How the units of a batch are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One at a time in [`AgentKind`] priority order; `deadline` bounds each agent.
    Sequential { deadline: Duration },
    /// All at once; `deadline` bounds the whole fan-out.
    Parallel { deadline: Duration },
}

/// One agent call to make.
pub struct WorkUnit {
    pub kind: AgentKind,
    pub agent: Arc<dyn Agent>,
    pub input: AgentInput,
}

/// Notification sent after each agent finishes, in completion order.
#[derive(Debug, Clone)]
pub struct AgentCompletion {
    pub kind: AgentKind,
    pub succeeded: bool,
    /// Agents finished so far, including this one.
    pub finished: usize,
    pub total: usize,
}

/// Receives [`AgentCompletion`]s as agents finish.
pub trait CompletionSink: Send {
    fn agent_finished(&mut self, completion: AgentCompletion) -> BoxFuture<'_, ()>;
}

impl CompletionSink for () {
    fn agent_finished(&mut self, _completion: AgentCompletion) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

fn spawn_unit(
    unit: WorkUnit,
    tx: mpsc::UnboundedSender<(AgentKind, Result<RawAgentOutput, AgentError>)>,
) -> Result<(), AgentError> {
    let kind = unit.kind;
    std::thread::Builder::new()
        .name(format!("agent-{kind}"))
        .spawn(move || {
            let result = unit.agent.process(&unit.input);
            // The receiver is gone once the dispatcher stopped waiting.
            let _ = tx.send((kind, result));
        })
        .map(|_| ())
        .map_err(|e| AgentError::Failed(format!("failed to start agent thread: {e}")))
}

/// Run `units` and collect one result per unit.
///
/// Never fails: errors, deadline overruns and cancellations are recorded in
/// the returned map. `sink` observes each finished agent.
pub async fn dispatch_agents(
    units: Vec<WorkUnit>,
    mode: DispatchMode,
    cancel: &CancellationToken,
    sink: &mut dyn CompletionSink,
) -> AgentResults {
    let mut units = units;
    units.sort_by_key(|u| u.kind);
    let total = units.len();
    let mut results = AgentResults::new();

    match mode {
        DispatchMode::Sequential { deadline } => {
            for unit in units {
                if cancel.is_cancelled() {
                    info!(agent = %unit.kind, "Skipping agent, job cancelled");
                    break;
                }
                let kind = unit.kind;
                let result = run_batch(vec![unit], deadline, cancel).await;
                for (kind, outcome) in result {
                    results.insert(kind, outcome);
                }
                let succeeded = results.get(&kind).is_some_and(Result::is_ok);
                sink.agent_finished(AgentCompletion {
                    kind,
                    succeeded,
                    finished: results.len(),
                    total,
                })
                .await;
            }
        }
        DispatchMode::Parallel { deadline } => {
            info!(agent_count = total, deadline_secs = deadline.as_secs(), "Starting parallel dispatch");
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut pending = BTreeMap::new();
            for unit in units {
                let kind = unit.kind;
                let unit_cancel = unit.input.cancel.clone();
                match spawn_unit(unit, tx.clone()) {
                    Ok(()) => {
                        pending.insert(kind, unit_cancel);
                    }
                    Err(e) => {
                        results.insert(kind, Err(e));
                    }
                }
            }
            drop(tx);
            collect(&mut rx, pending, deadline, cancel, &mut results, total, sink).await;
        }
    }

    results
}

/// Run a single-unit batch for sequential mode without progress callbacks.
async fn run_batch(units: Vec<WorkUnit>, deadline: Duration, cancel: &CancellationToken) -> AgentResults {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut results = AgentResults::new();
    let mut pending = BTreeMap::new();
    for unit in units {
        let kind = unit.kind;
        let unit_cancel = unit.input.cancel.clone();
        match spawn_unit(unit, tx.clone()) {
            Ok(()) => {
                pending.insert(kind, unit_cancel);
            }
            Err(e) => {
                results.insert(kind, Err(e));
            }
        }
    }
    drop(tx);
    let total = pending.len();
    collect(&mut rx, pending, deadline, cancel, &mut results, total, &mut ()).await;
    results
}

async fn collect(
    rx: &mut mpsc::UnboundedReceiver<(AgentKind, Result<RawAgentOutput, AgentError>)>,
    mut pending: BTreeMap<AgentKind, CancellationToken>,
    deadline: Duration,
    cancel: &CancellationToken,
    results: &mut AgentResults,
    total: usize,
    sink: &mut dyn CompletionSink,
) {
    let expires = tokio::time::Instant::now() + deadline;

    while !pending.is_empty() {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                for (kind, token) in std::mem::take(&mut pending) {
                    token.cancel();
                    results.insert(kind, Err(AgentError::Cancelled));
                }
            }
            () = tokio::time::sleep_until(expires) => {
                for (kind, token) in std::mem::take(&mut pending) {
                    token.cancel();
                    warn!(agent = %kind, deadline_secs = deadline.as_secs(), "Agent abandoned at dispatch deadline");
                    results.insert(kind, Err(AgentError::DeadlineExceeded(deadline)));
                }
            }
            received = rx.recv() => match received {
                Some((kind, result)) => {
                    if pending.remove(&kind).is_none() {
                        continue;
                    }
                    let succeeded = result.is_ok();
                    match &result {
                        Ok(_) => info!(agent = %kind, "Agent completed"),
                        Err(e) => error!(agent = %kind, error = %e, "Agent failed"),
                    }
                    results.insert(kind, result);
                    sink.agent_finished(AgentCompletion {
                        kind,
                        succeeded,
                        finished: results.len(),
                        total,
                    })
                    .await;
                }
                None => {
                    // Every sender is gone: the remaining threads died without reporting.
                    for kind in std::mem::take(&mut pending).into_keys() {
                        results.insert(
                            kind,
                            Err(AgentError::Failed("agent thread exited without a result".into())),
                        );
                    }
                }
            }
        }
    }
}
