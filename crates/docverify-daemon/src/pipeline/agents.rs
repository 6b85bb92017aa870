//! Analysis agents: the blocking contract, the command-backed implementation,
//! and the registry mapping agent kinds to implementations.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use docverify_core::config::AgentCommandConfig;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::document::DocumentCategory;
use super::error::AgentError;

/// How often a running agent command is checked for exit or cancellation.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT_CHARS: usize = 500;

/// Agent identity. Declaration order is the sequential dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Identity,
    Financial,
    Academic,
}

impl AgentKind {
    pub const ALL: [Self; 3] = [Self::Identity, Self::Financial, Self::Academic];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Financial => "financial",
            Self::Academic => "academic",
        }
    }

    /// Capitalized name used in messages.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Identity => "Identity",
            Self::Financial => "Financial",
            Self::Academic => "Academic",
        }
    }

    pub const fn category(self) -> DocumentCategory {
        match self {
            Self::Identity => DocumentCategory::Identity,
            Self::Financial => DocumentCategory::Financial,
            Self::Academic => DocumentCategory::Academic,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match DocumentCategory::parse(s) {
            Some(DocumentCategory::Identity) => Ok(Self::Identity),
            Some(DocumentCategory::Financial) => Ok(Self::Financial),
            Some(DocumentCategory::Academic) => Ok(Self::Academic),
            _ => Err(format!("unknown agent kind: {s}")),
        }
    }
}

/// What an agent is asked to analyse.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub documents: Vec<PathBuf>,
    /// Set for the financial agent only.
    pub financial_threshold_eur: Option<f64>,
    /// Fires when the dispatch deadline passes or the job is cancelled.
    /// Agents should poll it; those that do not simply run to completion.
    pub cancel: CancellationToken,
}

/// Unvalidated JSON produced by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawAgentOutput(pub serde_json::Value);

/// Agent contract.
///
/// `process` blocks and may take arbitrarily long. It always runs on a
/// dedicated OS thread, which is abandoned if the dispatcher stops waiting.
/// Cancellation is cooperative: an implementation that never checks
/// `input.cancel` runs to completion and its result is discarded.
pub trait Agent: Send + Sync {
    fn process(&self, input: &AgentInput) -> Result<RawAgentOutput, AgentError>;
}

/// Request document written to a command agent's stdin.
#[derive(Serialize)]
struct CommandRequest<'a> {
    agent: AgentKind,
    documents: &'a [PathBuf],
    #[serde(skip_serializing_if = "Option::is_none")]
    financial_threshold_eur: Option<f64>,
}

/// Agent backed by an external command.
///
/// The command receives a JSON request on stdin and must print a single JSON
/// document on stdout. A non-zero exit status is an agent failure.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    kind: AgentKind,
    command: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandAgent {
    pub fn new(kind: AgentKind, config: &AgentCommandConfig) -> Self {
        Self {
            kind,
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }

    fn failed(&self, message: impl fmt::Display) -> AgentError {
        AgentError::Failed(format!("{} ({}): {message}", self.command.display(), self.kind))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.chars().count() <= STDERR_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(STDERR_EXCERPT_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

impl Agent for CommandAgent {
    fn process(&self, input: &AgentInput) -> Result<RawAgentOutput, AgentError> {
        let request = serde_json::to_vec(&CommandRequest {
            agent: self.kind,
            documents: &input.documents,
            financial_threshold_eur: input.financial_threshold_eur,
        })
        .map_err(|e| self.failed(format!("failed to encode request: {e}")))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.failed(format!("failed to start: {e}")))?;
        debug!(agent = %self.kind, pid = child.id(), "Agent command started");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // Fed from a detached thread so a command that never reads its input
        // cannot hold up the cancel check below. The thread ends once the
        // write completes or the pipe closes.
        if let Some(mut stdin) = child.stdin.take() {
            let kind = self.kind;
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(&request) {
                    // The command may legitimately exit without reading its input.
                    debug!(agent = %kind, error = %e, "Agent command did not accept input");
                }
            });
        }

        let status = loop {
            if input.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                warn!(agent = %self.kind, "Agent command killed after cancellation");
                return Err(AgentError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(CHILD_POLL_INTERVAL),
                Err(e) => return Err(self.failed(format!("wait failed: {e}"))),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(self.failed(format!("exited with {status}: {}", excerpt(&stderr))));
        }

        let value: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|e| self.failed(format!("invalid JSON output: {e}")))?;
        Ok(RawAgentOutput(value))
    }
}

/// Agent implementations by kind.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentKind, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command agents from the `agents` configuration section.
    pub fn from_config(agents: &BTreeMap<String, AgentCommandConfig>) -> docverify_core::Result<Self> {
        let mut registry = Self::new();
        for (key, config) in agents {
            let kind = AgentKind::from_str(key).map_err(docverify_core::Error::Config)?;
            registry.register(kind, Arc::new(CommandAgent::new(kind, config)));
        }
        Ok(registry)
    }

    pub fn register(&mut self, kind: AgentKind, agent: Arc<dyn Agent>) {
        self.agents.insert(kind, agent);
    }

    #[must_use]
    pub fn with(mut self, kind: AgentKind, agent: Arc<dyn Agent>) -> Self {
        self.register(kind, agent);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn input() -> AgentInput {
        AgentInput {
            documents: vec![PathBuf::from("/tmp/passport.pdf")],
            financial_threshold_eur: None,
            cancel: CancellationToken::new(),
        }
    }

    fn shell(script: &str) -> CommandAgent {
        CommandAgent::new(
            AgentKind::Identity,
            &AgentCommandConfig {
                command: PathBuf::from("sh"),
                args: vec!["-c".into(), script.into()],
                env: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn kinds_sort_in_priority_order() {
        let mut kinds = vec![AgentKind::Academic, AgentKind::Identity, AgentKind::Financial];
        kinds.sort();
        assert_eq!(kinds, AgentKind::ALL);
        assert_eq!("passport".parse::<AgentKind>().unwrap(), AgentKind::Identity);
    }

    #[test]
    fn registry_rejects_unknown_keys() {
        let mut agents = BTreeMap::new();
        agents.insert(
            "tax".to_string(),
            AgentCommandConfig {
                command: PathBuf::from("true"),
                args: vec![],
                env: BTreeMap::new(),
            },
        );
        assert!(AgentRegistry::from_config(&agents).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_parses_stdout() {
        let agent = shell(r#"cat > /dev/null; echo '{"accuracy_score": 91}'"#);
        let output = agent.process(&input()).unwrap();
        assert_eq!(output.0["accuracy_score"], 91);
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_reports_exit_status() {
        let agent = shell("echo 'model unavailable' >&2; exit 3");
        let err = agent.process(&input()).unwrap_err();
        match err {
            AgentError::Failed(msg) => assert!(msg.contains("model unavailable")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_agent_honours_cancellation() {
        let agent = shell("sleep 30");
        let input = input();
        input.cancel.cancel();
        assert_eq!(agent.process(&input).unwrap_err(), AgentError::Cancelled);
    }

    #[cfg(unix)]
    #[test]
    fn cancel_is_seen_while_input_is_unread() {
        // Far larger than a pipe buffer, and the command never reads it.
        let mut input = input();
        input.documents = (0..20_000)
            .map(|i| PathBuf::from(format!("/uploads/session/document-{i:05}.pdf")))
            .collect();
        let cancel = input.cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let agent = shell("sleep 30");
        assert_eq!(agent.process(&input).unwrap_err(), AgentError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        canceller.join().unwrap();
    }
}
