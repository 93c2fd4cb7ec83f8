use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::fix::FixStatus;
use crate::review_schema::{AgentErrorKind, Verdict};

/// A pipeline event with its wall-clock emission time.
#[derive(Debug, Clone)]
pub struct Event {
    pub at: SystemTime,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    ReviewStarted {
        agents: Vec<String>,
        mode: String,
    },
    AgentStarted {
        agent: String,
    },
    AgentCompleted {
        agent: String,
        findings: usize,
        duration: Duration,
    },
    AgentError {
        agent: String,
        kind: AgentErrorKind,
        message: String,
    },
    RateLimited {
        agent: String,
        reset_after: Option<Duration>,
        message: String,
    },
    Consolidated {
        unique_findings: usize,
        verdict: Verdict,
    },
    FixStarted {
        findings: usize,
        max_cycles: u32,
    },
    CycleStarted {
        cycle: u32,
    },
    AgentInvoked {
        cycle: u32,
        exit_code: i32,
    },
    VerificationStarted {
        cycle: u32,
    },
    VerificationResult {
        cycle: u32,
        passed: bool,
    },
    CycleCompleted {
        cycle: u32,
    },
    FixCompleted {
        status: FixStatus,
        cycles: u32,
    },
}

/// Non-blocking event emitter over a caller-supplied bounded channel.
///
/// A missing channel is valid, and a full channel drops the event; event
/// delivery must never stall the pipeline.
#[derive(Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: EventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = Event {
            at: SystemTime::now(),
            kind,
        };
        if tx.try_send(event).is_err() {
            trace!("event channel full or closed, dropping event");
        }
    }
}

/// Drain an event channel into the log. Spawned by the CLI so progress is
/// visible while agents run.
pub async fn log_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        match event.kind {
            EventKind::ReviewStarted { agents, mode } => {
                info!(%mode, "review started with {} agent(s): {}", agents.len(), agents.join(", "));
            }
            EventKind::AgentStarted { agent } => info!(%agent, "agent started"),
            EventKind::AgentCompleted { agent, findings, duration } => {
                info!(%agent, findings, "agent completed in {}s", duration.as_secs());
            }
            EventKind::AgentError { agent, kind, message } => {
                warn!(%agent, %kind, "agent failed: {message}");
            }
            EventKind::RateLimited { agent, reset_after, message } => {
                warn!(%agent, ?reset_after, "agent rate-limited: {message}");
            }
            EventKind::Consolidated { unique_findings, verdict } => {
                info!(unique_findings, %verdict, "review consolidated");
            }
            EventKind::FixStarted { findings, max_cycles } => {
                info!(findings, max_cycles, "fix loop started");
            }
            EventKind::CycleStarted { cycle } => info!(cycle, "fix cycle started"),
            EventKind::AgentInvoked { cycle, exit_code } => {
                info!(cycle, exit_code, "fix agent finished");
            }
            EventKind::VerificationStarted { cycle } => info!(cycle, "verification started"),
            EventKind::VerificationResult { cycle, passed } => {
                info!(cycle, passed, "verification finished");
            }
            EventKind::CycleCompleted { cycle } => info!(cycle, "fix cycle completed"),
            EventKind::FixCompleted { status, cycles } => {
                info!(%status, cycles, "fix loop completed");
            }
        }
    }
}
