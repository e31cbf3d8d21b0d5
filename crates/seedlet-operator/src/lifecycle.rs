//! Phased lifecycle: bootstrap runnables first, then the main group
//!
//! Every bootstrap runnable must return `Ok` before any main runnable is
//! spawned. A failing bootstrap runnable aborts its siblings and the whole
//! lifecycle ends in [`Phase::Failed`]; main runnables never start.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use seedlet_common::metrics::record_phase;
use seedlet_common::Error;

/// Where the lifecycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, nothing started yet
    Idle,
    /// Bootstrap runnables are running
    Bootstrapping,
    /// Main runnables are running
    Running,
    /// Everything returned after cancellation or completion
    Stopped,
    /// A runnable failed; terminal
    Failed,
}

impl Phase {
    /// Lowercase name used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Running => "running",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long-running or run-to-completion process managed by [`Lifecycle`]
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run until done or until `cancel` fires
    async fn run(&self, cancel: CancellationToken) -> Result<(), Error>;
}

/// Two-phase barrier over bootstrap and main runnables
pub struct Lifecycle {
    bootstrap: Vec<Arc<dyn Runnable>>,
    main: Vec<Arc<dyn Runnable>>,
    phase: watch::Sender<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Empty lifecycle in [`Phase::Idle`]
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            bootstrap: Vec::new(),
            main: Vec::new(),
            phase,
        }
    }

    /// Add a runnable that must finish before the main group starts
    pub fn bootstrap(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.bootstrap.push(runnable);
        self
    }

    /// Add a runnable to the main group
    pub fn main(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.main.push(runnable);
        self
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run both groups; returns the first error
    ///
    /// Cancellation during bootstrap stops without starting the main group.
    /// A main runnable error cancels its siblings.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        self.transition(Phase::Bootstrapping);
        if let Err(e) = run_group("bootstrap", &self.bootstrap, &cancel).await {
            self.transition(Phase::Failed);
            return Err(e);
        }
        if cancel.is_cancelled() {
            self.transition(Phase::Stopped);
            return Ok(());
        }

        self.transition(Phase::Running);
        match run_group("main", &self.main, &cancel).await {
            Ok(()) => {
                self.transition(Phase::Stopped);
                Ok(())
            }
            Err(e) => {
                self.transition(Phase::Failed);
                Err(e)
            }
        }
    }

    fn transition(&self, next: Phase) {
        let previous = self.phase.send_replace(next);
        record_phase(next.as_str());
        info!(from = %previous, to = %next, "Lifecycle phase changed");
    }
}

/// Run every runnable concurrently and wait for all of them
///
/// The first failure cancels the group token and aborts the remaining tasks.
async fn run_group(
    group: &str,
    runnables: &[Arc<dyn Runnable>],
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let token = cancel.child_token();
    let mut set = JoinSet::new();
    for runnable in runnables {
        let runnable = Arc::clone(runnable);
        let token = token.clone();
        set.spawn(async move {
            let name = runnable.name().to_string();
            let result = runnable.run(token).await;
            (name, result)
        });
    }

    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok((name, Ok(()))) => {
                info!(group, runnable = %name, "Runnable finished");
                continue;
            }
            Ok((name, Err(e))) => {
                error!(group, runnable = %name, error = %e, "Runnable failed");
                e
            }
            Err(join) => Error::internal_with_context(
                "lifecycle",
                format!("{group} runnable panicked: {join}"),
            ),

        };
        token.cancel();
        set.abort_all();
        return Err(failure);
    }
    Ok(())
}
