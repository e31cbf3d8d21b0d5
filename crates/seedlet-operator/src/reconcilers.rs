//! Hand-off point to the tenant reconcilers

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use seedlet_cache::ScopedClient;
use seedlet_common::health::PeriodicHealth;
use seedlet_common::Error;

/// Everything reconcilers get once bootstrap and maintenance are done
#[derive(Clone)]
pub struct ReconcilerContext {
    /// Seed this agent serves
    pub seed_name: String,
    /// Cached garden access, scoped to this seed
    pub garden: ScopedClient,
    /// Seed cluster client
    pub seed: Client,
    /// Heartbeat health; reconcilers pause while it is false
    pub health: PeriodicHealth,
}

/// The steady-state controllers
#[async_trait]
pub trait ReconcilerSet: Send + Sync {
    /// Run until `cancel` fires
    async fn run(&self, ctx: ReconcilerContext, cancel: CancellationToken) -> Result<(), Error>;
}

/// Reconciler set that only waits; for agents that register and maintain
/// the seed without running tenant controllers
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleReconcilers;

#[async_trait]
impl ReconcilerSet for IdleReconcilers {
    async fn run(&self, ctx: ReconcilerContext, cancel: CancellationToken) -> Result<(), Error> {
        info!(seed = %ctx.seed_name, "No tenant reconcilers configured, idling");
        cancel.cancelled().await;
        Ok(())
    }
}
