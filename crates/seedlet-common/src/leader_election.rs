//! Seed-side leader election over a coordination Lease
//!
//! Only one seedlet replica per seed runs the lifecycle; standbys wait in
//! [`LeaderElector::acquire`]. Every write is a replace guarded by the
//! lease's resourceVersion, so a concurrent writer gets 409 and loses the
//! round instead of both replicas believing they lead.
//!
//! The leader renews every `renewIntervalSeconds`. Transient API errors are
//! tolerated until the lease would have expired for everyone else; a lease
//! observed under another holder is lost at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionConfig;
use crate::Error;

/// What to do with the lease as observed at `now`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We already hold it
    Renew,
    /// Held by someone else whose lease ran out, or released
    TakeOver {
        /// Transition count to write
        transitions: i32,
    },
    /// Held by someone else and still valid
    Wait,
}

/// Decide the next step for `identity` given the current lease
pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(spec) = lease.map(|l| l.spec.clone().unwrap_or_default()) else {
        return LeaseAction::Create;
    };
    match spec.holder_identity.as_deref() {
        Some(holder) if holder == identity => return LeaseAction::Renew,
        // cleared by a graceful release
        None => {
            return LeaseAction::TakeOver {
                transitions: spec.lease_transitions.unwrap_or(0) + 1,
            }
        }
        Some(_) => {}
    }

    let valid_until = spec
        .renew_time
        .zip(spec.lease_duration_seconds)
        .map(|(renewed, secs)| renewed.0 + chrono::Duration::seconds(i64::from(secs)));
    match valid_until {
        Some(until) if now <= until => LeaseAction::Wait,
        _ => LeaseAction::TakeOver {
            transitions: spec.lease_transitions.unwrap_or(0) + 1,
        },
    }
}

/// Merge patch that hands the lease back: no holder, renewal in the past
pub fn release_patch(now: DateTime<Utc>) -> Value {
    let past = now - chrono::Duration::seconds(60);
    json!({
        "spec": {
            "holderIdentity": null,
            "renewTime": past.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        }
    })
}

/// Outcome of one acquire-or-renew round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Held,
    HeldByOther,
}

/// Competes for one Lease on behalf of `identity`
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Elector for the lease named in `config`
    pub fn new(client: Client, config: &LeaderElectionConfig, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, &config.resource_namespace),
            lease_name: config.resource_name.clone(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
            renew_interval: Duration::from_secs(config.renew_interval_seconds),
            retry_interval: Duration::from_secs(config.retry_interval_seconds),
        }
    }

    /// Block until this replica leads; [`Error::Cancelled`] if `cancel` fires first
    pub async fn acquire(
        self: Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<LeaderGuard, Error> {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership");
        loop {
            match self.round().await {
                Ok(Round::Held) => break,
                Ok(Round::HeldByOther) => {
                    debug!(identity = %self.identity, "Lease held by another replica")
                }
                Err(e) => warn!(identity = %self.identity, error = %e, "Lease round failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled("leader election")),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        let lost = CancellationToken::new();
        let renewal = tokio::spawn(Arc::clone(&self).keep_renewing(lost.clone()));
        Ok(LeaderGuard {
            elector: self,
            renewal,
            lost,
        })
    }

    async fn round(&self) -> Result<Round, Error> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.lease_name).await?;

        match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => Ok(Round::HeldByOther),
            LeaseAction::Create => {
                let lease = self.lease(None, now, now, 0);
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!(identity = %self.identity, "Created leader lease");
                        Ok(Round::Held)
                    }
                    Err(e) => conflict_means_other(e.into()),
                }
            }
            LeaseAction::Renew => {
                let current = existing.unwrap_or_default();
                let spec = current.spec.unwrap_or_default();
                let acquired = spec.acquire_time.map_or(now, |t| t.0);
                let lease = self.lease(
                    current.metadata.resource_version,
                    acquired,
                    now,
                    spec.lease_transitions.unwrap_or(0),
                );
                self.replace(lease).await
            }
            LeaseAction::TakeOver { transitions } => {
                let rv = existing.and_then(|l| l.metadata.resource_version);
                info!(identity = %self.identity, transitions, "Taking over leader lease");
                self.replace(self.lease(rv, now, now, transitions)).await
            }
        }
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        acquired: DateTime<Utc>,
        renewed: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        let duration = i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX);
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(duration),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn replace(&self, lease: Lease) -> Result<Round, Error> {
        if lease.metadata.resource_version.is_none() {
            return Err(Error::internal_with_context(
                "leader-election",
                "lease has no resourceVersion",
            ));
        }
        match self.api.replace(&self.lease_name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(Round::Held),
            Err(e) => conflict_means_other(e.into()),
        }
    }

    async fn keep_renewing(self: Arc<Self>, lost: CancellationToken) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.round().await {
                Ok(Round::Held) => last_renewed = Instant::now(),
                Ok(Round::HeldByOther) => {
                    warn!(identity = %self.identity, "Lease taken by another replica");
                    break;
                }
                Err(e) if last_renewed.elapsed() < self.lease_duration => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease expired without renewal");
                    break;
                }
            }
        }
        lost.cancel();
    }

    async fn release(&self) -> Result<(), Error> {
        let Some(lease) = self.api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        if lease.spec.and_then(|s| s.holder_identity).as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }
        let patch = release_patch(Utc::now());
        self.api
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(identity = %self.identity, "Leader lease released");
        Ok(())
    }
}

fn conflict_means_other(e: Error) -> Result<Round, Error> {
    if e.is_conflict() || e.is_already_exists() {
        Ok(Round::HeldByOther)
    } else {
        Err(e)
    }
}

/// Held leadership; renewal stops when the guard is dropped
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost: CancellationToken,
}

impl LeaderGuard {
    /// Resolves once the lease is lost
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Hand the lease back so a standby takes over without waiting for expiry
    pub async fn release_leadership(&self) -> Result<(), Error> {
        self.renewal.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("seedlet-leader-election".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),

                lease_transitions: Some(3),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(lease_action(None, "pod-a", Utc::now()), LeaseAction::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
        let l = lease(Some("pod-a"), 5, 15);
        assert_eq!(lease_action(Some(&l), "pod-a", Utc::now()), LeaseAction::Renew);
    }

    #[test]
    fn valid_foreign_lease_means_wait() {
        let l = lease(Some("pod-b"), 5, 15);
        assert_eq!(lease_action(Some(&l), "pod-a", Utc::now()), LeaseAction::Wait);
    }

    #[test]
    fn expired_foreign_lease_is_taken_over_with_bumped_transitions() {
        let l = lease(Some("pod-b"), 60, 15);
        assert_eq!(
            lease_action(Some(&l), "pod-a", Utc::now()),
            LeaseAction::TakeOver { transitions: 4 }
        );
    }

    #[test]
    fn released_lease_is_taken_over_immediately() {
        let l = lease(None, 0, 15);
        assert_eq!(
            lease_action(Some(&l), "pod-a", Utc::now()),
            LeaseAction::TakeOver { transitions: 4 }
        );
    }

    #[test]
    fn lease_without_timing_counts_as_expired() {
        let mut l = lease(Some("pod-b"), 0, 15);
        if let Some(spec) = l.spec.as_mut() {
            spec.renew_time = None;
        }
        assert!(matches!(
            lease_action(Some(&l), "pod-a", Utc::now()),
            LeaseAction::TakeOver { .. }
        ));
    }

    #[test]
    fn released_lease_looks_expired_to_standbys() {
        let now = Utc::now();
        let patch = release_patch(now);
        assert!(patch["spec"]["holderIdentity"].is_null());

        let renewed: DateTime<Utc> = patch["spec"]["renewTime"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(renewed < now);
    }
}
