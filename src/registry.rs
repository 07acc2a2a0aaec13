use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::context::Config;
use crate::job::JobId;
use crate::store::{self, Store};

/// The four recovery/tracking registries. Each is a time-scored membership
/// structure in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    InFlight,
    Scheduled,
    Completed,
    DeadLetter,
}

impl RegistryKind {
    pub fn name(&self) -> &'static str {
        match self {
            RegistryKind::InFlight => "in_flight",
            RegistryKind::Scheduled => "scheduled",
            RegistryKind::Completed => "completed",
            RegistryKind::DeadLetter => "dead_letter",
        }
    }
}

/// What the recovery daemon does to a due member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    /// Stale claim: back onto its queue (worker-crash recovery).
    Requeue,
    /// Due scheduled job: onto its target queue.
    Activate,
    /// Lapsed terminal job: remove record and membership.
    Delete,
}

/// A registry paired with its cleanup policy.
///
/// A member is due once its score is at least `grace` old: the staleness
/// threshold for in-flight claims, zero for scheduled jobs (score is the
/// due time itself), the retention TTL for the terminal registries.
#[derive(Debug, Clone)]
pub struct Registry {
    pub kind: RegistryKind,
    pub action: CleanupAction,
    pub grace: Duration,
}

impl Registry {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.grace).unwrap_or_default()
    }

    /// Apply this registry's cleanup action to one member.
    pub async fn apply(&self, store: &dyn Store, id: &JobId) -> store::Result<()> {
        match self.action {
            CleanupAction::Requeue => store.requeue(id).await,
            CleanupAction::Activate => store.activate(id).await,
            CleanupAction::Delete => store.purge(self.kind, id).await,
        }
    }
}

/// The standard four registries with thresholds taken from the config.
pub fn default_registries(config: &Config) -> Vec<Registry> {
    vec![
        Registry {
            kind: RegistryKind::InFlight,
            action: CleanupAction::Requeue,
            grace: config.inflight_timeout,
        },
        Registry {
            kind: RegistryKind::Scheduled,
            action: CleanupAction::Activate,
            grace: Duration::ZERO,
        },
        Registry {
            kind: RegistryKind::Completed,
            action: CleanupAction::Delete,
            grace: config.completed_ttl,
        },
        Registry {
            kind: RegistryKind::DeadLetter,
            action: CleanupAction::Delete,
            grace: config.dead_letter_ttl,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cutoff_subtracts_grace() {
        let registry = Registry {
            kind: RegistryKind::InFlight,
            action: CleanupAction::Requeue,
            grace: Duration::from_secs(600),
        };
        let now = Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).unwrap();
        assert_eq!(
            registry.cutoff(now),
            Utc.with_ymd_and_hms(2026, 8, 7, 11, 50, 0).unwrap()
        );
    }

    #[test]
    fn default_registries_cover_all_four() {
        let registries = default_registries(&Config::default());
        let kinds: Vec<_> = registries.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                RegistryKind::InFlight,
                RegistryKind::Scheduled,
                RegistryKind::Completed,
                RegistryKind::DeadLetter,
            ]
        );
        // Scheduled jobs are due the moment their score passes.
        assert_eq!(registries[1].grace, Duration::ZERO);
        // Dead letters outlive completed jobs.
        assert!(registries[3].grace > registries[2].grace);
    }
}
