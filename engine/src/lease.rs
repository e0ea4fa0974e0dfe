//! Leader lease rules.
//!
//! All tabs share one lease row. A tab may hold it only while `now <
//! expires_at`; anyone observing an expired lease may take it over with a
//! bumped epoch. Writers apply a [`LeaseDecision`] with compare-and-swap on
//! the previous `(holder, epoch)`, so two tabs racing for a lapsed lease
//! cannot both win.

use crate::{Epoch, TabId, Timestamp};
use serde::{Deserialize, Serialize};

/// The shared leadership claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder: Option<TabId>,
    pub epoch: Epoch,
    pub expires_at: Timestamp,
}

impl Lease {
    /// A lease nobody has ever held.
    pub fn vacant() -> Self {
        Self {
            holder: None,
            epoch: 0,
            expires_at: 0,
        }
    }

    /// Whether the lease is live at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.holder.is_some() && now < self.expires_at
    }

    pub fn is_held_by(&self, tab: &str, now: Timestamp) -> bool {
        self.is_live(now) && self.holder.as_deref() == Some(tab)
    }
}

/// What a tab should write after reading the current lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it; extend the expiry
    Renew(Lease),
    /// It lapsed or was released; take it with a new epoch
    Acquire(Lease),
    /// Someone else holds a live lease
    Held {
        holder: TabId,
        expires_at: Timestamp,
    },
}

/// Decide how `tab` should treat the lease at `now`.
pub fn decide(current: &Lease, tab: &str, now: Timestamp, ttl_ms: u64) -> LeaseDecision {
    let expires_at = now.saturating_add(ttl_ms);

    if current.is_held_by(tab, now) {
        return LeaseDecision::Renew(Lease {
            holder: Some(tab.to_string()),
            epoch: current.epoch,
            expires_at,
        });
    }

    match &current.holder {
        Some(holder) if current.is_live(now) => LeaseDecision::Held {
            holder: holder.clone(),
            expires_at: current.expires_at,
        },
        _ => LeaseDecision::Acquire(Lease {
            holder: Some(tab.to_string()),
            epoch: current.epoch + 1,
            expires_at,
        }),
    }
}

/// A tab's view of its own role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Role {
    Leader { epoch: Epoch, expires_at: Timestamp },
    Follower { holder: Option<TabId> },
}

impl Role {
    /// Leadership only counts until the lease we last wrote runs out, even if
    /// we have not noticed losing it yet.
    pub fn is_leader_at(&self, now: Timestamp) -> bool {
        matches!(self, Role::Leader { expires_at, .. } if now < *expires_at)
    }

    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Role::Leader { epoch, .. } => Some(*epoch),
            Role::Follower { .. } => None,
        }
    }
}
