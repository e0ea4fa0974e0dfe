//! Leader election between tabs sharing one database.
//!
//! The lease row is the only coordination point. Each tick reads it, lets
//! [`tether_engine::lease::decide`] pick renew, acquire or back off, and writes
//! the result with a compare-and-swap so two tabs racing for a lapsed lease
//! cannot both win.

use std::sync::Arc;

use tether_engine::{lease, Clock, Epoch, Lease, LeaseDecision, Role, TabId, Timestamp};

use crate::db::{self, Db};
use crate::error::Result;

/// Keeps this tab's view of the sync lease current.
#[derive(Debug)]
pub struct LeaderCoordinator {
    db: Db,
    tab_id: TabId,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
    role: Role,
    last_tick: Option<Timestamp>,
}

impl LeaderCoordinator {
    pub fn new(db: Db, tab_id: impl Into<TabId>, ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            tab_id: tab_id.into(),
            ttl_ms,
            clock,
            role: Role::Follower { holder: None },
            last_tick: None,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Whether this tab may act as the synchronizer right now.
    pub fn is_leader(&self) -> bool {
        self.role.is_leader_at(self.clock.now())
    }

    /// The epoch of the lease we hold, if still valid.
    pub fn epoch(&self) -> Option<Epoch> {
        if self.is_leader() {
            self.role.epoch()
        } else {
            None
        }
    }

    /// Milliseconds left on the lease we hold; zero when not leading.
    pub fn lease_remaining(&self) -> u64 {
        match self.role {
            Role::Leader { expires_at, .. } => expires_at.saturating_sub(self.clock.now()),
            Role::Follower { .. } => 0,
        }
    }

    /// When this tab last ran [`tick`](Self::tick).
    pub fn last_tick(&self) -> Option<Timestamp> {
        self.last_tick
    }

    /// Acquire, renew or observe the lease. Returns whether the role changed.
    pub async fn tick(&mut self) -> Result<bool> {
        let now = self.clock.now();
        self.last_tick = Some(now);

        let mut conn = self.db.pool().acquire().await?;
        let current = db::lease::read_lease(&mut conn).await?;

        let next_role = match lease::decide(&current, &self.tab_id, now, self.ttl_ms) {
            LeaseDecision::Renew(next) | LeaseDecision::Acquire(next) => {
                if db::lease::compare_and_swap(&mut conn, &current, &next).await? {
                    Role::Leader {
                        epoch: next.epoch,
                        expires_at: next.expires_at,
                    }
                } else {
                    // Another tab wrote first; report whoever holds it now.
                    let winner = db::lease::read_lease(&mut conn).await?;
                    tracing::debug!(tab = %self.tab_id, holder = ?winner.holder, "Lost lease race");
                    Role::Follower {
                        holder: winner.holder,
                    }
                }
            }
            LeaseDecision::Held { holder, .. } => Role::Follower {
                holder: Some(holder),
            },
        };

        Ok(self.set_role(next_role))
    }

    /// Give up the lease so another tab can take over without waiting for
    /// it to expire.
    pub async fn resign(&mut self) -> Result<()> {
        let Role::Leader { epoch, .. } = self.role else {
            return Ok(());
        };

        let mut conn = self.db.pool().acquire().await?;
        let current = db::lease::read_lease(&mut conn).await?;
        if current.holder.as_deref() == Some(self.tab_id.as_str()) && current.epoch == epoch {
            let released = Lease {
                holder: None,
                epoch,
                expires_at: 0,
            };
            if db::lease::compare_and_swap(&mut conn, &current, &released).await? {
                tracing::info!(tab = %self.tab_id, epoch, "Released sync lease");
            }
        }

        self.set_role(Role::Follower { holder: None });
        Ok(())
    }

    fn set_role(&mut self, role: Role) -> bool {
        let was_leader = matches!(self.role, Role::Leader { .. });
        let is_leader = matches!(role, Role::Leader { .. });
        let changed = was_leader != is_leader || self.role.epoch() != role.epoch();

        if changed {
            match &role {
                Role::Leader { epoch, expires_at } => {
                    tracing::info!(tab = %self.tab_id, epoch, expires_at, "Became sync leader")
                }
                Role::Follower { holder } => {
                    tracing::info!(tab = %self.tab_id, holder = ?holder, "Following")
                }
            }
        }

        self.role = role;
        changed
    }
}
