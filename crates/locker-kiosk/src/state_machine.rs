//! Per-locker ownership and status.
//!
//! ```text
//! Free ──assign──► Owned ──open──► Opening ──ok, release──► Free
//!  │  ▲                             │  ──ok, assign───► Owned
//!  │  │                             └──fault──────────► Error ──recover──► Free
//!  ▼  │
//! Blocked
//! ```
//!
//! Every transition is a compare-and-set on the stored status and is
//! broadcast as a [`LockerEvent`] once persisted.

use chrono::{DateTime, Utc};
use locker_core::{KioskId, LockerId, LockerStatus, OpenPurpose, Owner};
use locker_storage::{Database, Locker, LockerRepository, SqliteLockerRepository};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{KioskError, Result};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// A persisted locker transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockerEvent {
    pub kiosk_id: KioskId,
    pub locker_id: LockerId,
    pub from: LockerStatus,
    pub to: LockerStatus,
    pub owner: Option<Owner>,
    pub at: DateTime<Utc>,
}

/// How the hardware part of an open ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The relay was pulsed.
    Opened,
    /// The pulse was attempted and failed.
    Failed,
    /// Nothing reached the relay card.
    NotAttempted,
}

/// Transitions the state machine performs.
pub fn can_transition(from: LockerStatus, to: LockerStatus) -> bool {
    use LockerStatus::*;
    matches!(
        (from, to),
        (Free, Owned)
            | (Free, Blocked)
            | (Free, Error)
            | (Owned, Opening)
            | (Opening, Free | Owned | Error)
            | (Error, Free)
            | (Blocked, Free)
    )
}

/// Locker lifecycle on top of the locker table.
#[derive(Debug)]
pub struct LockerStateMachine {
    repo: SqliteLockerRepository,
    events: broadcast::Sender<LockerEvent>,
}

impl LockerStateMachine {
    pub fn new(db: &Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            repo: SqliteLockerRepository::new(db.pool().clone()),
            events,
        }
    }

    /// Receive every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LockerEvent> {
        self.events.subscribe()
    }

    pub async fn provision(&self, kiosk: &KioskId, count: u16) -> Result<u64> {
        Ok(self.repo.provision(kiosk, count).await?)
    }

    pub async fn get(&self, kiosk: &KioskId, locker: LockerId) -> Result<Locker> {
        self.repo
            .get(kiosk, locker)
            .await?
            .ok_or_else(|| KioskError::not_found("Locker", format!("{kiosk}/{locker}")))
    }

    pub async fn list(&self, kiosk: &KioskId) -> Result<Vec<Locker>> {
        Ok(self.repo.list(kiosk).await?)
    }

    pub async fn free_lockers(&self, kiosk: &KioskId) -> Result<Vec<LockerId>> {
        let free = self.repo.list_by_status(kiosk, LockerStatus::Free).await?;
        Ok(free.into_iter().map(|l| l.locker_id).collect())
    }

    pub async fn opening_lockers(&self, kiosk: &KioskId) -> Result<Vec<LockerId>> {
        let opening = self.repo.list_by_status(kiosk, LockerStatus::Opening).await?;
        Ok(opening.into_iter().map(|l| l.locker_id).collect())
    }

    /// The locker `owner` currently holds on this kiosk.
    pub async fn held_by(&self, kiosk: &KioskId, owner: &Owner) -> Result<Option<Locker>> {
        Ok(self.repo.find_by_owner(kiosk, owner).await?)
    }

    /// `Free → Owned`.
    pub async fn assign(&self, kiosk: &KioskId, locker: LockerId, owner: &Owner) -> Result<Locker> {
        self.transition(
            kiosk,
            locker,
            LockerStatus::Free,
            LockerStatus::Owned,
            Some(owner),
            "assign",
        )
        .await
    }

    /// Enter `Opening` before a pulse.
    ///
    /// An `Owned` locker moves to `Opening`; an `Opening` locker (a command
    /// replayed after recovery) is accepted as is. `Free`, `Error` and
    /// `Blocked` lockers are admin opens and keep their status until
    /// [`complete_open`](Self::complete_open). Returns the current locker.
    pub async fn begin_open(&self, kiosk: &KioskId, locker: LockerId) -> Result<Locker> {
        let current = self.get(kiosk, locker).await?;
        if current.status != LockerStatus::Owned {
            return Ok(current);
        }
        self.transition(kiosk, locker, LockerStatus::Owned, LockerStatus::Opening, None, "open")
            .await
    }

    /// Apply the result of a pulse.
    ///
    /// From `Opening`, success ends `Free` for [`OpenPurpose::Release`] and
    /// `Owned` for [`OpenPurpose::Assign`], a failed pulse ends `Error` and a
    /// pulse that never reached the card returns the locker to `Owned`.
    /// Admin opens of `Free` or `Error` lockers end `Free` on success and
    /// `Error` on failure; `Blocked` lockers never change. Returns the
    /// locker after the change, or `None` when nothing changed.
    pub async fn complete_open(
        &self,
        kiosk: &KioskId,
        locker: LockerId,
        purpose: OpenPurpose,
        outcome: OpenOutcome,
    ) -> Result<Option<Locker>> {
        use LockerStatus::*;

        let current = self.get(kiosk, locker).await?.status;
        let target = match (current, outcome) {
            (Opening, OpenOutcome::Opened) => match purpose {
                OpenPurpose::Release => Free,
                OpenPurpose::Assign => Owned,
            },
            (Opening, OpenOutcome::Failed) => Error,
            (Opening, OpenOutcome::NotAttempted) => Owned,
            (Free, OpenOutcome::Failed) => Error,
            (Error, OpenOutcome::Opened) => Free,
            _ => return Ok(None),
        };

        let updated = self
            .transition(kiosk, locker, current, target, None, "complete open")
            .await;
        match updated {
            Ok(updated) => Ok(Some(updated)),
            // Changed underneath (admin action); leave it alone.
            Err(KioskError::Conflict { status, .. }) => {
                warn!(kiosk = %kiosk, locker = %locker, %status, "Locker changed during open");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// `Error → Free`.
    pub async fn recover(&self, kiosk: &KioskId, locker: LockerId) -> Result<Locker> {
        self.transition(kiosk, locker, LockerStatus::Error, LockerStatus::Free, None, "recover")
            .await
    }

    /// `Free → Blocked`.
    pub async fn block(&self, kiosk: &KioskId, locker: LockerId) -> Result<Locker> {
        self.transition(kiosk, locker, LockerStatus::Free, LockerStatus::Blocked, None, "block")
            .await
    }

    /// `Blocked → Free`.
    pub async fn unblock(&self, kiosk: &KioskId, locker: LockerId) -> Result<Locker> {
        self.transition(kiosk, locker, LockerStatus::Blocked, LockerStatus::Free, None, "unblock")
            .await
    }

    async fn transition(
        &self,
        kiosk: &KioskId,
        locker: LockerId,
        from: LockerStatus,
        to: LockerStatus,
        owner: Option<&Owner>,
        action: &'static str,
    ) -> Result<Locker> {
        debug_assert!(can_transition(from, to), "{from} -> {to}");

        let Some(updated) = self.repo.transition(kiosk, locker, from, to, owner).await? else {
            let current = self.get(kiosk, locker).await?;
            return Err(KioskError::Conflict {
                locker_id: locker,
                status: current.status,
                action,
            });
        };

        info!(kiosk = %kiosk, locker = %locker, "Locker {} -> {}", from, to);
        // No subscribers is fine.
        let _ = self.events.send(LockerEvent {
            kiosk_id: kiosk.clone(),
            locker_id: locker,
            from,
            to,
            owner: updated.owner.clone(),
            at: updated.updated_at,
        });
        Ok(updated)
    }
}
