//! RFID locker-selection sessions.
//!
//! A kiosk holds at most one session. The slot is a `tokio` mutex per kiosk;
//! callers keep it locked for a whole scan or selection, so the expiry timer
//! and a selection can never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use locker_core::constants::DEFAULT_SESSION_TIMEOUT_SECS;
use locker_core::{CardId, KioskId, LockerId};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A live locker-selection window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub kiosk_id: KioskId,
    pub card_id: CardId,
    pub allowed_locker_ids: Vec<LockerId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    deadline: Instant,
}

impl Session {
    pub fn allows(&self, locker: LockerId) -> bool {
        self.allowed_locker_ids.contains(&locker)
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.deadline
    }
}

/// Why a session left the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Cancelled,
    Superseded,
    Expired,
}

#[derive(Debug, Default)]
struct SlotState {
    session: Option<Session>,
    timer: Option<JoinHandle<()>>,
}

impl SlotState {
    fn end(&mut self, reason: SessionEnd) -> Option<Session> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let session = self.session.take()?;
        info!(
            kiosk = %session.kiosk_id,
            session_id = %session.session_id,
            card = %session.card_id,
            "Session ended: {:?}",
            reason
        );
        Some(session)
    }
}

type Cell = Arc<tokio::sync::Mutex<SlotState>>;

/// Exclusive access to one kiosk's session slot.
#[derive(Debug)]
pub struct SessionSlot {
    kiosk_id: KioskId,
    timeout: Duration,
    cell: Weak<tokio::sync::Mutex<SlotState>>,
    state: OwnedMutexGuard<SlotState>,
}

impl SessionSlot {
    /// The current session, unless it has run out.
    pub fn active(&self) -> Option<&Session> {
        self.state.session.as_ref().filter(|s| s.is_live())
    }

    /// Open a new session, ending any current one.
    pub fn begin(&mut self, card_id: CardId, allowed_locker_ids: Vec<LockerId>) -> &Session {
        self.state.end(SessionEnd::Superseded);

        let now = Utc::now();
        let deadline = Instant::now() + self.timeout;
        let session_id = Uuid::new_v4().to_string();
        let expires_at = chrono::TimeDelta::from_std(self.timeout)
            .map(|timeout| now + timeout)
            .unwrap_or(now);

        info!(
            kiosk = %self.kiosk_id,
            session_id = %session_id,
            card = %card_id,
            lockers = allowed_locker_ids.len(),
            "Session started"
        );

        self.state.timer = Some(spawn_expiry(self.cell.clone(), session_id.clone(), deadline));
        self.state.session.insert(Session {
            session_id,
            kiosk_id: self.kiosk_id.clone(),
            card_id,
            allowed_locker_ids,
            created_at: now,
            expires_at,
            deadline,
        })
    }

    /// Clear the slot.
    pub fn end(&mut self, reason: SessionEnd) -> Option<Session> {
        self.state.end(reason)
    }
}

fn spawn_expiry(
    cell: Weak<tokio::sync::Mutex<SlotState>>,
    session_id: String,
    deadline: Instant,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep_until(deadline).await;
        let Some(cell) = cell.upgrade() else {
            return;
        };
        let mut state = cell.lock().await;
        if state
            .session
            .as_ref()
            .is_some_and(|s| s.session_id == session_id)
        {
            // This task is the timer being cleared; do not abort it.
            state.timer = None;
            state.end(SessionEnd::Expired);
        }
    })
}

/// `GET /api/session/status` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub has_session: bool,
    pub remaining_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// One session slot per kiosk.
#[derive(Debug, Default)]
pub struct SessionManager {
    config: SessionConfig,
    slots: Mutex<HashMap<KioskId, Cell>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Lock the kiosk's slot; waits while another scan or selection holds it.
    pub async fn slot(&self, kiosk: &KioskId) -> SessionSlot {
        let cell = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(kiosk.clone()).or_default())
        };
        let weak = Arc::downgrade(&cell);
        let state = cell.lock_owned().await;
        SessionSlot {
            kiosk_id: kiosk.clone(),
            timeout: self.config.timeout(),
            cell: weak,
            state,
        }
    }

    pub async fn status(&self, kiosk: &KioskId) -> SessionStatus {
        let slot = self.slot(kiosk).await;
        match slot.active() {
            Some(session) => SessionStatus {
                has_session: true,
                remaining_seconds: session.remaining().as_secs_f64().ceil() as u64,
                session_id: Some(session.session_id.clone()),
            },
            None => SessionStatus {
                has_session: false,
                remaining_seconds: 0,
                session_id: None,
            },
        }
    }

    /// Drop the kiosk's session. Returns whether one was live.
    pub async fn cancel(&self, kiosk: &KioskId) -> bool {
        let mut slot = self.slot(kiosk).await;
        let live = slot.active().is_some();
        slot.end(SessionEnd::Cancelled);
        if !live {
            debug!(kiosk = %kiosk, "No session to cancel");
        }
        live
    }
}
