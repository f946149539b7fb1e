//! Entry points for the web layer and the CLI.
//!
//! One method per endpoint of the kiosk API. Response types serialize with
//! the field names the web panel expects.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use locker_core::constants::clamp_bulk_interval;
use locker_core::{CardId, KioskId, LockerId, LockerStatus, OpenPurpose, Owner};
use locker_hardware::{HealthSnapshot, RelayDriver};
use locker_storage::models::{CommandPayload, NewCommand};
use locker_storage::{
    Command, CommandQueue, Database, Locker, SqliteCommandQueue, StorageError,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{KioskError, Result};
use crate::session::{SessionConfig, SessionEnd, SessionManager, SessionStatus};
use crate::state_machine::{LockerEvent, LockerStateMachine};

/// `202 Accepted` body for queued hardware work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenResponse {
    pub command_id: String,
    /// `false` when the command id had already been used.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardAction {
    /// The card's locker is being opened (and released).
    OpenLocker,
    /// The card has no locker; pick one within the session.
    ShowLockers,
}

/// Result of an RFID scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardResponse {
    pub action: CardAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockers: Option<Vec<LockerId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locker_id: Option<LockerId>,
    /// Absent when a release of the locker was already queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub timeout_seconds: u64,
}

/// Result of a locker selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectResponse {
    pub locker_id: LockerId,
    pub command_id: String,
}

/// Kiosk runtime: queue, lockers, sessions and one relay driver per kiosk.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use locker_core::{CardId, KioskId};
/// use locker_hardware::mock::MockRelayBus;
/// use locker_hardware::{DriverConfig, RelayDriver};
/// use locker_kiosk::{CardAction, KioskService};
/// use locker_storage::Database;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = Database::in_memory().await?;
/// let kiosk = KioskId::new("lobby")?;
/// let (bus, _handle) = MockRelayBus::for_lockers(16);
///
/// let service = KioskService::builder(&db)
///     .kiosk(kiosk.clone(), Arc::new(RelayDriver::new(bus, DriverConfig::default())))
///     .build();
/// service.provision(&kiosk, 16).await?;
///
/// let response = service.handle_card(&kiosk, &CardId::new("04A1B2C3")?).await?;
/// assert_eq!(response.action, CardAction::ShowLockers);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct KioskService {
    queue: SqliteCommandQueue,
    lockers: Arc<LockerStateMachine>,
    sessions: SessionManager,
    drivers: HashMap<KioskId, Arc<RelayDriver>>,
}

/// Builder for [`KioskService`].
#[derive(Debug)]
pub struct KioskServiceBuilder {
    db: Database,
    session: SessionConfig,
    drivers: HashMap<KioskId, Arc<RelayDriver>>,
}

impl KioskServiceBuilder {
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Register a kiosk and the driver of its bus.
    pub fn kiosk(mut self, kiosk: KioskId, driver: Arc<RelayDriver>) -> Self {
        self.drivers.insert(kiosk, driver);
        self
    }

    pub fn build(self) -> KioskService {
        KioskService {
            queue: SqliteCommandQueue::new(self.db.pool().clone()),
            lockers: Arc::new(LockerStateMachine::new(&self.db)),
            sessions: SessionManager::new(self.session),
            drivers: self.drivers,
        }
    }
}

impl KioskService {
    pub fn builder(db: &Database) -> KioskServiceBuilder {
        KioskServiceBuilder {
            db: db.clone(),
            session: SessionConfig::default(),
            drivers: HashMap::new(),
        }
    }

    pub fn kiosks(&self) -> impl Iterator<Item = &KioskId> {
        self.drivers.keys()
    }

    /// Locker transitions, for the notifier.
    pub fn subscribe(&self) -> broadcast::Receiver<LockerEvent> {
        self.lockers.subscribe()
    }

    /// Dispatcher for one registered kiosk, sharing this service's state.
    pub fn dispatcher(&self, kiosk: &KioskId, config: DispatcherConfig) -> Result<Dispatcher> {
        let driver = self.driver(kiosk)?;
        Ok(Dispatcher::new(
            kiosk.clone(),
            self.queue.clone(),
            Arc::clone(&self.lockers),
            Arc::clone(driver),
            config,
        ))
    }

    pub fn driver(&self, kiosk: &KioskId) -> Result<&Arc<RelayDriver>> {
        self.drivers
            .get(kiosk)
            .ok_or_else(|| KioskError::not_found("Kiosk", kiosk))
    }

    pub async fn provision(&self, kiosk: &KioskId, count: u16) -> Result<u64> {
        self.driver(kiosk)?;
        self.lockers.provision(kiosk, count).await
    }

    /// `POST /api/lockers/{id}/open`: queue a releasing open.
    ///
    /// An `Owned` locker enters `Opening` right away so a re-scan by its
    /// owner does not queue a second pulse.
    pub async fn open_locker(
        &self,
        kiosk: &KioskId,
        locker_id: LockerId,
        command_id: Option<String>,
    ) -> Result<OpenResponse> {
        let locker = self.provisioned(kiosk, locker_id).await?;
        let payload = CommandPayload::open(locker_id, OpenPurpose::Release, locker.owner.clone());
        let response = self.enqueue(kiosk, payload, command_id).await?;

        if response.created && locker.status == LockerStatus::Owned {
            self.mark_opening(kiosk, locker_id).await;
        }
        Ok(response)
    }

    /// Queue an OFF-only write for a relay left energized. Locker state is
    /// not touched.
    pub async fn close_relay(
        &self,
        kiosk: &KioskId,
        locker_id: LockerId,
        command_id: Option<String>,
    ) -> Result<OpenResponse> {
        self.provisioned(kiosk, locker_id).await?;
        let response = self
            .enqueue(kiosk, CommandPayload::close_relay(locker_id), command_id)
            .await?;
        info!(
            kiosk = %kiosk,
            locker = %locker_id,
            command_id = %response.command_id,
            "Relay close queued"
        );
        Ok(response)
    }

    /// `POST /api/lockers/bulk-open`.
    pub async fn bulk_open(
        &self,
        kiosk: &KioskId,
        locker_ids: &[LockerId],
        interval_ms: u64,
        command_id: Option<String>,
    ) -> Result<OpenResponse> {
        if locker_ids.is_empty() {
            return Err(KioskError::invalid("locker_ids must not be empty"));
        }
        let mut seen = BTreeSet::new();
        let mut unique = Vec::with_capacity(locker_ids.len());
        for &locker_id in locker_ids {
            self.provisioned(kiosk, locker_id).await?;
            if seen.insert(locker_id) {
                unique.push(locker_id);
            }
        }

        let payload = CommandPayload::bulk_open(unique, clamp_bulk_interval(interval_ms));
        self.enqueue(kiosk, payload, command_id).await
    }

    /// `POST /api/rfid/handle-card`.
    ///
    /// Any live session on the kiosk is cancelled first. A card holding a
    /// locker gets it opened and released; otherwise a selection session
    /// over the currently free lockers starts.
    pub async fn handle_card(&self, kiosk: &KioskId, card: &CardId) -> Result<CardResponse> {
        self.driver(kiosk)?;
        let mut slot = self.sessions.slot(kiosk).await;
        slot.end(SessionEnd::Superseded);

        let owner = Owner::rfid(card);
        if let Some(held) = self.lockers.held_by(kiosk, &owner).await? {
            let command_id = match held.status {
                LockerStatus::Owned => {
                    let payload = CommandPayload::open(
                        held.locker_id,
                        OpenPurpose::Release,
                        Some(owner.clone()),
                    );
                    let response = self.enqueue(kiosk, payload, None).await?;
                    self.mark_opening(kiosk, held.locker_id).await;
                    Some(response.command_id)
                }
                LockerStatus::Opening => {
                    self.release_opening(kiosk, held.locker_id, &owner).await?
                }
                _ => None,
            };
            info!(kiosk = %kiosk, card = %card, locker = %held.locker_id, "Card opens its locker");
            return Ok(CardResponse {
                action: CardAction::OpenLocker,
                session_id: None,
                lockers: None,
                locker_id: Some(held.locker_id),
                command_id,
                timeout_seconds: 0,
            });
        }

        let free = self.lockers.free_lockers(kiosk).await?;
        if free.is_empty() {
            return Err(KioskError::NoLockersAvailable);
        }
        let session = slot.begin(card.clone(), free);
        Ok(CardResponse {
            action: CardAction::ShowLockers,
            session_id: Some(session.session_id.clone()),
            lockers: Some(session.allowed_locker_ids.clone()),
            locker_id: None,
            command_id: None,
            timeout_seconds: self.sessions.config().timeout_secs,
        })
    }

    /// `POST /api/lockers/select`: assign the locker to the session's card
    /// and queue its first open.
    ///
    /// A failed selection leaves the session open for another pick.
    pub async fn select_locker(
        &self,
        kiosk: &KioskId,
        session_id: &str,
        locker_id: LockerId,
    ) -> Result<SelectResponse> {
        let mut slot = self.sessions.slot(kiosk).await;
        let card = match slot.active() {
            Some(session) if session.session_id == session_id => {
                if !session.allows(locker_id) {
                    return Err(KioskError::invalid(format!(
                        "locker {locker_id} was not offered in this session"
                    )));
                }
                session.card_id.clone()
            }
            _ => return Err(KioskError::SessionExpired),
        };

        let owner = Owner::rfid(&card);
        self.lockers.assign(kiosk, locker_id, &owner).await?;

        let payload = CommandPayload::open(locker_id, OpenPurpose::Assign, Some(owner));
        let response = match self.enqueue(kiosk, payload, None).await {
            Ok(response) => response,
            Err(e) => {
                error!(kiosk = %kiosk, locker = %locker_id, "Assigned locker could not be opened: {}", e);
                slot.end(SessionEnd::Completed);
                return Err(e);
            }
        };
        self.mark_opening(kiosk, locker_id).await;
        slot.end(SessionEnd::Completed);

        Ok(SelectResponse {
            locker_id,
            command_id: response.command_id,
        })
    }

    /// `GET /api/session/status`.
    pub async fn session_status(&self, kiosk: &KioskId) -> Result<SessionStatus> {
        self.driver(kiosk)?;
        Ok(self.sessions.status(kiosk).await)
    }

    /// `POST /api/session/cancel`. Returns whether a session was live.
    pub async fn cancel_session(&self, kiosk: &KioskId) -> Result<bool> {
        self.driver(kiosk)?;
        Ok(self.sessions.cancel(kiosk).await)
    }

    pub async fn block_locker(&self, kiosk: &KioskId, locker_id: LockerId) -> Result<Locker> {
        self.lockers.block(kiosk, locker_id).await
    }

    pub async fn unblock_locker(&self, kiosk: &KioskId, locker_id: LockerId) -> Result<Locker> {
        self.lockers.unblock(kiosk, locker_id).await
    }

    pub async fn recover_locker(&self, kiosk: &KioskId, locker_id: LockerId) -> Result<Locker> {
        self.lockers.recover(kiosk, locker_id).await
    }

    /// Cancel a command that has not started yet.
    pub async fn cancel_command(&self, command_id: &str) -> Result<()> {
        if self.queue.cancel(command_id).await? {
            info!(command_id, "Command cancelled");
            return Ok(());
        }
        let command = self.command(command_id).await?;
        Err(StorageError::Conflict(format!(
            "command {command_id} is {}, only pending commands can be cancelled",
            command.status
        ))
        .into())
    }

    pub async fn command(&self, command_id: &str) -> Result<Command> {
        self.queue
            .get(command_id)
            .await?
            .ok_or_else(|| KioskError::not_found("Command", command_id))
    }

    pub async fn recent_commands(&self, kiosk: &KioskId, limit: u32) -> Result<Vec<Command>> {
        Ok(self.queue.list_recent(kiosk, limit).await?)
    }

    pub async fn lockers(&self, kiosk: &KioskId) -> Result<Vec<Locker>> {
        self.lockers.list(kiosk).await
    }

    pub fn health(&self, kiosk: &KioskId) -> Result<HealthSnapshot> {
        Ok(self.driver(kiosk)?.health())
    }

    async fn provisioned(&self, kiosk: &KioskId, locker_id: LockerId) -> Result<Locker> {
        self.driver(kiosk)?;
        match self.lockers.get(kiosk, locker_id).await {
            Err(KioskError::NotFound { .. }) => Err(KioskError::invalid(format!(
                "locker {locker_id} is not provisioned on kiosk {kiosk}"
            ))),
            other => other,
        }
    }

    async fn enqueue(
        &self,
        kiosk: &KioskId,
        payload: CommandPayload,
        command_id: Option<String>,
    ) -> Result<OpenResponse> {
        let mut command = NewCommand::new(kiosk.clone(), payload);
        if let Some(id) = command_id {
            command = command.with_id(id);
        }
        let enqueued = self.queue.enqueue(&command).await?;
        Ok(OpenResponse {
            command_id: enqueued.command_id,
            created: enqueued.created,
        })
    }

    /// Make sure an `Opening` locker ends free. Returns the id of a newly
    /// queued release, or `None` when one is already queued.
    ///
    /// A still-pending assign open is cancelled once the release is queued,
    /// so the owner gets a single pulse.
    async fn release_opening(
        &self,
        kiosk: &KioskId,
        locker_id: LockerId,
        owner: &Owner,
    ) -> Result<Option<String>> {
        let mut assigns = Vec::new();
        for command in self.queue.list_active(kiosk).await? {
            match command.payload()? {
                CommandPayload::OpenLocker(open) if open.locker_id == locker_id => {
                    if open.purpose == OpenPurpose::Release {
                        return Ok(None);
                    }
                    assigns.push(command.command_id);
                }
                CommandPayload::BulkOpen(bulk) if bulk.locker_ids.contains(&locker_id) => {
                    return Ok(None);
                }
                _ => {}
            }
        }

        let payload = CommandPayload::open(locker_id, OpenPurpose::Release, Some(owner.clone()));
        let response = self.enqueue(kiosk, payload, None).await?;
        for command_id in assigns {
            if self.queue.cancel(&command_id).await? {
                info!(
                    kiosk = %kiosk,
                    locker = %locker_id,
                    command_id = %command_id,
                    "Assign open superseded by release"
                );
            }
        }
        Ok(Some(response.command_id))
    }

    /// Best effort: the dispatcher moves the locker to `Opening` itself if
    /// this loses a race.
    async fn mark_opening(&self, kiosk: &KioskId, locker_id: LockerId) {
        if let Err(e) = self.lockers.begin_open(kiosk, locker_id).await {
            info!(kiosk = %kiosk, locker = %locker_id, "Locker not moved to Opening: {}", e);
        }
    }
}
