//! Per-kiosk command execution loop.
//!
//! A dispatcher owns nothing but handles: the queue, the locker state
//! machine and the kiosk's [`RelayDriver`]. Each tick it claims pending
//! commands one at a time (oldest first) and runs them to completion.
//! Claiming is a compare-and-set from `pending`, so a command delivered twice
//! is pulsed once.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use locker_core::constants::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_STALE_THRESHOLD_SECS, clamp_bulk_interval,
};
use locker_core::{CommandStatus, ErrorKind, KioskId, LockerId, OpenPurpose};
use locker_hardware::{HardwareError, PulseReport, RelayDriver};
use locker_storage::models::{BulkOpenPayload, CloseRelayPayload, OpenLockerPayload};
use locker_storage::{Command, CommandPayload, CommandQueue, SqliteCommandQueue, StaleRecovery};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{KioskError, Result};
use crate::state_machine::{LockerStateMachine, OpenOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    /// Age after which an `executing` command is considered orphaned.
    pub stale_threshold_secs: u64,
    /// Delay before replaying a command that never reached the bus.
    pub retry_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            retry_delay_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl DispatcherConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold_secs = threshold.as_secs();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Per-locker entry of a bulk command's stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItemOutcome {
    pub locker_id: LockerId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PulseReport>,
}

impl BulkItemOutcome {
    fn failed(locker_id: LockerId, kind: ErrorKind, error: String) -> Self {
        Self {
            locker_id,
            ok: false,
            error_kind: Some(kind),
            error: Some(error),
            report: None,
        }
    }
}

/// What happened to the command after the hardware step.
enum Settled {
    Completed,
    Failed(String),
    Rescheduled(CommandStatus),
}

/// Faults that left the bus untouched; the command can run again.
fn replayable(error: &HardwareError) -> bool {
    matches!(
        error,
        HardwareError::Unavailable { .. } | HardwareError::BusBusy { .. }
    )
}

fn message(error: &HardwareError) -> String {
    format!("{}: {}", error.kind(), error)
}

/// Executes one kiosk's queued commands.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    kiosk: KioskId,
    queue: SqliteCommandQueue,
    lockers: Arc<LockerStateMachine>,
    driver: Arc<RelayDriver>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        kiosk: KioskId,
        queue: SqliteCommandQueue,
        lockers: Arc<LockerStateMachine>,
        driver: Arc<RelayDriver>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            kiosk,
            queue,
            lockers,
            driver,
            config,
        }
    }

    pub fn kiosk(&self) -> &KioskId {
        &self.kiosk
    }

    /// Reset this kiosk's commands orphaned by a crash.
    ///
    /// Lockers left `Opening` with no live command behind them move to
    /// `Error`: whether their relay fired is unknown.
    pub async fn recover(&self) -> Result<StaleRecovery> {
        let threshold = Duration::from_secs(self.config.stale_threshold_secs);
        let recovery = self.queue.recover_stale(&self.kiosk, threshold).await?;

        let mut live = BTreeSet::new();
        for command in self.queue.list_active(&self.kiosk).await? {
            match command.payload() {
                Ok(CommandPayload::OpenLocker(payload)) => {
                    live.insert(payload.locker_id);
                }
                Ok(CommandPayload::BulkOpen(payload)) => live.extend(payload.locker_ids),
                _ => {}
            }
        }
        for locker in self.lockers.opening_lockers(&self.kiosk).await? {
            if live.contains(&locker) {
                continue;
            }
            warn!(kiosk = %self.kiosk, locker = %locker, "Locker left opening, outcome unknown");
            self.lockers
                .complete_open(&self.kiosk, locker, OpenPurpose::Release, OpenOutcome::Failed)
                .await?;
        }
        Ok(recovery)
    }

    /// Run every eligible command, oldest first. Returns how many ran.
    pub async fn run_once(&self) -> Result<usize> {
        let mut executed = 0;
        while let Some(command) = self.queue.next_pending(&self.kiosk).await? {
            if !self.queue.mark_executing(&command.command_id).await? {
                debug!(command_id = %command.command_id, "Command already claimed");
                continue;
            }
            self.execute(&command).await?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Recover stale commands, then poll until `shutdown` turns `true`.
    ///
    /// A command in flight when shutdown is signalled runs to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovery = self.recover().await?;
        info!(
            kiosk = %self.kiosk,
            requeued = recovery.requeued,
            failed = recovery.failed,
            "Dispatcher started"
        );

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        while !*shutdown.borrow() {
            if let Err(e) = self.run_once().await {
                error!(kiosk = %self.kiosk, "Dispatch failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(kiosk = %self.kiosk, "Dispatcher stopped");
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown, rx) = watch::channel(false);
        let kiosk = self.kiosk.clone();
        let task = tokio::spawn(self.run(rx));
        DispatcherHandle {
            kiosk,
            shutdown,
            task,
        }
    }

    async fn execute(&self, command: &Command) -> Result<()> {
        let started = Instant::now();
        let id = command.command_id.as_str();
        info!(
            kiosk = %self.kiosk,
            command_id = id,
            command_type = %command.command_type,
            attempt = command.retry_count + 1,
            "Executing command"
        );

        let settled = match command.payload() {
            Ok(CommandPayload::OpenLocker(payload)) => self.open_locker(id, &payload).await?,
            Ok(CommandPayload::CloseRelay(payload)) => self.close_relay(id, &payload).await?,
            Ok(CommandPayload::BulkOpen(payload)) => {
                self.bulk_open(id, &payload, started).await?
            }
            Err(e) => {
                let error = KioskError::invalid(format!("unreadable payload: {e}")).to_message();
                self.queue
                    .mark_failed(id, &error, Some(elapsed_ms(started)), None)
                    .await?;
                Settled::Failed(error)
            }
        };

        let duration_ms = elapsed_ms(started);
        match settled {
            Settled::Completed => info!(command_id = id, duration_ms, "Command completed"),
            Settled::Failed(error) => {
                warn!(command_id = id, duration_ms, "Command failed: {}", error)
            }
            Settled::Rescheduled(status) => {
                info!(command_id = id, %status, "Command not executed, bus unavailable")
            }
        }
        Ok(())
    }

    async fn open_locker(&self, id: &str, payload: &OpenLockerPayload) -> Result<Settled> {
        let started = Instant::now();
        let locker = payload.locker_id;
        if let Err(e) = self.lockers.begin_open(&self.kiosk, locker).await {
            let error = e.to_message();
            self.queue.mark_failed(id, &error, Some(0), None).await?;
            return Ok(Settled::Failed(error));
        }

        let result = self.driver.open(locker).await;
        let duration_ms = elapsed_ms(started);
        match result {
            Ok(report) => {
                let result = to_json(&report)?;
                self.queue
                    .mark_completed(id, duration_ms, Some(&result))
                    .await?;
                self.lockers
                    .complete_open(&self.kiosk, locker, payload.purpose, OpenOutcome::Opened)
                    .await?;
                Ok(Settled::Completed)
            }
            Err(e) if replayable(&e) => {
                let status = self.reschedule(id, &e).await?;
                if status == CommandStatus::Failed {
                    let outcome = OpenOutcome::NotAttempted;
                    self.lockers
                        .complete_open(&self.kiosk, locker, payload.purpose, outcome)
                        .await?;
                }
                Ok(Settled::Rescheduled(status))
            }
            Err(e) => {
                let error = message(&e);
                self.queue
                    .mark_failed(id, &error, Some(duration_ms), None)
                    .await?;
                self.lockers
                    .complete_open(&self.kiosk, locker, payload.purpose, OpenOutcome::Failed)
                    .await?;
                Ok(Settled::Failed(error))
            }
        }
    }

    async fn close_relay(&self, id: &str, payload: &CloseRelayPayload) -> Result<Settled> {
        let started = Instant::now();
        match self.driver.close(payload.locker_id).await {
            Ok(report) => {
                let result = to_json(&report)?;
                self.queue
                    .mark_completed(id, elapsed_ms(started), Some(&result))
                    .await?;
                Ok(Settled::Completed)
            }
            Err(e) if replayable(&e) => Ok(Settled::Rescheduled(self.reschedule(id, &e).await?)),
            Err(e) => {
                let error = message(&e);
                self.queue
                    .mark_failed(id, &error, Some(elapsed_ms(started)), None)
                    .await?;
                Ok(Settled::Failed(error))
            }
        }
    }

    async fn bulk_open(
        &self,
        id: &str,
        payload: &BulkOpenPayload,
        started: Instant,
    ) -> Result<Settled> {
        // Slots in request order; rejected lockers fill theirs up front.
        let mut slots: Vec<Option<BulkItemOutcome>> =
            payload.locker_ids.iter().map(|_| None).collect();
        let mut runnable = Vec::with_capacity(payload.locker_ids.len());
        let mut runnable_slots = Vec::with_capacity(payload.locker_ids.len());
        for (slot, &locker) in payload.locker_ids.iter().enumerate() {
            match self.lockers.begin_open(&self.kiosk, locker).await {
                Ok(_) => {
                    runnable.push(locker);
                    runnable_slots.push(slot);
                }
                Err(e) => {
                    slots[slot] = Some(BulkItemOutcome::failed(locker, e.kind(), e.to_string()));
                }
            }
        }

        let interval_ms = clamp_bulk_interval(payload.interval_ms);
        let items = self.driver.bulk_open(&runnable, interval_ms).await;
        for (slot, item) in runnable_slots.into_iter().zip(items) {
            let locker = item.locker_id;
            let (outcome, state) = match item.result {
                Ok(report) => (
                    BulkItemOutcome {
                        locker_id: locker,
                        ok: true,
                        error_kind: None,
                        error: None,
                        report: Some(report),
                    },
                    OpenOutcome::Opened,
                ),
                Err(e) => {
                    let state = if replayable(&e) {
                        OpenOutcome::NotAttempted
                    } else {
                        OpenOutcome::Failed
                    };
                    (BulkItemOutcome::failed(locker, e.kind(), e.to_string()), state)
                }
            };
            self.lockers
                .complete_open(&self.kiosk, locker, OpenPurpose::Release, state)
                .await?;
            slots[slot] = Some(outcome);
        }
        let outcomes: Vec<BulkItemOutcome> = slots.into_iter().flatten().collect();

        let result = to_json(&outcomes)?;
        let duration_ms = elapsed_ms(started);
        let failures: Vec<&BulkItemOutcome> = outcomes.iter().filter(|o| !o.ok).collect();
        match failures.first() {
            None => {
                self.queue
                    .mark_completed(id, duration_ms, Some(&result))
                    .await?;
                Ok(Settled::Completed)
            }
            Some(first) => {
                let lockers: Vec<String> =
                    failures.iter().map(|o| o.locker_id.to_string()).collect();
                let kind = first.error_kind.unwrap_or(ErrorKind::HardwareUnavailable);
                let error = format!(
                    "{}: {} of {} lockers failed ({})",
                    kind,
                    failures.len(),
                    outcomes.len(),
                    lockers.join(", ")
                );
                self.queue
                    .mark_failed(id, &error, Some(duration_ms), Some(&result))
                    .await?;
                Ok(Settled::Failed(error))
            }
        }
    }

    async fn reschedule(&self, id: &str, error: &HardwareError) -> Result<CommandStatus> {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        Ok(self.queue.reschedule(id, &message(error), delay).await?)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| KioskError::Storage(e.into()))
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Running dispatcher task.
#[derive(Debug)]
pub struct DispatcherHandle {
    kiosk: KioskId,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl DispatcherHandle {
    pub fn kiosk(&self) -> &KioskId {
        &self.kiosk
    }

    /// Signal shutdown and wait for the loop to finish its current command.
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already be gone.
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                error!(kiosk = %self.kiosk, "Dispatcher task panicked: {}", e);
                Ok(())
            }
        }
    }
}
