//! Relay driver: the only path from commands to coils.
//!
//! # Architecture
//!
//! ```text
//! open(locker) ──► bus lock (timeout ⇒ bus_busy)
//!                   │  wait out command_interval since last release
//!                   ▼
//!             ┌──────────┐ ok, sleep pulse ┌─────────┐ ok ┌────────┐
//!             │ Energize │────────────────►│ Release │───►│ Verify │──► PulseReport
//!             └──────────┘                 └─────────┘    └────────┘
//!               │ fault                      │ fault        (optional, soft)
//!               ▼                            ▼
//!           backoff, retry ON            backoff, retry OFF only
//! ```
//!
//! The lock is held from the ON write to the OFF write, so no other frame
//! can land on the bus mid-pulse. A failed release never re-energizes the
//! relay. In [`WriteMode::MultiCoil`] every failed `0x0F` write is followed
//! by exactly one `0x05` write of the same value; the next write tries
//! `0x0F` again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use locker_core::constants::clamp_bulk_interval;
use locker_core::{HardwareAddress, LockerId};
use locker_protocol::{Request, Response};
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::devices::AnyRelayBus;
use crate::error::{BusFault, BusTarget, FaultKind, HardwareError, Result};
use crate::traits::RelayBus;
use crate::types::{
    BulkItemResult, DriverConfig, HealthSnapshot, LastFault, PulseReport, WriteMode,
};

struct BusState {
    bus: AnyRelayBus,
    last_release: Option<Instant>,
}

/// Exclusive use of the bus. Dropping it stamps the release time used
/// for command pacing.
pub(crate) struct BusLease<'a> {
    guard: MutexGuard<'a, BusState>,
}

impl BusLease<'_> {
    pub(crate) fn bus(&mut self) -> &mut AnyRelayBus {
        &mut self.guard.bus
    }
}

impl Drop for BusLease<'_> {
    fn drop(&mut self) {
        self.guard.last_release = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
struct Health {
    total: AtomicU64,
    failed: AtomicU64,
    fallbacks: AtomicU64,
    port_open: AtomicBool,
    last_fault: StdMutex<Option<LastFault>>,
}

impl Health {
    fn record_command(&self, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_fault(&self, target: BusTarget, fault: &BusFault) {
        let mut last = self
            .last_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Some(LastFault {
            kind: fault.kind,
            target: target.to_string(),
            detail: fault.detail.clone(),
        });
    }

    fn snapshot(&self, port: &str) -> HealthSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let error_rate_percent = if total == 0 {
            0.0
        } else {
            (failed as f64 / total as f64) * 100.0
        };
        HealthSnapshot {
            port: port.to_string(),
            port_open: self.port_open.load(Ordering::Relaxed),
            total_commands: total,
            failed_commands: failed,
            error_rate_percent,
            fallback_count: self.fallbacks.load(Ordering::Relaxed),
            last_fault: self
                .last_fault
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PulsePhase {
    Energize,
    Release,
}

/// Drives the relay cards of one kiosk's RS-485 bus.
///
/// # Examples
///
/// ```
/// use locker_core::LockerId;
/// use locker_hardware::mock::MockRelayBus;
/// use locker_hardware::{DriverConfig, RelayDriver};
///
/// #[tokio::main]
/// async fn main() -> locker_hardware::Result<()> {
///     let (bus, handle) = MockRelayBus::for_lockers(32);
///     let driver = RelayDriver::new(bus, DriverConfig::default());
///
///     let locker = LockerId::new(17).unwrap();
///     let report = driver.open(locker).await?;
///     assert_eq!(report.address.slave, 2);
///     assert!(!handle.coil(locker.address()));
///     Ok(())
/// }
/// ```
pub struct RelayDriver {
    bus: Mutex<BusState>,
    config: DriverConfig,
    health: Health,
    port: String,
}

impl std::fmt::Debug for RelayDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDriver")
            .field("port", &self.port)
            .field("config", &self.config)
            .finish()
    }
}

impl RelayDriver {
    pub fn new(bus: impl Into<AnyRelayBus>, config: DriverConfig) -> Self {
        let bus = bus.into();
        let health = Health::default();
        health.port_open.store(bus.is_open(), Ordering::Relaxed);
        let port = bus.info().port;
        Self {
            bus: Mutex::new(BusState {
                bus,
                last_release: None,
            }),
            config,
            health,
            port,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Pulse the relay of `locker`: ON, hold, OFF, optionally verify.
    ///
    /// # Errors
    ///
    /// - `BusBusy` / `Unavailable` when nothing was written
    /// - `Timeout`, `Crc`, `Nack`, `Io` once retries are exhausted
    pub async fn open(&self, locker: LockerId) -> Result<PulseReport> {
        self.run(locker, PulsePhase::Energize).await
    }

    /// Write the coil of `locker` OFF.
    pub async fn close(&self, locker: LockerId) -> Result<PulseReport> {
        self.run(locker, PulsePhase::Release).await
    }

    /// Pulse several lockers, `interval_ms` apart (clamped to 100-5000).
    ///
    /// A failing locker does not stop the sequence.
    pub async fn bulk_open(&self, lockers: &[LockerId], interval_ms: u64) -> Vec<BulkItemResult> {
        let interval = Duration::from_millis(clamp_bulk_interval(interval_ms));
        let mut results = Vec::with_capacity(lockers.len());

        for (index, &locker_id) in lockers.iter().enumerate() {
            if index > 0 {
                sleep(interval).await;
            }
            let result = self.open(locker_id).await;
            if let Err(e) = &result {
                warn!("Bulk open: locker {} failed: {}", locker_id, e);
            }
            results.push(BulkItemResult { locker_id, result });
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(
            total = results.len(),
            failed,
            interval_ms = interval.as_millis() as u64,
            "Bulk open finished"
        );
        results
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot(&self.port)
    }

    async fn run(&self, locker: LockerId, start: PulsePhase) -> Result<PulseReport> {
        let target = BusTarget::Coil(locker.address());
        let result = async {
            let mut lease = self.acquire(target).await?;
            self.ensure_open(&mut lease, target).await?;
            self.drive(&mut lease, locker, start).await
        }
        .await;

        self.health.record_command(result.is_ok());
        match &result {
            Ok(report) => info!(
                locker_id = %locker,
                slave = report.address.slave,
                coil = report.address.coil,
                retries = report.retries,
                fallbacks = report.fallbacks,
                duration_ms = report.duration_ms,
                "Relay {} completed",
                if start == PulsePhase::Energize { "pulse" } else { "release" }
            ),
            Err(e) => error!(locker_id = %locker, kind = %e.kind(), "Relay command failed: {}", e),
        }
        result
    }

    /// Take the bus lock, then wait out the inter-command gap.
    pub(crate) async fn acquire(&self, target: BusTarget) -> Result<BusLease<'_>> {
        let limit = self.config.bus_lock_timeout();
        let guard = timeout(limit, self.bus.lock()).await.map_err(|_| {
            warn!("Bus lock for {} not acquired within {}ms", target, limit.as_millis());
            HardwareError::BusBusy {
                target,
                attempts: 0,
                waited_ms: limit.as_millis() as u64,
            }
        })?;

        if let Some(last) = guard.last_release {
            sleep_until(last + self.config.command_interval()).await;
        }
        Ok(BusLease { guard })
    }

    /// Reopen the port if needed; failure here means nothing was written.
    pub(crate) async fn ensure_open(&self, lease: &mut BusLease<'_>, target: BusTarget) -> Result<()> {
        if lease.bus().is_open() {
            return Ok(());
        }
        let result = lease.bus().open().await;
        self.health.port_open.store(result.is_ok(), Ordering::Relaxed);
        result.map_err(|fault| {
            self.health.record_fault(target, &fault);
            HardwareError::Unavailable {
                target,
                attempts: 0,
                reason: fault.detail,
            }
        })
    }

    /// One request/response on the wire, parsed.
    pub(crate) async fn exchange(
        &self,
        lease: &mut BusLease<'_>,
        request: &Request,
    ) -> std::result::Result<Option<Response>, BusFault> {
        if !lease.bus().is_open() {
            let reopened = lease.bus().open().await;
            self.health.port_open.store(reopened.is_ok(), Ordering::Relaxed);
            reopened?;
        }
        let reply = lease.bus().transact(request).await;
        self.health
            .port_open
            .store(lease.bus().is_open(), Ordering::Relaxed);

        match reply? {
            None => Ok(None),
            Some(frame) => Response::parse(request, &frame)
                .map(Some)
                .map_err(BusFault::from),
        }
    }

    /// Switch one coil. Returns whether the `0x05` fallback was used.
    async fn write_coil(
        &self,
        lease: &mut BusLease<'_>,
        address: HardwareAddress,
        on: bool,
    ) -> std::result::Result<bool, BusFault> {
        let single = Request::write_single_coil(address.slave, address.coil, on);
        if self.config.write_mode == WriteMode::SingleCoil {
            return self.exchange(lease, &single).await.map(|_| false);
        }

        let multi = Request::write_multiple_coils(address.slave, address.coil, on);
        match self.exchange(lease, &multi).await {
            Ok(_) => Ok(false),
            Err(fault) if fault.kind == FaultKind::Unavailable => Err(fault),
            Err(fault) => {
                warn!(
                    slave = address.slave,
                    coil = address.coil,
                    on,
                    fault = %fault.kind,
                    "0x0F write failed ({}), falling back to 0x05",
                    fault.detail
                );
                self.health.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.health.record_fault(BusTarget::Coil(address), &fault);
                self.exchange(lease, &single).await.map(|_| true)
            }
        }
    }

    async fn drive(
        &self,
        lease: &mut BusLease<'_>,
        locker: LockerId,
        start: PulsePhase,
    ) -> Result<PulseReport> {
        let address = locker.address();
        let target = BusTarget::Coil(address);
        let started = Instant::now();
        let max_failures = self.config.max_retries.max(1);

        let mut phase = start;
        let mut failures = 0u32;
        let mut fallbacks = 0u32;
        let mut energized_at: Option<Instant> = None;
        let mut on_reached_card = false;
        let mut on_duration_ms = None;

        loop {
            let on = phase == PulsePhase::Energize;
            match self.write_coil(lease, address, on).await {
                Ok(fell_back) => {
                    fallbacks += u32::from(fell_back);
                    match phase {
                        PulsePhase::Energize => {
                            let at = Instant::now();
                            energized_at = Some(at);
                            sleep_until(at + self.config.pulse_duration()).await;
                            phase = PulsePhase::Release;
                        }
                        PulsePhase::Release => {
                            on_duration_ms =
                                energized_at.map(|at| at.elapsed().as_millis() as u64);
                            break;
                        }
                    }
                }
                Err(fault) => {
                    failures += 1;
                    self.health.record_fault(target, &fault);
                    if phase == PulsePhase::Energize && fault.kind != FaultKind::Unavailable {
                        on_reached_card = true;
                    }

                    if failures >= max_failures {
                        match phase {
                            PulsePhase::Release if energized_at.is_some() => {
                                error!("Relay at {} may remain energized: release failed", address);
                            }
                            PulsePhase::Energize if on_reached_card => {
                                self.release_after_failed_energize(lease, address, max_failures)
                                    .await;
                            }
                            _ => {}
                        }
                        return Err(self.exhausted(target, failures, fault));
                    }

                    let delay = self.backoff(failures);
                    warn!(
                        "{:?} at {} failed ({}), retry {}/{} in {}ms",
                        phase,
                        address,
                        fault,
                        failures,
                        max_failures - 1,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            }
        }

        let verified = if self.config.verify {
            Some(self.verify_off(lease, address).await)
        } else {
            None
        };

        Ok(PulseReport {
            locker_id: locker,
            address,
            retries: failures,
            fallbacks,
            on_duration_ms,
            verified,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// The card may have applied an ON frame whose answer was lost, so an
    /// exhausted energize phase still ends with OFF writes.
    async fn release_after_failed_energize(
        &self,
        lease: &mut BusLease<'_>,
        address: HardwareAddress,
        max_failures: u32,
    ) {
        let target = BusTarget::Coil(address);
        for attempt in 1..=max_failures {
            match self.write_coil(lease, address, false).await {
                Ok(_) => {
                    info!("Relay at {} released after failed energize", address);
                    return;
                }
                Err(fault) => {
                    self.health.record_fault(target, &fault);
                    if attempt < max_failures {
                        sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }
        error!("Relay at {} may remain energized: release failed", address);
    }

    /// Read the coil back; a mismatch is logged, never retried.
    async fn verify_off(&self, lease: &mut BusLease<'_>, address: HardwareAddress) -> bool {
        let request = Request::read_coils(address.slave, address.coil, 1);
        match self.exchange(lease, &request).await {
            Ok(Some(Response::Coils(states))) if states.first() == Some(&false) => true,
            Ok(other) => {
                warn!("Verify at {}: relay not reported OFF ({:?})", address, other);
                false
            }
            Err(fault) => {
                warn!("Verify at {} failed: {}", address, fault);
                false
            }
        }
    }

    fn exhausted(&self, target: BusTarget, attempts: u32, mut fault: BusFault) -> HardwareError {
        // Frames already went out in this command; losing the port now is
        // not a pre-hardware failure.
        if fault.kind == FaultKind::Unavailable {
            fault.kind = FaultKind::Io;
        }
        HardwareError::from_fault(target, attempts, fault)
    }

    /// `base * 2^n + rand(0..=base)`, capped at the configured maximum,
    /// where `n` counts the retries already made: the first retry after one
    /// failure waits `base * 2^0` plus jitter.
    fn backoff(&self, failures: u32) -> Duration {
        let base = self.config.backoff_base_ms;
        let exponential = base.saturating_mul(1u64 << failures.saturating_sub(1).min(16));
        let jitter = if base == 0 {
            0
        } else {
            rand::rng().random_range(0..=base)
        };
        let delay = exponential
            .saturating_add(jitter)
            .min(self.config.backoff_max_ms);
        debug!("Backoff after {} failure(s): {}ms", failures, delay);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRelayBus;

    fn driver(config: DriverConfig) -> RelayDriver {
        let (bus, _handle) = MockRelayBus::with_cards([1]);
        RelayDriver::new(bus, config)
    }

    #[test]
    fn test_backoff_is_capped() {
        let driver = driver(
            DriverConfig::default()
                .with_backoff(Duration::from_millis(100), Duration::from_millis(250)),
        );
        for failures in 1..10 {
            assert!(driver.backoff(failures) <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let driver = driver(
            DriverConfig::default()
                .with_backoff(Duration::from_millis(100), Duration::from_secs(60)),
        );
        let third = driver.backoff(3);
        assert!(third >= Duration::from_millis(400));
        assert!(third <= Duration::from_millis(500));
    }

    #[test]
    fn test_first_retry_waits_about_base() {
        let driver = driver(
            DriverConfig::default()
                .with_backoff(Duration::from_millis(100), Duration::from_secs(60)),
        );
        let first = driver.backoff(1);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_without_base() {
        let driver = driver(DriverConfig::default().with_backoff(Duration::ZERO, Duration::ZERO));
        assert_eq!(driver.backoff(5), Duration::ZERO);
    }

    #[test]
    fn test_health_starts_clean() {
        let health = driver(DriverConfig::default()).health();
        assert_eq!(health.total_commands, 0);
        assert_eq!(health.error_rate_percent, 0.0);
        assert!(health.port_open);
        assert_eq!(health.port, "mock");
    }
}
