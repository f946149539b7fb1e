//! Shared setup: one kiosk, an in-memory database and a mock relay bus.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use locker_core::{CardId, KioskId, LockerId, LockerStatus};
use locker_hardware::mock::{MockRelayBus, MockRelayBusHandle};
use locker_hardware::{DriverConfig, RelayDriver};
use locker_kiosk::{Dispatcher, DispatcherConfig, KioskService, SessionConfig};
use locker_storage::{Database, Locker};

pub const RETRY_DELAY: Duration = Duration::from_millis(20);

pub struct Harness {
    pub db: Database,
    pub kiosk: KioskId,
    pub service: KioskService,
    pub bus: MockRelayBusHandle,
}

impl Harness {
    pub async fn new(lockers: u16) -> Self {
        Self::with_sessions(lockers, SessionConfig::default()).await
    }

    /// `cards` relay cards on the bus, `lockers` lockers provisioned.
    pub async fn with_cards(cards: u8, lockers: u16) -> Self {
        let (bus, handle) = MockRelayBus::with_cards(1..=cards);
        Self::build(bus, handle, lockers, SessionConfig::default()).await
    }

    pub async fn with_sessions(lockers: u16, sessions: SessionConfig) -> Self {
        let (bus, handle) = MockRelayBus::for_lockers(lockers);
        Self::build(bus, handle, lockers, sessions).await
    }

    async fn build(
        bus: MockRelayBus,
        handle: MockRelayBusHandle,
        lockers: u16,
        sessions: SessionConfig,
    ) -> Self {
        let db = Database::in_memory().await.unwrap();
        let kiosk = KioskId::new("lobby").unwrap();
        let driver = RelayDriver::new(bus, driver_config());
        let service = KioskService::builder(&db)
            .session_config(sessions)
            .kiosk(kiosk.clone(), Arc::new(driver))
            .build();
        service.provision(&kiosk, lockers).await.unwrap();

        Self {
            db,
            kiosk,
            service,
            bus: handle,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_with(dispatcher_config())
    }

    pub fn dispatcher_with(&self, config: DispatcherConfig) -> Dispatcher {
        self.service.dispatcher(&self.kiosk, config).unwrap()
    }

    pub async fn locker(&self, id: u16) -> Locker {
        self.service
            .lockers(&self.kiosk)
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.locker_id == locker(id))
            .unwrap()
    }

    pub async fn status(&self, id: u16) -> LockerStatus {
        self.locker(id).await.status
    }

    /// ON/OFF writes the bus saw for a locker.
    pub fn pulses(&self, id: u16) -> usize {
        self.bus
            .coil_writes(locker(id).address())
            .iter()
            .filter(|(_, on)| *on)
            .count()
    }
}

pub fn locker(id: u16) -> LockerId {
    LockerId::new(id).unwrap()
}

pub fn card(id: &str) -> CardId {
    CardId::new(id).unwrap()
}

pub fn driver_config() -> DriverConfig {
    DriverConfig::default()
        .with_pulse_duration(Duration::from_millis(20))
        .with_command_interval(Duration::ZERO)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

pub fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_delay(RETRY_DELAY)
}
