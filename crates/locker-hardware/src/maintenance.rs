//! Installer operations on relay card addressing.
//!
//! Cards keep their slave address in holding register `0x4000`. A fresh
//! card answers at address 1; to chain cards, each one is connected alone
//! and given its address through a broadcast write. These operations go
//! through the same bus lock as locker pulses and are never retried.

use std::ops::RangeInclusive;
use std::time::Duration;

use locker_core::LockerId;
use locker_core::constants::{
    BROADCAST_ADDRESS, MAX_SLAVE_ADDRESS, MIN_SLAVE_ADDRESS, SLAVE_ADDRESS_REGISTER,
};
use locker_protocol::{Request, Response};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::driver::{BusLease, RelayDriver};
use crate::error::{BusFault, BusTarget, FaultKind, HardwareError, Result};
use crate::types::{PulseReport, ScanHit, SlaveAddressChange};

/// Time a card needs to apply a broadcast address change.
pub const BROADCAST_SETTLE: Duration = Duration::from_millis(500);

/// Gap between probes during a scan.
pub const SCAN_PROBE_INTERVAL: Duration = Duration::from_millis(100);

fn check_unicast(slave: u8, what: &str) -> Result<()> {
    if (MIN_SLAVE_ADDRESS..=MAX_SLAVE_ADDRESS).contains(&slave) {
        Ok(())
    } else {
        Err(HardwareError::invalid(format!(
            "{what} must be {MIN_SLAVE_ADDRESS}-{MAX_SLAVE_ADDRESS}, got {slave}"
        )))
    }
}

impl RelayDriver {
    /// Read the address a card reports in its address register.
    pub async fn read_slave_address(&self, slave: u8) -> Result<u8> {
        check_unicast(slave, "slave address")?;
        let target = BusTarget::Slave { slave };
        let mut lease = self.acquire(target).await?;
        self.ensure_open(&mut lease, target).await?;

        self.read_address_register(&mut lease, slave)
            .await
            .map_err(|fault| HardwareError::from_fault(target, 1, fault))
    }

    /// Write a new slave address to the card at `current`.
    ///
    /// With `current == 0` the write is broadcast: every card on the line
    /// takes the new address, so only one card should be connected. The
    /// change is then checked by reading the register at the new address
    /// after [`BROADCAST_SETTLE`].
    pub async fn set_slave_address(&self, current: u8, new: u8) -> Result<SlaveAddressChange> {
        if current != BROADCAST_ADDRESS {
            check_unicast(current, "current address")?;
        }
        check_unicast(new, "new address")?;

        let target = BusTarget::Slave { slave: current };
        let mut lease = self.acquire(target).await?;
        self.ensure_open(&mut lease, target).await?;

        let request = Request::write_single_register(current, SLAVE_ADDRESS_REGISTER, u16::from(new));
        self.exchange(&mut lease, &request)
            .await
            .map_err(|fault| HardwareError::from_fault(target, 1, fault))?;

        let verified = if current == BROADCAST_ADDRESS {
            sleep(BROADCAST_SETTLE).await;
            match self.read_address_register(&mut lease, new).await {
                Ok(reported) => reported == new,
                Err(fault) => {
                    warn!("No answer at new address {} after broadcast: {}", new, fault);
                    false
                }
            }
        } else {
            true
        };

        info!(previous = current, new, verified, "Slave address written");
        Ok(SlaveAddressChange {
            previous: current,
            new,
            verified,
        })
    }

    /// Probe every address in `range` and list the cards that answer.
    ///
    /// The bus stays locked for the whole scan.
    pub async fn scan(&self, range: RangeInclusive<u8>) -> Result<Vec<ScanHit>> {
        check_unicast(*range.start(), "scan start")?;
        check_unicast(*range.end(), "scan end")?;

        let target = BusTarget::Slave {
            slave: *range.start(),
        };
        let mut lease = self.acquire(target).await?;
        self.ensure_open(&mut lease, target).await?;

        let mut hits = Vec::new();
        for (index, slave) in range.enumerate() {
            if index > 0 {
                sleep(SCAN_PROBE_INTERVAL).await;
            }
            match self.read_address_register(&mut lease, slave).await {
                Ok(reported) => {
                    info!("Card found at {} (reports {})", slave, reported);
                    hits.push(ScanHit {
                        probed: slave,
                        reported,
                    });
                }
                Err(fault) if fault.kind == FaultKind::Timeout => {
                    debug!("No card at {}", slave);
                }
                Err(fault) => warn!("Garbled answer at {}: {}", slave, fault),
            }
        }
        Ok(hits)
    }

    /// Pulse one relay for an installer check.
    pub async fn test_relay(&self, locker: LockerId) -> Result<PulseReport> {
        info!("Testing relay of locker {} at {}", locker, locker.address());
        self.open(locker).await
    }

    async fn read_address_register(
        &self,
        lease: &mut BusLease<'_>,
        slave: u8,
    ) -> std::result::Result<u8, BusFault> {
        let request = Request::read_holding_register(slave, SLAVE_ADDRESS_REGISTER);
        match self.exchange(lease, &request).await? {
            Some(Response::Registers(values)) => values
                .first()
                .map(|value| (value & 0x00FF) as u8)
                .ok_or_else(|| BusFault::new(FaultKind::Crc, "empty register response")),
            other => Err(BusFault::new(
                FaultKind::Crc,
                format!("unexpected response: {other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverConfig;
    use crate::mock::MockRelayBus;

    fn quick() -> DriverConfig {
        DriverConfig::default().with_command_interval(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_slave_address() {
        let (bus, _handle) = MockRelayBus::with_cards([3]);
        let driver = RelayDriver::new(bus, quick());
        assert_eq!(driver.read_slave_address(3).await.unwrap(), 3);

        let error = driver.read_slave_address(4).await.unwrap_err();
        assert!(matches!(error, HardwareError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_address_change_is_verified() {
        let (bus, handle) = MockRelayBus::with_cards([1]);
        let driver = RelayDriver::new(bus, quick());

        let change = driver.set_slave_address(BROADCAST_ADDRESS, 5).await.unwrap();
        assert!(change.verified);
        assert_eq!(handle.card_addresses(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_address_change() {
        let (bus, handle) = MockRelayBus::with_cards([1, 2]);
        let driver = RelayDriver::new(bus, quick());

        let change = driver.set_slave_address(2, 9).await.unwrap();
        assert_eq!(change.previous, 2);
        assert_eq!(handle.card_addresses(), vec![1, 9]);
    }

    #[tokio::test]
    async fn test_invalid_addresses_rejected() {
        let (bus, handle) = MockRelayBus::with_cards([1]);
        let driver = RelayDriver::new(bus, quick());

        assert!(matches!(
            driver.set_slave_address(1, 0).await,
            Err(HardwareError::InvalidParameters(_))
        ));
        assert!(matches!(
            driver.set_slave_address(1, 248).await,
            Err(HardwareError::InvalidParameters(_))
        ));
        assert!(driver.read_slave_address(0).await.is_err());
        assert!(handle.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_finds_cards() {
        let (bus, _handle) = MockRelayBus::with_cards([2, 4]);
        let driver = RelayDriver::new(bus, quick());

        let hits = driver.scan(1..=5).await.unwrap();
        let probed: Vec<u8> = hits.iter().map(|h| h.probed).collect();
        assert_eq!(probed, vec![2, 4]);
        assert!(hits.iter().all(|h| h.probed == h.reported));
    }
}
