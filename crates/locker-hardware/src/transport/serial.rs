//! RS-485 transport over a USB serial adapter.
//!
//! `serialport` is blocking, so each exchange moves the port handle into
//! `spawn_blocking` and takes it back afterwards. Responses are split with
//! [`RtuCodec`]; a read that ends mid-frame is reported as a CRC fault, a
//! read that gets nothing as a timeout.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use locker_protocol::{CodecError, Request, RtuCodec};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::error::{BusFault, FaultKind};
use crate::traits::RelayBus;
use crate::types::{BusInfo, SerialConfig};

/// Serial port transport, 8N1, no flow control.
pub struct SerialBus {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBus")
            .field("config", &self.config)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialBus {
    /// Create a transport without opening the port.
    ///
    /// The port is opened lazily by the driver before the first exchange,
    /// so a missing adapter surfaces as `hardware_unavailable` per command.
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    /// Create a transport and open the port immediately.
    ///
    /// # Errors
    ///
    /// Returns an `Unavailable` fault if the device cannot be opened.
    pub fn connect(config: SerialConfig) -> Result<Self, BusFault> {
        let port = open_port(&config)?;
        Ok(Self {
            config,
            port: Some(port),
        })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>, BusFault> {
    serialport::new(&config.port, config.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(config.response_timeout())
        .open()
        .map_err(|e| BusFault::unavailable(format!("cannot open {}: {e}", config.port)))
}

/// Write one frame and block until a full response, a timeout or an error.
fn exchange_blocking(
    port: &mut dyn SerialPort,
    frame: &[u8],
    broadcast: bool,
    timeout: Duration,
) -> Result<Option<BytesMut>, BusFault> {
    let io_fault = |e: io::Error| BusFault::new(FaultKind::Io, e.to_string());

    // Stale bytes from an earlier timed-out exchange would desync framing.
    port.clear(ClearBuffer::All)
        .map_err(|e| BusFault::new(FaultKind::Io, e.to_string()))?;
    port.write_all(frame).map_err(io_fault)?;
    port.flush().map_err(io_fault)?;

    if broadcast {
        return Ok(None);
    }

    let mut codec = RtuCodec::new();
    let mut buf = BytesMut::with_capacity(32);
    let mut chunk = [0u8; 64];
    let deadline = Instant::now() + timeout;

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => return Ok(Some(frame)),
            Ok(None) => {}
            Err(CodecError::Protocol(e)) => return Err(BusFault::new(FaultKind::Crc, e.to_string())),
            Err(CodecError::Io(e)) => return Err(io_fault(e)),
        }

        if Instant::now() >= deadline {
            return Err(incomplete(&buf, timeout));
        }

        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(incomplete(&buf, timeout));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_fault(e)),
        }
    }
}

fn incomplete(buf: &BytesMut, timeout: Duration) -> BusFault {
    if buf.is_empty() {
        BusFault::timeout(timeout.as_millis() as u64)
    } else {
        BusFault::new(
            FaultKind::Crc,
            format!("truncated frame: {} byte(s) before timeout", buf.len()),
        )
    }
}

impl RelayBus for SerialBus {
    async fn transact(&mut self, request: &Request) -> Result<Option<BytesMut>, BusFault> {
        let Some(mut port) = self.port.take() else {
            return Err(BusFault::unavailable(format!("{} is not open", self.config.port)));
        };
        let frame = request.encode();
        let broadcast = request.is_broadcast();
        let timeout = self.config.response_timeout();

        debug!(port = %self.config.port, frame = ?&frame[..], "tx");
        let joined = tokio::task::spawn_blocking(move || {
            let result = exchange_blocking(port.as_mut(), &frame, broadcast, timeout);
            (port, result)
        })
        .await;

        let (port, result) = match joined {
            Ok(pair) => pair,
            Err(e) => return Err(BusFault::new(FaultKind::Io, format!("serial task failed: {e}"))),
        };

        match &result {
            Err(fault) if fault.kind == FaultKind::Io => {
                warn!(port = %self.config.port, error = %fault.detail, "Serial I/O failed, closing port");
            }
            _ => self.port = Some(port),
        }
        if let Ok(Some(frame)) = &result {
            debug!(port = %self.config.port, frame = ?&frame[..], "rx");
        }
        result
    }

    async fn open(&mut self) -> Result<(), BusFault> {
        let config = self.config.clone();
        let port = tokio::task::spawn_blocking(move || open_port(&config))
            .await
            .map_err(|e| BusFault::unavailable(format!("serial task failed: {e}")))??;
        info!(port = %self.config.port, baud_rate = self.config.baud_rate, "Serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn info(&self) -> BusInfo {
        BusInfo::new("RS-485 Serial", self.config.port.clone()).with_baud_rate(self.config.baud_rate)
    }
}
