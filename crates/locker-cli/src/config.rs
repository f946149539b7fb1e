//! Daemon configuration.
//!
//! Layered as: built-in defaults, then the TOML file, then `LOCKERD_*`
//! environment variables, then command-line flags.
//!
//! ```toml
//! [database]
//! path = "/var/lib/lockerd/lockerd.db"
//!
//! [session]
//! timeout_secs = 30
//!
//! [[kiosks]]
//! id = "lobby"
//! lockers = 32
//!
//! [kiosks.serial]
//! port = "/dev/ttyUSB0"
//!
//! [kiosks.driver]
//! pulse_duration_ms = 400
//! ```

use std::path::Path;

use anyhow::{Context, bail};
use locker_core::KioskId;
use locker_hardware::{DriverConfig, SerialConfig};
use locker_kiosk::{DispatcherConfig, SessionConfig};
use locker_storage::DatabaseConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lockerd.toml";
pub const DEFAULT_KIOSK_ID: &str = "kiosk-1";

pub const ENV_DATABASE: &str = "LOCKERD_DATABASE";
pub const ENV_SERIAL_PORT: &str = "LOCKERD_SERIAL_PORT";
pub const ENV_KIOSK_ID: &str = "LOCKERD_KIOSK_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One kiosk: an identity and the RS-485 line its lockers hang on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KioskConfig {
    pub id: KioskId,
    /// Lockers to provision at startup.
    #[serde(default)]
    pub lockers: Option<u16>,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

impl KioskConfig {
    pub fn new(id: KioskId) -> Self {
        Self {
            id,
            lockers: None,
            serial: SerialConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub dispatcher: DispatcherConfig,
    pub kiosks: Vec<KioskConfig>,
}

impl Config {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("invalid configuration in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LOCKERD_*` overrides read through `lookup`.
    ///
    /// The serial port and kiosk id apply to the first kiosk, which is
    /// created if the file configured none.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(path) = lookup(ENV_DATABASE) {
            self.database.path = path;
        }
        let port = lookup(ENV_SERIAL_PORT);
        let kiosk_id = lookup(ENV_KIOSK_ID)
            .map(KioskId::new)
            .transpose()
            .with_context(|| format!("invalid {ENV_KIOSK_ID}"))?;

        if port.is_none() && kiosk_id.is_none() {
            return Ok(());
        }
        let first = self.first_kiosk_mut()?;
        if let Some(port) = port {
            first.serial.port = port;
        }
        if let Some(id) = kiosk_id {
            first.id = id;
        }
        self.validate()
    }

    /// The configured kiosks, or a single default one.
    pub fn kiosks(&self) -> anyhow::Result<Vec<KioskConfig>> {
        if self.kiosks.is_empty() {
            return Ok(vec![KioskConfig::new(KioskId::new(DEFAULT_KIOSK_ID)?)]);
        }
        Ok(self.kiosks.clone())
    }

    /// The kiosk named `id`, or the first one when `id` is `None`.
    pub fn kiosk(&self, id: Option<&str>) -> anyhow::Result<KioskConfig> {
        let kiosks = self.kiosks()?;
        match id {
            None => kiosks
                .into_iter()
                .next()
                .context("no kiosk configured"),
            Some(id) => kiosks
                .into_iter()
                .find(|k| k.id.as_str() == id)
                .with_context(|| format!("kiosk {id} is not configured")),
        }
    }

    fn first_kiosk_mut(&mut self) -> anyhow::Result<&mut KioskConfig> {
        if self.kiosks.is_empty() {
            self.kiosks.push(KioskConfig::new(KioskId::new(DEFAULT_KIOSK_ID)?));
        }
        self.kiosks.first_mut().context("no kiosk configured")
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (index, kiosk) in self.kiosks.iter().enumerate() {
            if self.kiosks[..index].iter().any(|k| k.id == kiosk.id) {
                bail!("kiosk {} is configured twice", kiosk.id);
            }
            if self.kiosks[..index]
                .iter()
                .any(|k| k.serial.port == kiosk.serial.port)
            {
                bail!("serial port {} is shared by two kiosks", kiosk.serial.port);
            }
        }
        if self.session.timeout_secs == 0 {
            bail!("session.timeout_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_file_means_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());

        let kiosks = config.kiosks().unwrap();
        assert_eq!(kiosks.len(), 1);
        assert_eq!(kiosks[0].id.as_str(), DEFAULT_KIOSK_ID);
        assert_eq!(kiosks[0].serial.port, "/dev/ttyUSB0");
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_kiosks() {
        let config = Config::parse(
            r#"
            [database]
            path = "/tmp/lockers.db"

            [session]
            timeout_secs = 45

            [[kiosks]]
            id = "lobby"
            lockers = 32
            serial = { port = "/dev/ttyUSB0" }

            [[kiosks]]
            id = "gym"
            serial = { port = "/dev/ttyUSB1", baud_rate = 19200 }
            driver = { pulse_duration_ms = 600, write_mode = "single_coil" }
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, "/tmp/lockers.db");
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.session.timeout_secs, 45);
        assert_eq!(config.kiosks.len(), 2);
        assert_eq!(config.kiosks[0].lockers, Some(32));

        let gym = config.kiosk(Some("gym")).unwrap();
        assert_eq!(gym.serial.baud_rate, 19200);
        assert_eq!(gym.serial.response_timeout_ms, 500);
        assert_eq!(gym.driver.pulse_duration_ms, 600);
        assert_eq!(gym.driver.command_interval_ms, 300);
        assert_eq!(config.kiosk(None).unwrap().id.as_str(), "lobby");
        assert!(config.kiosk(Some("roof")).is_err());
    }

    #[test]
    fn test_rejects_duplicate_ports_and_bad_ids() {
        let shared = r#"
            [[kiosks]]
            id = "a"
            [[kiosks]]
            id = "b"
        "#;
        assert!(Config::parse(shared).is_err());

        assert!(Config::parse("[[kiosks]]\nid = \"not valid!\"").is_err());
        assert!(Config::parse("[session]\ntimeout_secs = 0").is_err());
    }

    #[test]
    fn test_env_overrides_first_kiosk() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                (ENV_DATABASE, "/data/l.db"),
                (ENV_SERIAL_PORT, "/dev/ttyACM0"),
                (ENV_KIOSK_ID, "entrance"),
            ]))
            .unwrap();

        assert_eq!(config.database.path, "/data/l.db");
        assert_eq!(config.kiosks.len(), 1);
        assert_eq!(config.kiosks[0].id.as_str(), "entrance");
        assert_eq!(config.kiosks[0].serial.port, "/dev/ttyACM0");
    }

    #[test]
    fn test_env_without_overrides_leaves_config() {
        let mut config = Config::default();
        config.apply_env(env(&[])).unwrap();
        assert_eq!(config, Config::default());

        assert!(config.apply_env(env(&[(ENV_KIOSK_ID, "")])).is_err());
    }
}
