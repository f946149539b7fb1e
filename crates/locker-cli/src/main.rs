//! `lockerd`: locker controller daemon and installer tool.

mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use locker_core::LockerId;
use locker_core::constants::{BROADCAST_ADDRESS, MAX_SLAVE_ADDRESS, MIN_SLAVE_ADDRESS};
use locker_hardware::{RelayDriver, SerialBus};
use locker_kiosk::KioskService;
use locker_storage::Database;
use serde::Serialize;
use tracing::{error, info};

use crate::config::{Config, DEFAULT_CONFIG_PATH, KioskConfig};

#[derive(Parser, Debug)]
#[command(name = "lockerd")]
#[command(version, about = "RFID locker controller for Modbus RTU relay cards")]
struct Args {
    /// Configuration file. A missing file means defaults.
    #[arg(long, short, env = "LOCKERD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// SQLite database path, overriding the configuration.
    #[arg(long)]
    database: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one dispatcher per configured kiosk until Ctrl-C.
    Run,

    /// Create lockers 1..=COUNT on a kiosk. Existing lockers are kept.
    Provision {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long)]
        count: u16,
    },

    /// Queue an open for a running daemon to execute.
    Open {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long)]
        locker: u16,
        /// Idempotency key; reusing it never pulses twice.
        #[arg(long)]
        command_id: Option<String>,
    },

    /// Queue an OFF write for a relay left energized.
    Close {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long)]
        locker: u16,
        #[arg(long)]
        command_id: Option<String>,
    },

    /// Probe slave addresses and list the cards that answer.
    Scan {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long, default_value_t = MIN_SLAVE_ADDRESS)]
        from: u8,
        #[arg(long, default_value_t = MAX_SLAVE_ADDRESS)]
        to: u8,
    },

    /// Read the address register of one card.
    ReadAddress {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long)]
        slave: u8,
    },

    /// Give a card a new slave address. `--current 0` broadcasts.
    SetAddress {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long, default_value_t = BROADCAST_ADDRESS)]
        current: u8,
        #[arg(long)]
        new: u8,
    },

    /// Pulse one relay directly, bypassing the queue.
    TestRelay {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long)]
        locker: u16,
    },

    /// List a kiosk's most recent commands.
    Commands {
        #[arg(long)]
        kiosk: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(path) = args.database {
        config.database.path = path;
    }
    if args.log_json {
        config.logging.json = true;
    }
    logging::init(&config.logging);

    match args.command {
        Command::Run => run(&config).await,
        Command::Provision { kiosk, count } => {
            let kiosk = config.kiosk(kiosk.as_deref())?;
            let service = service(&config, std::slice::from_ref(&kiosk)).await?;
            let created = service.provision(&kiosk.id, count).await?;
            info!(kiosk = %kiosk.id, created, "Lockers provisioned");
            Ok(())
        }
        Command::Open {
            kiosk,
            locker,
            command_id,
        } => {
            let kiosk = config.kiosk(kiosk.as_deref())?;
            let service = service(&config, std::slice::from_ref(&kiosk)).await?;
            let response = service
                .open_locker(&kiosk.id, LockerId::new(locker)?, command_id)
                .await?;
            print_json(&response)
        }
        Command::Close {
            kiosk,
            locker,
            command_id,
        } => {
            let kiosk = config.kiosk(kiosk.as_deref())?;
            let service = service(&config, std::slice::from_ref(&kiosk)).await?;
            let response = service
                .close_relay(&kiosk.id, LockerId::new(locker)?, command_id)
                .await?;
            print_json(&response)
        }
        Command::Scan { kiosk, from, to } => {
            let driver = driver(&config.kiosk(kiosk.as_deref())?);
            print_json(&driver.scan(from..=to).await?)
        }
        Command::ReadAddress { kiosk, slave } => {
            let driver = driver(&config.kiosk(kiosk.as_deref())?);
            let address = driver.read_slave_address(slave).await?;
            println!("{address}");
            Ok(())
        }
        Command::SetAddress {
            kiosk,
            current,
            new,
        } => {
            let driver = driver(&config.kiosk(kiosk.as_deref())?);
            print_json(&driver.set_slave_address(current, new).await?)
        }
        Command::TestRelay { kiosk, locker } => {
            let driver = driver(&config.kiosk(kiosk.as_deref())?);
            print_json(&driver.test_relay(LockerId::new(locker)?).await?)
        }
        Command::Commands { kiosk, limit } => {
            let kiosk = config.kiosk(kiosk.as_deref())?;
            let service = service(&config, std::slice::from_ref(&kiosk)).await?;
            print_json(&service.recent_commands(&kiosk.id, limit).await?)
        }
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let kiosks = config.kiosks()?;
    let service = service(config, &kiosks).await?;
    info!(
        version = locker_core::VERSION,
        kiosks = kiosks.len(),
        database = %config.database.path,
        "Starting lockerd"
    );

    for kiosk in &kiosks {
        if let Some(count) = kiosk.lockers {
            service.provision(&kiosk.id, count).await?;
        }
    }

    let mut handles = Vec::with_capacity(kiosks.len());
    for kiosk in &kiosks {
        handles.push(service.dispatcher(&kiosk.id, config.dispatcher)?.spawn());
    }

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;
    info!("Shutting down");

    for handle in handles {
        let kiosk = handle.kiosk().clone();
        if let Err(e) = handle.shutdown().await {
            error!(kiosk = %kiosk, "Dispatcher ended with error: {}", e);
        }
    }
    Ok(())
}

async fn service(config: &Config, kiosks: &[KioskConfig]) -> anyhow::Result<KioskService> {
    let db = Database::new(config.database.clone())
        .await
        .with_context(|| format!("cannot open database {}", config.database.path))?;
    let builder = kiosks.iter().fold(
        KioskService::builder(&db).session_config(config.session),
        |builder, kiosk| builder.kiosk(kiosk.id.clone(), Arc::new(driver(kiosk))),
    );
    Ok(builder.build())
}

/// The port opens lazily, so a missing adapter fails per command.
fn driver(kiosk: &KioskConfig) -> RelayDriver {
    RelayDriver::new(SerialBus::new(kiosk.serial.clone()), kiosk.driver.clone())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
