//! hso-modem
//!
//! Command-line front end for Option HSO modems: lists supported devices,
//! shows the functions each interface provides, talks AT on a serial port
//! and brings the network function up.

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use common::{ThreadWorkQueue, WorkQueue, setup_logging};
use driver::usb::{self, UsbModem};
use driver::{ByteConsumer, DriverConfig, InterfaceBinding, ModemDriver, PacketSink};
use protocol::PortKind;
use rusb::Context as UsbContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hso-modem")]
#[command(author, version, about = "Driver for Option HSO USB modems")]
#[command(long_about = "
Userspace driver for Option HSO composite USB modems.

EXAMPLES:
    # Show connected supported modems
    hso-modem list

    # Show the functions of each interface
    hso-modem ports

    # Ask the control port for the firmware revision
    hso-modem at AT+CGMR --port control

    # Bring the network function up and log statistics
    hso-modem monitor

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hso-modem/driver.toml
    3. /etc/hso-modem/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported modems on the bus
    List,
    /// Probe every modem and print its functions
    Ports,
    /// Send one AT command and print the reply
    At {
        /// Command to send, without the trailing CR
        command: String,
        /// Serial port to use (control, app, app2, gps, pcsc, diag, diag2, modem)
        #[arg(short, long, default_value = "control")]
        port: PortKind,
        /// How long to collect the reply
        #[arg(short, long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Bring the network function up and log statistics until Ctrl-C
    Monitor {
        /// Seconds between statistics lines
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => DriverConfig::load_from(path).context("Failed to load configuration")?,
        None => DriverConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level)
        .to_string();
    setup_logging(&log_level).context("Failed to setup logging")?;
    info!("hso-modem v{}", env!("CARGO_PKG_VERSION"));

    let work = Arc::new(
        ThreadWorkQueue::new("hso-work", 1, 256).context("Failed to start work queue")?,
    );
    let driver = ModemDriver::new(config, work.clone() as Arc<dyn WorkQueue>);
    let context = UsbContext::new().context("Failed to initialize libusb")?;

    let result = match args.command.unwrap_or(Command::List) {
        Command::List => list(&context, &driver),
        Command::Ports => ports(&context, &driver),
        Command::At {
            command,
            port,
            wait_ms,
        } => at(&context, &driver, &command, port, Duration::from_millis(wait_ms)).await,
        Command::Monitor { interval } => {
            monitor(&context, &driver, Duration::from_secs(interval.max(1))).await
        }
    };

    drop(driver);
    match Arc::try_unwrap(work) {
        Ok(work) => work.shutdown(),
        Err(_) => debug!("Work queue still shared, leaving it to drain"),
    }
    result
}

fn list(context: &UsbContext, driver: &ModemDriver) -> Result<()> {
    let modems = usb::find_modems(context, driver).context("Failed to enumerate USB devices")?;
    if modems.is_empty() {
        println!("No supported modems found.");
        return Ok(());
    }

    println!("Found {} supported modem(s):\n", modems.len());
    for modem in &modems {
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}  layout {:?}",
            modem.vendor_id(),
            modem.product_id(),
            modem.bus_number(),
            modem.address(),
            driver.layout_for(modem.vendor_id(), modem.product_id())
        );
    }
    Ok(())
}

/// An opened modem with every interface probed
struct Session {
    modem: UsbModem,
    bindings: Vec<InterfaceBinding>,
}

fn attach(context: &UsbContext, driver: &ModemDriver) -> Result<Vec<Session>> {
    let modems = usb::find_modems(context, driver).context("Failed to enumerate USB devices")?;
    let mut sessions = Vec::new();

    for mut modem in modems {
        let interfaces = modem.interfaces()?;
        let transport = match modem.open() {
            Ok(transport) => transport,
            Err(e) => {
                warn!(
                    "Skipping {:04x}:{:04x}: {}",
                    modem.vendor_id(),
                    modem.product_id(),
                    e
                );
                continue;
            }
        };

        let mut bindings = Vec::new();
        for intf in &interfaces {
            match driver.probe(
                transport.clone(),
                modem.vendor_id(),
                modem.product_id(),
                intf,
            ) {
                Ok(binding) => bindings.push(binding),
                Err(e) => debug!("Interface {} not bound: {}", intf.number, e),
            }
        }
        sessions.push(Session { modem, bindings });
    }
    Ok(sessions)
}

fn detach(driver: &ModemDriver, sessions: Vec<Session>) {
    for mut session in sessions {
        for binding in session.bindings {
            driver.disconnect(binding);
        }
        session.modem.close();
    }
}

fn ports(context: &UsbContext, driver: &ModemDriver) -> Result<()> {
    let sessions = attach(context, driver)?;
    if sessions.is_empty() {
        println!("No supported modems found.");
        return Ok(());
    }

    for info in driver.ports() {
        println!(
            "  {:<8} {:<14} interface {} ({})",
            info.index.to_string(),
            info.port.name(),
            info.interface,
            if info.mux { "mux" } else { "bulk" }
        );
    }
    detach(driver, sessions);
    Ok(())
}

/// Collects serial bytes for the AT command
#[derive(Default)]
struct ReplyBuffer {
    data: Mutex<Vec<u8>>,
    hung_up: AtomicBool,
}

impl ByteConsumer for ReplyBuffer {
    fn is_throttled(&self) -> bool {
        false
    }

    fn push(&self, data: &[u8]) -> usize {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        data.len()
    }

    fn hangup(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
    }
}

async fn at(
    context: &UsbContext,
    driver: &ModemDriver,
    command: &str,
    port: PortKind,
    wait: Duration,
) -> Result<()> {
    let sessions = attach(context, driver)?;
    let result = send_at(driver, command, port, wait).await;
    detach(driver, sessions);
    result
}

async fn send_at(
    driver: &ModemDriver,
    command: &str,
    port: PortKind,
    wait: Duration,
) -> Result<()> {
    let index = driver
        .find(port)
        .ok_or_else(|| anyhow!("No {} port found", port.name()))?;
    let reply = Arc::new(ReplyBuffer::default());
    let handle = driver
        .open_serial(index, reply.clone())
        .with_context(|| format!("Failed to open {}", index))?;

    let mut pending = format!("{}\r", command).into_bytes();
    while !pending.is_empty() {
        let written = handle.write(&pending)?;
        pending.drain(..written);
        if written == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    tokio::time::sleep(wait).await;
    if reply.hung_up.load(Ordering::SeqCst) {
        bail!("Modem disconnected");
    }

    let data = reply.data.lock().unwrap_or_else(|e| e.into_inner()).clone();
    print!("{}", String::from_utf8_lossy(&data));
    Ok(())
}

/// Counts received packets; nothing is routed
struct CountingSink {
    packets: Mutex<Vec<Bytes>>,
}

impl PacketSink for CountingSink {
    fn deliver(&self, packet: Bytes) {
        debug!("Received {} byte packet", packet.len());
        let mut packets = self.packets.lock().unwrap_or_else(|e| e.into_inner());
        if packets.len() < 16 {
            packets.push(packet);
        }
    }
}

async fn monitor(context: &UsbContext, driver: &ModemDriver, interval: Duration) -> Result<()> {
    let sessions = attach(context, driver)?;
    let result = run_monitor(driver, interval).await;
    detach(driver, sessions);
    result
}

async fn run_monitor(driver: &ModemDriver, interval: Duration) -> Result<()> {
    let index = driver
        .find(PortKind::Network)
        .ok_or_else(|| anyhow!("No network function found"))?;
    let sink = Arc::new(CountingSink {
        packets: Mutex::new(Vec::new()),
    });
    let handle = driver
        .open_net(index, sink)
        .with_context(|| format!("Failed to bring {} up", index))?;
    handle.set_radio(true).context("Failed to switch the radio on")?;
    info!("{} up, press Ctrl+C to stop", index);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = handle.check_tx_timeout() {
                    warn!("{}", e);
                }
                let stats = handle.stats();
                info!(
                    "rx {} pkts / {} bytes ({} errors, {} dropped), tx {} pkts / {} bytes ({} errors)",
                    stats.rx_packets, stats.rx_bytes, stats.rx_errors, stats.rx_dropped,
                    stats.tx_packets, stats.tx_bytes, stats.tx_errors
                );
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down"),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
        }
    }

    if let Err(e) = handle.set_radio(false) {
        warn!("Failed to switch the radio off: {}", e);
    }
    Ok(())
}
