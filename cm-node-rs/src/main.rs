//! Charge Management Node
//!
//! Runs either as a load manager distributing a fixed current budget over
//! its chargers, or as a simulated charger reporting to a manager.

use clap::{Parser, Subcommand};
use cm_core::resolver::NetworkResolver;
use cm_core::state::feature;
use cm_core::{
    ChargerStatus, Client, ClientConfig, CommandUpdate, Manager, ManagerConfig, StateV1, StateV3,
    StaticSystemState, CHARGE_MANAGEMENT_PORT, CHARGE_MANAGER_PORT,
};
use rand::Rng;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Chargers not heard from for this long get no allocation
const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// IEC 61851 state B: vehicle connected
const IEC_STATE_B: u8 = 1;
/// IEC 61851 state C: charging
const IEC_STATE_C: u8 = 2;

/// Charge-management node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Local address to bind to
    #[arg(short, long, default_value = "0.0.0.0", global = true)]
    bind: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Distribute current over managed chargers
    Manager {
        /// Charger IP address or hostname, repeat for every charger
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,

        /// UDP port to receive state packets on
        #[arg(short, long, default_value_t = CHARGE_MANAGER_PORT)]
        port: u16,

        /// UDP port chargers receive commands on
        #[arg(long, default_value_t = CHARGE_MANAGEMENT_PORT)]
        client_port: u16,

        /// Total current available to all chargers in mA
        #[arg(short, long, default_value = "32000")]
        total_current: u32,

        /// Resolve hostnames through DNS only
        #[arg(long)]
        no_mdns: bool,
    },

    /// Simulate a managed charger
    Client {
        /// UDP port to receive commands on
        #[arg(short, long, default_value_t = CHARGE_MANAGEMENT_PORT)]
        port: u16,

        /// JSON file with features and meter readings
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Maximum current the charger supports in mA
        #[arg(long, default_value = "32000")]
        supported_current: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.mode {
        Mode::Manager {
            hosts,
            port,
            client_port,
            total_current,
            no_mdns,
        } => {
            let config = ManagerConfig::default()
                .with_bind_addr(args.bind)
                .with_port(port)
                .with_client_port(client_port);
            run_manager(config, hosts, total_current, no_mdns).await
        }
        Mode::Client {
            port,
            state_file,
            supported_current,
        } => {
            let system = match state_file {
                Some(path) => StaticSystemState::load(path)?,
                None => StaticSystemState::default()
                    .with_feature(feature::EVSE)
                    .with_feature(feature::CP_DISCONNECT),
            };
            let config = ClientConfig::default().with_bind_addr(args.bind).with_port(port);
            run_client(config, system, supported_current).await
        }
    }
}

/// Latest state reported by one charger
#[derive(Debug, Clone, Copy)]
struct ChargerReport {
    received: Instant,
    iec61851_state: u8,
    supported_current: u16,
    phases: i8,
}

impl ChargerReport {
    fn wants_current(&self) -> bool {
        matches!(self.iec61851_state, IEC_STATE_B | IEC_STATE_C)
    }
}

/// Split `total_current` evenly over all chargers with a vehicle, capped at
/// what each charger supports. Current a charger cannot take is handed to
/// the others.
fn allocate(total_current: u32, reports: &[Option<ChargerReport>], now: Instant) -> Vec<u16> {
    let mut allocation = vec![0u16; reports.len()];

    let mut waiting: Vec<usize> = reports
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            r.filter(|r| now.saturating_duration_since(r.received) < REPORT_TIMEOUT && r.wants_current())
                .map(|_| i)
        })
        .collect();

    // Smallest chargers first, so their leftover flows to the larger ones.
    waiting.sort_by_key(|&i| reports[i].map_or(0, |r| r.supported_current));

    let mut remaining = total_current;
    let mut count = waiting.len() as u32;
    for i in waiting {
        let supported = reports[i].map_or(0, |r| r.supported_current);
        let share = (remaining / count).min(supported as u32);
        allocation[i] = share as u16;
        remaining -= share;
        count -= 1;
    }

    allocation
}

async fn run_manager(
    config: ManagerConfig,
    hosts: Vec<String>,
    total_current: u32,
    no_mdns: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Charge manager starting: {} chargers, {} mA total",
        hosts.len(),
        total_current
    );

    let resolver = Arc::new(if no_mdns {
        NetworkResolver::dns_only()
    } else {
        NetworkResolver::new()?
    });

    let mut poll_ticker = interval(config.poll_interval);
    let mut resolve_ticker = interval(config.resolve_interval);
    let mut allocate_ticker = interval(Duration::from_secs(1));

    let mut manager = Manager::register(config, &hosts, resolver.clone())?;

    let (state_tx, mut state_rx) = mpsc::unbounded_channel::<(u8, StateV1, Option<StateV3>)>();
    manager.set_state_callback(move |device, v1, _v2, v3| {
        let _ = state_tx.send((device, *v1, v3.copied()));
    });
    manager.set_error_callback(|device, error| {
        warn!("Charger #{}: {}", device, error);
    });

    let mut reports: Vec<Option<ChargerReport>> = vec![None; manager.device_count()];

    loop {
        tokio::select! {
            _ = poll_ticker.tick() => manager.poll(),

            _ = resolve_ticker.tick() => manager.resolve_due(),

            Some((device, v1, v3)) = state_rx.recv() => {
                if let Some(report) = reports.get_mut(device as usize) {
                    *report = Some(ChargerReport {
                        received: Instant::now(),
                        iec61851_state: v1.iec61851_state,
                        supported_current: v1.supported_current,
                        phases: v3.map_or(0, |v3| v3.phase_count()),
                    });
                }
            }

            _ = allocate_ticker.tick() => {
                let allocation = allocate(total_current, &reports, Instant::now());
                for (device, current) in allocation.into_iter().enumerate() {
                    let phases = reports[device].map_or(0, |r| r.phases);
                    if !manager.send_manager_update(device as u8, current, false, phases) {
                        // Retried with the same sequence number on the next tick
                        warn!("Send buffer full, allocation for charger #{} delayed", device);
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    resolver.shutdown()?;
    Ok(())
}

/// Simulated charger following the manager's allocation
struct SimulatedCharger {
    status: ChargerStatus,
    started: Instant,
    state_changed: Instant,
}

impl SimulatedCharger {
    fn new(supported_current: u16) -> Self {
        let now = Instant::now();
        Self {
            status: ChargerStatus {
                esp32_uid: rand::thread_rng().gen(),
                iec61851_state: IEC_STATE_B,
                charger_state: 1,
                supported_current,
                managed: true,
                phases: 3,
                ..Default::default()
            },
            started: now,
            state_changed: now,
        }
    }

    fn apply(&mut self, update: CommandUpdate) {
        let iec61851_state = if update.allocated_current > 0 {
            IEC_STATE_C
        } else {
            IEC_STATE_B
        };
        if iec61851_state != self.status.iec61851_state {
            self.state_changed = Instant::now();
        }

        self.status.iec61851_state = iec61851_state;
        self.status.charger_state = iec61851_state + 1;
        self.status.allowed_charging_current = update.allocated_current.min(self.status.supported_current);
        self.status.cp_disconnected = update.cp_disconnect_requested;
        if update.allocated_phases > 0 {
            self.status.phases = update.allocated_phases;
        }
    }

    fn snapshot(&mut self) -> ChargerStatus {
        self.status.uptime = self.started.elapsed().as_millis() as u32;
        self.status.time_since_state_change = self.state_changed.elapsed().as_millis() as u32;
        self.status
    }
}

async fn run_client(
    config: ClientConfig,
    system: StaticSystemState,
    supported_current: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Charger simulation starting, supports {} mA", supported_current);

    let mut poll_ticker = interval(config.poll_interval);
    // Spread chargers started together over the send interval
    let jitter = rand::thread_rng().gen_range(0..config.send_interval.as_millis().max(1) as u64);
    let mut send_ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_millis(jitter),
        config.send_interval,
    );

    let mut client = Client::register(config, system)?;

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    client.set_command_callback(move |update| {
        let _ = command_tx.send(update);
    });

    let mut charger = SimulatedCharger::new(supported_current);

    loop {
        tokio::select! {
            _ = poll_ticker.tick() => client.poll(),

            Some(update) = command_rx.recv() => {
                info!(
                    "Allocated {} mA on {} phases{}",
                    update.allocated_current,
                    update.allocated_phases,
                    if update.cp_disconnect_requested { ", CP disconnect requested" } else { "" }
                );
                charger.apply(update);
            }

            _ = send_ticker.tick() => {
                let status = charger.snapshot();
                if !client.send_state(&status) && client.manager_addr().is_some() {
                    warn!("Failed to send state");
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
