use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use batterycast::receiver::{NameMatch, ScanFilter};
use batterycast::settings::DEFAULT_PATH;
use batterycast::sysfs_source::DEFAULT_ROOT;
use batterycast::{
    AdvertiseParams, Broadcaster, ConsoleRadio, FileSettingsStore, Layout, LogStatusSink, LogWakeLock, Parts,
    PowerState, Radio, RadioEvents, RadioPower, Sampler, SettingsStore, StatusPublisher, SysfsTelemetrySource, Worker,
};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(version, about = "Broadcast battery telemetry over BLE advertisements")]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "BATTERYCAST_SETTINGS", default_value = DEFAULT_PATH)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Broadcast until interrupted
    Broadcast {
        /// Device id, defaults to the stored one
        #[arg(long)]
        device_id: Option<u32>,
        /// Seconds between frames (1-60), defaults to the stored value
        #[arg(long)]
        interval: Option<i64>,
        #[command(flatten)]
        host: HostArgs,
    },
    /// Broadcast with the stored settings, if auto start is enabled
    Autostart {
        #[command(flatten)]
        host: HostArgs,
    },
    /// Listen for frames and print them
    Scan {
        /// Only show devices whose name starts with this
        #[arg(long)]
        name: Option<String>,
        /// Match --name exactly instead of as a prefix
        #[arg(long, requires = "name")]
        exact: bool,
        /// Print every advertisement, not only new sequence numbers
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = batterycast::frame::MANUFACTURER_ID, value_parser = parse_u16)]
        company_id: u16,
    },
    /// Print the last stored broadcast status
    Status,
    /// Change stored settings
    Config {
        #[arg(long)]
        device_id: Option<u32>,
        #[arg(long)]
        interval: Option<i64>,
        #[arg(long)]
        auto_start: Option<bool>,
    },
}

#[derive(Args)]
struct HostArgs {
    #[arg(long, value_enum, default_value_t = LayoutArg::Versioned)]
    layout: LayoutArg,
    /// Power supply directory to read, e.g. BAT0. Defaults to the first battery found
    #[arg(long)]
    battery: Option<String>,
    #[arg(long, default_value = DEFAULT_ROOT)]
    power_supply_root: PathBuf,
    /// Do not watch a Bluetooth adapter; treat the radio as always on
    #[arg(long)]
    no_adapter: bool,
    /// Log frames instead of advertising them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    /// 9 bytes
    Legacy,
    /// 11 bytes, magic prefixed
    Versioned,
}

impl From<LayoutArg> for Layout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Legacy => Layout::Legacy,
            LayoutArg::Versioned => Layout::Versioned,
        }
    }
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = Arc::new(FileSettingsStore::new(&cli.settings));

    match cli.command {
        Command::Broadcast { device_id, interval, host } => {
            let settings = store.load()?;
            let device_id = device_id.unwrap_or(settings.device_id);
            let interval = interval.unwrap_or(settings.interval_sec);
            broadcast(store, device_id, interval, host).await
        }
        Command::Autostart { host } => {
            let settings = store.load()?;
            if !settings.auto_start {
                log::info!("Auto start disabled in {}", cli.settings.display());
                return Ok(());
            }
            broadcast(store, settings.device_id, settings.interval_sec, host).await
        }
        Command::Scan { name, exact, all, company_id } => {
            let filter = ScanFilter {
                company_id,
                name: name.map(|n| if exact { NameMatch::Exact(n) } else { NameMatch::Prefix(n) }),
                only_on_change: !all,
            };
            println!("Scanning BLE... Ctrl+C to quit");
            tokio::select! {
                result = batterycast::receiver::scan(filter, |sighting| {
                    let time = chrono::Local::now().format("%H:%M:%S").to_string();
                    println!("{}", sighting.line(&time));
                }) => result,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        Command::Status => {
            let settings = store.load()?;
            println!("running:   {}", settings.service_running);
            println!("status:    {}", settings.ble_status);
            if !settings.ble_error.is_empty() {
                println!("error:     {}", settings.ble_error);
            }
            println!("updated:   {}", format_ts(settings.ble_ts));
            println!("device id: {}", settings.device_id);
            println!("interval:  {}s", settings.interval_sec);
            println!("autostart: {}", settings.auto_start);
            Ok(())
        }
        Command::Config { device_id, interval, auto_start } => {
            store.update(&mut |s| {
                if let Some(device_id) = device_id {
                    s.device_id = device_id;
                }
                if let Some(interval) = interval {
                    s.interval_sec = interval;
                }
                if let Some(auto_start) = auto_start {
                    s.auto_start = auto_start;
                }
            })?;
            log::info!("Saved {}", cli.settings.display());
            Ok(())
        }
    }
}

async fn broadcast(store: Arc<FileSettingsStore>, device_id: u32, interval: i64, host: HostArgs) -> anyhow::Result<()> {
    let worker = Worker::new();
    let power = RadioPower::new(PowerState::On);
    if !host.no_adapter {
        let (power, events) = (power.clone(), worker.radio_events());
        tokio::spawn(async move {
            if let Err(err) = batterycast::radio_watch::watch_adapter(power, events).await {
                log::warn!("Stopped watching the adapter: {err:#}");
            }
        });
    }

    let radio: Box<dyn Radio> = if host.dry_run {
        Box::new(ConsoleRadio::new(worker.radio_events(), power))
    } else {
        open_radio(worker.radio_events(), power).await?
    };

    let (publisher, fan_out) = StatusPublisher::spawn(store, Arc::new(LogStatusSink));
    let broadcaster = Broadcaster::new(Parts {
        sampler: Sampler::new(SysfsTelemetrySource::with_root(host.power_supply_root, host.battery)),
        radio,
        wake_lock: Box::new(LogWakeLock),
        publisher,
        layout: host.layout.into(),
        params: AdvertiseParams::default(),
    });
    let (handle, task) = worker.spawn(broadcaster);

    handle.start(device_id, interval)?;
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    handle.shutdown().await?;
    task.await?;
    fan_out.await?;
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "bluez"))]
async fn open_radio(events: RadioEvents, power: RadioPower) -> anyhow::Result<Box<dyn Radio>> {
    let radio = batterycast::bluez_radio::BluezRadio::open(events, power).await?;
    Ok(Box::new(radio))
}

#[cfg(not(all(target_os = "linux", feature = "bluez")))]
async fn open_radio(_events: RadioEvents, _power: RadioPower) -> anyhow::Result<Box<dyn Radio>> {
    anyhow::bail!("built without an advertiser (enable the `bluez` feature on Linux); use --dry-run to log frames instead")
}

fn format_ts(ms: i64) -> String {
    if ms <= 0 {
        return "never".to_owned();
    }
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(ts) => ts.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}
