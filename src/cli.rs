//! Command Line Interface
//!
//! Thin consumer of [`sf_core::SmcService`]: every command connects through
//! the helper, and falls back to simulated readings when the helper or the
//! SMC is unavailable.

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sf_core::{
    BackendKind, FanReading, Monitor, PermissionState, SmcService, SmcSettings, TemperatureReading,
};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "smcfan")]
#[command(version)]
#[command(about = "smcfan - SMC temperatures and fan control")]
#[command(long_about = "smcfan - SMC temperatures and fan control

Reads temperature sensors and drives fans through the privileged smcfand
helper. When the helper cannot reach the SMC, readings are simulated and
marked as such.

EXAMPLES:
    smcfan status                      Helper, permission and backend summary
    smcfan temps                       List all temperature sensors
    smcfan fans --json                 Fan limits and speeds as JSON
    smcfan read TC0P                   Read a single temperature key
    smcfan fan set 0 3000              Force fan 0 to 3000 RPM
    smcfan fan auto 0                  Return fan 0 to firmware control
    smcfan watch --interval-ms 1000    Poll until Ctrl-C
    smcfan stats                       Access statistics and tuning hints

ENVIRONMENT VARIABLES:
    RUST_LOG=debug         Enable debug logging

FILES:
    ~/.config/smcfan/settings.json     Client settings")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Helper socket (overrides settings)
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Show helper, permission and backend status
    Status,

    /// List all temperature sensors
    Temps(OutputArgs),

    /// List all fans
    Fans(OutputArgs),

    /// Read one temperature key
    Read {
        /// Four-character SMC key, e.g. TC0P
        key: String,
    },

    /// Fan control
    #[command(subcommand, about = "Force fan speeds or return fans to automatic mode")]
    Fan(FanCommands),

    /// Poll temperatures and fans continuously
    Watch {
        /// Poll interval in milliseconds (defaults to settings)
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,

        /// Stop after this many samples
        #[arg(long)]
        count: Option<u64>,
    },

    /// Show access statistics and optimisation suggestions
    Stats,

    /// Settings management
    #[command(subcommand, about = "View client settings")]
    Settings(SettingsCommands),
}

#[derive(Args, Debug, PartialEq)]
pub struct OutputArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum FanCommands {
    /// Force a fan to a target speed
    Set {
        index: u8,
        rpm: f64,
    },
    /// Return a fan to automatic control
    Auto {
        index: u8,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum SettingsCommands {
    /// Print effective settings as JSON
    Show,
    /// Print the settings file location
    Path,
}

// ============================================================================
// Execution
// ============================================================================

/// Effective settings: the settings file plus command-line overrides.
pub fn effective_settings(cli: &Cli) -> SmcSettings {
    let mut settings = sf_core::get_cached_settings();
    if let Some(socket) = &cli.socket {
        settings.ipc.socket_path = Some(socket.clone());
    }
    settings
}

pub async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = effective_settings(&cli);

    if let Commands::Settings(sub) = &cli.command {
        return cmd_settings(sub, &settings);
    }

    let service = SmcService::new(settings);
    let state = match service.connect().await {
        Ok(state) => state,
        Err(e) => {
            debug!("Connect failed: {}", e);
            service.permission_state()
        }
    };
    if service.backend_kind() == BackendKind::Simulated && cli.command != Commands::Status {
        eprintln!("warning: SMC access {}, showing simulated values", state);
    }

    let result = match &cli.command {
        Commands::Status => cmd_status(&service).await,
        Commands::Temps(args) => cmd_temps(&service, args).await,
        Commands::Fans(args) => cmd_fans(&service, args).await,
        Commands::Read { key } => cmd_read(&service, key).await,
        Commands::Fan(sub) => cmd_fan(&service, sub).await,
        Commands::Watch { interval_ms, count } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| service.settings().poll_interval());
            cmd_watch(&service, interval, *count).await
        }
        Commands::Stats => cmd_stats(&service).await,
        Commands::Settings(_) => Ok(()),
    };

    if let Err(e) = service.disconnect().await {
        debug!("Disconnect failed: {}", e);
    }
    result
}

fn marker(simulated: bool) -> &'static str {
    if simulated {
        " (simulated)"
    } else {
        ""
    }
}

async fn cmd_status(service: &SmcService) -> anyhow::Result<()> {
    println!("smcfan Status");
    println!("=============");
    println!();
    println!("Socket:     {}", service.settings().socket_path().display());
    println!("Permission: {}", service.permission_state());
    println!("Backend:    {}", service.backend_kind());

    if service.backend_kind() == BackendKind::Real {
        match service.helper_status().await {
            Ok(status) => {
                println!();
                println!("Helper:");
                println!("  Version:  {}", status.version);
                println!("  Protocol: {}", status.protocol_version);
                println!("  Driver:   {}", status.driver);
                println!("  SMC open: {}", if status.connected { "yes" } else { "no" });
            }
            Err(e) => println!("Helper:     unavailable ({})", e),
        }
    } else if service.permission_state() == PermissionState::Restricted {
        println!();
        println!("The SMC service is not reachable on this machine.");
    }

    println!();
    println!("Fans:  {}", service.fan_count().await?);
    Ok(())
}

fn print_temperatures(temps: &[TemperatureReading]) {
    println!("{:<6} {:<20} {:>9}", "KEY", "SENSOR", "CELSIUS");
    for t in temps {
        println!("{:<6} {:<20} {:>9.2}{}", t.key, t.name, t.celsius, marker(t.simulated));
    }
}

fn print_fans(fans: &[FanReading]) {
    println!("{:<4} {:>8} {:>8} {:>8}", "FAN", "MIN", "MAX", "RPM");
    for f in fans {
        println!(
            "{:<4} {:>8.0} {:>8.0} {:>8.0}{}",
            f.index,
            f.info.min,
            f.info.max,
            f.info.current,
            marker(f.simulated)
        );
    }
}

async fn cmd_temps(service: &SmcService, args: &OutputArgs) -> anyhow::Result<()> {
    let temps = service.all_temperatures().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&temps)?);
    } else if temps.is_empty() {
        println!("No temperature sensors found");
    } else {
        print_temperatures(&temps);
    }
    Ok(())
}

async fn cmd_fans(service: &SmcService, args: &OutputArgs) -> anyhow::Result<()> {
    let fans = service.all_fans().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&fans)?);
    } else if fans.is_empty() {
        println!("No fans found");
    } else {
        print_fans(&fans);
    }
    Ok(())
}

async fn cmd_read(service: &SmcService, key: &str) -> anyhow::Result<()> {
    let value = service
        .read_temperature(key)
        .await
        .with_context(|| format!("reading {}", key))?;
    let simulated = service.backend_kind() == BackendKind::Simulated;
    println!("{} = {:.2} °C{}", key, value, marker(simulated));
    Ok(())
}

async fn cmd_fan(service: &SmcService, sub: &FanCommands) -> anyhow::Result<()> {
    match sub {
        FanCommands::Set { index, rpm } => {
            service
                .set_fan_speed(*index, *rpm)
                .await
                .with_context(|| format!("setting fan {} to {} RPM", index, rpm))?;
            println!("Fan {} forced to {:.0} RPM", index, rpm);
        }
        FanCommands::Auto { index } => {
            service
                .set_fan_auto_mode(*index)
                .await
                .with_context(|| format!("returning fan {} to automatic mode", index))?;
            println!("Fan {} returned to automatic mode", index);
        }
    }
    Ok(())
}

async fn cmd_watch(service: &SmcService, interval: Duration, count: Option<u64>) -> anyhow::Result<()> {
    let (monitor, mut rx) = Monitor::spawn(service.clone(), interval);

    loop {
        tokio::select! {
            sample = rx.recv() => {
                let Some(sample) = sample else { break };
                println!("--- sample {} ---", sample.sequence);
                print_temperatures(&sample.temperatures);
                print_fans(&sample.fans);
                if count.is_some_and(|n| sample.sequence >= n) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.stop().await;
    Ok(())
}

async fn cmd_stats(service: &SmcService) -> anyhow::Result<()> {
    // two passes so the second one exercises the caches
    for _ in 0..2 {
        service.all_temperatures().await?;
        service.all_fans().await?;
    }
    let report = service.cleanup();

    let snapshot = service.performance();
    println!("Accesses:       {} ({} successful)", snapshot.total_accesses, snapshot.successful_accesses);
    println!("Cache hit rate: {:.0}%", snapshot.cache_hit_rate * 100.0);
    println!("Cache entries:  {}", snapshot.cache_entries);
    println!("Avg latency:    {} µs", snapshot.average_latency.as_micros());
    if let Some(pool) = snapshot.pool {
        println!(
            "Pool:           {}/{} busy, {} idle, {} opened",
            pool.busy, pool.max, pool.idle, pool.opened
        );
    }
    println!("Cleanup:        {} expired entries, {} idle connections", report.cache_evicted, report.pool_closed);

    let suggestions = service.optimization_suggestions();
    if !suggestions.is_empty() {
        println!();
        println!("Suggestions:");
        for s in suggestions {
            println!("  - {}", s);
        }
    }
    Ok(())
}

fn cmd_settings(sub: &SettingsCommands, settings: &SmcSettings) -> anyhow::Result<()> {
    match sub {
        SettingsCommands::Show => println!("{}", serde_json::to_string_pretty(settings)?),
        SettingsCommands::Path => match sf_core::constants::paths::settings_path() {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no configuration directory on this system"),
        },
    }
    Ok(())
}
