use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use uuid::Uuid;

use focus_lock_agent::{
    enforcer::Enforcer,
    ghost,
    protection::{self, CriticalGuard},
    session::SessionControl,
    time_oracle,
};
use focus_lock_common::Schedule;
use focus_lock_platform::OsPlatform;
use focus_lock_store::Store;

#[derive(Parser)]
#[command(name = "focus-lock")]
#[command(about = "Tamper-resistant focus enforcement", long_about = None)]
struct Cli {
    /// Run as the headless enforcement agent
    #[arg(long)]
    enforce: bool,

    /// Arm a short diagnostic session and exit
    #[arg(long)]
    test_spawn: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Arm a focus session for the given number of minutes
    Start { minutes: u64 },

    /// End the current focus session
    Stop,

    /// Spend one emergency unlock (pauses enforcement for 60 s)
    Unlock,

    /// Show session state and counters
    Status,

    /// Edit the blocked application list
    Apps {
        #[command(subcommand)]
        action: ListAction,
    },

    /// Edit the blocked website list
    Sites {
        #[command(subcommand)]
        action: ListAction,
    },

    /// Manage weekly schedules
    Schedules {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Toggle blocking of common VPN clients
    Vpn {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}

#[derive(Subcommand)]
enum ListAction {
    Add { name: String },
    Remove { name: String },
    List,
}

#[derive(Subcommand)]
enum ScheduleAction {
    List,

    /// Add a weekly window, e.g. add evenings --days Mon,Tue --start 19:00 --end 22:00
    Add {
        name: String,
        #[arg(long, value_delimiter = ',')]
        days: Vec<String>,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },

    Enable { id: Uuid },

    Disable { id: Uuid },

    Remove { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let platform = focus_lock_platform::native();

    if cli.enforce {
        return run_agent(platform).await;
    }

    init_tracing(None)?;
    let store = Arc::new(Store::new(platform.clone()).context("failed to open config store")?);
    let control = SessionControl::new(store.clone(), platform);

    if cli.test_spawn {
        control.start_focus(Duration::from_secs(60))?;
        println!("Armed a 60 s diagnostic session; the agent should now be running.");
        return Ok(());
    }

    match cli.command {
        Some(command) => run_command(&control, command),
        None => {
            // The desktop shell ships separately; headless builds land here.
            control.startup_sanity()?;
            print_status(&control)?;
            println!("\nRun `focus-lock --help` for the available commands.");
            Ok(())
        }
    }
}

/// Headless agent mode: single instance, self-protection, then the loop.
async fn run_agent(platform: Arc<dyn OsPlatform>) -> Result<()> {
    let log_dir = platform.config_root().join("FocusLock");
    std::fs::create_dir_all(&log_dir)?;
    init_tracing(Some(&log_dir))?;

    let acquired = platform
        .acquire_instance_lock(ghost::AGENT_MUTEX)
        .context("failed to create instance mutex")?;
    if !acquired {
        // The running agent will pick up any config change on its own.
        info!("another agent instance is active, exiting");
        return Ok(());
    }
    info!("agent started, pid {}", std::process::id());

    let store = Arc::new(Store::new(platform.clone()).context("failed to open config store")?);

    protection::enable_protections(&platform, &log_dir);
    let mut critical = CriticalGuard::engage(platform.clone(), &log_dir);

    let clock = time_oracle::arm(&store);
    let result = Enforcer::new(store, platform).run(clock).await;

    critical.disarm();
    if let Err(err) = &result {
        error!("enforcement loop failed: {err}");
    }
    result.map_err(Into::into)
}

fn run_command(control: &SessionControl, command: Commands) -> Result<()> {
    match command {
        Commands::Start { minutes } => {
            control.start_focus(Duration::from_secs(minutes * 60))?;
            println!("Focus session armed for {minutes} minute(s).");
        }
        Commands::Stop => {
            control.stop_focus()?;
            println!("Focus session stopped.");
        }
        Commands::Unlock => {
            let until = control.emergency_unlock()?;
            println!("Enforcement paused until {until}.");
        }
        Commands::Status => print_status(control)?,
        Commands::Apps { action } => match action {
            ListAction::Add { name } => control.add_app(&name)?,
            ListAction::Remove { name } => control.remove_app(&name)?,
            ListAction::List => {
                for app in control.status()?.blocked_apps {
                    println!("{app}");
                }
            }
        },
        Commands::Sites { action } => match action {
            ListAction::Add { name } => control.add_site(&name)?,
            ListAction::Remove { name } => control.remove_site(&name)?,
            ListAction::List => {
                for site in control.status()?.blocked_sites {
                    println!("{site}");
                }
            }
        },
        Commands::Schedules { action } => run_schedule_command(control, action)?,
        Commands::Vpn { state } => {
            control.set_block_common_vpn(state == "on")?;
            println!("Common VPN blocking: {state}.");
        }
    }
    Ok(())
}

fn run_schedule_command(control: &SessionControl, action: ScheduleAction) -> Result<()> {
    let mut schedules = control.status()?.schedules;
    match action {
        ScheduleAction::List => {
            for schedule in &schedules {
                println!(
                    "{} {} [{}] {}-{} {}",
                    schedule.id,
                    schedule.name,
                    schedule.days.join(","),
                    schedule.start_time,
                    schedule.end_time,
                    if schedule.enabled { "enabled" } else { "disabled" }
                );
            }
            return Ok(());
        }
        ScheduleAction::Add {
            name,
            days,
            start,
            end,
        } => {
            let mut schedule = Schedule::new(name);
            schedule.days = days;
            schedule.start_time = start;
            schedule.end_time = end;
            schedule.enabled = true;
            println!("Added schedule {}.", schedule.id);
            schedules.push(schedule);
        }
        ScheduleAction::Enable { id } => set_enabled(&mut schedules, id, true)?,
        ScheduleAction::Disable { id } => set_enabled(&mut schedules, id, false)?,
        ScheduleAction::Remove { id } => schedules.retain(|s| s.id != id),
    }
    control.save_schedules(schedules)?;
    Ok(())
}

fn set_enabled(schedules: &mut [Schedule], id: Uuid, enabled: bool) -> Result<()> {
    let schedule = schedules
        .iter_mut()
        .find(|s| s.id == id)
        .with_context(|| format!("no schedule with id {id}"))?;
    schedule.enabled = enabled;
    Ok(())
}

fn print_status(control: &SessionControl) -> Result<()> {
    let config = control.status()?;
    let now = chrono::Utc::now();

    if config.manual_active(now) {
        println!(
            "Session active until {} ({:?} budget left).",
            config.lock_end_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
            config.remaining_duration
        );
    } else {
        println!("No manual session active.");
    }
    if config.paused(now) {
        println!(
            "Enforcement paused until {}.",
            config.paused_until.map(|t| t.to_rfc3339()).unwrap_or_default()
        );
    }
    println!(
        "Blocked: {} app(s), {} site(s); VPN blocking {}.",
        config.blocked_apps.len(),
        config.blocked_sites.len(),
        if config.block_common_vpn { "on" } else { "off" }
    );
    println!(
        "Schedules: {} ({} enabled). Emergency unlocks used: {}/2.",
        config.schedules.len(),
        config.schedules.iter().filter(|s| s.enabled).count(),
        config.emergency_unlocks_used
    );
    if !config.stats.kill_counts.is_empty() {
        println!("Kill counts:");
        for (app, count) in &config.stats.kill_counts {
            println!("  {app}: {count}");
        }
    }
    Ok(())
}

/// Console logging for interactive use; append-only `debug.log` in agent
/// mode, where no console exists.
fn init_tracing(log_dir: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match log_dir {
        Some(dir) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("debug.log"))
                .context("failed to open debug.log")?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}
