use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;

use crate::commands::{self, CommandResult};
use crate::device::{AppSettings, DeviceManager};
use crate::egm::SignalMonitor;
use crate::params::{DisplayParameters, PacingMode};
use crate::serial::ProtocolVariant;

/// Program, interrogate and monitor the pacemaker over its serial link.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Serial port; defaults to the settings file, then the J-Link probe
    #[arg(short, long, global = true)]
    pub port: Option<String>,
    #[arg(long, global = true)]
    pub baud: Option<u32>,
    /// Connect and read timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,
    /// Wire protocol revision: optimistic or acknowledged
    #[arg(long, global = true)]
    pub variant: Option<ProtocolVariant>,
    /// JSON settings file
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,
    /// JSON profile store
    #[arg(long, global = true, default_value = "profiles.json")]
    pub profiles: PathBuf,
    /// Talk to an in-memory pacemaker instead of a serial port
    #[arg(long, global = true)]
    pub simulate: bool,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[arg(short, long, global = true)]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List serial ports
    Ports,
    /// Read back the programmed parameters
    Interrogate {
        /// Convert to clinical units
        #[arg(long)]
        display: bool,
    },
    /// Program parameters from a JSON file of wire field names
    Program {
        #[arg(short, long)]
        mode: PacingMode,
        #[arg(long)]
        params: PathBuf,
        /// Read back and compare after programming
        #[arg(long)]
        verify: bool,
    },
    /// Program, read back and compare
    EchoTest {
        #[arg(short, long)]
        mode: PacingMode,
        #[arg(long)]
        params: PathBuf,
    },
    /// Read electrogram frames
    Signals {
        #[arg(short = 'n', long, default_value_t = 1)]
        frames: usize,
    },
    /// Poll electrograms for a while and print the rolling buffer
    Monitor {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Print the effective settings (file plus flags)
    Settings {
        /// Also write them to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Manage stored parameter profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
    List,
    Show {
        name: String,
    },
    /// Create a profile from clinical-unit parameters (defaults when omitted)
    Create {
        name: String,
        #[arg(short, long)]
        mode: PacingMode,
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Replace a profile's clinical-unit parameters
    Update {
        name: String,
        #[arg(long)]
        params: PathBuf,
    },
    Delete {
        name: String,
    },
    /// Program a profile and verify it
    Apply {
        name: String,
    },
}

impl Cli {
    /// Settings file (or defaults) with command line overrides applied
    pub fn settings(&self) -> Result<AppSettings> {
        let mut settings = match &self.settings {
            Some(path) => AppSettings::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => AppSettings::default(),
        };
        if let Some(port) = &self.port {
            settings.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            settings.baud_rate = baud;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.connect_timeout_ms = timeout_ms;
            settings.read_timeout_ms = timeout_ms;
        }
        if let Some(variant) = self.variant {
            settings.variant = variant;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn log_level(&self, settings: &AppSettings) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Error;
        }
        let base = settings.log_level.parse().unwrap_or(log::LevelFilter::Info);
        match self.verbose {
            0 => base,
            1 => base.max(log::LevelFilter::Debug),
            _ => log::LevelFilter::Trace,
        }
    }
}

/// `RUST_LOG` still wins over the computed level
pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the result and turn failure into an error exit
fn report<T: Serialize>(result: CommandResult<T>) -> Result<()> {
    print_json(&result)?;
    if !result.success {
        bail!(result.message);
    }
    Ok(())
}

fn read_fields(path: &Path) -> Result<BTreeMap<String, serde_json::Value>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("{} is not a JSON object of fields", path.display()))
}

fn read_display_parameters(path: &Path) -> Result<DisplayParameters> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Invalid profile parameters in {}", path.display()))
}

async fn profile_id(manager: &DeviceManager, name: &str) -> Result<String> {
    match manager.get_profile_manager().await.get_profile_by_name(name) {
        Some(profile) => Ok(profile.id.clone()),
        None => bail!("Profile not found: {}", name),
    }
}

async fn connect(cli: &Cli, manager: &DeviceManager, settings: &AppSettings) -> Result<()> {
    let result = if cli.simulate {
        commands::connect_simulator(manager, settings).await
    } else {
        commands::connect_device(manager, cli.port.as_deref(), settings).await
    };
    if !result.success {
        bail!(result.message);
    }
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings()?;
    init_logging(cli.log_level(&settings));

    let manager = Arc::new(DeviceManager::new());

    match &cli.command {
        Command::Ports => return report(commands::list_ports()),
        Command::Settings { save } => {
            if let Some(path) = save {
                settings
                    .save(path)
                    .with_context(|| format!("Failed to save settings to {}", path.display()))?;
                log::info!("Settings written to {}", path.display());
            }
            return print_json(&settings);
        }
        Command::Profiles { action } => return run_profiles(&cli, &manager, action).await,
        _ => {}
    }

    connect(&cli, &manager, &settings).await?;
    let outcome = run_device_command(&cli, &manager, &settings).await;
    manager.disconnect().await?;
    outcome
}

async fn run_device_command(cli: &Cli, manager: &Arc<DeviceManager>, settings: &AppSettings) -> Result<()> {
    match &cli.command {
        Command::Interrogate { display: true } => report(commands::interrogate_display(manager).await),
        Command::Interrogate { display: false } => report(commands::interrogate_device(manager).await),
        Command::Program { mode, params, verify } => {
            let fields = read_fields(params)?;
            if *verify {
                report(commands::echo_test(manager, mode.symbol(), &fields).await)
            } else {
                report(commands::program_parameters(manager, mode.symbol(), &fields).await)
            }
        }
        Command::EchoTest { mode, params } => {
            let fields = read_fields(params)?;
            report(commands::echo_test(manager, mode.symbol(), &fields).await)
        }
        Command::Signals { frames } => {
            let mut collected = Vec::with_capacity(*frames);
            for _ in 0..*frames {
                let result = commands::get_signals(manager).await;
                match result.data {
                    Some(frame) => collected.push(frame),
                    None => bail!(result.message),
                }
            }
            print_json(&collected)
        }
        Command::Monitor { seconds } => {
            let monitor = SignalMonitor::start(manager.clone(), settings.poll_interval(), settings.signal_buffer_len);
            tokio::time::sleep(Duration::from_secs(*seconds)).await;
            print_json(&monitor.stop().await)
        }
        Command::Ports | Command::Settings { .. } | Command::Profiles { .. } => Ok(()),
    }
}

async fn run_profiles(cli: &Cli, manager: &Arc<DeviceManager>, action: &ProfileAction) -> Result<()> {
    manager.load_profiles(&cli.profiles).await?;

    match action {
        ProfileAction::List => report(commands::get_profiles(manager).await),
        ProfileAction::Show { name } => report(commands::get_profile(manager, name).await),
        ProfileAction::Create { name, mode, params } => {
            let parameters = match params {
                Some(path) => read_display_parameters(path)?,
                None => DisplayParameters::default(),
            };
            let result = commands::create_profile(manager, name, *mode, parameters).await;
            if result.success {
                manager.save_profiles(&cli.profiles).await?;
            }
            report(result)
        }
        ProfileAction::Update { name, params } => {
            let id = profile_id(manager, name).await?;
            let parameters = read_display_parameters(params)?;
            let result = commands::update_profile(manager, &id, parameters).await;
            if result.success {
                manager.save_profiles(&cli.profiles).await?;
            }
            report(result)
        }
        ProfileAction::Delete { name } => {
            let id = profile_id(manager, name).await?;
            let result = commands::delete_profile(manager, &id).await;
            manager.save_profiles(&cli.profiles).await?;
            report(result)
        }
        ProfileAction::Apply { name } => {
            let settings = cli.settings()?;
            connect(cli, manager, &settings).await?;
            let outcome = report(commands::apply_profile(manager, name).await);
            manager.disconnect().await?;
            outcome
        }
    }
}
