use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::schedule::{BackupType, Interval};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Backend configuration. A default one is written if it doesn't exist.
    #[arg(
        long,
        short = 'c',
        env = "BACKUP_CRON_CONFIG",
        default_value = "/etc/backup_cron.toml"
    )]
    pub config: PathBuf,

    /// File the backup schedules are stored in.
    #[arg(
        long,
        short = 's',
        env = "BACKUP_CRON_STORE",
        default_value = "/var/lib/backup_cron/schedules.json"
    )]
    pub store: PathBuf,

    /// Lock file preventing overlapping runs.
    #[arg(long, default_value = "/run/backup_cron.lock")]
    pub lock_file: PathBuf,

    /// Simulative backup run. Nothing is written to disks or the store.
    #[arg(long)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Run all due backups once. (Default)
    ///
    /// Meant to be invoked by cron or a systemd timer, e.g. every minute.
    Run(RunArgs),
    /// List all schedules.
    List,
    /// Create a new schedule. It is due right away.
    Add(AddArgs),
    /// Pause a schedule.
    Pause {
        /// Id of the schedule.
        id: u64,
    },
    /// Resume a paused schedule.
    Resume {
        /// Id of the schedule.
        id: u64,
    },
    /// Remove a schedule.
    Remove {
        /// Id of the schedule.
        id: u64,
    },
}

impl Default for Action {
    fn default() -> Self {
        Self::Run(RunArgs::default())
    }
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Reference instant of the run (RFC 3339). Defaults to the current time.
    #[arg(long)]
    pub now: Option<DateTime<Utc>>,

    /// Print the run report as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// How often to back up: hourly, daily, weekly or monthly.
    #[arg(long, short = 'i')]
    pub interval: Interval,

    /// Time of day to back up at (HH:MM, UTC). Ignored for hourly backups.
    #[arg(long, short = 't')]
    pub time: Option<String>,

    /// What to back up.
    #[arg(long = "type", value_enum, default_value = "files")]
    pub backup_type: BackupType,

    /// Disk to write the backup to.
    #[arg(long, short = 'd', default_value = "local")]
    pub disk: String,

    /// Path to include in files backups. May be given multiple times.
    #[arg(long = "path", short = 'p')]
    pub paths: Vec<PathBuf>,
}
