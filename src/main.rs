use std::path::Path;
use std::process::ExitCode;

use backup_cron_lib::backends::{BackendsConfig, LocalBackupService};
use backup_cron_lib::cli::{Action, AddArgs, Cli, RunArgs};
use backup_cron_lib::runner::Runner;
use backup_cron_lib::schedule::ScheduleStatus;
use backup_cron_lib::store::{JsonStore, NewSchedule};
use backup_cron_lib::util::lock::PidLock;

use chrono::{DateTime, Utc};
use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let dry_run = cli.dry_run;
    if dry_run {
        log::warn!("Running in dry-run mode");
    }

    let store = JsonStore::new(cli.store);

    match cli.action.unwrap_or_default() {
        Action::Run(args) => run(&cli.config, &cli.lock_file, store, args, dry_run),
        Action::List => list(&store),
        Action::Add(args) => add(&store, args),
        Action::Pause { id } => set_status(&store, id, ScheduleStatus::Paused),
        Action::Resume { id } => set_status(&store, id, ScheduleStatus::Active),
        Action::Remove { id } => match store.remove(id) {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("Removing schedule {id} failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn load_config(path: &Path) -> Option<BackendsConfig> {
    match std::fs::read(path) {
        Ok(config_str) => match toml::from_slice(&config_str) {
            Err(e) => {
                log::error!("Reading the config file failed: {e}");
                None
            }
            Ok(cfg) => Some(cfg),
        },
        Err(e) => {
            if std::fs::exists(path).is_ok_and(|b| !b) {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = BackendsConfig::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(config_str) => {
                        if let Err(e) = std::fs::write(path, config_str) {
                            log::warn!("Writing default config to {} failed {e}", path.display());
                        }
                    }
                    Err(e) => log::warn!("Serializing the default config failed: {e}"),
                }

                Some(default_config)
            } else {
                log::error!("Reading the config file failed: {e}");
                None
            }
        }
    }
}

fn run(
    config: &Path,
    lock_file: &Path,
    store: JsonStore,
    RunArgs { now, json }: RunArgs,
    dry_run: bool,
) -> ExitCode {
    let Some(backends_config) = load_config(config) else {
        return ExitCode::FAILURE;
    };

    let _lock = match PidLock::acquire(lock_file) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            log::warn!(target: "lock", "Another run is in progress, skipping this one");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            log::error!(target: "lock", "{e}");
            return ExitCode::FAILURE;
        }
    };

    let service = LocalBackupService::with_config(backends_config, dry_run);
    let runner = Runner::new(store, service).dry_run(dry_run);
    let now: DateTime<Utc> = now.unwrap_or_else(Utc::now);

    let report = match runner.run_once(now) {
        Ok(report) => report,
        Err(e) => {
            log::error!(target: "runner", "Run aborted: {e}");
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(report) => println!("{report}"),
            Err(e) => log::error!("Serializing the run report failed: {e}"),
        }
    } else {
        print!("{report}");
    }

    if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn list(store: &JsonStore) -> ExitCode {
    let schedules = match store.all() {
        Ok(schedules) => schedules,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let fmt_time = |t: Option<DateTime<Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into())
    };
    for s in schedules {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\tlast: {}\tnext: {}",
            s.id,
            s.status,
            s.interval,
            s.time_of_day.as_deref().unwrap_or("-"),
            s.backup_type,
            s.disk,
            fmt_time(s.last_run_at),
            fmt_time(s.next_run_at),
        );
    }

    ExitCode::SUCCESS
}

fn add(store: &JsonStore, args: AddArgs) -> ExitCode {
    if args.backup_type.includes_files() && args.paths.is_empty() {
        log::error!("A {} backup needs at least one --path", args.backup_type);
        return ExitCode::FAILURE;
    }

    let new = NewSchedule {
        interval: args.interval,
        time_of_day: args.time,
        backup_type: args.backup_type,
        paths: args.paths,
        disk: args.disk,
    };
    match store.create(new) {
        Ok(schedule) => {
            println!("{}", schedule.id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Creating the schedule failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn set_status(store: &JsonStore, id: u64, status: ScheduleStatus) -> ExitCode {
    match store.set_status(id, status) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Updating schedule {id} failed: {e}");
            ExitCode::FAILURE
        }
    }
}
