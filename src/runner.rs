//! A single pass over all active schedules.
//!
//! [Runner::run_once] is meant to be invoked by an external trigger (cron, a
//! systemd timer) on a fixed cadence. It contains no timer of its own and
//! processes schedules sequentially.
//!
//! Two overlapping passes may both see a schedule as due. The write-back is a
//! compare-and-swap on the `next_run_at` the pass observed, so only one of
//! them advances the schedule, but both will already have dispatched the
//! backup. Callers serialize passes with [PidLock](crate::util::lock::PidLock).
//!
//! A schedule paused or removed while its backup runs keeps that state: the
//! write-back only touches the run times of a record that is still active.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::backends::{BackupRequest, BackupService};
use crate::schedule::{compute_next_run_at, is_due, BackupSchedule};
use crate::store::{ScheduleStore, StoreError};

/// What happened to one schedule during a pass.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ScheduleOutcome {
    pub schedule_id: u64,
    pub due_checked: bool,
    pub dispatched: bool,
    /// [None] if nothing was dispatched.
    pub succeeded: Option<bool>,
    pub message: Option<String>,
}

impl ScheduleOutcome {
    fn not_due(schedule_id: u64) -> Self {
        Self {
            schedule_id,
            due_checked: true,
            dispatched: false,
            succeeded: None,
            message: None,
        }
    }
}

impl fmt::Display for ScheduleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (self.dispatched, self.succeeded) {
            (false, _) if self.message.is_some() => "not dispatched",
            (false, _) => "not due",
            (true, Some(true)) => "succeeded",
            (true, _) => "failed",
        };
        write!(f, "schedule {}: {state}", self.schedule_id)?;
        if let Some(message) = &self.message {
            write!(f, " ({message})")?;
        }
        Ok(())
    }
}

/// Outcomes of one pass, in the order the schedules were processed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunReport {
    pub now: DateTime<Utc>,
    pub outcomes: Vec<ScheduleOutcome>,
}

impl RunReport {
    pub fn dispatched(&self) -> impl Iterator<Item = &ScheduleOutcome> {
        self.outcomes.iter().filter(|o| o.dispatched)
    }

    /// Outcomes of backups that were dispatched and failed.
    pub fn failed(&self) -> impl Iterator<Item = &ScheduleOutcome> {
        self.dispatched().filter(|o| o.succeeded != Some(true))
    }

    /// Outcomes of due schedules whose backup couldn't be started.
    pub fn not_dispatched(&self) -> impl Iterator<Item = &ScheduleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.dispatched && o.message.is_some())
    }

    /// Whether any due schedule failed or couldn't be started.
    pub fn has_failures(&self) -> bool {
        self.failed().chain(self.not_dispatched()).next().is_some()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            writeln!(f, "{outcome}")?;
        }
        Ok(())
    }
}

/// Checks active schedules and dispatches the due ones.
pub struct Runner<S, B> {
    store: S,
    service: B,
    dry_run: bool,
}

impl<S: ScheduleStore, B: BackupService> Runner<S, B> {
    pub fn new(store: S, service: B) -> Self {
        Self {
            store,
            service,
            dry_run: false,
        }
    }

    /// On a dry run schedules are dispatched but never written back.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Processes every active schedule once at the reference instant `now`.
    ///
    /// Reading the schedules or writing one back fails the whole pass.
    /// Schedules written back before the failure keep their update.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport, StoreError> {
        let schedules = self.store.list_active_schedules()?;
        log::debug!(target: "runner", "Checking {} active schedule(s) at {now}", schedules.len());

        let mut outcomes = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            outcomes.push(self.process(schedule, now)?);
        }

        Ok(RunReport { now, outcomes })
    }

    fn process(
        &self,
        mut schedule: BackupSchedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, StoreError> {
        let id = schedule.id;
        if !is_due(&schedule, now) {
            log::trace!(target: "runner", "Schedule {id} is not due before {:?}", schedule.next_run_at);
            return Ok(ScheduleOutcome::not_due(id));
        }

        let request = BackupRequest {
            backup_type: schedule.backup_type,
            paths: schedule.paths.clone(),
            disk: schedule.disk.clone(),
        };
        log::info!(target: "runner", "Dispatching {} backup of schedule {id} to disk '{}'", request.backup_type, request.disk);

        let result = match self.service.create_backup(&request) {
            Ok(result) => result,
            Err(e) => {
                log::error!(target: "runner", "Backup of schedule {id} couldn't be started: {e}");
                return Ok(ScheduleOutcome {
                    schedule_id: id,
                    due_checked: true,
                    dispatched: false,
                    succeeded: None,
                    message: Some(e.to_string()),
                });
            }
        };

        if result.succeeded {
            log::info!(target: "runner", "Backup of schedule {id} succeeded: {}", result.message);
        } else {
            log::error!(target: "runner", "Backup of schedule {id} failed: {}", result.message);
        }

        let expected_next_run_at = schedule.next_run_at;
        schedule.last_run_at = Some(now);
        schedule.next_run_at = Some(compute_next_run_at(&schedule, now));

        let mut message = result.message;
        if self.dry_run {
            log::debug!(target: "runner", "Dry-run: not advancing schedule {id} to {:?}", schedule.next_run_at);
        } else {
            match self.store.record_run(&schedule, expected_next_run_at) {
                Ok(()) => {
                    log::debug!(target: "runner", "Schedule {id} runs next at {:?}", schedule.next_run_at);
                }
                Err(StoreError::Conflict(_)) => {
                    log::warn!(target: "runner", "Schedule {id} was paused or advanced by another pass, keeping its update");
                    message.push_str("; schedule was paused or advanced by another pass");
                }
                Err(StoreError::NotFound(_)) => {
                    log::warn!(target: "runner", "Schedule {id} was removed while its backup ran");
                    message.push_str("; schedule was removed");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ScheduleOutcome {
            schedule_id: id,
            due_checked: true,
            dispatched: true,
            succeeded: Some(result.succeeded),
            message: Some(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io;
    use std::path::PathBuf;

    use chrono::TimeZone;

    use super::*;
    use crate::backends::{BackupResult, DispatchError};
    use crate::schedule::{BackupType, Interval, ScheduleStatus};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn schedule(id: u64, next_run_at: Option<DateTime<Utc>>) -> BackupSchedule {
        BackupSchedule {
            id,
            interval: Interval::Daily,
            time_of_day: Some("02:00".into()),
            backup_type: BackupType::Both,
            paths: vec![PathBuf::from("/srv/app/storage")],
            disk: "local".into(),
            status: ScheduleStatus::Active,
            last_run_at: None,
            next_run_at,
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        schedules: RefCell<Vec<BackupSchedule>>,
        fail_save_of: Option<u64>,
    }

    impl MemoryStore {
        fn with(schedules: Vec<BackupSchedule>) -> Self {
            Self {
                schedules: RefCell::new(schedules),
                fail_save_of: None,
            }
        }

        fn get(&self, id: u64) -> BackupSchedule {
            self.schedules
                .borrow()
                .iter()
                .find(|s| s.id == id)
                .cloned()
                .unwrap()
        }
    }

    impl ScheduleStore for MemoryStore {
        fn list_active_schedules(&self) -> Result<Vec<BackupSchedule>, StoreError> {
            Ok(self
                .schedules
                .borrow()
                .iter()
                .filter(|s| s.is_active())
                .cloned()
                .collect())
        }

        fn record_run(
            &self,
            schedule: &BackupSchedule,
            expected_next_run_at: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            if self.fail_save_of == Some(schedule.id) {
                return Err(StoreError::Io {
                    path: "memory".into(),
                    source: io::Error::other("write failed"),
                });
            }

            let mut schedules = self.schedules.borrow_mut();
            let stored = schedules
                .iter_mut()
                .find(|s| s.id == schedule.id)
                .ok_or(StoreError::NotFound(schedule.id))?;
            if !stored.is_active() || stored.next_run_at != expected_next_run_at {
                return Err(StoreError::Conflict(schedule.id));
            }
            stored.last_run_at = schedule.last_run_at;
            stored.next_run_at = schedule.next_run_at;
            Ok(())
        }
    }

    /// Answers every request with the same result and records the requests.
    struct FixedService {
        result: fn() -> Result<BackupResult, DispatchError>,
        requests: RefCell<Vec<BackupRequest>>,
    }

    impl FixedService {
        fn new(result: fn() -> Result<BackupResult, DispatchError>) -> Self {
            Self {
                result,
                requests: RefCell::default(),
            }
        }

        fn succeeding() -> Self {
            Self::new(|| Ok(BackupResult::success("done")))
        }
    }

    impl BackupService for FixedService {
        fn create_backup(&self, request: &BackupRequest) -> Result<BackupResult, DispatchError> {
            self.requests.borrow_mut().push(request.clone());
            (self.result)()
        }
    }

    #[test]
    fn dispatches_never_run_schedule() {
        let service = FixedService::succeeding();
        let runner = Runner::new(MemoryStore::with(vec![schedule(1, None)]), &service);

        let report = runner.run_once(at(2024, 6, 1, 10, 0)).unwrap();

        assert_eq!(
            report.outcomes,
            vec![ScheduleOutcome {
                schedule_id: 1,
                due_checked: true,
                dispatched: true,
                succeeded: Some(true),
                message: Some("done".into()),
            }]
        );
        assert_eq!(
            service.requests.borrow().as_slice(),
            &[BackupRequest {
                backup_type: BackupType::Both,
                paths: vec![PathBuf::from("/srv/app/storage")],
                disk: "local".into(),
            }]
        );

        let stored = runner.store().get(1);
        assert_eq!(stored.last_run_at, Some(at(2024, 6, 1, 10, 0)));
        assert_eq!(stored.next_run_at, Some(at(2024, 6, 2, 2, 0)));
    }

    #[test]
    fn skips_schedule_that_is_not_due() {
        let service = FixedService::succeeding();
        let before = schedule(1, Some(at(2024, 6, 2, 2, 0)));
        let runner = Runner::new(MemoryStore::with(vec![before.clone()]), &service);

        let report = runner.run_once(at(2024, 6, 2, 1, 0)).unwrap();

        assert_eq!(report.outcomes, vec![ScheduleOutcome::not_due(1)]);
        assert!(service.requests.borrow().is_empty());
        assert_eq!(runner.store().get(1), before);
    }

    #[test]
    fn failed_backup_still_advances() {
        let service = FixedService::new(|| Ok(BackupResult::failure("disk full")));
        let runner = Runner::new(
            MemoryStore::with(vec![schedule(1, Some(at(2024, 6, 2, 2, 0)))]),
            &service,
        );

        let report = runner.run_once(at(2024, 6, 2, 2, 0)).unwrap();

        let outcome = &report.outcomes[0];
        assert!(outcome.dispatched);
        assert_eq!(outcome.succeeded, Some(false));
        assert_eq!(outcome.message.as_deref(), Some("disk full"));
        assert_eq!(report.failed().count(), 1);
        assert!(report.has_failures());
        assert_eq!(runner.store().get(1).next_run_at, Some(at(2024, 6, 3, 2, 0)));
    }

    #[test]
    fn undispatched_backup_stays_due() {
        let service = FixedService::new(|| Err(DispatchError::UnknownDisk("s3".into())));
        let before = schedule(1, None);
        let runner = Runner::new(MemoryStore::with(vec![before.clone()]), &service);

        let report = runner.run_once(at(2024, 6, 1, 10, 0)).unwrap();

        let outcome = &report.outcomes[0];
        assert!(outcome.due_checked);
        assert!(!outcome.dispatched);
        assert_eq!(outcome.succeeded, None);
        assert!(outcome.message.as_deref().unwrap().contains("s3"));
        assert_eq!(runner.store().get(1), before);
        assert_eq!(report.failed().count(), 0);
        assert_eq!(report.not_dispatched().count(), 1);
        assert!(report.has_failures());
    }

    #[test]
    fn paused_schedules_are_untouched() {
        let service = FixedService::succeeding();
        let mut paused = schedule(2, None);
        paused.status = ScheduleStatus::Paused;
        let runner = Runner::new(
            MemoryStore::with(vec![schedule(1, None), paused.clone()]),
            &service,
        );

        let report = runner.run_once(at(2024, 6, 1, 10, 0)).unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].schedule_id, 1);
        assert_eq!(runner.store().get(2), paused);
    }

    #[test]
    fn processes_schedules_in_store_order() {
        let service = FixedService::succeeding();
        let runner = Runner::new(
            MemoryStore::with(vec![
                schedule(3, None),
                schedule(1, Some(at(2030, 1, 1, 0, 0))),
                schedule(2, None),
            ]),
            &service,
        );

        let report = runner.run_once(at(2024, 6, 1, 10, 0)).unwrap();

        let ids: Vec<_> = report.outcomes.iter().map(|o| o.schedule_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(report.dispatched().count(), 2);
        assert!(!report.has_failures());
    }

    #[test]
    fn store_failure_aborts_pass_but_keeps_earlier_updates() {
        let service = FixedService::succeeding();
        let mut store = MemoryStore::with(vec![schedule(1, None), schedule(2, None), schedule(3, None)]);
        store.fail_save_of = Some(2);
        let runner = Runner::new(store, &service);

        let res = runner.run_once(at(2024, 6, 1, 10, 0));

        assert!(matches!(res, Err(StoreError::Io { .. })));
        assert!(runner.store().get(1).next_run_at.is_some());
        assert!(runner.store().get(2).next_run_at.is_none());
        assert!(runner.store().get(3).next_run_at.is_none());
        assert_eq!(service.requests.borrow().len(), 2);
    }

    #[test]
    fn concurrent_advance_is_not_overwritten() {
        /// Advances the schedule behind the runner's back while the backup runs.
        struct RacingService<'a> {
            store: &'a MemoryStore,
        }

        impl BackupService for RacingService<'_> {
            fn create_backup(&self, _: &BackupRequest) -> Result<BackupResult, DispatchError> {
                let mut schedules = self.store.schedules.borrow_mut();
                schedules[0].next_run_at = Some(at(2099, 1, 1, 0, 0));
                Ok(BackupResult::success("done"))
            }
        }

        let store = MemoryStore::with(vec![schedule(1, None)]);
        let runner = Runner::new(&store, RacingService { store: &store });

        let report = runner.run_once(at(2024, 6, 1, 10, 0)).unwrap();

        assert!(report.outcomes[0].dispatched);
        assert!(report.outcomes[0]
            .message
            .as_deref()
            .unwrap()
            .contains("another pass"));
        assert_eq!(store.get(1).next_run_at, Some(at(2099, 1, 1, 0, 0)));
    }

    /// Changes the store behind the runner's back while the backup runs.
    struct MeddlingService<'a> {
        store: &'a MemoryStore,
        meddle: fn(&mut Vec<BackupSchedule>),
    }

    impl BackupService for MeddlingService<'_> {
        fn create_backup(&self, _: &BackupRequest) -> Result<BackupResult, DispatchError> {
            (self.meddle)(&mut self.store.schedules.borrow_mut());
            Ok(BackupResult::success("done"))
        }
    }

    #[test]
    fn pause_during_backup_is_kept() {
        let store = MemoryStore::with(vec![schedule(1, None)]);
        let service = MeddlingService {
            store: &store,
            meddle: |schedules| schedules[0].status = ScheduleStatus::Paused,
        };

        let report = Runner::new(&store, service)
            .run_once(at(2024, 6, 1, 10, 0))
            .unwrap();

        assert!(report.outcomes[0].dispatched);
        assert!(report.outcomes[0].message.as_deref().unwrap().contains("paused"));
        let stored = store.get(1);
        assert_eq!(stored.status, ScheduleStatus::Paused);
        assert!(stored.next_run_at.is_none());
    }

    #[test]
    fn removal_during_backup_is_kept() {
        let store = MemoryStore::with(vec![schedule(1, None), schedule(2, None)]);
        let service = MeddlingService {
            store: &store,
            meddle: |schedules| schedules.retain(|s| s.id != 1),
        };

        let report = Runner::new(&store, service)
            .run_once(at(2024, 6, 1, 10, 0))
            .unwrap();

        assert!(report.outcomes[0]
            .message
            .as_deref()
            .unwrap()
            .contains("removed"));
        let ids: Vec<_> = store.schedules.borrow().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn dry_run_does_not_write_back() {
        let service = FixedService::succeeding();
        let runner = Runner::new(MemoryStore::with(vec![schedule(1, None)]), &service).dry_run(true);

        let report = runner.run_once(at(2024, 6, 1, 10, 0)).unwrap();

        assert!(report.outcomes[0].dispatched);
        assert!(runner.store().get(1).next_run_at.is_none());
    }

    #[test]
    fn report_renders_one_line_per_schedule() {
        let report = RunReport {
            now: at(2024, 6, 1, 10, 0),
            outcomes: vec![
                ScheduleOutcome::not_due(1),
                ScheduleOutcome {
                    schedule_id: 2,
                    due_checked: true,
                    dispatched: true,
                    succeeded: Some(false),
                    message: Some("disk full".into()),
                },
            ],
        };

        assert_eq!(
            report.to_string(),
            "schedule 1: not due\nschedule 2: failed (disk full)\n"
        );
    }
}
