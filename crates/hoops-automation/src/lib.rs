//! Scheduled extraction + ETL with retries.
//!
//! The scheduler is a poll loop: it runs the job once on start, then checks
//! every poll interval whether the daily fire time has passed. Time comes from
//! a [`Clock`] and the loop stops when its [`Shutdown`] fires, so the whole
//! thing can be driven by a fake clock in tests.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use hoops_core::{AutomationSettings, Settings};
use hoops_etl::{CoreConfig, CorePipeline};
use hoops_storage::write_run_marker;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hoops-automation";

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("invalid schedule time {0:?}; expected HH:MM")]
    InvalidScheduleTime(String),
    #[error("starting extractor process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("extractor exited with {status}: {stderr}")]
    ExtractorFailed { status: String, stderr: String },
    #[error("extractor reported errors: {0}")]
    ExtractorStderr(String),
}

/// Wall-clock time of day the daily job fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTime(NaiveTime);

impl DailyTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    /// First fire time strictly after `now`.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = now.timezone();
        let mut date = now.date_naive();
        loop {
            let candidate = date.and_time(self.0);
            // A fire time inside a DST gap moves to the next valid instant.
            let local = tz
                .from_local_datetime(&candidate)
                .earliest()
                .or_else(|| {
                    tz.from_local_datetime(&(candidate + chrono::Duration::hours(1)))
                        .earliest()
                });
            if let Some(fire) = local {
                if fire > *now {
                    return fire;
                }
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => return now.clone(),
            };
        }
    }
}

impl FromStr for DailyTime {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AutomationError::InvalidScheduleTime(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        DailyTime::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sending half of the stop signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiving half of the stop signal.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal fires. A dropped trigger never fires.
    pub async fn wait(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One full extraction + ETL attempt.
#[async_trait]
pub trait EtlRunner: Send + Sync {
    async fn run_etl(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &AutomationSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
        }
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Run the job until it succeeds or the attempts run out; waits
/// `retry_delay` between failed attempts only.
pub async fn run_with_retry(runner: &dyn EtlRunner, policy: &RetryPolicy, clock: &dyn Clock) -> bool {
    let attempts = policy.attempts();
    info!(attempts, "starting etl with retries");
    for attempt in 1..=attempts {
        info!(attempt, attempts, "etl attempt");
        match runner.run_etl().await {
            Ok(()) => {
                info!(attempt, "etl completed");
                return true;
            }
            Err(err) => error!(attempt, error = %format!("{err:#}"), "etl attempt failed"),
        }
        if attempt < attempts {
            warn!(delay_secs = policy.retry_delay.as_secs(), "retrying after delay");
            clock.sleep(policy.retry_delay).await;
        }
    }
    error!(attempts, "etl failed after all attempts");
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub time: DailyTime,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &AutomationSettings) -> Result<Self, AutomationError> {
        Ok(Self {
            time: settings.schedule_time.parse()?,
            retry: RetryPolicy::from_settings(settings),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            error_backoff: Duration::from_secs(settings.error_backoff_secs),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub runs: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub panicked: u32,
}

pub struct DailyScheduler {
    runner: Arc<dyn EtlRunner>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl DailyScheduler {
    pub fn new(runner: Arc<dyn EtlRunner>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            runner,
            clock,
            config,
        }
    }

    /// Run immediately, then daily at the configured time until `shutdown` fires.
    pub async fn start(&self, mut shutdown: Shutdown) -> SchedulerSummary {
        let mut summary = SchedulerSummary::default();
        let mut next_fire = self.config.time.next_after(&self.clock.now());
        info!(time = %self.config.time, next = %next_fire, "etl scheduled daily");

        let mut due = true;
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let mut pause = self.config.poll_interval;
            let scheduled = self.clock.now() >= next_fire;
            if due || scheduled {
                due = false;
                summary.runs += 1;
                match self.run_job().await {
                    Ok(true) => summary.succeeded += 1,
                    Ok(false) => summary.failed += 1,
                    Err(join_err) => {
                        summary.panicked += 1;
                        error!(
                            error = %join_err,
                            backoff_secs = self.config.error_backoff.as_secs(),
                            "scheduled job crashed; backing off"
                        );
                        pause = self.config.error_backoff;
                    }
                }
                // The startup run leaves today's slot in place.
                if scheduled {
                    next_fire = self.config.time.next_after(&next_fire);
                }
                info!(next = %next_fire, "next scheduled run");
            }

            tokio::select! {
                _ = self.clock.sleep(pause) => {}
                _ = shutdown.wait() => break,
            }
        }
        info!(runs = summary.runs, "etl scheduler stopped");
        summary
    }

    async fn run_job(&self) -> Result<bool, tokio::task::JoinError> {
        let runner = Arc::clone(&self.runner);
        let clock = Arc::clone(&self.clock);
        let policy = self.config.retry;
        tokio::spawn(async move { run_with_retry(runner.as_ref(), &policy, clock.as_ref()).await }).await
    }
}

/// Command line of the extractor subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExtractorCommand {
    /// `<program> [--config <file>] extract --repo <url> --staging <dir>`.
    pub fn hoops(
        program: PathBuf,
        config_file: Option<&std::path::Path>,
        repo_url: &str,
        staging_dir: &std::path::Path,
    ) -> Self {
        let mut args = Vec::new();
        if let Some(config_file) = config_file {
            args.push("--config".to_string());
            args.push(config_file.display().to_string());
        }
        args.extend([
            "extract".to_string(),
            "--repo".to_string(),
            repo_url.to_string(),
            "--staging".to_string(),
            staging_dir.display().to_string(),
        ]);
        Self { program, args }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub repo_url: String,
    pub log_dir: PathBuf,
    pub extractor: ExtractorCommand,
    pub core: CoreConfig,
}

impl AutomationConfig {
    pub fn from_settings(settings: &Settings, extractor: ExtractorCommand) -> Self {
        Self {
            repo_url: settings.source.repo_url.clone(),
            log_dir: settings.paths.log_dir.clone(),
            extractor,
            core: CoreConfig::from_settings(settings, None),
        }
    }
}

/// Extractor subprocess followed by the in-process core pipeline.
#[derive(Debug, Clone)]
pub struct EtlAutomation {
    config: AutomationConfig,
}

impl EtlAutomation {
    pub fn new(config: AutomationConfig) -> Self {
        Self { config }
    }

    /// Fails on a non-zero exit or any stderr output.
    pub async fn run_extraction(&self) -> Result<(), AutomationError> {
        let command = &self.config.extractor;
        info!(command = %command.display(), "running extractor");
        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .await
            .map_err(AutomationError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(AutomationError::ExtractorFailed {
                status: output.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            return Err(AutomationError::ExtractorStderr(stderr));
        }
        info!(stdout_lines = stdout.lines().count(), "extractor finished");
        Ok(())
    }
}

#[async_trait]
impl EtlRunner for EtlAutomation {
    async fn run_etl(&self) -> anyhow::Result<()> {
        self.run_extraction().await?;
        info!("extraction completed; running transform and load");

        CorePipeline::new(self.config.core.clone()).run().await?;

        let now = Local::now();
        let marker = write_run_marker(
            &self.config.log_dir,
            "etl_automation_success",
            now,
            &[
                format!("completed_at: {}", now.format("%Y-%m-%d %H:%M:%S")),
                format!("source: {}", self.config.repo_url),
            ],
        )
        .await?;
        info!(marker = %marker.display(), "automated etl completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn local(h: u32, m: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2025, 6, 1, h, m, 0)
            .single()
            .expect("unambiguous local time")
    }

    struct FakeClock {
        now: Mutex<DateTime<Local>>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        fn at(now: DateTime<Local>) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(now),
                sleeps: Mutex::new(Vec::new()),
            })
        }

        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().expect("sleeps lock").clone()
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Local> {
            *self.now.lock().expect("clock lock")
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().expect("sleeps lock").push(duration);
            {
                let mut now = self.now.lock().expect("clock lock");
                *now += chrono::Duration::from_std(duration).expect("duration");
            }
            tokio::task::yield_now().await;
        }
    }

    struct ScriptedRunner {
        calls: AtomicU32,
        succeed_from: u32,
        panic_on: Option<u32>,
        stop_after: Option<(u32, Mutex<Option<ShutdownTrigger>>)>,
    }

    impl ScriptedRunner {
        fn new(succeed_from: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_from,
                panic_on: None,
                stop_after: None,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EtlRunner for ScriptedRunner {
        async fn run_etl(&self) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, trigger)) = &self.stop_after {
                if call >= *limit {
                    if let Some(trigger) = trigger.lock().expect("trigger lock").as_ref() {
                        trigger.trigger();
                    }
                }
            }
            if self.panic_on == Some(call) {
                panic!("scripted crash on call {call}");
            }
            if call >= self.succeed_from {
                Ok(())
            } else {
                anyhow::bail!("scripted failure on call {call}")
            }
        }
    }

    #[test]
    fn daily_time_parses_hh_mm() {
        assert_eq!("02:00".parse::<DailyTime>().expect("parse"), DailyTime::new(2, 0).expect("time"));
        assert_eq!("7:30".parse::<DailyTime>().expect("parse").to_string(), "07:30");
        for bad in ["24:00", "12:60", "noon", "12", "12:5", ":30", "123:00"] {
            assert!(bad.parse::<DailyTime>().is_err(), "{bad}");
        }
    }

    #[test]
    fn next_fire_is_strictly_after_now() {
        let time = DailyTime::new(2, 0).expect("time");
        assert_eq!(time.next_after(&local(1, 30)), local(2, 0));
        assert_eq!(
            time.next_after(&local(2, 0)),
            local(2, 0) + chrono::Duration::days(1)
        );
        assert_eq!(
            time.next_after(&local(23, 0)),
            local(2, 0) + chrono::Duration::days(1)
        );
    }

    #[tokio::test]
    async fn always_failing_job_runs_exactly_max_retries_times() {
        let runner = ScriptedRunner::new(u32::MAX);
        let clock = FakeClock::at(local(1, 0));
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::ZERO,
        };
        assert!(!run_with_retry(&runner, &policy, clock.as_ref()).await);
        assert_eq!(runner.calls(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::ZERO, Duration::ZERO]);
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let runner = ScriptedRunner::new(2);
        let clock = FakeClock::at(local(1, 0));
        let policy = RetryPolicy::default();
        assert!(run_with_retry(&runner, &policy, clock.as_ref()).await);
        assert_eq!(runner.calls(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(300)]);
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            time: DailyTime::new(2, 0).expect("time"),
            retry: RetryPolicy {
                max_retries: 1,
                retry_delay: Duration::ZERO,
            },
            poll_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn scheduler_runs_immediately_then_at_fire_time() {
        let (trigger, shutdown) = shutdown_channel();
        let runner = Arc::new(ScriptedRunner {
            stop_after: Some((2, Mutex::new(Some(trigger)))),
            ..ScriptedRunner::new(1)
        });
        let clock = FakeClock::at(local(1, 58));
        let scheduler = DailyScheduler::new(runner.clone(), clock.clone(), scheduler_config());

        let summary = scheduler.start(shutdown).await;
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(runner.calls(), 2);
        assert!(clock.now() >= local(2, 0));
        assert_eq!(
            clock.sleeps()[..2],
            [Duration::from_secs(60), Duration::from_secs(60)]
        );
    }

    #[tokio::test]
    async fn slow_startup_run_does_not_swallow_todays_slot() {
        let (trigger, shutdown) = shutdown_channel();
        let runner = Arc::new(ScriptedRunner {
            stop_after: Some((3, Mutex::new(Some(trigger)))),
            ..ScriptedRunner::new(2)
        });
        let clock = FakeClock::at(local(1, 55));
        let config = SchedulerConfig {
            retry: RetryPolicy {
                max_retries: 2,
                retry_delay: Duration::from_secs(600),
            },
            ..scheduler_config()
        };
        let scheduler = DailyScheduler::new(runner.clone(), clock.clone(), config);

        let summary = scheduler.start(shutdown).await;
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(runner.calls(), 3);
        assert!(clock.now() < local(3, 0), "second run waited for tomorrow");
        assert_eq!(clock.sleeps()[..2], [Duration::from_secs(600), Duration::from_secs(60)]);
    }

    #[tokio::test]
    async fn scheduler_contains_panicking_job_and_backs_off() {
        let (trigger, shutdown) = shutdown_channel();
        let runner = Arc::new(ScriptedRunner {
            panic_on: Some(1),
            stop_after: Some((2, Mutex::new(Some(trigger)))),
            ..ScriptedRunner::new(1)
        });
        let clock = FakeClock::at(local(1, 58));
        let scheduler = DailyScheduler::new(runner.clone(), clock.clone(), scheduler_config());

        let summary = scheduler.start(shutdown).await;
        assert_eq!(summary.panicked, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(clock.sleeps()[0], Duration::from_secs(300));
    }

    #[tokio::test]
    async fn scheduler_stops_when_already_triggered() {
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();
        let runner = Arc::new(ScriptedRunner::new(1));
        let clock = FakeClock::at(local(1, 0));
        let summary = DailyScheduler::new(runner.clone(), clock, scheduler_config())
            .start(shutdown)
            .await;
        assert_eq!(summary, SchedulerSummary::default());
        assert_eq!(runner.calls(), 0);
    }

    #[test]
    fn extractor_command_passes_config_through() {
        let command = ExtractorCommand::hoops(
            PathBuf::from("/usr/local/bin/hoops"),
            Some(std::path::Path::new("hoops.yaml")),
            "https://github.com/example/repo",
            std::path::Path::new("data/staging"),
        );
        assert_eq!(
            command.display(),
            "/usr/local/bin/hoops --config hoops.yaml extract --repo https://github.com/example/repo --staging data/staging"
        );
    }

    #[test]
    fn scheduler_config_rejects_bad_time() {
        let settings = AutomationSettings {
            schedule_time: "25:00".to_string(),
            ..AutomationSettings::default()
        };
        assert!(matches!(
            SchedulerConfig::from_settings(&settings),
            Err(AutomationError::InvalidScheduleTime(_))
        ));
    }
}
