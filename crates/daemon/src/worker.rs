// SSH Tunnel Keeper - Worker Module
// Keeps the tunnel process of one site alive: start, watch output, reset, stop

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ssh_keeper_common::{prepare_invocation, requires_reset, Invocation, SiteConfig, SiteLog};

use crate::config::KeeperConfig;
use crate::process::{Launcher, TunnelProcess};

/// Timing contract of the worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTiming {
    /// Idle wait between two polls
    pub tick: Duration,
    /// Wait after a launch before the PID is trusted
    pub settle: Duration,
    /// Wait after a reset before the next launch
    pub cooldown: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            settle: Duration::from_secs(3),
            cooldown: Duration::from_secs(15),
        }
    }
}

/// Settings shared by all workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub ssh_program: String,
    /// Where pinned known_hosts files are written
    pub ssh_dir: PathBuf,
    /// Where `<site>.log` files are written
    pub log_dir: PathBuf,
    pub echo: bool,
    pub timing: WorkerTiming,
}

impl WorkerSettings {
    pub fn from_config(config: &KeeperConfig) -> Self {
        Self {
            ssh_program: config.ssh_program.clone(),
            ssh_dir: config.ssh_dir(),
            log_dir: config.log_path.clone(),
            echo: config.echo,
            timing: WorkerTiming::default(),
        }
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started yet, or stopped for good
    Stopped,
    /// Next tick launches a process
    Starting,
    /// A process is owned and polled every tick
    Running,
    /// The process was asked to terminate; cooling down before the next launch
    Resetting,
}

/// Supervision unit for one site
///
/// Owns at most one tunnel process at a time. The stop token is checked at
/// the top of every tick and wins over everything else.
pub struct Worker {
    site: SiteConfig,
    settings: Arc<WorkerSettings>,
    launcher: Arc<dyn Launcher>,
    log: SiteLog,
    stop: CancellationToken,
    state: WorkerState,
    invocation: Option<Invocation>,
    process: Option<Box<dyn TunnelProcess>>,
    generation: u64,
    reset_pending: bool,
}

impl Worker {
    pub fn new(site: SiteConfig, settings: Arc<WorkerSettings>, launcher: Arc<dyn Launcher>) -> Self {
        let log = SiteLog::new(
            settings.log_dir.join(format!("{}.log", site.name)),
            site.name.clone(),
            settings.echo,
        );

        Self {
            site,
            settings,
            launcher,
            log,
            stop: CancellationToken::new(),
            state: WorkerState::Stopped,
            invocation: None,
            process: None,
            generation: 0,
            reset_pending: false,
        }
    }

    /// Token that stops this worker when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn site_name(&self) -> &str {
        &self.site.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Number of processes launched so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run until the stop token is cancelled
    pub async fn run(&mut self) {
        self.log
            .info(format!("Worker for site '{}' started", self.site.name));
        self.state = WorkerState::Starting;

        while !self.stop.is_cancelled() {
            let wait = self.tick().await;
            tokio::time::sleep(wait).await;
        }

        self.shutdown();
        self.log
            .info(format!("Worker for site '{}' stopped", self.site.name));
    }

    /// One iteration of the loop; returns how long to wait before the next one
    async fn tick(&mut self) -> Duration {
        match self.state {
            WorkerState::Stopped => self.settings.timing.tick,
            WorkerState::Starting => self.start().await,
            WorkerState::Running => self.poll(),
            WorkerState::Resetting => {
                // Cool-down is over
                self.state = WorkerState::Starting;
                self.start().await
            }
        }
    }

    async fn start(&mut self) -> Duration {
        let timing = self.settings.timing;

        let invocation = match &self.invocation {
            Some(invocation) => invocation.clone(),
            None => {
                match prepare_invocation(&self.settings.ssh_program, &self.site, &self.settings.ssh_dir) {
                    Ok(invocation) => {
                        self.log.info(format!("Using command: {}", invocation));
                        self.invocation = Some(invocation.clone());
                        invocation
                    }
                    Err(e) => {
                        self.log.error(format!("Failed to prepare command: {}", e));
                        return timing.tick;
                    }
                }
            }
        };

        self.log.info("Starting subprocess ...");

        let process = match self.launcher.launch(&invocation) {
            Ok(process) => process,
            Err(e) => {
                self.log.error(format!("Failed to start subprocess: {}", e));
                return timing.tick;
            }
        };

        let pid = pid_label(process.id());
        self.process = Some(process);
        self.generation += 1;

        // ssh may fork and let its wrapper exit right after launch
        tokio::time::sleep(timing.settle).await;

        self.state = WorkerState::Running;
        self.log.info(format!(
            "Started subprocess with PID #{} (generation {})",
            pid, self.generation
        ));

        timing.tick
    }

    fn poll(&mut self) -> Duration {
        let timing = self.settings.timing;

        let Some(process) = self.process.as_mut() else {
            self.state = WorkerState::Starting;
            return timing.tick;
        };

        if let Some(line) = process.next_line() {
            self.log.ext_cmd(&line);
            if requires_reset(&line) {
                // Acted on by the first tick that finds no more output
                self.reset_pending = true;
            }
            return Duration::ZERO;
        }

        if self.reset_pending {
            return self.reset();
        }

        let pid = pid_label(process.id());
        match process.try_exit() {
            Ok(Some(exit)) => {
                self.log.warning(format!(
                    "Subprocess with PID #{} died, return code {}",
                    pid, exit
                ));
                self.process = None;
                self.state = WorkerState::Starting;
            }
            Ok(None) => {}
            Err(e) => {
                self.log
                    .error(format!("Failed to check subprocess with PID #{}: {}", pid, e));
            }
        }

        timing.tick
    }

    fn reset(&mut self) -> Duration {
        let cooldown = self.settings.timing.cooldown;

        self.reset_pending = false;
        self.state = WorkerState::Resetting;

        if let Some(mut process) = self.process.take() {
            let pid = pid_label(process.id());
            self.log
                .warning(format!("Subprocess with PID #{} needs to be restarted", pid));
            self.log.info(format!("Terminating subprocess with PID #{}", pid));
            if let Err(e) = process.terminate() {
                self.log
                    .error(format!("Failed to terminate subprocess with PID #{}: {}", pid, e));
            }
        }

        self.log.info(format!(
            "Waiting {} seconds before restarting the subprocess",
            cooldown.as_secs()
        ));

        cooldown
    }

    fn shutdown(&mut self) {
        if let Some(mut process) = self.process.take() {
            let pid = pid_label(process.id());
            self.log.info(format!("Terminating subprocess with PID #{}", pid));
            if let Err(e) = process.terminate() {
                self.log
                    .error(format!("Failed to terminate subprocess with PID #{}: {}", pid, e));
            }
        }

        self.reset_pending = false;
        self.state = WorkerState::Stopped;
    }
}

fn pid_label(id: Option<u32>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeLauncher;
    use crate::process::ProcessExit;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const TRIGGER: &str = "Warning: remote port forwarding failed for listen port 9000";

    fn settings(temp_dir: &TempDir) -> Arc<WorkerSettings> {
        Arc::new(WorkerSettings {
            ssh_program: "ssh".to_string(),
            ssh_dir: temp_dir.path().join(".ssh"),
            log_dir: temp_dir.path().to_path_buf(),
            echo: false,
            timing: WorkerTiming::default(),
        })
    }

    fn site() -> SiteConfig {
        let mut site = SiteConfig::new("office", "u", "h");
        site.identity_file = Some(PathBuf::from("/k"));
        site
    }

    fn worker(temp_dir: &TempDir, launcher: &Arc<FakeLauncher>) -> Worker {
        let mut worker = Worker::new(site(), settings(temp_dir), launcher.clone());
        worker.state = WorkerState::Starting;
        worker
    }

    fn log_of(temp_dir: &TempDir) -> String {
        fs::read_to_string(temp_dir.path().join("office.log")).unwrap_or_default()
    }

    fn push_line(launcher: &FakeLauncher, index: usize, line: &str) {
        launcher
            .process(index)
            .lock()
            .unwrap()
            .lines
            .push_back(line.to_string());
    }

    fn terminated(launcher: &FakeLauncher, index: usize) -> bool {
        launcher.process(index).lock().unwrap().terminated
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_launches_and_settles() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        let before = Instant::now();
        let wait = worker.tick().await;

        assert!(before.elapsed() >= Duration::from_secs(3));
        assert_eq!(wait, Duration::from_secs(1));
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(worker.generation(), 1);
        assert_eq!(launcher.count(), 1);

        let log = log_of(&temp_dir);
        assert!(log.contains("[INFO] Using command: ssh -nNT -i /k u@h"));
        assert!(log.contains("[INFO] Started subprocess with PID #1000 (generation 1)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_process_keeps_running() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        worker.tick().await;
        for _ in 0..5 {
            assert_eq!(worker.tick().await, Duration::from_secs(1));
            assert_eq!(worker.state(), WorkerState::Running);
        }
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_is_logged_and_drained_without_waiting() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        worker.tick().await;
        push_line(&launcher, 0, "Authenticated to h ([10.0.0.1]:22).");

        assert_eq!(worker.tick().await, Duration::ZERO);
        assert!(!worker.reset_pending);
        assert!(log_of(&temp_dir).contains("[EXT CMD] Authenticated to h ([10.0.0.1]:22)."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_death_relaunches_exactly_once() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        worker.tick().await;
        launcher.process(0).lock().unwrap().exit = Some(ProcessExit { code: Some(255) });

        assert_eq!(worker.tick().await, Duration::from_secs(1));
        assert_eq!(worker.state(), WorkerState::Starting);
        assert_eq!(launcher.count(), 1);
        assert!(log_of(&temp_dir)
            .contains("[WARNING] Subprocess with PID #1000 died, return code 255"));

        worker.tick().await;
        assert_eq!(launcher.count(), 2);
        assert_eq!(worker.generation(), 2);
        assert_eq!(worker.state(), WorkerState::Running);

        // The new process is alive; no further launches
        worker.tick().await;
        assert_eq!(launcher.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_deferred_until_output_is_drained() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        worker.tick().await;
        push_line(&launcher, 0, TRIGGER);
        push_line(&launcher, 0, "debug1: more output");

        // Trigger seen: flagged, not acted on
        assert_eq!(worker.tick().await, Duration::ZERO);
        assert!(worker.reset_pending);
        assert_eq!(worker.state(), WorkerState::Running);
        assert!(!terminated(&launcher, 0));

        // More output: still draining
        assert_eq!(worker.tick().await, Duration::ZERO);
        assert!(!terminated(&launcher, 0));

        // No output: reset
        assert_eq!(worker.tick().await, Duration::from_secs(15));
        assert!(terminated(&launcher, 0));
        assert_eq!(worker.state(), WorkerState::Resetting);
        assert!(!worker.reset_pending);

        let log = log_of(&temp_dir);
        assert!(log.contains(&format!("[EXT CMD] {}", TRIGGER)));
        assert!(log.contains("[WARNING] Subprocess with PID #1000 needs to be restarted"));
        assert!(log.contains("[INFO] Waiting 15 seconds before restarting the subprocess"));

        // After the cool-down the next tick relaunches
        worker.tick().await;
        assert_eq!(launcher.count(), 2);
        assert_eq!(worker.state(), WorkerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_wins_over_exit_check() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        worker.tick().await;
        push_line(&launcher, 0, "client_loop: send disconnect: Broken pipe");
        launcher.process(0).lock().unwrap().exit = Some(ProcessExit { code: Some(255) });

        worker.tick().await;
        assert_eq!(worker.tick().await, Duration::from_secs(15));
        assert_eq!(worker.state(), WorkerState::Resetting);
        assert!(!log_of(&temp_dir).contains("died"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_failure_does_not_block_reset() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = worker(&temp_dir, &launcher);

        worker.tick().await;
        launcher.process(0).lock().unwrap().fail_terminate = true;
        push_line(&launcher, 0, TRIGGER);

        worker.tick().await;
        assert_eq!(worker.tick().await, Duration::from_secs(15));
        assert_eq!(worker.state(), WorkerState::Resetting);
        assert!(log_of(&temp_dir).contains(
            "[ERROR] Failed to terminate subprocess with PID #1000: Operation not permitted"
        ));

        worker.tick().await;
        assert_eq!(launcher.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail_next(1);
        let mut worker = worker(&temp_dir, &launcher);

        assert_eq!(worker.tick().await, Duration::from_secs(1));
        assert_eq!(worker.state(), WorkerState::Starting);
        assert_eq!(worker.generation(), 0);
        assert!(log_of(&temp_dir).contains("[ERROR] Failed to start subprocess"));

        worker.tick().await;
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_known_hosts_is_a_launch_failure() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        let mut settings = (*settings(&temp_dir)).clone();
        settings.ssh_dir = blocker.join(".ssh");

        let mut site = site();
        site.hostkey = Some("ssh-ed25519 AAAA".to_string());

        let mut worker = Worker::new(site, Arc::new(settings), launcher.clone());
        worker.state = WorkerState::Starting;

        worker.tick().await;
        assert_eq!(launcher.count(), 0);
        assert_eq!(worker.state(), WorkerState::Starting);
        assert!(log_of(&temp_dir).contains("[ERROR] Failed to prepare command"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_running_terminates_process() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = Worker::new(site(), settings(&temp_dir), launcher.clone());
        let stop = worker.stop_token();

        let handle = tokio::spawn(async move {
            worker.run().await;
            worker
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(launcher.count(), 1);

        stop.cancel();
        let worker = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop within one tick")
            .unwrap();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(terminated(&launcher, 0));
        assert_eq!(launcher.count(), 1);

        let log = log_of(&temp_dir);
        assert!(log.contains("[INFO] Worker for site 'office' started"));
        assert!(log.contains("[INFO] Terminating subprocess with PID #1000"));
        assert!(log.contains("[INFO] Worker for site 'office' stopped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_starting() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        launcher.fail_next(u32::MAX);
        let mut worker = Worker::new(site(), settings(&temp_dir), launcher.clone());
        let stop = worker.stop_token();

        let handle = tokio::spawn(async move {
            worker.run().await;
            worker
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.cancel();
        let worker = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop within one tick")
            .unwrap();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(launcher.count(), 0);
        assert!(!log_of(&temp_dir).contains("Terminating"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_cooldown_and_cooldown_bound() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = Worker::new(site(), settings(&temp_dir), launcher.clone());
        let stop = worker.stop_token();

        let handle = tokio::spawn(async move {
            worker.run().await;
            worker
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        push_line(&launcher, 0, TRIGGER);

        // Reset happens within a couple of ticks; stop in the middle of the cool-down
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(terminated(&launcher, 0));
        assert_eq!(launcher.count(), 1);

        stop.cancel();
        let worker = tokio::time::timeout(Duration::from_secs(16), handle)
            .await
            .expect("worker should stop once the cool-down is over")
            .unwrap();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_waits_for_cooldown() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = Worker::new(site(), settings(&temp_dir), launcher.clone());
        let stop = worker.stop_token();

        let handle = tokio::spawn(async move {
            worker.run().await;
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        push_line(&launcher, 0, TRIGGER);
        let flagged_at = Instant::now();

        tokio::time::sleep(Duration::from_secs(30)).await;
        stop.cancel();
        handle.await.unwrap();

        assert!(launcher.count() >= 2);
        assert!(launcher.launch_time(1) - flagged_at >= Duration::from_secs(15));
        assert!(terminated(&launcher, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_never_launches() {
        let temp_dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut worker = Worker::new(site(), settings(&temp_dir), launcher.clone());

        worker.stop_token().cancel();
        worker.run().await;

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(launcher.count(), 0);
    }
}
