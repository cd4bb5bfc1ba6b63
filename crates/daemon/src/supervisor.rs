// SSH Tunnel Keeper - Supervisor Module
// Creates one worker per site, runs them in parallel and coordinates shutdown

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ssh_keeper_common::{SiteConfig, SiteLog};

use crate::process::Launcher;
use crate::worker::{Worker, WorkerSettings, WorkerState};

/// A spawned worker as seen by the supervisor
struct WorkerHandle {
    site: String,
    stop: CancellationToken,
    /// Final state and number of launches
    join: JoinHandle<(WorkerState, u64)>,
}

/// Root controller owning all workers
pub struct Supervisor {
    settings: Arc<WorkerSettings>,
    launcher: Arc<dyn Launcher>,
    log: SiteLog,
    workers: Vec<Worker>,
}

impl Supervisor {
    /// `log` is the main log of the service
    pub fn new(settings: WorkerSettings, launcher: Arc<dyn Launcher>, log: SiteLog) -> Self {
        Self {
            settings: Arc::new(settings),
            launcher,
            log,
            workers: Vec::new(),
        }
    }

    /// Create a worker for every active, valid site
    ///
    /// Sites with a credential defect are logged at ERROR and skipped.
    /// Returns the number of workers created.
    pub fn add_sites(&mut self, sites: impl IntoIterator<Item = SiteConfig>) -> usize {
        let mut added = 0;

        for site in sites {
            if !site.active {
                debug!("Site '{}' is inactive, skipping", site.name);
                continue;
            }

            if let Err(e) = site.validate() {
                self.log.error(format!("{}. Skipping this site.", e));
                continue;
            }

            self.workers
                .push(Worker::new(site, self.settings.clone(), self.launcher.clone()));
            added += 1;
        }

        added
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run all workers until `shutdown` is cancelled, then stop and join them
    pub async fn run(self, shutdown: CancellationToken) {
        let Self { log, workers, .. } = self;

        if workers.is_empty() {
            log.warning("No active/working site configuration found. Exiting ...");
            log.info("Service stopped.");
            return;
        }

        let handles: Vec<WorkerHandle> = workers
            .into_iter()
            .map(|mut worker| {
                let site = worker.site_name().to_string();
                let stop = worker.stop_token();
                let join = tokio::spawn(async move {
                    worker.run().await;
                    (worker.state(), worker.generation())
                });
                WorkerHandle { site, stop, join }
            })
            .collect();

        log.info(format!("Service started with {} worker(s)", handles.len()));

        shutdown.cancelled().await;
        log.info("Stopping service ...");

        join_all(&log, handles).await;

        log.info("Service stopped.");
    }
}

/// Stop every worker, then wait for each of them in turn
async fn join_all(log: &SiteLog, handles: Vec<WorkerHandle>) {
    for handle in &handles {
        handle.stop.cancel();
    }

    for handle in handles {
        match handle.join.await {
            Ok((state, generation)) => debug!(
                "Worker for site '{}' joined ({:?}, {} launch(es))",
                handle.site, state, generation
            ),
            Err(e) => log.error(format!(
                "Worker for site '{}' ended abnormally: {}",
                handle.site, e
            )),
        }
    }
}
