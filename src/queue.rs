use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::analysis::{Analysis, AnalysisError};
use crate::config::Config;
use crate::proxmox::ProxmoxClient;
use crate::report::{self, AnalysisStatus};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("analysis queue is closed")]
    Closed,
}

/// One accepted submission, consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub template: u32,
    pub filename: String,
    pub extension: String,
    pub sample_path: PathBuf,
}

/// Bounded in-memory queue of pending analyses with a fixed worker pool.
/// `enqueue` blocking on a full channel is the admission-control signal.
pub struct AnalysisQueue {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl AnalysisQueue {
    pub fn start(client: ProxmoxClient, node_name: String, cfg: &Config) -> AnalysisQueue {
        log::info!(
            "[QUEUE] starting {} workers (queue capacity {})",
            cfg.queue_max_workers,
            cfg.queue_capacity
        );
        AnalysisQueue::with_runner(
            cfg.queue_capacity,
            cfg.queue_max_workers,
            move |job: Job| {
                let client = client.clone();
                let node_name = node_name.clone();
                async move { run_job(job, client, node_name).await }
            },
        )
    }

    /// Pool plumbing, split from [`AnalysisQueue::start`] so tests can plug
    /// in their own job runner.
    fn with_runner<F, Fut>(capacity: usize, workers: usize, runner: F) -> AnalysisQueue
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AnalysisError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let runner = Arc::new(runner);

        let workers = (0..workers)
            .map(|n| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only for the receive so siblings can
                        // dequeue while this worker is busy.
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let id = job.id.clone();
                        log::info!("[QUEUE] worker {n} picked up analysis {id}");
                        if let Err(e) = (*runner)(job).await {
                            log::error!("[QUEUE] worker {n}: analysis {id} failed: {e}");
                        }
                    }
                    log::info!("[QUEUE] worker {n} stopped");
                })
            })
            .collect();

        AnalysisQueue { tx, workers }
    }

    /// Queue with a no-op runner, for handler tests that only exercise
    /// intake.
    #[cfg(test)]
    pub(crate) fn start_for_tests() -> AnalysisQueue {
        AnalysisQueue::with_runner(8, 1, |_job| async { Ok::<(), AnalysisError>(()) })
    }

    /// Hands a job to the pool. Blocks while the queue is full; fails only
    /// once the queue is closed.
    pub async fn enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        self.tx.send(job).await.map_err(|_| EnqueueError::Closed)
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn close(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Drives one job through the full state machine and guarantees that the
/// outcome is persisted and the environment torn down on every exit path.
async fn run_job(job: Job, client: ProxmoxClient, node_name: String) -> Result<(), AnalysisError> {
    let mut analysis = Analysis::new(&job, client, node_name).await?;

    let outcome = analysis.run().await;

    if let Err(ref cause) = outcome {
        // The status never regresses: a report that made it to Completed
        // before the deadline fired stays Completed.
        if analysis.report.request.status != AnalysisStatus::Completed {
            analysis.report.request.status = AnalysisStatus::Failed;
            analysis.report.request.error = cause.to_string();
            analysis.report.request.end_time = report::current_timestamp();
            if let Err(e) = analysis.report.save_status() {
                log::error!("[QUEUE] failed to persist status for {}: {e}", job.id);
            }
            if let Err(e) = analysis.report.save_report() {
                log::error!("[QUEUE] failed to persist report for {}: {e}", job.id);
            }
        }
    }

    // Teardown errors are surfaced here but never mask the original cause.
    match analysis.cleanup().await {
        Ok(()) => {
            if outcome.is_ok() {
                analysis.report.append_log("Environment deleted");
            }
        }
        Err(e) => log::error!("[QUEUE] teardown for analysis {} failed: {e}", job.id),
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    fn job(n: usize) -> Job {
        Job {
            id: format!("job-{n}"),
            template: 9011,
            filename: "sample.exe".to_string(),
            extension: ".exe".to_string(),
            sample_path: PathBuf::from("/nonexistent"),
        }
    }

    #[tokio::test]
    async fn enqueue_blocks_while_the_queue_is_full() {
        let gate = Arc::new(Semaphore::new(0));
        let runner_gate = Arc::clone(&gate);
        let queue = AnalysisQueue::with_runner(2, 1, move |_job| {
            let gate = Arc::clone(&runner_gate);
            async move {
                gate.acquire().await.unwrap().forget();
                Ok(())
            }
        });

        // The worker takes the first job and blocks in it; the next two
        // fill the channel.
        for n in 0..3 {
            timeout(Duration::from_secs(1), queue.enqueue(job(n)))
                .await
                .expect("enqueue should not block yet")
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queue is full: the next enqueue must block.
        let blocked = timeout(Duration::from_millis(100), queue.enqueue(job(3))).await;
        assert!(blocked.is_err(), "enqueue should block on a full queue");

        // Finishing one job frees one slot.
        gate.add_permits(1);
        timeout(Duration::from_secs(1), queue.enqueue(job(4)))
            .await
            .expect("enqueue should unblock once a slot frees up")
            .unwrap();

        gate.add_permits(64);
        queue.close().await;
    }

    #[tokio::test]
    async fn at_most_max_workers_jobs_run_concurrently() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let (active_r, peak_r, done_r) =
            (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));
        let queue = AnalysisQueue::with_runner(32, 4, move |_job| {
            let active = Arc::clone(&active_r);
            let peak = Arc::clone(&peak_r);
            let done = Arc::clone(&done_r);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for n in 0..16 {
            queue.enqueue(job(n)).await.unwrap();
        }
        queue.close().await;

        assert_eq!(done.load(Ordering::SeqCst), 16);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn a_failing_job_does_not_kill_its_worker() {
        let done = Arc::new(AtomicUsize::new(0));
        let done_r = Arc::clone(&done);
        let queue = AnalysisQueue::with_runner(8, 1, move |j: Job| {
            let done = Arc::clone(&done_r);
            async move {
                done.fetch_add(1, Ordering::SeqCst);
                if j.id == "job-0" {
                    Err(AnalysisError::Timeout)
                } else {
                    Ok(())
                }
            }
        });

        queue.enqueue(job(0)).await.unwrap();
        queue.enqueue(job(1)).await.unwrap();
        queue.close().await;

        assert_eq!(done.load(Ordering::SeqCst), 2);
    }
}
