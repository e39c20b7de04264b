use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;

use tracing::{debug, warn};

use crate::error::BcdataError;

#[derive(Debug)]
pub struct JobOutcome<J, T> {
    pub job: J,
    pub result: Result<T, BcdataError>,
}

/// Outcomes come back in submission order.
pub fn run_jobs<J, T, F>(jobs: Vec<J>, workers: usize, work: F) -> Vec<JobOutcome<J, T>>
where
    J: Send,
    T: Send,
    F: Fn(&J) -> Result<T, BcdataError> + Sync,
{
    let total = jobs.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);

    let (job_tx, job_rx) = mpsc::channel::<(usize, J)>();
    for job in jobs.into_iter().enumerate() {
        // The receiver is alive until the scope below ends.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let queue = Mutex::new(job_rx);
    let cancelled = AtomicBool::new(false);
    let (done_tx, done_rx) = mpsc::channel::<(usize, JobOutcome<J, T>)>();

    thread::scope(|scope| {
        for worker in 0..workers {
            let done_tx = done_tx.clone();
            let queue = &queue;
            let cancelled = &cancelled;
            let work = &work;
            scope.spawn(move || {
                loop {
                    let next = match queue.lock() {
                        Ok(receiver) => receiver.recv(),
                        Err(_) => break,
                    };
                    let Ok((index, job)) = next else { break };
                    let result = if cancelled.load(Ordering::SeqCst) {
                        Err(BcdataError::Cancelled(format!("job {index} not started")))
                    } else {
                        debug!(worker, job = index, "starting job");
                        let result = work(&job);
                        if let Err(err) = &result {
                            if err.is_fatal() {
                                warn!(worker, job = index, error = %err, "cancelling remaining jobs");
                                cancelled.store(true, Ordering::SeqCst);
                            }
                        }
                        result
                    };
                    if done_tx.send((index, JobOutcome { job, result })).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);

    let mut outcomes = done_rx.into_iter().collect::<Vec<_>>();
    outcomes.sort_by_key(|(index, _)| *index);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}
