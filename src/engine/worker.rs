//! Session worker thread.
//!
//! Every session owns exactly one worker. The worker creates its interpreter
//! on its own thread and then runs jobs from a bounded queue, one at a time.
//! The caller never joins the thread: an abandoned worker finishes its current
//! job (or notices the abort flag) and exits when its queue disconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::ExecutionError;
use crate::interpreter::{Interpreter, InterpreterFactory};

/// A unit of work run against the session's interpreter.
pub(crate) type Task = Box<dyn FnOnce(&mut dyn Interpreter) + Send>;

struct Job {
    task: Task,
    /// Instant after which the submitter considers this job overdue.
    overdue_at: Option<Instant>,
}

/// What the worker is doing right now, for overdue checks.
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    busy_until: Mutex<Option<Instant>>,
}

impl WorkerState {
    fn set(&self, overdue_at: Option<Instant>) {
        *self.busy_until.lock().unwrap_or_else(PoisonError::into_inner) = overdue_at;
    }

    /// True when the running job passed its overdue instant.
    pub(crate) fn is_overdue(&self, now: Instant) -> bool {
        self.busy_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| now >= at)
    }
}

pub(crate) struct SessionWorker {
    tx: Sender<Job>,
    abort: Arc<AtomicBool>,
    state: Arc<WorkerState>,
    queue_capacity: usize,
    label: String,
}

impl SessionWorker {
    pub(crate) fn start(
        label: String,
        queue_capacity: usize,
        stack_bytes: usize,
        factory: Arc<dyn InterpreterFactory>,
    ) -> Result<Self, ExecutionError> {
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);
        let state = Arc::new(WorkerState::default());
        let abort = Arc::new(AtomicBool::new(false));
        let worker_state = Arc::clone(&state);
        let worker_abort = Arc::clone(&abort);

        thread::Builder::new()
            .name(format!("kyrologic-{label}"))
            .stack_size(stack_bytes)
            .spawn(move || run(&rx, factory.as_ref(), &worker_state, &worker_abort))
            .map_err(|err| ExecutionError::WorkerSpawn {
                message: err.to_string(),
            })?;

        Ok(Self {
            tx,
            abort,
            state,
            queue_capacity,
            label,
        })
    }

    /// Abort flag handed to every query this worker runs.
    pub(crate) fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub(crate) fn is_overdue(&self, now: Instant) -> bool {
        self.state.is_overdue(now)
    }

    pub(crate) fn try_submit(&self, task: Task, overdue_at: Option<Instant>) -> Result<(), ExecutionError> {
        match self.tx.try_send(Job { task, overdue_at }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                session: self.label.clone(),
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected {
                session: self.label.clone(),
            }),
        }
    }

    /// Gives up on this worker. The running job sees the abort flag, queued
    /// jobs are discarded, and the thread exits once the queue closes.
    pub(crate) fn abandon(self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

fn run(rx: &Receiver<Job>, factory: &dyn InterpreterFactory, state: &WorkerState, abort: &AtomicBool) {
    let mut interpreter = factory.create();
    while let Ok(job) = rx.recv() {
        if abort.load(Ordering::SeqCst) {
            // Queued jobs of an abandoned worker are dropped; their callers see a disconnect.
            continue;
        }
        state.set(job.overdue_at);
        (job.task)(interpreter.as_mut());
        state.set(None);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::interpreter::SldFactory;

    fn worker(capacity: usize) -> SessionWorker {
        SessionWorker::start("test".to_string(), capacity, 1 << 20, Arc::new(SldFactory)).unwrap()
    }

    #[test]
    fn runs_tasks_in_order() {
        let w = worker(8);
        let (tx, rx) = bounded(8);
        for i in 0..3 {
            let tx = tx.clone();
            w.try_submit(Box::new(move |_| tx.send(i).unwrap()), None).unwrap();
        }
        let got: Vec<i32> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn full_queue_is_reported() {
        let w = worker(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        w.try_submit(
            Box::new(move |_| {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv();
            }),
            None,
        )
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        w.try_submit(Box::new(|_| {}), None).unwrap();
        let err = w.try_submit(Box::new(|_| {}), None).unwrap_err();
        assert!(matches!(err, ExecutionError::QueueFull { capacity: 1, .. }));
        drop(gate_tx);
    }

    #[test]
    fn overdue_tracks_the_running_job() {
        let w = worker(2);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        let past = Instant::now();
        w.try_submit(
            Box::new(move |_| {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv();
            }),
            Some(past),
        )
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(w.is_overdue(Instant::now()));
        drop(gate_tx);
        w.abandon();
    }
}
