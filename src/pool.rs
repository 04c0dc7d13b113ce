use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads pulling jobs off a shared channel.
///
/// Jobs queue up instead of spawning more threads, rapid triggers can't grow
/// the thread count. Dropping the pool lets queued jobs finish, then joins.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> io::Result<WorkerPool> {
        WorkerPool::with_init(name, size, || ())
    }

    /// Like [`WorkerPool::new`], running `init` once on every worker before it
    /// accepts jobs.
    pub fn with_init<I>(name: &str, size: usize, init: I) -> io::Result<WorkerPool>
    where
        I: Fn() + Send + Sync + 'static,
    {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let init = Arc::new(init);

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let receiver = receiver.clone();
            let init = Arc::clone(&init);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || {
                    init();
                    for job in receiver.iter() {
                        job();
                    }
                })?;
            workers.push(handle);
        }

        Ok(WorkerPool {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job`, returns false if every worker is gone.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender {
            Some(ref sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("a {} worker panicked", self.name);
            }
        }
    }
}

/// Stop signal that wakes sleeping threads right away.
///
/// Nothing is ever sent on the channel. Signalling drops the only sender, so
/// every clone of the receiver sees the disconnect at once.
#[derive(Clone)]
pub struct Shutdown {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        let (trigger, signal) = crossbeam_channel::bounded(0);
        Shutdown {
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal,
        }
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    /// Raises the signal. Returns false if it was already raised.
    pub fn signal(&self) -> bool {
        let mut trigger = self.trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take().is_some()
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `duration` unless the signal is raised first.
    /// Returns true if it was.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.signal.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// A named background thread that reports its exit on a channel.
pub struct Task {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Task {
    pub fn spawn<F>(name: String, f: F) -> io::Result<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        let (finished, done) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name).spawn(move || {
            // dropped on return and on unwind alike
            let _finished = finished;
            f();
        })?;
        Ok(Task { handle, done })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn finished_by(&self, deadline: Instant) -> bool {
        matches!(self.done.recv_deadline(deadline), Err(RecvTimeoutError::Disconnected))
    }
}

/// Joins every task that finishes before `timeout` runs out, the rest are
/// left detached. Returns true if all of them were joined.
pub fn join_within(tasks: Vec<Task>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut joined = true;
    for task in tasks {
        if !task.finished_by(deadline) {
            joined = false;
            continue;
        }
        if task.handle.join().is_err() {
            warn!("background thread panicked");
        }
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn runs_every_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("test", 3).unwrap();
            for _ in 0..50 {
                let counter = Arc::clone(&counter);
                assert!(pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn thread_count_is_bounded() {
        let names = Arc::new(Mutex::new(HashSet::new()));
        {
            let pool = WorkerPool::new("bounded", 2).unwrap();
            assert_eq!(pool.size(), 2);
            for _ in 0..20 {
                let names = Arc::clone(&names);
                pool.execute(move || {
                    let name = thread::current().name().map(String::from);
                    names.lock().unwrap().insert(name);
                });
            }
        }
        assert!(names.lock().unwrap().len() <= 2);
    }

    #[test]
    fn workers_run_jobs_concurrently() {
        let pool = WorkerPool::new("parallel", 2).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        // the first job blocks its worker, the second must still run
        let blocked = release_rx.clone();
        pool.execute(move || {
            let _ = blocked.recv();
        });
        pool.execute(move || {
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        drop(release_tx);
    }

    #[test]
    fn zero_size_still_gets_a_worker() {
        let pool = WorkerPool::new("tiny", 0).unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn shutdown_wakes_sleepers() {
        let shutdown = Shutdown::new();
        let sleeper = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let start = Instant::now();
                assert!(shutdown.sleep(Duration::from_secs(10)));
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!shutdown.is_signaled());
        assert!(shutdown.signal());
        assert!(!shutdown.signal());
        assert!(shutdown.is_signaled());

        let slept = sleeper.join().unwrap();
        assert!(slept < Duration::from_secs(5));
    }

    #[test]
    fn quiet_shutdown_sleeps_full_duration() {
        let shutdown = Shutdown::new();
        let start = Instant::now();
        assert!(!shutdown.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn join_within_gives_up_on_stuck_tasks() {
        let release = Arc::new(AtomicBool::new(false));
        let stuck = {
            let release = Arc::clone(&release);
            Task::spawn("stuck".into(), move || {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap()
        };
        let quick = Task::spawn("quick".into(), || ()).unwrap();

        assert!(!join_within(vec![quick, stuck], Duration::from_millis(50)));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn finished_tasks_are_noticed_without_polling() {
        let task = Task::spawn("short".into(), || thread::sleep(Duration::from_millis(20))).unwrap();
        let start = Instant::now();
        assert!(join_within(vec![task], Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn panicking_task_still_reports_done() {
        let task = Task::spawn("panics".into(), || panic!("boom")).unwrap();
        assert!(join_within(vec![task], Duration::from_secs(2)));
    }

    #[test]
    fn init_runs_per_worker() {
        let inits = Arc::new(AtomicUsize::new(0));
        {
            let inits = Arc::clone(&inits);
            let _pool = WorkerPool::with_init("init", 4, move || {
                inits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(inits.load(Ordering::SeqCst), 4);
    }
}
