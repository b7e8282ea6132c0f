//! Scheduled actions
//!
//! A [`TimerService`] runs [`TimerTask`]s after a delay. The journal arms two
//! tasks (inactivity flush and completion polling), both [`FireEvent`]s, which
//! hold only a weak, lock-guarded reference to the journal so that a fire
//! racing with teardown becomes a no-op.
//!
//! [`Timer`] is the shipped service: one thread and a deadline heap.

mod task;

pub use task::{FireEvent, FireState};

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

/// Action run by a timer service.
pub trait TimerTask: Send + Sync {
    /// Called once per scheduling, on the service's thread.
    fn fire(&self);
}

/// Something able to run tasks later.
pub trait TimerService: Send + Sync {
    /// Schedules `task` to fire once after `delay`.
    fn add(&self, task: Arc<dyn TimerTask>, delay: Duration);
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: Arc<dyn TimerTask>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Schedule {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    schedule: Mutex<Schedule>,
    changed: Condvar,
}

/// Single-threaded timer service.
///
/// Tasks fire on the timer thread in deadline order; ties fire in the order
/// they were added. The schedule lock is never held while a task runs, so a
/// task may schedule further tasks.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn start(name: &str) -> io::Result<Self> {
        let shared = Arc::new(TimerShared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("timer-{}", name))
            .spawn(move || run_timer(worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Tasks waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared
            .schedule
            .lock()
            .map(|schedule| schedule.heap.len())
            .unwrap_or(0)
    }

    /// Stops the timer thread. Pending tasks are dropped without firing.
    pub fn shutdown(&self) {
        if let Ok(mut schedule) = self.shared.schedule.lock() {
            schedule.shutdown = true;
            schedule.heap.clear();
        }
        self.shared.changed.notify_all();

        let handle = self.thread.lock().ok().and_then(|mut thread| thread.take());
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Shut down from inside a task: the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

impl TimerService for Timer {
    fn add(&self, task: Arc<dyn TimerTask>, delay: Duration) {
        let mut schedule = match self.shared.schedule.lock() {
            Ok(schedule) => schedule,
            Err(_) => return,
        };
        if schedule.shutdown {
            debug!("timer stopped, task dropped");
            return;
        }
        let seq = schedule.next_seq;
        schedule.next_seq += 1;
        schedule.heap.push(Scheduled {
            deadline: Instant::now() + delay,
            seq,
            task,
        });
        drop(schedule);
        self.shared.changed.notify_all();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(shared: Arc<TimerShared>) {
    let mut schedule = match shared.schedule.lock() {
        Ok(schedule) => schedule,
        Err(_) => return,
    };
    loop {
        if schedule.shutdown {
            break;
        }
        let now = Instant::now();
        let next_deadline = schedule.heap.peek().map(|next| next.deadline);
        schedule = match next_deadline {
            Some(deadline) if deadline <= now => {
                let due = schedule.heap.pop();
                drop(schedule);
                if let Some(due) = due {
                    due.task.fire();
                }
                match shared.schedule.lock() {
                    Ok(schedule) => schedule,
                    Err(_) => return,
                }
            }
            Some(deadline) => match shared.changed.wait_timeout(schedule, deadline - now) {
                Ok((schedule, _)) => schedule,
                Err(_) => return,
            },
            None => match shared.changed.wait(schedule) {
                Ok(schedule) => schedule,
                Err(_) => return,
            },
        };
    }
    debug!("timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Probe {
        label: u32,
        fired: mpsc::Sender<u32>,
    }

    impl TimerTask for Probe {
        fn fire(&self) {
            let _ = self.fired.send(self.label);
        }
    }

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let timer = Timer::start("order").unwrap();
        let (tx, rx) = mpsc::channel();
        for (label, delay) in [(3, 60), (1, 10), (2, 30)] {
            timer.add(
                Arc::new(Probe {
                    label,
                    fired: tx.clone(),
                }),
                Duration::from_millis(delay),
            );
        }

        let got: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let timer = Timer::start("ties").unwrap();
        let (tx, rx) = mpsc::channel();
        for label in 0..5 {
            timer.add(
                Arc::new(Probe {
                    label,
                    fired: tx.clone(),
                }),
                Duration::ZERO,
            );
        }
        let got: Vec<u32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let timer = Timer::start("drop").unwrap();
        let (tx, rx) = mpsc::channel();
        timer.add(Arc::new(Probe { label: 9, fired: tx }), Duration::from_secs(60));
        assert_eq!(timer.pending(), 1);

        timer.shutdown();
        assert_eq!(timer.pending(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_add_after_shutdown_ignored() {
        let timer = Timer::start("late").unwrap();
        timer.shutdown();
        let (tx, _rx) = mpsc::channel();
        timer.add(Arc::new(Probe { label: 1, fired: tx }), Duration::ZERO);
        assert_eq!(timer.pending(), 0);
    }
}
