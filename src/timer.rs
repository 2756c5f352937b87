/*! Deadlines for sockets that must act without being pushed.

A [Timer] owns one thread and a priority queue of deadlines. A socket registers itself
once, getting a [TimerHandle], and asks for a callback with [TimerHandle::schedule]; when
the deadline passes the thread calls [Timed::on_timer] and schedules whatever the
callback returns. The thread never holds its own lock while calling into a socket.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crate::socket::PollAt;
use crate::time::Instant;

/// Something driven by a [Timer].
pub trait Timed: Send + Sync {
    /// Called once the scheduled deadline has passed. Returns when to be called next.
    fn on_timer(&self, now: Instant) -> PollAt;
}

struct Task {
    target: Weak<dyn Timed>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, id: u64, poll_at: PollAt) {
        let PollAt::Time(deadline) = poll_at else {
            return;
        };
        let mut queue = self.lock();
        let Some(task) = queue.tasks.get_mut(&id) else {
            return;
        };
        if task.deadline.is_some_and(|current| current <= deadline) {
            return;
        }
        task.deadline = Some(deadline);
        queue.heap.push(Reverse((deadline, id)));
        drop(queue);
        self.wakeup.notify_one();
    }

    fn run(&self) {
        let mut queue = self.lock();
        loop {
            if queue.shutdown {
                return;
            }
            let now = Instant::now();
            let next = queue.heap.peek().map(|Reverse(entry)| *entry);
            let Some((deadline, id)) = next else {
                queue = self
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            if deadline > now {
                let timeout: core::time::Duration = now.until(deadline).into();
                queue = self
                    .wakeup
                    .wait_timeout(queue, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            queue.heap.pop();
            let target = match queue.tasks.get_mut(&id) {
                // Entries superseded by an earlier deadline are left in the heap.
                Some(task) if task.deadline == Some(deadline) => {
                    task.deadline = None;
                    task.target.clone()
                }
                _ => continue,
            };
            drop(queue);

            match target.upgrade() {
                Some(target) => {
                    let next = target.on_timer(now);
                    self.schedule(id, next);
                }
                None => {
                    net_trace!("timer: task {} is gone", id);
                    self.lock().tasks.remove(&id);
                }
            }
            queue = self.lock();
        }
    }
}

/// A thread calling [Timed] objects back at the deadlines they ask for.
pub struct Timer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Start the timer thread.
    pub fn new() -> io::Result<Timer> {
        let shared = Arc::new(Shared::default());
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("sockstack-timer".into())
                .spawn(move || shared.run())?
        };
        Ok(Timer {
            shared,
            thread: Some(thread),
        })
    }

    /// Register `target`. It is called back only at deadlines scheduled through the
    /// returned handle, and never after it has been dropped.
    pub fn register(&self, target: Weak<dyn Timed>) -> TimerHandle {
        let mut queue = self.shared.lock();
        let id = queue.next_id;
        queue.next_id += 1;
        queue.tasks.insert(
            id,
            Task {
                target,
                deadline: None,
            },
        );
        TimerHandle {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Number of registered, live handles.
    pub fn len(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                net_warn!("timer: thread panicked");
            }
        }
    }
}

/// A registration with a [Timer]. Dropping it cancels any pending deadline.
pub struct TimerHandle {
    shared: Arc<Shared>,
    id: u64,
}

impl TimerHandle {
    /// Ask for a callback at `poll_at`. A deadline later than the one already pending is
    /// ignored; the callback reports the next one anyway. [PollAt::Ingress] does nothing.
    pub fn schedule(&self, poll_at: PollAt) {
        self.shared.schedule(self.id, poll_at)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.shared.lock().tasks.remove(&self.id);
    }
}
