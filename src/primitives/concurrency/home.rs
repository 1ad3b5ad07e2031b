//! The execution context that owns a shard.
//!
//! Work that must run on the shard's context is sent to its queue as a task;
//! the caller blocks on a ticket until the worker has run it. Calls made from
//! the context itself run inline.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{Result, SliceError};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

struct Handle {
    name: String,
    thread_id: ThreadId,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // The last reference can be released by a task on the worker itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        if worker.join().is_err() {
            warn!(context = %self.name, "home.worker_panicked");
        }
    }
}

/// A named worker thread that serializes the tasks sent to it.
#[derive(Clone)]
pub struct ExecutionContext {
    handle: Arc<Handle>,
}

impl ExecutionContext {
    /// Spawns the worker thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&worker_shared))?;
        debug!(context = %name, "home.spawn");
        Ok(Self {
            handle: Arc::new(Handle {
                name,
                thread_id: worker.thread().id(),
                shared,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Thread name of the worker.
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Returns true when called from the worker thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.handle.thread_id
    }

    /// Runs `f` on this context and returns its result.
    ///
    /// A panic inside `f` is resumed on the caller.
    pub fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let slot = Arc::new(TaskSlot::<R>::new());
        let task_slot = Arc::clone(&slot);
        let task: Task = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            task_slot.finish(outcome);
        });
        {
            let mut state = self.handle.shared.state.lock();
            if state.shutdown {
                return Err(SliceError::Invalid("execution context shut down"));
            }
            state.tasks.push_back(task);
        }
        self.handle.shared.wakeup.notify_one();
        match slot.wait() {
            Ok(value) => Ok(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.handle.name)
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.shutdown {
                    debug!("home.worker_exit");
                    return;
                }
                shared.wakeup.wait(&mut state);
            }
        };
        task();
    }
}

struct TaskSlot<R> {
    result: Mutex<Option<thread::Result<R>>>,
    done: Condvar,
}

impl<R> TaskSlot<R> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn finish(&self, outcome: thread::Result<R>) {
        let mut result = self.result.lock();
        *result = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> thread::Result<R> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.done.wait(&mut guard);
        }
    }
}
