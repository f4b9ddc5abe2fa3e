//! Bounded-concurrency task queue driving the checker, uploader and preview
//! workers. Tasks run on the ambient tokio runtime.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

pub enum TaskOutcome<T> {
    Done,
    /// Put the task back at the tail of the queue.
    Retry(T),
}

pub type Worker<T> = Arc<dyn Fn(T) -> BoxFuture<'static, TaskOutcome<T>> + Send + Sync>;
type DrainHook = Arc<dyn Fn() + Send + Sync>;

struct State<T> {
    pending: VecDeque<T>,
    running: HashMap<u64, AbortHandle>,
    next_id: u64,
    paused: bool,
    generation: u64,
}

struct Inner<T> {
    worker: Worker<T>,
    concurrency: usize,
    state: Mutex<State<T>>,
    idle: Notify,
    on_drain: Mutex<Option<DrainHook>>,
}

pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(concurrency: usize, worker: Worker<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker,
                concurrency: concurrency.max(1),
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    running: HashMap::new(),
                    next_id: 0,
                    paused: false,
                    generation: 0,
                }),
                idle: Notify::new(),
                on_drain: Mutex::new(None),
            }),
        }
    }

    pub fn paused(concurrency: usize, worker: Worker<T>) -> Self {
        let q = Self::new(concurrency, worker);
        q.inner.state.lock().paused = true;
        q
    }

    /// Called whenever the last running task finishes with nothing pending.
    pub fn on_drain(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_drain.lock() = Some(Arc::new(hook));
    }

    pub fn push(&self, task: T) {
        self.inner.state.lock().pending.push_back(task);
        self.pump();
    }

    /// Insert halfway down the pending list: soon, without jumping the line.
    pub fn push_middle(&self, task: T) {
        {
            let mut st = self.inner.state.lock();
            let mid = st.pending.len() / 2;
            st.pending.insert(mid, task);
        }
        self.pump();
    }

    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Tasks waiting to start.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    pub fn is_idle(&self) -> bool {
        let st = self.inner.state.lock();
        st.pending.is_empty() && st.running.is_empty()
    }

    /// Drop pending tasks and abort running ones. The drain hook is not fired.
    pub fn kill(&self) {
        {
            let mut st = self.inner.state.lock();
            st.pending.clear();
            for (_, handle) in st.running.drain() {
                handle.abort();
            }
            st.generation += 1;
        }
        self.inner.idle.notify_waiters();
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn pump(&self) {
        let mut st = self.inner.state.lock();
        while !st.paused && st.running.len() < self.inner.concurrency {
            let Some(task) = st.pending.pop_front() else {
                break;
            };
            let id = st.next_id;
            st.next_id += 1;
            let generation = st.generation;
            let fut = (self.inner.worker)(task);
            let queue = self.clone();
            let handle = tokio::spawn(async move {
                // Workers report their own panics; this keeps the slot
                // accounting right if one still escapes.
                let outcome = AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or(TaskOutcome::Done);
                queue.finish(id, generation, outcome);
            });
            st.running.insert(id, handle.abort_handle());
        }
    }

    fn finish(&self, id: u64, generation: u64, outcome: TaskOutcome<T>) {
        let drained = {
            let mut st = self.inner.state.lock();
            if st.generation != generation {
                return;
            }
            st.running.remove(&id);
            if let TaskOutcome::Retry(task) = outcome {
                st.pending.push_back(task);
            }
            st.pending.is_empty() && st.running.is_empty()
        };
        if drained {
            self.inner.idle.notify_waiters();
            let hook = self.inner.on_drain.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.pump();
    }
}
