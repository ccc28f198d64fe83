//! A serial-queue executor for single-context event delivery.
//!
//! This crate provides an [`Executor`] that runs jobs and asynchronous tasks one at a
//! time, in submission order, on a dedicated worker thread. Code running on the queue
//! never overlaps with other code running on the same queue, which makes it a natural
//! home for `!Send` state machines that are driven by events arriving from elsewhere.
//!
//! It also provides a [`Handle`] type that allows for sending `!Send` values
//! between threads, as long as they are only accessed on the queue that owns them.
//!
//! # Example
//!
//! ```
//! # use serial_executor::Executor;
//! let task = Executor::background("example", |executor| executor.spawn(async { 6 * 7 }));
//! assert_eq!(futures_lite::future::block_on(task), 42);
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::sync::{Arc, mpsc};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use async_task::Runnable;

type Job = Box<dyn FnOnce() + Send>;

enum Work {
    Call(Job),
    Run(Runnable),
}

thread_local! {
    static LOCAL_JOBS: RefCell<VecDeque<Box<dyn FnOnce()>>> = const { RefCell::new(VecDeque::new()) };
}

struct Queue {
    label: String,
    thread: ThreadId,
    sender: mpsc::Sender<Work>,
}

impl Queue {
    fn push(&self, work: Work) {
        if let Err(work) = self.try_push(work) {
            tracing::error!(queue = %self.label, "serial queue is gone, dropping work item");
            drop(work);
        }
    }

    fn try_push(&self, work: Work) -> Result<(), Work> {
        self.sender.send(work).map_err(|err| err.0)
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Runs `func` on the queue and blocks until it returns.
    ///
    /// Runs inline when called from the queue itself.
    fn exec_sync<R: Send>(&self, func: impl FnOnce() -> R + Send) -> R {
        if self.is_current() {
            return func();
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        let job: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
            let _ = sender.send(func());
        });
        // SAFETY: this thread blocks on `receiver` until the job has either run to completion or
        // been dropped, so nothing borrowed by `func` can be invalidated while the queue holds it.
        let job: Job = unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + '_>, Job>(job) };
        self.push(Work::Call(job));

        match receiver.recv() {
            Ok(ret) => ret,
            Err(_) => panic!("serial queue `{}` dropped a synchronous job", self.label),
        }
    }
}

fn run_queue(receiver: mpsc::Receiver<Work>) {
    while let Ok(work) = receiver.recv() {
        match work {
            Work::Call(job) => job(),
            Work::Run(runnable) => {
                runnable.run();
            }
        }

        while let Some(job) = LOCAL_JOBS.with(|jobs| jobs.borrow_mut().pop_front()) {
            job();
        }
    }
}

/// An executor that runs jobs and async tasks on a serial queue.
///
/// `Executor` is `!Send`: it only exists on its own queue, which is what makes
/// [`exec_local()`][Executor::exec_local] and [`spawn_local()`][Executor::spawn_local] sound.
#[derive(Clone)]
pub struct Executor {
    queue: Arc<Queue>,
    phantom: PhantomData<*mut ()>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("label", &self.queue.label)
            .finish()
    }
}

impl Executor {
    /// Creates a new serial queue on a background thread and passes its executor to the
    /// provided entry point function.
    ///
    /// `entry` runs on the new queue; this call blocks until it returns.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the worker thread.
    pub fn background<F, R>(label: &str, entry: F) -> R
    where
        F: FnOnce(Self) -> R + Send,
        R: Send,
    {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(label.to_owned())
            .spawn(move || run_queue(receiver))
            .unwrap_or_else(|err| panic!("failed to spawn serial queue `{label}`: {err}"));

        let queue = Arc::new(Queue {
            label: label.to_owned(),
            thread: worker.thread().id(),
            sender,
        });

        tracing::debug!(queue = %label, "serial queue started");

        let inner = queue.clone();
        queue.exec_sync(move || {
            entry(Executor {
                queue: inner,
                phantom: PhantomData,
            })
        })
    }

    /// The label the queue was created with.
    pub fn label(&self) -> &str {
        &self.queue.label
    }

    /// Create a [`Handle`] to a value that can be sent between threads.
    ///
    /// `Handle` ensures that all accesses to `value` through the handle are synchronized on this
    /// executor's queue.
    pub fn handle<T: 'static>(&self, value: T) -> Handle<T> {
        Handle {
            queue: self.queue.clone(),
            value: ManuallyDrop::new(value),
        }
    }

    /// Queues `job` to run after everything already queued.
    pub fn exec_async(&self, job: impl FnOnce() + Send + 'static) {
        self.queue.push(Work::Call(Box::new(job)));
    }

    /// Queues a `!Send` job to run on this queue as soon as the current work item finishes.
    ///
    /// Local jobs run before the next item from the shared queue is picked up.
    pub fn exec_local(&self, job: impl FnOnce() + 'static) {
        debug_assert!(self.queue.is_current());
        LOCAL_JOBS.with(|jobs| jobs.borrow_mut().push_back(Box::new(job)));
    }

    /// Spawns a new asynchronous task, returning a [`Task`] that can be used to await its result.
    ///
    /// Dropping the `Task` will cancel it. If you want the task to run independently, you must call [`detach()`][Task::detach]
    pub fn spawn<R>(&self, future: impl Future<Output = R> + Send + 'static) -> Task<R>
    where
        R: Send + 'static,
    {
        let queue = self.queue.clone();
        let (runnable, task) = async_task::spawn(future, move |runnable: Runnable| {
            queue.push(Work::Run(runnable))
        });
        runnable.schedule();
        Task(TaskState::Spawned(task))
    }

    /// Spawns a `!Send` future on this queue.
    ///
    /// The future is only ever polled on the queue's worker thread. It may be woken from any
    /// thread.
    pub fn spawn_local<R>(&self, future: impl Future<Output = R> + 'static) -> Task<R>
    where
        R: 'static,
    {
        let queue = self.queue.clone();
        let (runnable, task) = async_task::spawn_local(future, move |runnable: Runnable| {
            queue.push(Work::Run(runnable))
        });
        runnable.schedule();
        Task(TaskState::Spawned(task))
    }
}

/// A handle to a value that is owned by a specific [`Executor`].
///
/// This allows for sending `!Send` values between threads, as long as they are only
/// accessed on the queue that owns them. Dropping the handle drops the value on its queue.
pub struct Handle<T: 'static> {
    queue: Arc<Queue>,
    value: ManuallyDrop<T>,
}

// SAFETY: the value is only touched on the owning queue: `lock` marshals every access there and
// `Drop` sends the value back before destroying it.
unsafe impl<T: 'static> Send for Handle<T> {}

unsafe impl<T: 'static> Sync for Handle<T> {}

struct AssertSend<T>(T);

// SAFETY: only used to carry values back to the queue that owns them.
unsafe impl<T> Send for AssertSend<T> {}

impl<T: 'static> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("queue", &self.queue.label)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Clone for Handle<T> {
    fn clone(&self) -> Self {
        let value = self.lock(|value, _| AssertSend(value.clone()));
        Self {
            queue: self.queue.clone(),
            value: ManuallyDrop::new(value.0),
        }
    }
}

impl<T: PartialEq + 'static> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue) && self.lock(move |value, _| *value == *other.value)
    }
}

impl<T: Eq + 'static> Eq for Handle<T> {}

impl<T: 'static> Drop for Handle<T> {
    fn drop(&mut self) {
        // SAFETY: `value` is never used again after being taken here.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        if self.queue.is_current() {
            drop(value);
        } else {
            let value = AssertSend(value);
            if let Err(work) = self.queue.try_push(Work::Call(Box::new(move || drop(value)))) {
                // The owning thread is gone; leaking is the only option that never touches the
                // value from the wrong thread.
                tracing::warn!(queue = %self.queue.label, "leaking handle value of a stopped queue");
                std::mem::forget(work);
            }
        }
    }
}

impl<T: 'static> Handle<T> {
    /// Acquires a lock on the value, running the provided function on the owning executor's queue.
    ///
    /// This method will block the current thread until the function returns. Called from the
    /// owning queue itself, the function runs inline.
    pub fn lock<R>(&self, func: impl FnOnce(&T, &Executor) -> R + Send) -> R
    where
        R: Send,
    {
        let handle = self;
        self.queue.exec_sync(move || func(&handle.value, &handle.executor()))
    }

    fn executor(&self) -> Executor {
        Executor {
            queue: self.queue.clone(),
            phantom: PhantomData,
        }
    }
}

#[derive(Debug)]
enum TaskState<T> {
    Ready(Option<T>),
    Spawned(async_task::Task<T>),
}

/// A future that resolves to the result of an asynchronous task.
///
/// Dropping a [`Task`] cancels it, which means its future won't be polled again. To drop the
/// [`Task`] handle without canceling it, use [`detach()`][`Task::detach()`] instead.
pub struct Task<T>(TaskState<T>);

impl<T> Task<T> {
    /// Creates a new task that is already completed with the given value.
    pub fn ready(val: T) -> Self {
        Task(TaskState::Ready(Some(val)))
    }

    /// Detaches the task, allowing it to run in the background.
    pub fn detach(self) {
        match self {
            Task(TaskState::Ready(_)) => (),
            Task(TaskState::Spawned(task)) => task.detach(),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match unsafe { self.get_unchecked_mut() } {
            Task(TaskState::Ready(val)) => match val.take() {
                Some(val) => Poll::Ready(val),
                None => panic!("`Task` polled after completion"),
            },
            Task(TaskState::Spawned(task)) => Pin::new(task).poll(cx),
        }
    }
}
