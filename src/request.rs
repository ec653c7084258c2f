//! Awaitable, retryable and cancellable operations built on top of one-shot signals.
//!
//! A [`request`] issues a command through a *send* action and then waits for a signal that a
//! *projector* accepts. If nothing qualifying arrives within [`RequestOptions::timeout`], the
//! command is sent again, up to [`RequestOptions::retries`] more times.

use log::*;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

use crate::error::*;
use crate::sync::Subject;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestOptions {
    /// How long to wait for a qualifying signal after each send.
    pub timeout: Duration,

    /// How many times the command is re-sent before giving up.
    pub retries: u32,
}

impl RequestOptions {
    pub const fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries,
        }
    }

    /// Sends once and waits up to `timeout`.
    pub const fn once(timeout: Duration) -> Self {
        Self::new(timeout, 0)
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 3)
    }
}

/// Outcome of feeding one signal to a request's projector.
#[derive(Debug)]
pub enum Projection<T> {
    /// Not the signal the request waits for, keep waiting.
    Ignore,
    Resolve(T),
    Reject(Error),
}

impl<T> From<Result<T>> for Projection<T> {
    fn from(v: Result<T>) -> Self {
        match v {
            Ok(v) => Self::Resolve(v),
            Err(e) => Self::Reject(e),
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;

struct CancelState {
    cancelled: bool,
    signal: Option<oneshot::Sender<()>>,
    hook: Option<Hook>,
}

/// Cancels the [`Request`] it was obtained from. Can be cloned and moved to other tasks.
#[derive(Clone)]
pub struct Canceller(Arc<Mutex<CancelState>>);

assert_impl_all!(Canceller: Send, Sync);

impl Canceller {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(CancelState {
            cancelled: false,
            signal: Some(tx),
            hook: None,
        }))), rx)
    }

    /// Fails the request with [`ErrorKind::Cancelled`] and runs its cleanup hook.
    /// Has no effect after the first call.
    pub fn cancel(&self) {
        let (signal, hook) = {
            let mut state = self.0.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            (state.signal.take(), state.hook.take())
        };
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.lock().cancelled
    }

    fn set_hook(&self, hook: Hook) {
        let run_now = {
            let mut state = self.0.lock();
            if state.cancelled {
                Some(hook)
            } else {
                state.hook = Some(hook);
                None
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handed to the procedure of [`cancelify`] to register what cancelling it means.
#[derive(Clone, Debug)]
pub struct CancelSlot(Canceller);

impl CancelSlot {
    /// Replaces the cancellation function. If the request is already cancelled `f` runs
    /// immediately.
    pub fn set(&self, f: impl FnOnce() + Send + 'static) {
        self.0.set_hook(Box::new(f));
    }
}

/// An in-flight operation. Resolves with the projected value or fails with the error that
/// ended it.
pub struct Request<T> {
    future: Pin<Box<dyn Future<Output = Result<T>> + Send>>,
    canceller: Canceller,
}

impl<T: Send + 'static> Request<T> {
    /// A request that has already finished.
    pub fn ready(result: Result<T>) -> Self {
        let (canceller, _) = Canceller::new();
        Self {
            future: Box::pin(async move { result }),
            canceller,
        }
    }

    /// Sets the function to run when the request is cancelled, e.g. to abort a command the
    /// controller may still be executing.
    pub fn on_cancel(self, f: impl FnOnce() + Send + 'static) -> Self {
        self.canceller.set_hook(Box::new(f));
        self
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("canceller", &self.canceller)
            .finish()
    }
}

/// Turns a command and the signal answering it into a [`Request`].
///
/// The subscription to `signals` is taken before this function returns, so signals emitted
/// between the call and the first poll are not lost. `send` runs on the first poll and again
/// on every retry; returning `Ok(false)` means the command could not be issued and fails the
/// request with [`ErrorKind::NotIssued`] without waiting.
pub fn request<E, T, S, P>(signals: &Subject<E>, options: RequestOptions, mut send: S, mut project: P)
    -> Request<T>
where
    E: Clone + Send + 'static,
    T: Send + 'static,
    S: FnMut() -> Result<bool> + Send + 'static,
    P: FnMut(&E) -> Projection<T> + Send + 'static,
{
    let (canceller, mut cancelled) = Canceller::new();
    let mut signals = signals.subscribe();
    let future = async move {
        let mut attempt = 0;
        loop {
            if cancelled.try_recv().is_ok() {
                return Err(Error::cancelled());
            }
            attempt += 1;
            if !send()? {
                return Err(Error::new(ErrorKind::NotIssued, "operation could not be issued"));
            }

            let deadline = time::sleep(options.timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => return Err(Error::cancelled()),
                    signal = signals.recv() => match signal {
                        Some(signal) => match project(&signal) {
                            Projection::Ignore => {}
                            Projection::Resolve(v) => return Ok(v),
                            Projection::Reject(e) => return Err(e),
                        }
                        None => return Err(Error::detached()),
                    },
                    _ = &mut deadline => break,
                }
            }

            if attempt > options.retries {
                return Err(Error::new(ErrorKind::RetriesExhausted,
                    format!("no response after {} attempts", attempt)));
            }
            debug!("no response within {:?}, retrying ({}/{})",
                options.timeout, attempt, options.retries);
        }
    };
    Request {
        future: Box::pin(future),
        canceller,
    }
}

/// Wraps a multi-step procedure so it can be cancelled. The procedure registers its current
/// cancellation function (usually the canceller of the step it awaits) through the slot.
pub fn cancelify<T, F, Fut>(procedure: F) -> Request<T>
where
    T: Send + 'static,
    F: FnOnce(CancelSlot) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let (canceller, cancelled) = Canceller::new();
    let inner = procedure(CancelSlot(canceller.clone()));
    let future = async move {
        tokio::select! {
            biased;
            _ = cancelled => Err(Error::cancelled()),
            r = inner => r,
        }
    };
    Request {
        future: Box::pin(future),
        canceller,
    }
}
