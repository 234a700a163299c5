//! Write-once promises backing every durable operation.
//!
//! A promise is the only suspension point workflow code has: awaiting an
//! unresolved promise parks the workflow until the cooperative runner polls
//! it again after the next event-loop pass. Promises carry either a value or
//! a [`Failure`], support chaining, and hold a cancellation handle that
//! propagates to the owning entity machine.

use kairos_core::machines::CancellationHandle;
use kairos_core::Failure;
use parking_lot::Mutex;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A cancellation handle that fires at most once, shareable between a
/// promise and the cancellation scope that owns it.
pub(crate) struct CancelOnce {
    handle: Mutex<Option<CancellationHandle>>,
}

impl CancelOnce {
    pub fn new(handle: CancellationHandle) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn invoke(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle();
        }
    }
}

type PromiseState<T> = Mutex<Option<std::result::Result<T, Failure>>>;

/// A write-once container of either a value or a failure.
pub struct Promise<T> {
    state: Arc<PromiseState<T>>,
    cancel: Option<Arc<CancelOnce>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Promise<T> {
    /// An unresolved promise plus its completer.
    pub fn pending() -> (Self, PromiseCompleter<T>) {
        let state: Arc<PromiseState<T>> = Arc::new(Mutex::new(None));
        (
            Self {
                state: state.clone(),
                cancel: None,
            },
            PromiseCompleter { state },
        )
    }

    /// A promise resolved up front, e.g. for values already known from
    /// replay or for operation errors.
    pub fn ready(result: std::result::Result<T, Failure>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(result))),
            cancel: None,
        }
    }

    pub(crate) fn with_cancel(mut self, cancel: Arc<CancelOnce>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Request cancellation of the owning operation. Resolution semantics
    /// depend on the operation's cancellation type.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.invoke();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Map the success value; failures pass through.
    pub fn then<U, F>(self, f: F) -> Then<T, U, F>
    where
        F: FnOnce(T) -> U,
    {
        Then {
            promise: self,
            f: Some(f),
            _marker: PhantomData,
        }
    }

    /// Map a failure into a recovery result; success passes through.
    pub fn catch<F>(self, f: F) -> Catch<T, F>
    where
        F: FnOnce(Failure) -> std::result::Result<T, Failure>,
    {
        Catch {
            promise: self,
            f: Some(f),
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Non-consuming read of the resolved value, if any.
    pub fn peek(&self) -> Option<std::result::Result<T, Failure>> {
        self.state.lock().clone()
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = std::result::Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &*self.state.lock() {
            Some(result) => Poll::Ready(result.clone()),
            // The cooperative runner re-polls after every event-loop pass;
            // no waker plumbing is needed.
            None => Poll::Pending,
        }
    }
}

/// Completion side of a promise, owned by an entity-machine callback.
pub struct PromiseCompleter<T> {
    state: Arc<PromiseState<T>>,
}

impl<T> Clone for PromiseCompleter<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> PromiseCompleter<T> {
    pub fn complete(&self, value: T) {
        self.complete_with(Ok(value));
    }

    pub fn fail(&self, failure: Failure) {
        self.complete_with(Err(failure));
    }

    /// Write-once: later writes are dropped.
    pub fn complete_with(&self, result: std::result::Result<T, Failure>) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(result);
        } else {
            tracing::trace!("promise already resolved, dropping late completion");
        }
    }
}

/// Future returned by [`Promise::then`].
pub struct Then<T, U, F> {
    promise: Promise<T>,
    f: Option<F>,
    _marker: PhantomData<U>,
}

impl<T, U, F> Unpin for Then<T, U, F> {}

impl<T: Clone, U, F> Future for Then<T, U, F>
where
    F: FnOnce(T) -> U + Unpin,
{
    type Output = std::result::Result<U, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.promise).poll(cx) {
            Poll::Ready(Ok(value)) => {
                let f = this.f.take().expect("then polled after completion");
                Poll::Ready(Ok(f(value)))
            }
            Poll::Ready(Err(failure)) => Poll::Ready(Err(failure)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Promise::catch`].
pub struct Catch<T, F> {
    promise: Promise<T>,
    f: Option<F>,
}

impl<T, F> Unpin for Catch<T, F> {}

impl<T: Clone, F> Future for Catch<T, F>
where
    F: FnOnce(Failure) -> std::result::Result<T, Failure> + Unpin,
{
    type Output = std::result::Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.promise).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(failure)) => {
                let f = this.f.take().expect("catch polled after completion");
                Poll::Ready(f(failure))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn test_pending_promise_polls_pending_until_completed() {
        let (mut promise, completer) = Promise::<i32>::pending();
        assert!(poll_once(&mut promise).is_pending());
        assert!(!promise.is_completed());

        completer.complete(42);
        assert!(promise.is_completed());
        assert_eq!(poll_once(&mut promise), Poll::Ready(Ok(42)));
    }

    #[test]
    fn test_completion_is_write_once() {
        let (promise, completer) = Promise::<i32>::pending();
        completer.complete(1);
        completer.complete(2);
        completer.fail(Failure::canceled("late"));
        assert_eq!(promise.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_ready_promise_resolves_immediately() {
        let mut promise = Promise::ready(Err::<i32, _>(Failure::canceled("nope")));
        match poll_once(&mut promise) {
            Poll::Ready(Err(failure)) => assert!(failure.is_canceled()),
            other => panic!("expected cancelled failure, got {other:?}"),
        }
    }

    #[test]
    fn test_then_maps_success() {
        let (promise, completer) = Promise::<i32>::pending();
        completer.complete(20);
        let mut mapped = promise.then(|v| v * 2);
        assert_eq!(poll_once(&mut mapped), Poll::Ready(Ok(40)));
    }

    #[test]
    fn test_then_passes_failure_through() {
        let promise = Promise::<i32>::ready(Err(Failure::canceled("c")));
        let mut mapped = promise.then(|v| v * 2);
        match poll_once(&mut mapped) {
            Poll::Ready(Err(failure)) => assert!(failure.is_canceled()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_catch_recovers_failure() {
        let promise = Promise::<i32>::ready(Err(Failure::canceled("c")));
        let mut recovered = promise.catch(|_| Ok(7));
        assert_eq!(poll_once(&mut recovered), Poll::Ready(Ok(7)));
    }

    #[test]
    fn test_cancel_fires_handle_once() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let (promise, _completer) = Promise::<i32>::pending();
        let promise = promise.with_cancel(CancelOnce::new(Box::new(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        })));
        promise.cancel();
        promise.cancel();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }
}
