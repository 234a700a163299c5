//! Combinators over promises.
//!
//! `all` and `any` coordinate several in-flight operations while preserving
//! determinism: resolution order is driven purely by history event order, so
//! the same promises win on every replay.

use crate::promise::Promise;
use kairos_core::Failure;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Wait for all promises to resolve successfully; the first failure wins.
pub fn all<T: Clone>(promises: Vec<Promise<T>>) -> All<T> {
    let len = promises.len();
    All {
        promises: promises.into_iter().map(Some).collect(),
        results: (0..len).map(|_| None).collect(),
    }
}

/// Future returned by [`all`].
pub struct All<T> {
    promises: Vec<Option<Promise<T>>>,
    results: Vec<Option<T>>,
}

impl<T> Unpin for All<T> {}

impl<T: Clone> Future for All<T> {
    type Output = Result<Vec<T>, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;

        for index in 0..this.promises.len() {
            if this.results[index].is_some() {
                continue;
            }
            if let Some(promise) = &mut this.promises[index] {
                match Pin::new(promise).poll(cx) {
                    Poll::Ready(Ok(value)) => {
                        this.results[index] = Some(value);
                        this.promises[index] = None;
                    }
                    Poll::Ready(Err(failure)) => return Poll::Ready(Err(failure)),
                    Poll::Pending => all_done = false,
                }
            }
        }

        if all_done {
            let results = this
                .results
                .iter_mut()
                .map(|slot| slot.take().expect("all results present"))
                .collect();
            Poll::Ready(Ok(results))
        } else {
            Poll::Pending
        }
    }
}

/// Wait for the first promise to resolve, successfully or not. Returns the
/// winning index with its value; a winning failure propagates.
pub fn any<T: Clone>(promises: Vec<Promise<T>>) -> Any<T> {
    Any { promises }
}

/// Future returned by [`any`].
pub struct Any<T> {
    promises: Vec<Promise<T>>,
}

impl<T> Unpin for Any<T> {}

impl<T: Clone> Future for Any<T> {
    type Output = Result<(usize, T), Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (index, promise) in this.promises.iter_mut().enumerate() {
            match Pin::new(promise).poll(cx) {
                Poll::Ready(Ok(value)) => return Poll::Ready(Ok((index, value))),
                Poll::Ready(Err(failure)) => return Poll::Ready(Err(failure)),
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseCompleter;

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    fn pending_batch(count: usize) -> (Vec<Promise<i32>>, Vec<PromiseCompleter<i32>>) {
        (0..count).map(|_| Promise::pending()).unzip()
    }

    #[test]
    fn test_all_waits_for_every_promise() {
        let (promises, completers) = pending_batch(3);
        let mut joined = all(promises);
        assert!(poll_once(&mut joined).is_pending());

        completers[0].complete(1);
        completers[2].complete(3);
        assert!(poll_once(&mut joined).is_pending());

        completers[1].complete(2);
        assert_eq!(poll_once(&mut joined), Poll::Ready(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn test_all_propagates_first_failure() {
        let (promises, completers) = pending_batch(2);
        let mut joined = all(promises);
        completers[1].fail(Failure::canceled("boom"));
        match poll_once(&mut joined) {
            Poll::Ready(Err(failure)) => assert!(failure.is_canceled()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_all_of_empty_resolves_immediately() {
        let mut joined = all(Vec::<Promise<i32>>::new());
        assert_eq!(poll_once(&mut joined), Poll::Ready(Ok(vec![])));
    }

    #[test]
    fn test_any_returns_first_resolved_index() {
        let (promises, completers) = pending_batch(3);
        let mut selected = any(promises);
        assert!(poll_once(&mut selected).is_pending());

        completers[1].complete(11);
        assert_eq!(poll_once(&mut selected), Poll::Ready(Ok((1, 11))));
    }

    #[test]
    fn test_any_propagates_winning_failure() {
        let (promises, completers) = pending_batch(2);
        let mut selected = any(promises);
        completers[0].fail(Failure::canceled("first"));
        assert!(matches!(poll_once(&mut selected), Poll::Ready(Err(_))));
    }
}
