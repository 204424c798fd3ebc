//! Async adapter for waiting on a [`TimedFuture`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{FutureError, TimedFuture};

/// Resolves with the outcome of a [`TimedFuture`] once it is done.
///
/// Returned by [`TimedFuture::get_async()`].
#[derive(Debug)]
pub struct GetAsync<'a, T, E> {
    future: &'a TimedFuture<T, E>,
}

impl<'a, T, E> GetAsync<'a, T, E> {
    pub(crate) fn new(future: &'a TimedFuture<T, E>) -> Self {
        Self { future }
    }
}

impl<'a, T, E> Future for GetAsync<'a, T, E> {
    type Output = Result<&'a T, &'a FutureError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let future: &'a TimedFuture<T, E> = self.future;

        future
            .register_waker(cx.waker())
            .map_or(Poll::Pending, Poll::Ready)
    }
}
