use std::future::Future as _;
use std::pin::Pin;
use std::task::{self, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream as _;
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use pin_project_lite::pin_project;
use tokio::sync::watch;
use tokio::time::Sleep;

use crate::client::PoolClient;
use crate::error::{Error, ReadTimeoutKind};
use crate::pool::Pooled;
use crate::uri::PoolKey;

pin_project! {
    /// The response body surfaced to callers.
    ///
    /// Wraps `hyper::body::Incoming`, re-arming a fresh read timeout around
    /// every chunk and mapping parser errors into this crate's taxonomy.
    /// `pause(true)` stops the body from yielding further frames to its
    /// consumer (without affecting how fast `hyper` drains the socket)
    /// until `pause(false)` is called.
    ///
    /// Holds the pooled connection's checkout guard for as long as the body
    /// is still being drained, so the connection can't be handed to a second
    /// request while this one's response is still in flight on the wire;
    /// it is dropped, releasing the connection back to the pool, only once
    /// `poll_frame` reaches a terminal state.
    pub struct IncomingBody {
        #[pin]
        inner: Incoming,
        read_timeout: Option<Duration>,
        #[pin]
        sleep: Option<Sleep>,
        paused: watch::Receiver<bool>,
        pause_tx: watch::Sender<bool>,
        pooled: Option<Pooled<PoolClient, PoolKey>>,
    }
}

impl IncomingBody {
    pub(crate) fn new(
        inner: Incoming,
        read_timeout: Option<Duration>,
        pooled: Pooled<PoolClient, PoolKey>,
    ) -> Self {
        let (pause_tx, paused) = watch::channel(false);
        IncomingBody {
            inner,
            read_timeout,
            sleep: None,
            paused,
            pause_tx,
            pooled: Some(pooled),
        }
    }

    /// Stop (`true`) or resume (`false`) delivering body frames to the
    /// consumer. Backpressure on the underlying socket read is handled
    /// separately by `hyper` simply not being polled while paused.
    pub fn pause(&self, paused: bool) {
        let _ = self.pause_tx.send(paused);
    }
}

impl std::fmt::Debug for IncomingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingBody").finish_non_exhaustive()
    }
}

impl Body for IncomingBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let mut this = self.project();

        if *this.paused.borrow() {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        if let Some(dur) = *this.read_timeout {
            if this.sleep.is_none() {
                this.sleep.set(Some(tokio::time::sleep(dur)));
            }
            if let Some(sleep) = this.sleep.as_mut().as_pin_mut() {
                if sleep.poll(cx).is_ready() {
                    this.pooled.take();
                    return Poll::Ready(Some(Err(Error::ReadTimeout(ReadTimeoutKind::Body))));
                }
            }
        }

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.sleep.set(None);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.pooled.take();
                Poll::Ready(Some(Err(Error::from_hyper(e))))
            }
            Poll::Ready(None) => {
                this.pooled.take();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Adapts a `futures_util::Stream` of `Bytes` chunks into a request
    /// body, exposing a `watch<bool>` the caller can subscribe to if it
    /// wants to proactively stop producing before `hyper`'s own pull-based
    /// backpressure would ask it to (which it otherwise handles for free
    /// simply by not polling this body until its write buffer drains).
    pub struct RequestBody<S> {
        #[pin]
        stream: S,
        paused: watch::Receiver<bool>,
        pause_tx: watch::Sender<bool>,
        size_hint: SizeHint,
    }
}

impl<S> RequestBody<S> {
    pub fn new(stream: S) -> Self {
        Self::with_size_hint(stream, SizeHint::default())
    }

    pub fn with_size_hint(stream: S, size_hint: SizeHint) -> Self {
        let (pause_tx, paused) = watch::channel(false);
        RequestBody {
            stream,
            paused,
            pause_tx,
            size_hint,
        }
    }

    pub fn pause(&self, paused: bool) {
        let _ = self.pause_tx.send(paused);
    }
}

impl<S, E> Body for RequestBody<S>
where
    S: futures_core::Stream<Item = Result<Bytes, E>>,
    Error: From<E>,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let this = self.project();

        if *this.paused.borrow() {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(Error::from(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}
