use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An executor that drives the spawned connection-driver and idle-eviction
/// tasks for a [`Pool`](crate::pool::Pool).
///
/// Wraps whatever `hyper::rt::Executor` the caller handed to
/// [`Pool::new`](crate::pool::Pool::new) behind a single concrete type so
/// `PoolInner` doesn't need to be generic over it.
#[derive(Clone)]
pub(crate) struct Exec {
    inner: Arc<dyn Fn(BoxSendFuture) + Send + Sync>,
}

impl Exec {
    pub(crate) fn new<E>(executor: E) -> Self
    where
        E: hyper::rt::Executor<BoxSendFuture> + Send + Sync + Clone + 'static,
    {
        Exec {
            inner: Arc::new(move |fut| executor.execute(fut)),
        }
    }

    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        (self.inner)(Box::pin(fut));
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec").finish()
    }
}
