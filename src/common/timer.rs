use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use hyper::rt::Sleep;

/// A type-erased `hyper::rt::Timer`, so `PoolInner` can hold one without
/// becoming generic over the timer implementation.
#[derive(Clone)]
pub(crate) struct Timer {
    inner: Arc<dyn hyper::rt::Timer + Send + Sync>,
}

impl Timer {
    pub(crate) fn new<T>(timer: T) -> Self
    where
        T: hyper::rt::Timer + Send + Sync + 'static,
    {
        Timer {
            inner: Arc::new(timer),
        }
    }

    pub(crate) fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
        self.inner.sleep_until(deadline)
    }

    pub(crate) fn reset(&self, sleep: &mut Pin<Box<dyn Sleep>>, deadline: Instant) {
        self.inner.reset(sleep, deadline);
    }
}

impl hyper::rt::Timer for Timer {
    fn sleep(&self, duration: std::time::Duration) -> Pin<Box<dyn Sleep>> {
        self.inner.sleep(duration)
    }

    fn sleep_until(&self, deadline: Instant) -> Pin<Box<dyn Sleep>> {
        self.inner.sleep_until(deadline)
    }

    fn reset(&self, sleep: &mut Pin<Box<dyn Sleep>>, new_deadline: Instant) {
        self.inner.reset(sleep, new_deadline);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").finish()
    }
}
