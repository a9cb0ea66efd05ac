pub mod body;
mod exchange;

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{self, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, Uri};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use pin_project_lite::pin_project;
use tracing::debug;

use crate::connect::{Connect, HttpConnector};
use crate::error::Error;
use crate::pool::{self, Pool, Poolable, Pooled};
use crate::rt::{TokioExecutor, TokioTimer};
use crate::uri::PoolKey;

pub use body::IncomingBody;

/// Request bodies are funneled through this boxed type once buffered, so
/// the pool and connection machinery don't need to be generic over the
/// caller's original body type.
type BoxBody = http_body_util::combinators::BoxBody<Bytes, Error>;

/// Configuration for a [`Client`].
///
/// Use [`ClientBuilder`] for ergonomic, validated construction; the
/// `Default` impl matches the defaults documented on each field.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long an idle pooled connection may sit before it is evicted.
    pub idle_timeout: Duration,
    /// Maximum idle connections kept per `(scheme, authority)`.
    pub max_idle_per_host: usize,
    /// Timeout for establishing a new TCP connection. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Timeout for receiving response headers, and independently for each
    /// subsequent body chunk. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// How many extra attempts an idempotent request gets after its
    /// connection was closed before any response byte arrived.
    pub retry_limit: u32,
    /// Delay between retry attempts.
    pub retry_delay: Duration,
    /// Whether to inject a `Host` header derived from the request's
    /// authority when one isn't already present.
    pub set_host: bool,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        if self.read_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "read_timeout must be greater than zero".into(),
            ));
        }
        if self.max_idle_per_host > 0 && self.idle_timeout == Duration::ZERO {
            return Err(Error::Config(
                "idle_timeout must be greater than zero when pooling is enabled".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            idle_timeout: Duration::from_secs(60),
            max_idle_per_host: 32,
            connect_timeout: None,
            read_timeout: None,
            retry_limit: 2,
            retry_delay: Duration::from_millis(500),
            set_host: true,
        }
    }
}

/// Builder for [`ClientConfig`] plus a [`Client`].
#[derive(Clone, Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    pub fn idle_timeout(mut self, dur: Duration) -> Self {
        self.config.idle_timeout = dur;
        self
    }

    pub fn max_idle_per_host(mut self, n: usize) -> Self {
        self.config.max_idle_per_host = n;
        self
    }

    pub fn connect_timeout(mut self, dur: Option<Duration>) -> Self {
        self.config.connect_timeout = dur;
        self
    }

    pub fn read_timeout(mut self, dur: Option<Duration>) -> Self {
        self.config.read_timeout = dur;
        self
    }

    pub fn retry_limit(mut self, n: u32) -> Self {
        self.config.retry_limit = n;
        self
    }

    pub fn retry_delay(mut self, dur: Duration) -> Self {
        self.config.retry_delay = dur;
        self
    }

    pub fn set_host(mut self, set_host: bool) -> Self {
        self.config.set_host = set_host;
        self
    }

    pub fn build(self) -> Result<Client<HttpConnector>, Error> {
        self.config.validate()?;
        let connector = HttpConnector::with_connect_timeout(self.config.connect_timeout);
        Ok(Client::with_connector(self.config, connector))
    }

    pub fn build_with_connector<C: Connect>(self, connector: C) -> Result<Client<C>, Error> {
        self.config.validate()?;
        Ok(Client::with_connector(self.config, connector))
    }
}

pin_project! {
    /// Wraps a connector's I/O to count bytes read off the wire, so the
    /// retry path can tell "the peer closed before sending anything" apart
    /// from "the peer closed mid-response" for the same `hyper::Error`.
    struct CountingIo<T> {
        #[pin]
        inner: T,
        bytes_read: Arc<AtomicUsize>,
    }
}

impl<T: hyper::rt::Read> hyper::rt::Read for CountingIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        mut buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.project();
        let n = unsafe {
            let mut tbuf = hyper::rt::ReadBuf::uninit(buf.as_mut());
            match this.inner.poll_read(cx, tbuf.unfilled()) {
                Poll::Ready(Ok(())) => tbuf.filled().len(),
                other => return other,
            }
        };
        unsafe {
            buf.advance(n);
        }
        if n > 0 {
            this.bytes_read.fetch_add(n, Ordering::Relaxed);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: hyper::rt::Write> hyper::rt::Write for CountingIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }
}

/// A connection held in the pool: the `hyper` H1 request sender, with its
/// background connection driver already spawned alongside it, and a shared
/// counter of bytes read off the wire for this connection's current attempt.
struct PoolClient {
    sender: http1::SendRequest<BoxBody>,
    bytes_read: Arc<AtomicUsize>,
}

impl Poolable for PoolClient {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// The async HTTP/1.1 client: a connection pool plus the retry/timeout
/// policy driving each exchange.
#[derive(Clone)]
pub struct Client<C> {
    config: ClientConfig,
    connector: C,
    pool: Pool<PoolClient, PoolKey>,
}

impl Client<HttpConnector> {
    pub fn new() -> Self {
        ClientBuilder::new()
            .build()
            .expect("default config is valid")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl Default for Client<HttpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connect> Client<C> {
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        let pool = Pool::new(
            pool::Config {
                idle_timeout: Some(config.idle_timeout),
                max_idle_per_host: config.max_idle_per_host,
            },
            TokioExecutor::new(),
            Some(TokioTimer::new()),
        );

        Client {
            config,
            connector,
            pool,
        }
    }

    pub async fn get(&self, uri: Uri) -> Result<Response<IncomingBody>, Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .expect("well-formed GET request");
        self.request(req).await
    }

    pub async fn head(&self, uri: Uri) -> Result<Response<IncomingBody>, Error> {
        let req = Request::builder()
            .method(Method::HEAD)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .expect("well-formed HEAD request");
        self.request(req).await
    }

    pub async fn post(&self, uri: Uri, body: Bytes) -> Result<Response<IncomingBody>, Error> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(body))
            .expect("well-formed POST request");
        self.request(req).await
    }

    /// Send a request, transparently attaching/releasing a pooled
    /// connection and retrying an idempotent request whose connection
    /// died before any response byte arrived.
    ///
    /// The body is fully buffered before the first attempt so a retry can
    /// resend it without requiring the caller's body type to implement
    /// `Clone` — see the crate's design notes on streamed request bodies
    /// and retries.
    pub async fn request<B>(&self, req: Request<B>) -> Result<Response<IncomingBody>, Error>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (mut parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| Error::connect(e.to_string()))?
            .to_bytes();

        let key = {
            let mut probe = Request::from_parts(parts.clone(), ());
            let key = exchange::normalize_request(&mut probe, self.config.set_host)?;
            parts = probe.into_parts().0;
            key
        };
        let method = parts.method.clone();

        let mut attempt: u32 = 0;
        loop {
            let mut pooled = self.checkout_or_connect(&key).await?;
            let bytes_before = pooled.bytes_read.load(Ordering::Relaxed);

            let to_send = Request::from_parts(parts.clone(), full_body(body_bytes.clone()));
            let send = pooled.sender.send_request(to_send);
            let outcome = match self.config.read_timeout {
                Some(dur) => match tokio::time::timeout(dur, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(Error::ReadTimeout(crate::error::ReadTimeoutKind::Headers))
                    }
                },
                None => send.await,
            };

            match outcome {
                Ok(resp) => {
                    return Ok(exchange::into_response(resp, self.config.read_timeout, pooled))
                }
                Err(e) if exchange::is_connection_closed(&e) => {
                    // A connection that is closed after it already handed back
                    // some bytes of a response was never merely WAITING: the
                    // response is truncated, and replaying the request would
                    // risk a non-idempotent side effect running twice or a
                    // caller silently getting a different response. That is
                    // never retried, regardless of method.
                    if pooled.bytes_read.load(Ordering::Relaxed) > bytes_before {
                        return Err(Error::connect(
                            "Server dropped connection before the response was complete.",
                        ));
                    }
                    if !exchange::is_idempotent(&method) {
                        return Err(Error::connect(format!("can't retry {method} method")));
                    }
                    if attempt < self.config.retry_limit {
                        debug!(
                            attempt,
                            reused = pooled.is_reused(),
                            "retrying after connection closed before any response byte"
                        );
                        attempt += 1;
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                    return Err(Error::connect(format!(
                        "tried to connect {} times",
                        attempt + 1
                    )));
                }
                Err(e) => return Err(Error::from_hyper(e)),
            }
        }
    }

    /// Race an idle-connection checkout against a fresh connect.
    ///
    /// Unlike an HTTP/2 pool, which wants at most one live connection per
    /// host, HTTP/1.1 legitimately needs a new connection for every request
    /// already in flight against the same host, so there is no "wait for
    /// the one connect in progress" dedup here: whichever finishes first
    /// wins, and a checkout that loses the race simply requeues its waiter
    /// for next time by virtue of being dropped.
    async fn checkout_or_connect(
        &self,
        key: &PoolKey,
    ) -> Result<Pooled<PoolClient, PoolKey>, Error> {
        if !self.pool.is_enabled() {
            return self.connect(key).await;
        }

        let checkout = self.pool.checkout(key.clone());
        let connect = self.connect(key);
        futures_util::pin_mut!(checkout);
        futures_util::pin_mut!(connect);

        match futures_util::future::select(checkout, connect).await {
            futures_util::future::Either::Left((Ok(pooled), _)) => Ok(pooled),
            futures_util::future::Either::Left((Err(_), connecting)) => connecting.await,
            futures_util::future::Either::Right((connected, _)) => connected,
        }
    }

    async fn connect(&self, key: &PoolKey) -> Result<Pooled<PoolClient, PoolKey>, Error> {
        let io = self.connector.connect(&key.1).await?;
        let bytes_read = Arc::new(AtomicUsize::new(0));
        let io = CountingIo {
            inner: io,
            bytes_read: bytes_read.clone(),
        };

        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| Error::connect(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(%err, "connection driver exited with error");
            }
        });

        Ok(self
            .pool
            .pooled(key.clone(), PoolClient { sender, bytes_read }))
    }
}

fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes)
        .map_err(|never: Infallible| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ClientConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        let mut config = ClientConfig::default();
        config.connect_timeout = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_read_timeout() {
        let mut config = ClientConfig::default();
        config.read_timeout = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_idle_timeout_with_pooling_enabled() {
        let mut config = ClientConfig::default();
        config.idle_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn allows_zero_idle_timeout_with_pooling_disabled() {
        let mut config = ClientConfig::default();
        config.idle_timeout = Duration::ZERO;
        config.max_idle_per_host = 0;
        config.validate().unwrap();
    }
}
