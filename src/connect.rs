use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http::uri::Authority;
use tokio::net::TcpStream;

use crate::error::Error;
use crate::rt::TokioIo;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A pluggable outbound TCP connector.
///
/// The default [`HttpConnector`] resolves and connects with
/// `tokio::net::TcpStream`; tests substitute an in-process connector that
/// hands back a loopback socket pair instead.
pub trait Connect: Send + Sync + 'static {
    type Io: hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static;

    fn connect(&self, authority: &Authority) -> BoxFuture<'_, Result<Self::Io, Error>>;
}

/// Default [`Connect`] implementation, backed by `tokio::net::TcpStream`.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    connect_timeout: Option<Duration>,
}

impl HttpConnector {
    pub fn new() -> Self {
        HttpConnector {
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Option<Duration>) -> Self {
        HttpConnector { connect_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connect for HttpConnector {
    type Io = TokioIo<TcpStream>;

    fn connect(&self, authority: &Authority) -> BoxFuture<'_, Result<Self::Io, Error>> {
        let host = authority.host().to_owned();
        let port = authority.port_u16().unwrap_or(80);
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let connect = TcpStream::connect((host.as_str(), port));
            let stream = match connect_timeout {
                Some(dur) => tokio::time::timeout(dur, connect)
                    .await
                    .map_err(|_| Error::connect(format!("timed out connecting to {host}:{port}")))?
                    .map_err(Error::Io)?,
                None => connect.await.map_err(Error::Io)?,
            };
            stream.set_nodelay(true).map_err(Error::Io)?;
            Ok(TokioIo::new(stream))
        })
    }
}
