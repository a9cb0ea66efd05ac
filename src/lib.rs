//! An asynchronous HTTP/1.1 client engine: a connection pool keyed by
//! scheme and authority, and a per-request exchange that frames, sends,
//! and retries requests over it.
//!
//! The wire-level parsing and framing is delegated to
//! [`hyper::client::conn::http1`]; this crate is responsible for pooling
//! connections, deciding when a request is safe to retry, enforcing
//! connect/read timeouts, and the ergonomic [`Client`] façade over all of
//! that.
//!
//! ```no_run
//! # async fn run() -> Result<(), fetchcore::Error> {
//! let client = fetchcore::Client::new();
//! let resp = client.get("http://example.com/".parse().unwrap()).await?;
//! println!("{}", resp.status());
//! # Ok(())
//! # }
//! ```

mod common;
pub mod connect;
pub mod error;
pub mod pool;
pub mod rt;
mod uri;

pub mod client;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use error::Error;
