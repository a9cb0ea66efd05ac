//! Adapters binding the `tokio` runtime to the `hyper::rt` traits this crate
//! and `hyper`'s own connection machinery are written against.

mod tokio;

pub use self::tokio::{TokioExecutor, TokioIo, TokioTimer};
