use std::fmt;

/// Why a read timed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadTimeoutKind {
    /// No response headers arrived within the configured window.
    Headers,
    /// No further body bytes arrived within the configured window.
    Body,
}

impl fmt::Display for ReadTimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadTimeoutKind::Headers => "headers",
            ReadTimeoutKind::Body => "body",
        })
    }
}

/// Everything that can go wrong while running a request through the client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request's URL could not be turned into a valid request.
    #[error("invalid url: {0}")]
    Url(String),

    /// Failed to obtain a usable connection (connect failure, or the retry
    /// budget for an idempotent request was exhausted).
    #[error("connect error: {0}")]
    Connect(String),

    /// Neither headers nor a body chunk arrived before the configured
    /// read timeout elapsed.
    #[error("read timeout waiting for {0}")]
    ReadTimeout(ReadTimeoutKind),

    /// The peer sent something that wasn't a supported HTTP version.
    #[error("unsupported or malformed HTTP version")]
    HttpVersion,

    /// Malformed chunked-transfer framing.
    #[error("chunked transfer error: {0}")]
    Chunk(String),

    /// A `Content-Length` header was missing, duplicated, or unparsable.
    #[error("content-length error: {0}")]
    ContentLength(String),

    /// A header line (or the header block as a whole) exceeded the
    /// configured size limit.
    #[error("header too large")]
    HeaderSpace,

    /// The request or status line exceeded the configured size limit.
    #[error("start line too large")]
    TopLineSpace,

    /// An unsupported or conflicting `Transfer-Encoding` value was seen.
    #[error("transfer-encoding error: {0}")]
    TransferCode(String),

    /// More pipelined responses arrived than requests were sent.
    #[error("too many messages on the connection")]
    TooManyMsgs,

    /// A response that must not carry a body (1xx, 204, 304, or a response
    /// to HEAD) had one anyway.
    #[error("body not allowed for this response")]
    BodyForbidden,

    /// Surfaced unchanged from the underlying HTTP/1.1 engine.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// Surfaced unchanged from the transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The connection pool was constructed with pooling disabled
    /// (`max_idle_per_host == 0`) and no idle connection was available.
    #[error("connection pool is disabled")]
    PoolDisabled,

    /// A `ClientConfig` failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn url(msg: impl Into<String>) -> Self {
        Error::Url(msg.into())
    }

    pub(crate) fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }

    /// Best-effort classification of a `hyper::Error` into the taxonomy
    /// above. `hyper` does not expose structured parse-error variants at
    /// this API layer, so this inspects `is_parse_*`/`is_*` probes and the
    /// error's `Display` text; anything unrecognized is returned as
    /// [`Error::Http`] unchanged.
    pub(crate) fn from_hyper(err: hyper::Error) -> Self {
        if err.is_parse_too_large() {
            return Error::HeaderSpace;
        }
        if err.is_parse_status() {
            return Error::HttpVersion;
        }
        if err.is_incomplete_message() {
            return Error::ContentLength("connection closed before the body completed".into());
        }

        let text = err.to_string();
        if text.contains("transfer-encoding") || text.contains("chunk") {
            return Error::Chunk(text);
        }
        if text.contains("content-length") {
            return Error::ContentLength(text);
        }

        Error::Http(err)
    }
}
