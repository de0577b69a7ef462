//!
//! Error kinds surfaced by every layer of the core: media dispatch, provisioning,
//! and the write-caching aggregator. Device errors are wrapped rather than
//! discarded so the caller can inspect `source` for the underlying `nix`/`io`
//! failure.
use snafu::Snafu;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ZtlError {
    #[snafu(display("failed to open device {}", name))]
    NoDevice { name: String },

    #[snafu(display("failed to read device geometry for {}", name))]
    NoGeometry { name: String },

    #[snafu(display("opcode {} is not valid for synchronous submission", opcode))]
    InvalidOpcode { opcode: u8 },

    #[snafu(display("zone report failed: {}", reason))]
    ReportErr { reason: String },

    #[snafu(display("failed to poke async context: {}", reason))]
    PokeErr { reason: String },

    #[snafu(display("failed to query outstanding commands: {}", reason))]
    OutsErr { reason: String },

    #[snafu(display("failed waiting on async context: {}", reason))]
    WaitErr { reason: String },

    #[snafu(display("failed to initialize async context: {}", reason))]
    AsynchErr { reason: String },

    #[snafu(display("failed to start completion thread"))]
    AsynchTh,

    #[snafu(display("group {} is invalid or has no available zones", grp))]
    GroupErr { grp: u32 },

    #[snafu(display("mempool exhausted for pool {:?}", key))]
    MempoolExhausted { key: crate::mempool::PoolKey },

    #[snafu(display("provisioning failed: nsec {} type {}", nsec, ptype))]
    ProvisionFail { nsec: u32, ptype: u16 },

    #[snafu(display("pre-submit failure on ucmd {}", id))]
    WcaSErr { id: u64 },

    #[snafu(display("mid-submit failure on ucmd {}", id))]
    WcaS2Err { id: u64 },

    #[snafu(display("index upsert failed for id {}", id))]
    MapErr { id: u64 },

    #[snafu(display(
        "non-contiguous media range for ucmd {}: ZTL-managed mapping does not support multi-piece entries",
        id
    ))]
    AppendErr { id: u64 },

    #[snafu(display("core already initialized"))]
    AlreadyInitialized,

    #[snafu(display("core not initialized"))]
    NotInitialized,

    #[snafu(display("I/O error: {}", source))]
    Io { source: ErrorKindWrapper },
}

/// `std::io::Error` does not implement `Clone`, but `ZtlError` needs to (it is
/// handed out through shared `Ucmd` state read from multiple threads). We keep
/// only the `ErrorKind`, which is enough to report the failure class.
pub mod io_error_kind {
    use std::io::ErrorKind;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorKindWrapper(pub ErrorKind);

    impl std::fmt::Display for ErrorKindWrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl From<std::io::Error> for ErrorKindWrapper {
        fn from(e: std::io::Error) -> Self {
            ErrorKindWrapper(e.kind())
        }
    }

    impl std::error::Error for ErrorKindWrapper {}
}

pub use io_error_kind::ErrorKindWrapper;

impl From<std::io::Error> for ZtlError {
    fn from(source: std::io::Error) -> Self {
        ZtlError::Io {
            source: source.into(),
        }
    }
}

impl From<nix::Error> for ZtlError {
    fn from(source: nix::Error) -> Self {
        ZtlError::AsynchErr {
            reason: source.to_string(),
        }
    }
}
