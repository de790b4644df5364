//! definition of the general ethercat error type

use std::sync::Arc;
use thiserror::Error;
use crate::can::SdoAbortCode;

/**
    general object reporting an unexpected result regarding ethercat communication

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it:

    - [Self::Configuration] and [Self::SizeMismatch] are not recoverable, the operation raising them is aborted and never retried
    - [Self::MailboxTimeout] and [Self::MailboxAbort] are only returned once the mailbox channel exhausted its retries, they concern one request and never the cyclic exchange
    - [Self::Watchdog] is handled by the scheduler's recovery, and only reaches the user through the fault callback once recovery failed
*/
#[derive(Clone, Debug, Error)]
pub enum EthercatError {
    /// error caused by communication support
    ///
    /// these errors are exterior to this library
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// malformed topology, overlapping bit ranges, address collisions, inconsistent settings
    #[error("configuration error: {0}")]
    Configuration(String),

    /// a variable handle that was not produced by the layout of this process image
    #[error("variable out of range: {0}")]
    OutOfRange(&'static str),

    /// payload size inconsistent with the declared object size or complete access semantics
    ///
    /// `expected` is `None` when the slave rejected the length without telling the size it expects
    #[error("size mismatch: got {received} bytes, expected {}", .expected.map_or_else(|| "another size".to_string(), |n| n.to_string()))]
    SizeMismatch {expected: Option<usize>, received: usize},

    /// sdo request left unanswered after all retries
    #[error("mailbox timeout on slave {station} after {attempts} attempts (last abort: {last_abort:?})")]
    MailboxTimeout {station: u16, attempts: u32, last_abort: Option<SdoAbortCode>},

    /// sdo request rejected by the slave after all retries
    #[error("mailbox request aborted by slave {station}: {code}")]
    MailboxAbort {station: u16, code: SdoAbortCode},

    /// a mandatory slave missed cyclic exchanges
    #[error("watchdog: slave {station} missed {misses} cyclic exchanges")]
    Watchdog {station: u16, misses: u32},

    /// the master went to fault state and stopped issuing frames
    #[error("master in fault state: {0}")]
    Fault(String),

    /// the operation is not allowed in the current master state
    #[error("operation not allowed: {0}")]
    State(&'static str),

    /// error detected by the master in the ethercat communication
    ///
    /// these errors can generally not be fixed and the whole communication has to be restarted
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// error is due to too much time elapsed, but does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried.
    #[error("timeout: {0}")]
    Timeout(&'static str),
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=()> = core::result::Result<T, EthercatError>;

impl EthercatError {
    /// true for errors the mailbox channel shall retry
    pub fn retryable(&self) -> bool {
        matches!(self, Self::MailboxTimeout{..} | Self::MailboxAbort{..} | Self::Timeout(_))
    }
}

impl From<std::io::Error> for EthercatError {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl From<crate::data::PackingError> for EthercatError {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::BadAlignment(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}
