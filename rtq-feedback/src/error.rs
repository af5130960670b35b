use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("end of stream")]
    EndOfStream,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("malformed feedback packet: {0}")]
    MalformedFeedback(String),
    #[error("malformed data packet: {0}")]
    MalformedData(String),
    #[error("congestion estimator: {0}")]
    Estimator(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Reports whether the error must tear down the write path.
    ///
    /// Transient send failures are suppressed by the writer; everything else,
    /// including the end-of-stream sentinel, is propagated so the media source
    /// can be stopped.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::SendFailed(_) => false,
            Error::Io(err) => !matches!(
                err.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::AddrNotAvailable
            ),
            _ => true,
        }
    }
}
