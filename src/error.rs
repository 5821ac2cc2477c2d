//! Error types shared by the poll engine, the meter and the Modbus clients.
use crate::{protocol as proto, store};

/// Represents all possible errors of a poll cycle or a register write.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    ProtocolError(#[from] proto::Error),

    /// Wraps `store::Error`.
    #[error(transparent)]
    StoreError(#[from] store::Error),

    /// Wraps `tokio_modbus::ExceptionCode`.
    #[error(transparent)]
    TokioExceptionError(#[from] tokio_modbus::ExceptionCode),

    /// Wraps `tokio_modbus::Error`.
    #[error(transparent)]
    TokioError(#[from] tokio_modbus::Error),
}

/// The result type for meter operations.
pub type Result<T> = std::result::Result<T, Error>;
