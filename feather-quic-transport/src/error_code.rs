use thiserror::Error;

// https://www.rfc-editor.org/rfc/rfc9000.html#section-20.1
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    NoError = 0x00,
    InternalError = 0x01,
    ConnectionRefused = 0x02,
    FlowControlError = 0x03,
    StreamLimitError = 0x04,
    StreamStateError = 0x05,
    FinalSizeError = 0x06,
    FrameEncodingError = 0x07,
    TransportParameterError = 0x08,
    ConnectionIdLimitError = 0x09,
    ProtocolViolation = 0x0a,
    InvalidToken = 0x0b,
    ApplicationError = 0x0c,
    CryptoBufferExceeded = 0x0d,
    KeyUpdateError = 0x0e,
    AeadLimitReached = 0x0f,
    NoViablePath = 0x10,
}

impl From<TransportErrorCode> for u64 {
    fn from(code: TransportErrorCode) -> Self {
        code as u16 as u64
    }
}

/// Errors raised by this endpoint that never go on the wire as is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalErrorCode {
    ConnectionAbandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicErrorCode {
    Application(u64),
    Transport(TransportErrorCode),
    Local(LocalErrorCode),
}

/// Connection fatal failures of the send path, carried inside `anyhow::Error`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuicTransportError {
    #[error("{reason} (local error {code:?})")]
    Local { code: LocalErrorCode, reason: String },
    #[error("{reason} (transport error {code:?})")]
    Transport {
        code: TransportErrorCode,
        reason: String,
    },
}

impl QuicTransportError {
    pub fn error_code(&self) -> QuicErrorCode {
        match self {
            QuicTransportError::Local { code, .. } => QuicErrorCode::Local(*code),
            QuicTransportError::Transport { code, .. } => QuicErrorCode::Transport(*code),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            QuicTransportError::Local { reason, .. } => reason,
            QuicTransportError::Transport { reason, .. } => reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_downcast() {
        let err: anyhow::Error = QuicTransportError::Local {
            code: LocalErrorCode::ConnectionAbandoned,
            reason: "Error on socket write Network is unreachable".to_string(),
        }
        .into();

        let quic_err = err.downcast_ref::<QuicTransportError>().unwrap();
        assert_eq!(
            quic_err.error_code(),
            QuicErrorCode::Local(LocalErrorCode::ConnectionAbandoned)
        );
        assert!(quic_err.reason().starts_with("Error on socket write"));
    }
}
