use {
    relay_protocol::{ServerFrame, error_codes},
    relay_store::StoreError,
};

use crate::auth::AuthError;

/// Failures reported back to the connection that caused them.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message could not be stored: {0}")]
    Persistence(#[from] StoreError),

    #[error("message {message_id} was stored but could not be pushed to {recipient_id}")]
    DeliveryBestEffortFailure {
        message_id: String,
        recipient_id: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => error_codes::UNAUTHENTICATED,
            Self::InvalidMessage(_) => error_codes::INVALID_MESSAGE,
            Self::Persistence(_) => error_codes::PERSISTENCE_ERROR,
            Self::DeliveryBestEffortFailure { .. } => error_codes::DELIVERY_FAILED,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
        }
    }

    pub fn to_frame(&self) -> ServerFrame {
        let message_id = match self {
            Self::DeliveryBestEffortFailure { message_id, .. } => Some(message_id.clone()),
            _ => None,
        };
        ServerFrame::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_constants() {
        assert_eq!(
            RelayError::from(AuthError::Expired).code(),
            "unauthenticated"
        );
        assert_eq!(
            RelayError::InvalidMessage("empty".into()).code(),
            "invalid_message"
        );
        assert_eq!(
            RelayError::from(StoreError::Unavailable("closed".into())).code(),
            "persistence_error"
        );
        assert_eq!(
            RelayError::InvalidRequest("bad".into()).code(),
            "invalid_request"
        );
    }

    #[test]
    fn delivery_failure_frame_carries_message_id() {
        let err = RelayError::DeliveryBestEffortFailure {
            message_id: "m1".into(),
            recipient_id: "2".into(),
        };
        let ServerFrame::Error {
            code, message_id, ..
        } = err.to_frame()
        else {
            panic!("expected error frame");
        };
        assert_eq!(code, "delivery_failed");
        assert_eq!(message_id.as_deref(), Some("m1"));
    }
}
