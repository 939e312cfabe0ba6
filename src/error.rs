//! Call-related error types.

use thiserror::Error;

use crate::auth::AuthError;
use crate::invite::DeliveryError;
use crate::media::MediaError;
use crate::signaling::TransportError;
use crate::state::InvalidTransition;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("too many concurrent calls")]
    TooManyCalls,

    #[error("call session no longer running: {0}")]
    SessionGone(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaError),
}
