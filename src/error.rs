use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    ICEError(#[from] webrtc_ice::Error),
    #[error(transparent)]
    RedisError(#[from] redis::RedisError),
    #[error(transparent)]
    JSONError(#[from] serde_json::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    ConfigError(#[from] crate::config::ConfigError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    RoomError(#[from] RoomError),
    #[error(transparent)]
    AdmissionError(#[from] AdmissionError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RoomError {
    pub kind: RoomErrorKind,
    pub message: String,
}

/// Rejections raised before a [`crate::peer::PeerSession`] is registered in a room.
#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AdmissionError {
    pub kind: AdmissionErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("peer connection error")]
    PeerConnectionError,
    #[error("local description error")]
    LocalDescriptionError,
    #[error("signaling closed error")]
    SignalingClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomErrorKind {
    #[error("room closed error")]
    RoomClosed,
    #[error("peer not found error")]
    PeerNotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionErrorKind {
    #[error("missing user id")]
    MissingUserId,
    #[error("user busy")]
    UserBusy,
}

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_room(message: String, kind: RoomErrorKind) -> Error {
        Error::RoomError(RoomError { kind, message })
    }

    pub fn new_admission(message: String, kind: AdmissionErrorKind) -> Error {
        Error::AdmissionError(AdmissionError { kind, message })
    }

    pub fn is_admission(&self) -> bool {
        matches!(self, Error::AdmissionError(_))
    }

    pub fn is_room_closed(&self) -> bool {
        matches!(
            self,
            Error::RoomError(RoomError {
                kind: RoomErrorKind::RoomClosed,
                ..
            })
        )
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("call_relay::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("call_relay::RoomError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("call_relay::AdmissionError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
