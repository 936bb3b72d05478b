use std::sync::Arc;

/// Result alias that carries the custom [`LiveSignalError`] type.
pub type Result<T> = std::result::Result<T, LiveSignalError>;

/// Common error type for the core crate.
///
/// Device-layer failures stay local to the subsystem that raised them. They
/// are reported through that subsystem's error observer and reflected in its
/// state value; they never cross from audio into MIDI or back.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LiveSignalError {
    /// Capture or MIDI access was refused by the platform or the user.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The platform exposes no MIDI capability at all.
    #[error("platform does not support {0}")]
    UnsupportedPlatform(String),
    /// A requested device or port id does not exist (or vanished mid-negotiation).
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    /// The capture stream or MIDI session could not be acquired.
    #[error("stream acquisition failed: {0}")]
    StreamAcquisition(String),
    /// Listing devices failed independently of acquiring a stream.
    #[error("device enumeration failed: {0}")]
    Enumeration(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// A shared lock was poisoned by a panicking callback.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// An in-flight initialize was superseded by a stop.
    #[error("initialization abandoned after stop")]
    Abandoned,
    /// Free-form message for errors that fit no other variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("json: {0}")]
    Json(#[source] Arc<serde_json::Error>),
}

/// Copyable classification of a [`LiveSignalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    UnsupportedPlatform,
    DeviceNotFound,
    StreamAcquisition,
    Enumeration,
    InvalidConfig,
    InvalidInput,
    Poisoned,
    Abandoned,
    Other,
}

impl LiveSignalError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::StreamAcquisition(_) => ErrorKind::StreamAcquisition,
            Self::Enumeration(_) => ErrorKind::Enumeration,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Poisoned(_) => ErrorKind::Poisoned,
            Self::Abandoned => ErrorKind::Abandoned,
            Self::Message(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Other,
        }
    }
}

impl From<&str> for LiveSignalError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LiveSignalError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

// Errors are handed to observers by value, so non-`Clone` sources are
// shared behind an `Arc`.
impl From<std::io::Error> for LiveSignalError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for LiveSignalError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl From<realfft::FftError> for LiveSignalError {
    fn from(value: realfft::FftError) -> Self {
        Self::msg(format!("fft: {value}"))
    }
}

#[cfg(feature = "midir")]
impl From<midir::InitError> for LiveSignalError {
    fn from(value: midir::InitError) -> Self {
        Self::UnsupportedPlatform(format!("MIDI ({value})"))
    }
}

#[cfg(feature = "midir")]
impl<T> From<midir::ConnectError<T>> for LiveSignalError {
    fn from(value: midir::ConnectError<T>) -> Self {
        Self::StreamAcquisition(value.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::SendError> for LiveSignalError {
    fn from(value: midir::SendError) -> Self {
        Self::msg(format!("MIDI send: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_taxonomy() {
        assert_eq!(
            LiveSignalError::PermissionDenied("mic".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(LiveSignalError::from("boom").kind(), ErrorKind::Other);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = LiveSignalError::from(io);
        assert!(format!("{err}").contains("gone"));
    }

    #[test]
    fn wrapped_errors_keep_their_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err = LiveSignalError::from(io).clone();
        let source = err.source().expect("io source");
        assert_eq!(source.to_string(), "locked");

        let json = serde_json::from_str::<u8>("nope").unwrap_err();
        let err = LiveSignalError::from(json);
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(err.source().is_some());
    }
}
