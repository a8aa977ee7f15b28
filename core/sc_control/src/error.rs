use crate::storage::StorageError;
use sc_dynamixel::BusError;
use sc_units::{MotorId, UnitsError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Coarse classification surfaced to API layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Transport,
    NotFound,
    Conflict,
    Storage,
}

/// One motor that did not accept a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorFailure {
    pub id: MotorId,
    pub message: String,
}

impl fmt::Display for MotorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "motor {}: {}", self.id, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("bus error: {0}")]
    Transport(#[from] BusError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("profile '{0}' is already playing")]
    AlreadyPlaying(String),
    #[error("profile '{0}' has no points")]
    EmptyProfile(String),
    #[error("torque command failed on {}", join(.0))]
    TorqueFailures(Vec<MotorFailure>),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn join(failures: &[MotorFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::EmptyProfile(_) => ErrorKind::InvalidInput,
            Self::Transport(_) | Self::TorqueFailures(_) => ErrorKind::Transport,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) | Self::AlreadyPlaying(_) => ErrorKind::Conflict,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<UnitsError> for ControlError {
    fn from(e: UnitsError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

/// Success flag plus a human readable message, the shape every write
/// operation is reported in to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            kind: None,
        }
    }
}

impl From<&ControlError> for CommandOutcome {
    fn from(e: &ControlError) -> Self {
        Self {
            success: false,
            message: e.to_string(),
            kind: Some(e.kind()),
        }
    }
}

impl<T> From<Result<T, ControlError>> for CommandOutcome {
    fn from(r: Result<T, ControlError>) -> Self {
        match r {
            Ok(_) => Self::ok("ok"),
            Err(e) => Self::from(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_variants_onto_the_taxonomy() {
        assert_eq!(ControlError::AlreadyPlaying("a".into()).kind(), ErrorKind::Conflict);
        assert_eq!(ControlError::EmptyProfile("a".into()).kind(), ErrorKind::InvalidInput);
        assert_eq!(
            ControlError::Transport(BusError::Timeout { id: Some(2) }).kind(),
            ErrorKind::Transport
        );
        assert_eq!(ControlError::from(UnitsError::UnknownMotor(9)).kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn torque_failures_list_every_motor() {
        let e = ControlError::TorqueFailures(vec![
            MotorFailure { id: 2, message: "timeout".into() },
            MotorFailure { id: 4, message: "crc".into() },
        ]);
        assert_eq!(e.to_string(), "torque command failed on motor 2: timeout, motor 4: crc");
    }

    #[test]
    fn outcome_carries_message_and_kind() {
        let ok: CommandOutcome = Ok::<_, ControlError>(()).into();
        assert!(ok.success);
        let err: CommandOutcome = Err::<(), _>(ControlError::NotFound("profile 'x'".into())).into();
        assert!(!err.success);
        assert_eq!(err.message, "profile 'x' not found");
        assert_eq!(err.kind, Some(ErrorKind::NotFound));
    }
}
