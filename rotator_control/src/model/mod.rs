use pass_planner::PassPlannerError;
use thiserror::Error;

pub mod calibration;
pub mod tracking_manager;

pub type RotatorResult<T> = Result<T, RotatorError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RotatorError {
    #[error("ProtocolTimeout: {0}")]
    ProtocolTimeout(String),
    #[error("ProtocolError: {0}")]
    ProtocolError(String),
    #[error("OperationAborted: {0}")]
    OperationAborted(String),
    #[error("RotatorUnresponsive: {0}")]
    RotatorUnresponsive(String),
    #[error("InvalidTransition: {event} is not allowed in {state}")]
    InvalidTransition { state: String, event: String },
    #[error("InvalidParkAzimuth: {0} (expected a multiple of 15 from 0 to 345)")]
    InvalidParkAzimuth(i64),
    #[error("SerialError: {0}")]
    SerialError(String),
    #[error("ConfigError: {0}")]
    ConfigError(String),
    #[error("PlannerError: {0}")]
    Planner(#[from] PassPlannerError),
}

impl From<crate::config::ConfigError> for RotatorError {
    fn from(e: crate::config::ConfigError) -> Self {
        RotatorError::ConfigError(e.to_string())
    }
}
