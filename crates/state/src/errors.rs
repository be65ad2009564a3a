use std::fmt;

use crate::{StateField, Verbosity};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Fields required by the verbosity are absent. An empty field list means the whole
    /// state is missing.
    #[error("{}", missing_message(.verbosity, .fields))]
    MissingState { verbosity: Option<Verbosity>, fields: Vec<StateField> },
    #[error("invalid value '{value}' for state field '{field}'{}", reason_suffix(.reason))]
    InvalidState { field: StateField, value: String, reason: Option<String> },
    #[error("error reading state: {0}")]
    ReadFailed(String),
    #[error("error writing state: {0}")]
    WriteFailed(String),
    #[error("internal state error: {0}")]
    Internal(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
}

fn missing_message(verbosity: &Option<Verbosity>, fields: &[StateField]) -> String {
    let mut out = String::new();
    if let Some(v) = verbosity {
        out.push_str(&format!("state verbosity is '{v}', but "));
    }
    if fields.is_empty() {
        out.push_str("the state is missing");
    } else {
        let names: Vec<_> = fields.iter().map(|f| f.name()).collect();
        out.push_str("following fields are missing in the state: ");
        out.push_str(&names.join(", "));
    }
    out
}

impl StateError {
    pub(crate) fn missing(verbosity: Verbosity, fields: Vec<StateField>) -> Self {
        StateError::MissingState { verbosity: Some(verbosity), fields }
    }

    pub(crate) fn invalid(field: StateField, value: impl fmt::Display, reason: Option<String>) -> Self {
        StateError::InvalidState { field, value: value.to_string(), reason }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StateError::MissingState { .. } => "MissingState",
            StateError::InvalidState { .. } => "InvalidState",
            StateError::ReadFailed(_) => "ReadFailed",
            StateError::WriteFailed(_) => "WriteFailed",
            StateError::Internal(_) => "InternalError",
        }
    }

    pub fn is_missing_state(&self) -> bool {
        matches!(self, StateError::MissingState { .. })
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, StateError::InvalidState { .. })
    }
}
