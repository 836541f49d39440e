use crate::columns::CanonicalField;
use crate::transport::TransportError;

/// Every way a run can fail, from reading the table to the last send.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid input table: {0}")]
    Input(String),

    #[error(
        "Could not detect column(s) {} in headers [{}]",
        join_fields(.missing),
        .headers.join(", ")
    )]
    Resolution {
        missing: Vec<CanonicalField>,
        headers: Vec<String>,
    },

    #[error("No valid recipients: every row is missing a name, email or company")]
    EmptyResult,

    #[error("Malformed template: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Send to {recipient} failed: {message}")]
    Send { recipient: String, message: String },

    #[error("Invalid email address '{0}'")]
    InvalidAddress(String),

    #[error("Message build error: {0}")]
    Message(String),

    #[error("Run cancelled by user")]
    Cancelled,
}

impl DispatchError {
    /// Errors raised before the first send; the run never starts.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DispatchError::Input(_)
                | DispatchError::Resolution { .. }
                | DispatchError::EmptyResult
                | DispatchError::Template(_)
                | DispatchError::Config(_)
                | DispatchError::Connect(_)
                | DispatchError::Auth(_)
        )
    }

    /// Mid-run errors that end the run in the halted state.
    pub fn is_halting(&self) -> bool {
        matches!(self, DispatchError::Send { .. } | DispatchError::Cancelled)
    }
}

impl From<TransportError> for DispatchError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Connect(message) => DispatchError::Connect(message),
            TransportError::Auth(message) => DispatchError::Auth(message),
            TransportError::Send { recipient, message } => {
                DispatchError::Send { recipient, message }
            }
        }
    }
}

fn join_fields(fields: &[CanonicalField]) -> String {
    fields
        .iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type DispatchResult<T> = Result<T, DispatchError>;
