pub mod columns;
pub mod composer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod progress;
pub mod recipients;
pub mod table;
pub mod transport;

pub use columns::{resolve, CanonicalField, ColumnMapping};
pub use composer::{AttachmentBlob, Composer, MessageTemplate, Payload};
pub use config::{Config, RunConfig, Secret};
pub use dispatch::{run, HaltReason, RunOutcome, RunState, RunSummary};
pub use error::{DispatchError, DispatchResult};
pub use progress::{LogReporter, ProgressReporter};
pub use recipients::{build, Recipient, RecipientSet};
pub use table::RawTable;
pub use transport::{MailTransport, SmtpSession, TransportError};
