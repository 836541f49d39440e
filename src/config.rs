use crate::composer::{AttachmentBlob, MessageTemplate};
use crate::error::{DispatchError, DispatchResult};
use lettre::message::Mailbox;
use lettre::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

pub const PASSWORD_ENV: &str = "BULK_MAILER_PASSWORD";
pub const EMAIL_DELAY_RANGE: RangeInclusive<u64> = 2..=10;
pub const BATCH_DELAY_RANGE: RangeInclusive<u64> = 1..=20;
pub const SUGGESTED_BATCH_SIZES: [usize; 3] = [50, 75, 100];

/// A credential that never shows up in `Debug` output or error text.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub sender: SenderConfig,
    pub message: MessageConfig,
    pub attachment: Option<AttachmentConfig>,
    pub pacing: PacingConfig,
    pub recipients: RecipientsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String, // Submission server, spoken to with STARTTLS
    pub port: u16,
    pub timeout_seconds: u64,
    pub password: Secret, // App password; BULK_MAILER_PASSWORD overrides
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            timeout_seconds: 30,
            password: Secret::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub address: String, // Also the SMTP login
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    pub subject: String,
    pub body: Option<String>,      // Uses {name} and {company}
    pub body_file: Option<String>, // Read when body is absent
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    pub path: String,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub batch_size: usize,
    pub per_email_delay_seconds: u64,
    pub per_batch_delay_minutes: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            batch_size: 50,
            per_email_delay_seconds: 4,
            per_batch_delay_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipientsConfig {
    pub table: Option<String>, // .csv or .xlsx
}

/// Login used for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCredentials {
    pub username: String,
    pub secret: Secret,
}

/// Frozen pacing and credentials for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub batch_size: usize,
    pub per_email_delay: Duration,
    pub per_batch_delay: Duration,
    pub credentials: RunCredentials,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Takes the SMTP password from the environment when it is set there.
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.trim().is_empty() {
                log::debug!("Using SMTP password from {PASSWORD_ENV}");
                self.smtp.password = Secret::new(password);
            }
        }
    }

    /// Checks every required input at once and reports all problems together.
    pub fn validate(&self) -> DispatchResult<()> {
        let mut problems = self.content_problems();
        if self.smtp.password.is_empty() {
            problems.push(format!("smtp.password is empty (set it or {PASSWORD_ENV})"));
        }
        self.report(problems)
    }

    /// Same as [`Config::validate`] minus the SMTP password, for dry runs.
    pub fn validate_content(&self) -> DispatchResult<()> {
        self.report(self.content_problems())
    }

    fn content_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.smtp.host.trim().is_empty() {
            problems.push("smtp.host is empty".to_string());
        }
        if self.smtp.port == 0 {
            problems.push("smtp.port must be non-zero".to_string());
        }
        if self.sender.address.trim().is_empty() {
            problems.push("sender.address is empty".to_string());
        } else if self.sender.address.trim().parse::<Address>().is_err() {
            problems.push(format!(
                "sender.address '{}' is not an email address",
                self.sender.address
            ));
        }
        if self.message.subject.trim().is_empty() {
            problems.push("message.subject is empty".to_string());
        }
        let has_body = self.message.body.as_deref().is_some_and(|b| !b.trim().is_empty());
        let has_body_file = self.message.body_file.as_deref().is_some_and(|f| !f.trim().is_empty());
        if !has_body && !has_body_file {
            problems.push("message.body or message.body_file is required".to_string());
        }
        if self.recipients.table.as_deref().map_or(true, |t| t.trim().is_empty()) {
            problems.push("recipients.table is empty".to_string());
        }
        if let Some(attachment) = &self.attachment {
            if attachment.path.trim().is_empty() {
                problems.push("attachment.path is empty".to_string());
            }
        }
        if self.pacing.batch_size == 0 {
            problems.push("pacing.batch_size must be positive".to_string());
        }
        if !EMAIL_DELAY_RANGE.contains(&self.pacing.per_email_delay_seconds) {
            problems.push(format!(
                "pacing.per_email_delay_seconds must be within {}..={}",
                EMAIL_DELAY_RANGE.start(),
                EMAIL_DELAY_RANGE.end()
            ));
        }
        if !BATCH_DELAY_RANGE.contains(&self.pacing.per_batch_delay_minutes) {
            problems.push(format!(
                "pacing.per_batch_delay_minutes must be within {}..={}",
                BATCH_DELAY_RANGE.start(),
                BATCH_DELAY_RANGE.end()
            ));
        }
        problems
    }

    fn report(&self, problems: Vec<String>) -> DispatchResult<()> {
        if problems.is_empty() {
            if !SUGGESTED_BATCH_SIZES.contains(&self.pacing.batch_size) {
                log::warn!(
                    "Unusual batch size {} (suggested: {:?})",
                    self.pacing.batch_size,
                    SUGGESTED_BATCH_SIZES
                );
            }
            Ok(())
        } else {
            Err(DispatchError::Config(problems.join("; ")))
        }
    }

    pub fn run_config(&self) -> DispatchResult<RunConfig> {
        self.validate()?;
        Ok(self.freeze())
    }

    /// Pacing for a dry run; the credentials carry no secret.
    pub fn preview_config(&self) -> DispatchResult<RunConfig> {
        self.validate_content()?;
        let mut config = self.freeze();
        config.credentials.secret = Secret::default();
        Ok(config)
    }

    fn freeze(&self) -> RunConfig {
        RunConfig {
            batch_size: self.pacing.batch_size,
            per_email_delay: Duration::from_secs(self.pacing.per_email_delay_seconds),
            per_batch_delay: Duration::from_secs(self.pacing.per_batch_delay_minutes * 60),
            credentials: RunCredentials {
                username: self.sender.address.trim().to_string(),
                secret: self.smtp.password.clone(),
            },
        }
    }

    pub fn sender_mailbox(&self) -> DispatchResult<Mailbox> {
        let address: Address = self
            .sender
            .address
            .trim()
            .parse()
            .map_err(|_| DispatchError::InvalidAddress(self.sender.address.clone()))?;
        let name = self
            .sender
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        Ok(Mailbox::new(name, address))
    }

    pub fn body_template(&self) -> DispatchResult<String> {
        if let Some(body) = self.message.body.as_deref().filter(|b| !b.trim().is_empty()) {
            return Ok(body.to_string());
        }
        match self.message.body_file.as_deref() {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                DispatchError::Config(format!("cannot read message.body_file {path}: {e}"))
            }),
            None => Err(DispatchError::Config(
                "message.body or message.body_file is required".to_string(),
            )),
        }
    }

    pub fn message_template(&self) -> DispatchResult<MessageTemplate> {
        MessageTemplate::new(self.message.subject.trim(), &self.body_template()?)
    }

    /// Reads the attachment once, if one is configured.
    pub fn load_attachment(&self) -> DispatchResult<Option<AttachmentBlob>> {
        match &self.attachment {
            Some(attachment) => {
                AttachmentBlob::from_path(&attachment.path, attachment.filename.as_deref())
                    .map(Some)
                    .map_err(|e| {
                        DispatchError::Config(format!(
                            "cannot read attachment {}: {e}",
                            attachment.path
                        ))
                    })
            }
            None => Ok(None),
        }
    }
}
