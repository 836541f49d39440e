use crate::config::{Secret, SmtpConfig};
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, DEFAULT_MECHANISMS};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::Address;
use std::time::Duration;

/// Failure of one transport step, tagged with the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Send to {recipient} failed: {message}")]
    Send { recipient: String, message: String },
}

/// A mail-submission session: connect, authenticate, send many, close.
///
/// The dispatch loop owns its transport exclusively for a whole run.
#[async_trait]
pub trait MailTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn authenticate(&mut self, user: &str, secret: &Secret) -> Result<(), TransportError>;

    async fn send(&mut self, from: &Address, to: &Address, raw: &[u8])
        -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// SMTP submission with a mandatory STARTTLS upgrade.
pub struct SmtpSession {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    hello_name: ClientId,
    connection: Option<AsyncSmtpConnection>,
}

impl SmtpSession {
    pub fn new(config: &SmtpConfig) -> Self {
        Self {
            host: config.host.trim().to_string(),
            port: config.port,
            timeout: (config.timeout_seconds > 0)
                .then(|| Duration::from_secs(config.timeout_seconds)),
            hello_name: ClientId::default(),
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

#[async_trait]
impl MailTransport for SmtpSession {
    async fn connect(&mut self) -> Result<(), TransportError> {
        log::info!("🔌 Connecting to {}:{}", self.host, self.port);
        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.host.as_str(), self.port),
            self.timeout,
            &self.hello_name,
            None,
            None,
        )
        .await
        .map_err(|e| TransportError::Connect(format!("{}:{}: {e}", self.host, self.port)))?;

        if !connection.can_starttls() {
            connection.abort().await;
            return Err(TransportError::Connect(format!(
                "{} does not offer STARTTLS",
                self.host
            )));
        }

        let tls_parameters = TlsParameters::new(self.host.clone())
            .map_err(|e| TransportError::Connect(format!("TLS parameters error: {e}")))?;
        connection
            .starttls(tls_parameters, &self.hello_name)
            .await
            .map_err(|e| TransportError::Connect(format!("STARTTLS failed: {e}")))?;

        log::debug!("TLS established with {}", self.host);
        self.connection = Some(connection);
        Ok(())
    }

    async fn authenticate(&mut self, user: &str, secret: &Secret) -> Result<(), TransportError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::Auth("not connected".to_string()))?;
        let credentials = Credentials::new(user.to_string(), secret.expose().to_string());
        connection
            .auth(DEFAULT_MECHANISMS, &credentials)
            .await
            .map_err(|e| TransportError::Auth(e.to_string()))?;
        log::info!("🔐 Authenticated as {user}");
        Ok(())
    }

    async fn send(
        &mut self,
        from: &Address,
        to: &Address,
        raw: &[u8],
    ) -> Result<(), TransportError> {
        let send_error = |message: String| TransportError::Send {
            recipient: to.to_string(),
            message,
        };
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| send_error("not connected".to_string()))?;
        let envelope = Envelope::new(Some(from.clone()), vec![to.clone()])
            .map_err(|e| send_error(e.to_string()))?;
        let response = connection
            .send(&envelope, raw)
            .await
            .map_err(|e| send_error(e.to_string()))?;
        log::debug!("Server accepted message for {to}: {:?}", response.code());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut connection) = self.connection.take() {
            connection
                .quit()
                .await
                .map_err(|e| TransportError::Connect(format!("QUIT failed: {e}")))?;
            log::debug!("Session with {} closed", self.host);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_from_config() {
        let config = SmtpConfig {
            host: " smtp.example.com ".to_string(),
            port: 2525,
            timeout_seconds: 0,
            password: Secret::new("x"),
        };
        let session = SmtpSession::new(&config);
        assert_eq!(session.host, "smtp.example.com");
        assert_eq!(session.port, 2525);
        assert!(session.timeout.is_none());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_unconnected_session_errors_by_kind() {
        let mut session = SmtpSession::new(&SmtpConfig::default());
        let from: Address = "me@example.com".parse().unwrap();
        let to: Address = "you@example.com".parse().unwrap();

        assert!(matches!(
            session.authenticate("me@example.com", &Secret::new("pw")).await,
            Err(TransportError::Auth(_))
        ));
        assert!(matches!(
            session.send(&from, &to, b"Subject: x\r\n\r\nbody").await,
            Err(TransportError::Send { ref recipient, .. }) if recipient == "you@example.com"
        ));
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = SmtpSession::new(&SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout_seconds: 2,
            password: Secret::default(),
        });
        assert!(matches!(
            session.connect().await,
            Err(TransportError::Connect(_))
        ));
        assert!(!session.is_connected());
    }
}
