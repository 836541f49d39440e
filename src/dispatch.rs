//! The batch dispatch loop.
//!
//! One run is strictly sequential: a single transport session, one recipient
//! at a time, a fixed pause after every send and a longer pause after every
//! full batch while recipients remain. The first failed send stops the whole
//! run; nothing is retried.

use crate::composer::Composer;
use crate::config::RunConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::progress::ProgressReporter;
use crate::recipients::RecipientSet;
use crate::transport::{MailTransport, TransportError};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a run stopped before reaching the last recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    SendFailed { recipient: String, message: String },
    Cancelled,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::SendFailed { recipient, message } => {
                write!(f, "send to {recipient} failed: {message}")
            }
            HaltReason::Cancelled => f.write_str("cancelled by user"),
        }
    }
}

impl From<HaltReason> for DispatchError {
    fn from(reason: HaltReason) -> Self {
        match reason {
            HaltReason::SendFailed { recipient, message } => {
                DispatchError::Send { recipient, message }
            }
            HaltReason::Cancelled => DispatchError::Cancelled,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Halted {
        reason: HaltReason,
    },
    Failed {
        #[serde(serialize_with = "display")]
        error: DispatchError,
    },
}

fn display<S: Serializer>(error: &DispatchError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Counters owned by the loop; reporters only ever see copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub sent_count: usize,
    pub total_count: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub outcome: RunOutcome,
    #[serde(flatten)]
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success)
    }

    pub fn sent(&self) -> usize {
        self.state.sent_count
    }

    pub fn total(&self) -> usize {
        self.state.total_count
    }
}

/// Total pacing wait for `count` successful sends, network time excluded.
pub fn planned_wait(count: usize, config: &RunConfig) -> Duration {
    if count == 0 || config.batch_size == 0 {
        return Duration::ZERO;
    }
    let pauses = (count - 1) / config.batch_size;
    config.per_email_delay * count as u32 + config.per_batch_delay * pauses as u32
}

/// Sends one message per recipient over a single session.
///
/// Session establishment failures come back as `Err` (`Connect` / `Auth`)
/// before anything is sent. Once sending has started, the run always ends
/// in a [`RunSummary`]: success, halted (send failure or cancellation) or
/// failed (anything else, e.g. an unusable address).
pub async fn run<T, R>(
    recipients: &RecipientSet,
    composer: &Composer,
    transport: &mut T,
    config: RunConfig,
    reporter: &mut R,
    cancel: &CancellationToken,
) -> DispatchResult<RunSummary>
where
    T: MailTransport + ?Sized,
    R: ProgressReporter + ?Sized,
{
    if config.batch_size == 0 {
        return Err(DispatchError::Config("batch size must be positive".to_string()));
    }

    let started_at = Utc::now();
    let mut state = RunState {
        total_count: recipients.len(),
        ..RunState::default()
    };

    transport.connect().await?;
    if let Err(error) = transport
        .authenticate(&config.credentials.username, &config.credentials.secret)
        .await
    {
        close_session(transport).await;
        return Err(error.into());
    }

    log::info!(
        "🚀 Sending {} email(s) in batches of {}",
        state.total_count,
        config.batch_size
    );
    let outcome = send_all(
        recipients, composer, transport, &config, reporter, cancel, &mut state,
    )
    .await;

    match &outcome {
        RunOutcome::Success => {
            close_session(transport).await;
            reporter.on_completed(state.sent_count, state.total_count);
        }
        RunOutcome::Halted { reason } => {
            state.last_error = Some(reason.to_string());
            reporter.on_halted(state.sent_count, state.total_count, &reason.to_string());
            close_session(transport).await;
        }
        RunOutcome::Failed { error } => {
            state.last_error = Some(error.to_string());
            reporter.on_halted(state.sent_count, state.total_count, &error.to_string());
            close_session(transport).await;
        }
    }

    Ok(RunSummary {
        outcome,
        state,
        started_at,
        finished_at: Utc::now(),
    })
}

async fn send_all<T, R>(
    recipients: &RecipientSet,
    composer: &Composer,
    transport: &mut T,
    config: &RunConfig,
    reporter: &mut R,
    cancel: &CancellationToken,
    state: &mut RunState,
) -> RunOutcome
where
    T: MailTransport + ?Sized,
    R: ProgressReporter + ?Sized,
{
    for recipient in recipients {
        if cancel.is_cancelled() {
            return RunOutcome::Halted {
                reason: HaltReason::Cancelled,
            };
        }

        // Batches follow the count actually sent, not row positions
        if state.sent_count % config.batch_size == 0 {
            reporter.on_batch_start(state.sent_count / config.batch_size + 1);
        }

        let payload = match composer.compose(recipient) {
            Ok(payload) => payload,
            Err(error) => return RunOutcome::Failed { error },
        };
        let raw = match payload.formatted() {
            Ok(raw) => raw,
            Err(error) => return RunOutcome::Failed { error },
        };

        if let Err(error) = transport.send(&payload.from.email, &payload.to, &raw).await {
            log::debug!("Send failure: {error}");
            let message = match error {
                TransportError::Send { message, .. } => message,
                other => other.to_string(),
            };
            return RunOutcome::Halted {
                reason: HaltReason::SendFailed {
                    recipient: recipient.email.clone(),
                    message,
                },
            };
        }

        state.sent_count += 1;
        reporter.on_item_sent(state.sent_count, state.total_count, recipient);

        if !pause(config.per_email_delay, cancel).await {
            return RunOutcome::Halted {
                reason: HaltReason::Cancelled,
            };
        }

        if state.sent_count % config.batch_size == 0 && state.sent_count < state.total_count {
            reporter.on_batch_pause(config.per_batch_delay);
            if !pause(config.per_batch_delay, cancel).await {
                return RunOutcome::Halted {
                    reason: HaltReason::Cancelled,
                };
            }
        }
    }

    RunOutcome::Success
}

/// Waits unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn close_session<T: MailTransport + ?Sized>(transport: &mut T) {
    if let Err(error) = transport.close().await {
        log::warn!("Failed to close mail session cleanly: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::resolve;
    use crate::composer::{AttachmentBlob, MessageTemplate};
    use crate::config::{RunCredentials, Secret};
    use crate::recipients::{build, Recipient};
    use crate::table::read_csv;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use lettre::Address;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingTransport {
        fail_connect: bool,
        fail_auth: bool,
        fail_send_at: Option<usize>, // 1-indexed attempt
        connected: bool,
        authenticated_as: Option<String>,
        attempts: usize,
        sent: Vec<(String, String, Vec<u8>)>,
        closed: usize,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.fail_connect {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            self.connected = true;
            Ok(())
        }

        async fn authenticate(
            &mut self,
            user: &str,
            secret: &Secret,
        ) -> Result<(), TransportError> {
            if self.fail_auth {
                return Err(TransportError::Auth("535 5.7.8 credentials rejected".to_string()));
            }
            assert_eq!(secret.expose(), "app-password");
            self.authenticated_as = Some(user.to_string());
            Ok(())
        }

        async fn send(
            &mut self,
            from: &Address,
            to: &Address,
            raw: &[u8],
        ) -> Result<(), TransportError> {
            assert!(self.connected && self.closed == 0);
            self.attempts += 1;
            if self.fail_send_at == Some(self.attempts) {
                return Err(TransportError::Send {
                    recipient: to.to_string(),
                    message: "421 4.7.0 try again later".to_string(),
                });
            }
            self.sent.push((from.to_string(), to.to_string(), raw.to_vec()));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed += 1;
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        BatchStart(usize),
        Sent(usize, usize),
        Pause(Duration),
        Halted(usize, usize, String),
        Completed(usize, usize),
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Vec<Event>,
        cancel_after: Option<(usize, CancellationToken)>,
        cancel_on_pause: Option<CancellationToken>,
    }

    impl ProgressReporter for RecordingReporter {
        fn on_batch_start(&mut self, batch_index: usize) {
            self.events.push(Event::BatchStart(batch_index));
        }

        fn on_item_sent(&mut self, sent: usize, total: usize, _recipient: &Recipient) {
            self.events.push(Event::Sent(sent, total));
            if let Some((after, token)) = &self.cancel_after {
                if sent == *after {
                    token.cancel();
                }
            }
        }

        fn on_batch_pause(&mut self, pause: Duration) {
            self.events.push(Event::Pause(pause));
            if let Some(token) = &self.cancel_on_pause {
                token.cancel();
            }
        }

        fn on_halted(&mut self, sent: usize, total: usize, reason: &str) {
            self.events.push(Event::Halted(sent, total, reason.to_string()));
        }

        fn on_completed(&mut self, sent: usize, total: usize) {
            self.events.push(Event::Completed(sent, total));
        }
    }

    fn recipients(count: usize) -> RecipientSet {
        let mut csv = String::from("name,email,company\n");
        for i in 1..=count {
            csv.push_str(&format!("Person {i},person{i}@example.com,Company {i}\n"));
        }
        let table = read_csv(csv.as_bytes()).unwrap();
        build(&table, &resolve(table.headers()).unwrap()).unwrap()
    }

    fn composer(attachment: Option<AttachmentBlob>) -> Composer {
        Composer::new(
            "me@example.com".parse().unwrap(),
            MessageTemplate::new("Application", "Dear {name} at {company},\nHello.").unwrap(),
            attachment,
        )
    }

    fn run_config(batch_size: usize, email_delay: u64, batch_delay_minutes: u64) -> RunConfig {
        RunConfig {
            batch_size,
            per_email_delay: Duration::from_secs(email_delay),
            per_batch_delay: Duration::from_secs(batch_delay_minutes * 60),
            credentials: RunCredentials {
                username: "me@example.com".to_string(),
                secret: Secret::new("app-password"),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_matches_formula() {
        for (n, b) in [(5usize, 2usize), (4, 2), (7, 3), (3, 50)] {
            let config = run_config(b, 3, 1);
            let expected = Duration::from_secs((n * 3 + (n - 1) / b * 60) as u64);
            assert_eq!(planned_wait(n, &config), expected);

            let mut transport = RecordingTransport::default();
            let mut reporter = RecordingReporter::default();
            let start = Instant::now();
            let summary = run(
                &recipients(n),
                &composer(None),
                &mut transport,
                config,
                &mut reporter,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

            assert_eq!(start.elapsed(), expected, "n={n} b={b}");
            assert!(summary.is_success());
            assert_eq!(summary.sent(), n);
            assert_eq!(transport.sent.len(), n);
            assert_eq!(transport.closed, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_events_in_order() {
        let mut transport = RecordingTransport::default();
        let mut reporter = RecordingReporter::default();
        run(
            &recipients(5),
            &composer(None),
            &mut transport,
            run_config(2, 2, 1),
            &mut reporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let minute = Duration::from_secs(60);
        assert_eq!(
            reporter.events,
            vec![
                Event::BatchStart(1),
                Event::Sent(1, 5),
                Event::Sent(2, 5),
                Event::Pause(minute),
                Event::BatchStart(2),
                Event::Sent(3, 5),
                Event::Sent(4, 5),
                Event::Pause(minute),
                Event::BatchStart(3),
                Event::Sent(5, 5),
                Event::Completed(5, 5),
            ]
        );
        let order: Vec<&str> = transport.sent.iter().map(|(_, to, _)| to.as_str()).collect();
        assert_eq!(
            order,
            vec![
                "person1@example.com",
                "person2@example.com",
                "person3@example.com",
                "person4@example.com",
                "person5@example.com",
            ]
        );
        assert_eq!(transport.authenticated_as.as_deref(), Some("me@example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_halts_immediately() {
        let mut transport = RecordingTransport {
            fail_send_at: Some(3),
            ..Default::default()
        };
        let mut reporter = RecordingReporter::default();
        let summary = run(
            &recipients(6),
            &composer(None),
            &mut transport,
            run_config(50, 2, 1),
            &mut reporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.sent(), 2);
        assert_eq!(transport.attempts, 3);
        assert_eq!(transport.sent.len(), 2);
        assert_eq!(transport.closed, 1);
        match &summary.outcome {
            RunOutcome::Halted {
                reason: HaltReason::SendFailed { recipient, message },
            } => {
                assert_eq!(recipient, "person3@example.com");
                assert!(message.contains("421"));
            }
            other => panic!("expected halted outcome, got {other:?}"),
        }
        assert!(summary.state.last_error.is_some());
        assert!(matches!(
            reporter.events.last(),
            Some(Event::Halted(2, 6, reason)) if reason.contains("person3@example.com")
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal_before_sending() {
        let mut transport = RecordingTransport {
            fail_connect: true,
            ..Default::default()
        };
        let mut reporter = RecordingReporter::default();
        let result = run(
            &recipients(2),
            &composer(None),
            &mut transport,
            run_config(50, 2, 1),
            &mut reporter,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(DispatchError::Connect(_))));
        assert_eq!(transport.attempts, 0);
        assert!(reporter.events.is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_closes_session() {
        let mut transport = RecordingTransport {
            fail_auth: true,
            ..Default::default()
        };
        let mut reporter = RecordingReporter::default();
        let result = run(
            &recipients(2),
            &composer(None),
            &mut transport,
            run_config(50, 2, 1),
            &mut reporter,
            &CancellationToken::new(),
        )
        .await;

        match result {
            Err(error @ DispatchError::Auth(_)) => {
                assert!(!error.to_string().contains("app-password"))
            }
            other => panic!("expected auth error, got {other:?}"),
        }
        assert_eq!(transport.attempts, 0);
        assert_eq!(transport.closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pause_halts_with_counts() {
        let token = CancellationToken::new();
        let mut transport = RecordingTransport::default();
        let mut reporter = RecordingReporter {
            cancel_after: Some((2, token.clone())),
            ..Default::default()
        };
        let start = Instant::now();
        let summary = run(
            &recipients(5),
            &composer(None),
            &mut transport,
            run_config(50, 10, 1),
            &mut reporter,
            &token,
        )
        .await
        .unwrap();

        assert!(matches!(
            summary.outcome,
            RunOutcome::Halted {
                reason: HaltReason::Cancelled
            }
        ));
        assert_eq!(summary.sent(), 2);
        assert_eq!(transport.sent.len(), 2);
        assert_eq!(transport.closed, 1);
        // Only the first pacing delay ran to completion
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(matches!(
            reporter.events.last(),
            Some(Event::Halted(2, 5, _))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_batch_pause() {
        let token = CancellationToken::new();
        let mut transport = RecordingTransport::default();
        let mut reporter = RecordingReporter {
            cancel_on_pause: Some(token.clone()),
            ..Default::default()
        };
        let start = Instant::now();
        let summary = run(
            &recipients(5),
            &composer(None),
            &mut transport,
            run_config(2, 3, 1),
            &mut reporter,
            &token,
        )
        .await
        .unwrap();

        assert!(matches!(
            summary.outcome,
            RunOutcome::Halted {
                reason: HaltReason::Cancelled
            }
        ));
        assert_eq!(summary.sent(), 2);
        assert_eq!(transport.attempts, 2);
        assert_eq!(transport.closed, 1);
        // Both per-email pauses ran, the batch pause did not
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(
            reporter.events,
            vec![
                Event::BatchStart(1),
                Event::Sent(1, 5),
                Event::Sent(2, 5),
                Event::Pause(Duration::from_secs(60)),
                Event::Halted(2, 5, "cancelled by user".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start_sends_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let mut transport = RecordingTransport::default();
        let summary = run(
            &recipients(3),
            &composer(None),
            &mut transport,
            run_config(50, 2, 1),
            &mut RecordingReporter::default(),
            &token,
        )
        .await
        .unwrap();
        assert_eq!(summary.sent(), 0);
        assert_eq!(transport.attempts, 0);
        assert_eq!(transport.closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_address_fails_run() {
        let csv = "name,email,company\n\
                   Ann,ann@example.com,Acme\n\
                   Bob,bob-at-nowhere,Globex\n\
                   Cy,cy@example.com,Initech\n";
        let table = read_csv(csv.as_bytes()).unwrap();
        let set = build(&table, &resolve(table.headers()).unwrap()).unwrap();
        let mut transport = RecordingTransport::default();
        let mut reporter = RecordingReporter::default();
        let summary = run(
            &set,
            &composer(None),
            &mut transport,
            run_config(50, 2, 1),
            &mut reporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(
            summary.outcome,
            RunOutcome::Failed {
                error: DispatchError::InvalidAddress(_)
            }
        ));
        assert_eq!(summary.sent(), 1);
        assert_eq!(transport.attempts, 1);
        assert_eq!(transport.closed, 1);
        assert!(summary.state.last_error.is_some());
        assert!(!reporter.events.iter().any(|e| matches!(e, Event::Completed(..))));
        assert!(matches!(
            reporter.events.last(),
            Some(Event::Halted(1, 3, reason)) if reason.contains("bob-at-nowhere")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messy_table_end_to_end_with_shared_attachment() {
        let csv = "HR Name,Email ID,Org\n\
                   Ann,ann@example.com,Acme\n\
                   Bob,,Globex\n\
                   Cy,cy@example.com,Initech\n";
        let table = read_csv(csv.as_bytes()).unwrap();
        let set = build(&table, &resolve(table.headers()).unwrap()).unwrap();
        assert_eq!(set.len(), 2);

        let resume: Vec<u8> = (0u8..48).map(|b| b.wrapping_mul(37).wrapping_add(200)).collect();
        let encoded = STANDARD.encode(&resume);
        let mut transport = RecordingTransport::default();
        let mut reporter = RecordingReporter::default();
        let start = Instant::now();
        let summary = run(
            &set,
            &composer(Some(AttachmentBlob::new("resume.pdf", resume))),
            &mut transport,
            run_config(50, 4, 5),
            &mut reporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.sent(), 2);
        assert_eq!(summary.total(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(8));
        assert!(!reporter.events.iter().any(|e| matches!(e, Event::Pause(_))));

        assert_eq!(transport.sent.len(), 2);
        for (from, _, raw) in &transport.sent {
            assert_eq!(from, "me@example.com");
            assert!(String::from_utf8_lossy(raw).contains(&encoded));
        }
        assert!(String::from_utf8_lossy(&transport.sent[0].2).contains("Dear Ann at Acme"));
        assert!(String::from_utf8_lossy(&transport.sent[1].2).contains("Dear Cy at Initech"));
    }

    #[test]
    fn test_summary_serializes() {
        let summary = RunSummary {
            outcome: RunOutcome::Halted {
                reason: HaltReason::Cancelled,
            },
            state: RunState {
                sent_count: 3,
                total_count: 9,
                last_error: Some("cancelled by user".to_string()),
            },
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outcome"], "halted");
        assert_eq!(json["reason"]["kind"], "cancelled");
        assert_eq!(json["sent_count"], 3);
        assert_eq!(json["total_count"], 9);
    }

    #[test]
    fn test_halt_reason_into_error() {
        let error: DispatchError = HaltReason::Cancelled.into();
        assert!(error.is_halting());
    }
}
