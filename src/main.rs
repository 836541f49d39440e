use bulk_mailer::composer::Composer;
use bulk_mailer::config::{AttachmentConfig, Config, RunConfig, PASSWORD_ENV};
use bulk_mailer::dispatch::{self, planned_wait, RunOutcome, RunSummary};
use bulk_mailer::progress::{describe, percent, LogReporter, ProgressReporter};
use bulk_mailer::recipients::{Recipient, RecipientSet};
use bulk_mailer::transport::SmtpSession;
use bulk_mailer::{columns, recipients, table, CanonicalField};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use std::process;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG: &str = "bulk-mailer.yaml";

const EXIT_PREFLIGHT: i32 = 1;
const EXIT_HALTED: i32 = 2;

#[tokio::main]
async fn main() {
    let matches = Command::new("bulk-mailer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sends one personalized email per row of a recipient spreadsheet")
        .long_about(
            "Bulk Mailer - paced, personalized SMTP dispatch:\n\
             • Reads recipients from .csv or .xlsx and finds the name, email and\n  \
             company columns\n\
             • Fills {name} and {company} into the message body\n\
             • Sends over a single STARTTLS session with per-email and per-batch pauses\n\
             • Stops at the first failed send and reports how far it got",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file"),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Build every message and show the plan without connecting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("table")
                .long("table")
                .value_name("FILE")
                .help("Recipient table (.csv or .xlsx)"),
        )
        .arg(
            Arg::new("attachment")
                .long("attachment")
                .value_name("FILE")
                .help("File attached to every message"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_name("N")
                .help("Emails per batch")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("email-delay")
                .long("email-delay")
                .value_name("SECONDS")
                .help("Pause after each email (2-10)")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("batch-delay")
                .long("batch-delay")
                .value_name("MINUTES")
                .help("Pause after each full batch (1-20)")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("summary-json")
                .long("summary-json")
                .help("Print the run summary as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG);

    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(EXIT_PREFLIGHT);
        }
    };
    apply_overrides(&mut config, &matches);
    config.apply_env();

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    let dry_run = matches.get_flag("dry-run");
    let run_config = if dry_run {
        config.preview_config()
    } else {
        config.run_config()
    };
    let run_config = match run_config {
        Ok(run_config) => run_config,
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(EXIT_PREFLIGHT);
        }
    };

    let (recipients, composer) = match prepare(&config) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(EXIT_PREFLIGHT);
        }
    };

    if dry_run {
        preview(&recipients, &composer, &run_config);
        return;
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            process::exit(130);
        }
        log::warn!("Interrupt received, stopping before the next email (press again to abort)");
        handler_token.cancel();
    }) {
        log::warn!("Failed to install Ctrl-C handler: {e}");
    }

    log::info!(
        "🚀 Sending {} email(s) via {}:{} as {}",
        recipients.len(),
        config.smtp.host,
        config.smtp.port,
        composer.sender()
    );

    let summary_json = matches.get_flag("summary-json");
    // Keep stdout clean for the JSON summary
    let mut reporter: Box<dyn ProgressReporter> = if summary_json {
        Box::new(LogReporter)
    } else {
        Box::new(ConsoleReporter::default())
    };
    let mut session = SmtpSession::new(&config.smtp);
    let summary = match dispatch::run(
        &recipients,
        &composer,
        &mut session,
        run_config,
        &mut *reporter,
        &cancel,
    )
    .await
    {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(EXIT_PREFLIGHT);
        }
    };

    print_summary(&summary, summary_json);
    if !summary.is_success() {
        process::exit(EXIT_HALTED);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Fill in sender, message and recipients, and set {PASSWORD_ENV}.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(EXIT_PREFLIGHT);
        }
    }
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(table) = matches.get_one::<String>("table") {
        config.recipients.table = Some(table.clone());
    }
    if let Some(path) = matches.get_one::<String>("attachment") {
        config.attachment = Some(AttachmentConfig {
            path: path.clone(),
            filename: None,
        });
    }
    if let Some(batch_size) = matches.get_one::<usize>("batch-size") {
        config.pacing.batch_size = *batch_size;
    }
    if let Some(seconds) = matches.get_one::<u64>("email-delay") {
        config.pacing.per_email_delay_seconds = *seconds;
    }
    if let Some(minutes) = matches.get_one::<u64>("batch-delay") {
        config.pacing.per_batch_delay_minutes = *minutes;
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("SMTP server: {}:{}", config.smtp.host, config.smtp.port);
    println!("Sender: {}", config.sender.address);
    println!(
        "Recipients table: {}",
        config.recipients.table.as_deref().unwrap_or("(none)")
    );
    match &config.attachment {
        Some(attachment) => println!("Attachment: {}", attachment.path),
        None => println!("Attachment: (none)"),
    }
    println!(
        "Pacing: {} per batch, {}s per email, {} min per batch",
        config.pacing.batch_size,
        config.pacing.per_email_delay_seconds,
        config.pacing.per_batch_delay_minutes
    );

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e}");
        process::exit(EXIT_PREFLIGHT);
    }
    if let Err(e) = config.message_template() {
        println!("❌ Message template is invalid:");
        println!("Error: {e}");
        process::exit(EXIT_PREFLIGHT);
    }
    println!("✅ Configuration is valid");
}

/// Everything that must succeed before a connection is opened.
fn prepare(config: &Config) -> anyhow::Result<(RecipientSet, Composer)> {
    let template = config.message_template()?;
    let sender = config.sender_mailbox()?;

    let path = config.recipients.table.as_deref().unwrap_or_default();
    let raw = table::load(path)?;

    let mapping = columns::resolve(raw.headers())?;
    for field in CanonicalField::ALL {
        log::debug!("Column '{}' -> {}", mapping.header_for(field), field);
    }

    let recipients = recipients::build(&raw, &mapping)?;
    let attachment = config.load_attachment()?;
    if let Some(blob) = &attachment {
        log::info!(
            "📎 Attaching {} ({}, {} bytes)",
            blob.filename(),
            blob.mime_type(),
            blob.content().len()
        );
    }

    Ok((recipients, Composer::new(sender, template, attachment)))
}

fn preview(recipients: &RecipientSet, composer: &Composer, run_config: &RunConfig) {
    let mut invalid = 0;
    for recipient in recipients {
        if let Err(e) = composer.compose(recipient).and_then(|p| p.formatted()) {
            println!("⚠️  {}: {e}", recipient.email);
            invalid += 1;
        }
    }

    println!("📋 Dry run");
    println!("═══════════════════════════════════════");
    println!("{:<25} {:<35} {:<25}", "Name", "Email", "Company");
    println!("{}", "─".repeat(85));
    for recipient in recipients.iter().take(10) {
        println!(
            "{:<25} {:<35} {:<25}",
            truncate_string(&recipient.name, 24),
            truncate_string(&recipient.email, 34),
            truncate_string(&recipient.company, 24)
        );
    }
    if recipients.len() > 10 {
        println!("... and {} more", recipients.len() - 10);
    }
    println!();

    let batches = recipients.len().div_ceil(run_config.batch_size);
    println!("Recipients: {}", recipients.len());
    println!("Batches: {batches} of up to {}", run_config.batch_size);
    println!(
        "Estimated wait: {}",
        format_wait(planned_wait(recipients.len(), run_config))
    );
    if invalid > 0 {
        println!("❌ {invalid} message(s) could not be built");
    }

    if let Some(first) = recipients.get(0) {
        if let Ok(payload) = composer.compose(first) {
            println!();
            println!("First message");
            println!("─────────────");
            println!("From: {}", payload.from);
            println!("To: {}", payload.to);
            println!("Subject: {}", payload.subject);
            if let Some(blob) = &payload.attachment {
                println!("Attachment: {} ({})", blob.filename(), blob.mime_type());
            }
            println!();
            println!("{}", payload.body);
        }
    }

    if invalid > 0 {
        process::exit(EXIT_PREFLIGHT);
    }
}

fn print_summary(summary: &RunSummary, json: bool) {
    if json {
        match serde_json::to_string_pretty(summary) {
            Ok(text) => println!("{text}"),
            Err(e) => log::error!("Failed to serialize run summary: {e}"),
        }
        return;
    }

    println!();
    println!("📊 Run summary");
    println!("═══════════════════════════════════════");
    match &summary.outcome {
        RunOutcome::Success => println!("Outcome: ✅ success"),
        RunOutcome::Halted { reason } => println!("Outcome: ⏹ halted ({reason})"),
        RunOutcome::Failed { error } => println!("Outcome: ❌ failed ({error})"),
    }
    println!("Sent: {} / {}", summary.sent(), summary.total());
    println!("Started: {}", summary.started_at.to_rfc3339());
    println!("Finished: {}", summary.finished_at.to_rfc3339());
    let elapsed = summary.finished_at - summary.started_at;
    println!("Duration: {}s", elapsed.num_seconds());
}

fn format_wait(wait: Duration) -> String {
    let seconds = wait.as_secs();
    format!("{}h {:02}m {:02}s", seconds / 3600, seconds % 3600 / 60, seconds % 60)
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Prints progress lines to stdout and mirrors halts to the log.
#[derive(Debug, Default)]
struct ConsoleReporter {
    batch: usize,
}

impl ProgressReporter for ConsoleReporter {
    fn on_batch_start(&mut self, batch_index: usize) {
        self.batch = batch_index;
        println!("📦 Batch {batch_index}");
    }

    fn on_item_sent(&mut self, sent: usize, total: usize, recipient: &Recipient) {
        println!(
            "  [{sent}/{total}] {:>5.1}%  {} <{}>",
            percent(sent, total),
            recipient.name,
            recipient.email
        );
    }

    fn on_batch_pause(&mut self, pause: Duration) {
        println!("⏸  Batch {} done, waiting {}", self.batch, describe(pause));
    }

    fn on_halted(&mut self, sent: usize, total: usize, reason: &str) {
        log::error!("Run stopped: {reason}");
        println!("❌ Stopped after {sent} of {total} email(s)");
    }

    fn on_completed(&mut self, sent: usize, total: usize) {
        println!("✅ Successfully sent {sent} of {total} email(s)");
    }
}
