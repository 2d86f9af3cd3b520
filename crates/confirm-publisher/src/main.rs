//! Console runner for the confirm publisher.
//!
//! Usage: confirm-publisher [--count <n>] [--nack-rate <p>]
//!
//! Without --count it prompts for the number of messages to publish until
//! `q` is entered. Messages go to the in-process broker.

use clap::Parser;
use confirm_publisher::{
    AckMode, BatchPublisher, ConfirmScript, ConfirmStrategy, Envelope, MemoryBroker, Metadata,
    PublishError, PublishResult, PublisherConfig,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Dennis", "Edsger", "Frances", "Grace", "Ken", "Leslie", "Margaret",
];
const LAST_NAMES: &[&str] = &[
    "Allen", "Dijkstra", "Hamilton", "Hopper", "Lamport", "Liskov", "Lovelace", "Ritchie",
    "Thompson", "Turing",
];

/// Publish fake messages with broker-confirmed delivery.
#[derive(Parser, Debug)]
#[command(name = "confirm-publisher")]
#[command(about = "Publish messages and wait for broker confirms")]
struct Args {
    /// Publish this many messages once and exit.
    #[arg(long)]
    count: Option<usize>,

    /// JSON configuration file.
    #[arg(long, env = "PUBLISHER_CONFIG")]
    config: Option<PathBuf>,

    /// Messages per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds to wait for outstanding confirms.
    #[arg(long)]
    timeout_secs: Option<f64>,

    /// Confirm strategy (batched, per_message, streaming).
    #[arg(long)]
    strategy: Option<ConfirmStrategy>,

    /// Maximum retry rounds for nacked messages.
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Probability that the broker nacks a message.
    #[arg(long, default_value = "0.0")]
    nack_rate: f64,

    /// Let the broker confirm runs of messages with a single multiple ack.
    #[arg(long)]
    cumulative_acks: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (compact, json)
    #[arg(long, default_value = "compact")]
    log_format: String,
}

#[derive(Debug, Serialize)]
struct PersonMessage {
    first_name: String,
    last_name: String,
    email: String,
    age: u8,
}

impl PersonMessage {
    fn fake(rng: &mut impl Rng) -> Self {
        let first_name = FIRST_NAMES.choose(rng).copied().unwrap_or("Ada").to_string();
        let last_name = LAST_NAMES.choose(rng).copied().unwrap_or("Lovelace").to_string();
        let email = format!(
            "{}.{}@example.com",
            first_name.to_lowercase(),
            last_name.to_lowercase()
        );
        Self {
            first_name,
            last_name,
            email,
            age: rng.gen_range(18..90),
        }
    }
}

fn build_config(args: &Args) -> PublishResult<PublisherConfig> {
    let mut config = match &args.config {
        Some(path) => PublisherConfig::load(path)?,
        None => PublisherConfig::new(),
    };

    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(timeout_secs) = args.timeout_secs {
        config.timeout_secs = timeout_secs;
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(max_rounds) = args.max_rounds {
        config.retry.max_rounds = Some(max_rounds);
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn fake_envelopes(count: usize) -> PublishResult<Vec<Envelope>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let envelope = Envelope::for_message(&PersonMessage::fake(&mut rng))?;
            let id = envelope.message_id().to_string();
            Ok(envelope.with_metadata(Metadata::new().add("message-id", &id)))
        })
        .collect()
}

async fn publish(publisher: &BatchPublisher, count: usize) -> PublishResult<()> {
    let report = publisher.publish_all(fake_envelopes(count)?).await?;
    info!(
        confirmed = report.confirmed,
        nacked = report.nacked,
        rounds = report.rounds,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Publish finished"
    );
    Ok(())
}

async fn run_interactive(publisher: &BatchPublisher) -> PublishResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        println!("Enter the number of messages to publish. (Q for exit)");
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let input = line.trim();

        if input.eq_ignore_ascii_case("q") {
            return Ok(());
        }

        match input.parse::<usize>() {
            Ok(count) => {
                if let Err(e) = publish(publisher, count).await {
                    error!(error = %e, "Publish failed");
                }
            }
            Err(_) => warn!(input = %input, "Not a number"),
        }
    }
}

#[tokio::main]
async fn main() -> PublishResult<()> {
    let args = Args::parse();
    let config = build_config(&args)?;

    observability::init_with_config(observability::LogConfig {
        service_name: "confirm-publisher".into(),
        default_level: config.log_level.clone(),
        format: observability::LogFormat::parse(&args.log_format),
    });

    if !(0.0..=1.0).contains(&args.nack_rate) {
        return Err(PublishError::Config(format!(
            "nack-rate must be between 0 and 1, got {}",
            args.nack_rate
        )));
    }

    let ack_mode = if args.cumulative_acks {
        AckMode::Cumulative
    } else {
        AckMode::Individual
    };
    let broker = MemoryBroker::new()
        .with_ack_mode(ack_mode)
        .with_script(ConfirmScript::random_nacks(args.nack_rate));

    info!(
        batch_size = config.batch_size,
        timeout_secs = config.timeout_secs,
        strategy = %config.strategy,
        max_rounds = ?config.retry.max_rounds,
        nack_rate = args.nack_rate,
        "Configuration loaded"
    );

    let publisher = BatchPublisher::new(Arc::new(broker), config)?;

    let work = async {
        match args.count {
            Some(count) => publish(&publisher, count).await,
            None => run_interactive(&publisher).await,
        }
    };

    tokio::select! {
        result = work => {
            if let Err(e) = result {
                error!(error = %e, "Publisher exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting...");
        }
    }

    Ok(())
}
