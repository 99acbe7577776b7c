//! portfwd - TCP port forwarder
//!
//! Manages the stored forward rules and runs them:
//! - `init` writes an example configuration
//! - `add` / `remove` edit the stored rules from a short intent (`8080=10.0.0.5:80/add`)
//! - `run` starts every stored rule and keeps forwarding until Ctrl-C
//! - `list` and `check` report rules and port availability

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use portfwd::{
    config::{generate_example_config, Config, LoggingConfig},
    forward::{is_port_in_use, Confirmation, StopReason},
    ForwardEvent, ForwardRegistry, ForwardRule, RuleAction, RuleIntent,
};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Interval between traffic summaries while running
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// portfwd - Local TCP port forwarding
#[derive(Parser, Debug)]
#[command(name = "portfwd")]
#[command(about = "portfwd - Forward local TCP ports to other endpoints")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "portfwd.toml")]
    config: String,

    /// Log level (overrides config: trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write an example configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start every stored forward and run until Ctrl-C (SIGHUP reloads)
    Run,

    /// Store a new forward, e.g. `8080=10.0.0.5:80` or `0.0.0.0:2222=bastion:22`
    Add {
        /// Forward to add, optionally with a trailing `/add`
        intent: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete a stored forward
    Remove {
        /// Forward to remove, optionally with a trailing `/remove`
        intent: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List stored forwards
    List,

    /// Report whether a local port is already bound
    Check {
        /// Port to probe on 127.0.0.1
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load_or_default(&args.config).context("Failed to load configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging)?;

    match args.command {
        Command::Init { force } => init(&args.config, force),
        Command::Run => run(&args.config, config).await,
        Command::Add { intent, yes } => {
            edit(&args.config, config, &intent, RuleAction::Add, yes).await
        }
        Command::Remove { intent, yes } => {
            edit(&args.config, config, &intent, RuleAction::Remove, yes).await
        }
        Command::List => list(&config).await,
        Command::Check { port } => {
            if is_port_in_use(port).await {
                println!("Port {} is in use", port);
            } else {
                println!("Port {} is free", port);
            }
            Ok(())
        }
    }
}

/// Install the tracing subscriber
fn init_logging(level: &str, logging: &LoggingConfig) -> Result<()> {
    let writer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(writer)
        .with_ansi(logging.file.is_none());

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        "pretty" => builder.pretty().init(),
        other => bail!("Unknown log format: {} (expected pretty, compact or json)", other),
    }

    Ok(())
}

fn init(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path);
    }

    generate_example_config()
        .save(path)
        .context("Failed to write example configuration")?;
    println!("Wrote example configuration to {}", path);
    Ok(())
}

/// Parse an intent given to `add` or `remove`; the action suffix is optional
fn parse_for(input: &str, action: RuleAction) -> Result<RuleIntent> {
    let input = input.trim();
    let line = if input.contains('/') {
        input.to_string()
    } else {
        format!("{}/{}", input, action)
    };
    let intent = line
        .parse::<RuleIntent>()
        .with_context(|| format!("Invalid forward: {}", input))?;

    if intent.action != action {
        bail!(
            "Intent asks to {} but the command is {}",
            intent.action,
            action
        );
    }
    if action == RuleAction::Add && intent.rule.is_self_loop() {
        bail!(
            "Forward {} would connect back to itself; give a destination with `=host:port`",
            intent.rule
        );
    }
    Ok(intent)
}

async fn edit(
    path: &str,
    mut config: Config,
    input: &str,
    action: RuleAction,
    yes: bool,
) -> Result<()> {
    let intent = parse_for(input, action)?;
    let rule = &intent.rule;

    let confirmation: Box<dyn Confirmation> = if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(Prompt { action })
    };
    if !confirmation.confirm(rule).await {
        println!("Cancelled");
        return Ok(());
    }

    if action == RuleAction::Add && is_port_in_use(rule.source_port).await {
        warn!(
            "Port {} is in use now; the forward will fail to start until it is released",
            rule.source_port
        );
    }
    config.apply(&intent)?;

    config.save(path).context("Failed to save configuration")?;
    info!("Stored forwards updated ({} {})", action, rule);
    println!("{}: {}", action, rule);
    Ok(())
}

async fn list(config: &Config) -> Result<()> {
    if config.rules().is_empty() {
        println!("No forwards configured");
        return Ok(());
    }

    for rule in config.rules() {
        let status = if is_port_in_use(rule.source_port).await {
            "port bound"
        } else {
            "port free"
        };
        println!("{}  ({})", rule, status);
    }
    Ok(())
}

async fn run(path: &str, config: Config) -> Result<()> {
    let registry = ForwardRegistry::new(config.forwarding.options());
    let mut events = registry.subscribe();

    for rule in config.rules() {
        if let Err(e) = registry.register(rule.clone()).await {
            warn!("Skipping forward {}: {}", rule, e);
        }
    }

    let results = registry.replay_all().await;
    let started = results.iter().filter(|(_, result)| result.is_ok()).count();
    info!("Started {} of {} forward(s)", started, results.len());
    if results.is_empty() {
        warn!("No forwards configured in {}", path);
    }

    let mut hangup = Hangup::new()?;
    let mut summary = Traffic::default();
    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down...");
                break;
            }
            _ = hangup.recv() => {
                info!("Reloading forwards from {}", path);
                if let Err(e) = reload(&registry, path).await {
                    error!("Reload failed: {:#}", e);
                }
            }
            _ = ticker.tick() => {
                if summary.changed {
                    info!(
                        "{} connection(s) open, {} total, {} dial failure(s), {} bytes relayed",
                        summary.open(),
                        summary.accepted,
                        summary.dial_failures,
                        summary.bytes
                    );
                    summary.changed = false;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => summary.record(&event),
                    Err(RecvError::Lagged(n)) => debug!("Event stream lagged, {} event(s) skipped", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    registry.shutdown().await;
    info!("All forwards stopped");
    Ok(())
}

/// Bring the registry in line with the rules now stored in `path`
async fn reload(registry: &ForwardRegistry, path: &str) -> Result<()> {
    let config = Config::load(path)?;
    let wanted: HashSet<&ForwardRule> = config.rules().iter().collect();

    for (rule, _) in registry.list().await {
        if !wanted.contains(&rule) {
            registry.remove(&rule).await?;
        }
    }
    for rule in config.rules() {
        if registry.get(rule).await.is_none() {
            registry.register(rule.clone()).await?;
        }
    }

    let results = registry.replay_all().await;
    let failed = results.iter().filter(|(_, result)| result.is_err()).count();
    if failed > 0 {
        return Err(anyhow!("{} forward(s) failed to start", failed));
    }
    Ok(())
}

/// Running traffic totals built from session events
#[derive(Debug, Default)]
struct Traffic {
    accepted: u64,
    dial_failures: u64,
    closed: u64,
    bytes: u64,
    changed: bool,
}

impl Traffic {
    fn open(&self) -> u64 {
        self.accepted.saturating_sub(self.dial_failures + self.closed)
    }

    fn record(&mut self, event: &ForwardEvent) {
        self.changed = true;
        match event {
            ForwardEvent::Accepted { .. } => self.accepted += 1,
            ForwardEvent::DialFailed { .. } => self.dial_failures += 1,
            ForwardEvent::SpliceClosed { stats, .. } => {
                self.closed += 1;
                self.bytes += stats.bytes_to_destination + stats.bytes_to_source;
            }
            ForwardEvent::Stopped {
                rule,
                reason: StopReason::Failed(reason),
            } => {
                error!("Forward {} failed: {}", rule, reason);
            }
            ForwardEvent::Ready { .. }
            | ForwardEvent::Rejected { .. }
            | ForwardEvent::Stopped { .. } => {}
        }
    }
}

/// Interactive yes/no prompt on the terminal
struct Prompt {
    action: RuleAction,
}

#[async_trait]
impl Confirmation for Prompt {
    async fn confirm(&self, rule: &ForwardRule) -> bool {
        let question = format!("{} forward {}? [y/N] ", self.action, rule);

        tokio::task::spawn_blocking(move || {
            print!("{}", question);
            io::stdout().flush().ok();

            let mut answer = String::new();
            if io::stdin().lock().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

/// Confirmation for `--yes`
struct AssumeYes;

#[async_trait]
impl Confirmation for AssumeYes {
    async fn confirm(&self, _rule: &ForwardRule) -> bool {
        true
    }
}

/// SIGHUP listener; never fires on platforms without it
struct Hangup {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Hangup {
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
            Ok(Self { signal })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.signal.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfwd::forward::SpliceStats;

    #[test]
    fn test_parse_for_appends_action() {
        let intent = parse_for("8080=10.0.0.5:80", RuleAction::Add).unwrap();
        assert_eq!(intent.action, RuleAction::Add);
        assert_eq!(intent.rule, ForwardRule::new("127.0.0.1", 8080, "10.0.0.5", 80));

        let intent = parse_for("0.0.0.0:9000=db:5432/remove", RuleAction::Remove).unwrap();
        assert_eq!(intent.rule, ForwardRule::new("0.0.0.0", 9000, "db", 5432));
    }

    #[test]
    fn test_parse_for_refuses_self_loop() {
        let err = parse_for("8080", RuleAction::Add).unwrap_err();
        assert!(err.to_string().contains("back to itself"));
        assert!(parse_for("127.0.0.1:8080=localhost:8080/add", RuleAction::Add).is_err());
    }

    #[test]
    fn test_parse_for_rejects_mismatched_action() {
        assert!(parse_for("8080/remove", RuleAction::Add).is_err());
        assert!(parse_for("8080/bogus", RuleAction::Add).is_err());
    }

    #[test]
    fn test_traffic_totals() {
        let rule = ForwardRule::new("127.0.0.1", 8080, "localhost", 80);
        let peer = "127.0.0.1:50000".parse().unwrap();
        let mut traffic = Traffic::default();

        for connection in 1..=3 {
            traffic.record(&ForwardEvent::Accepted {
                rule: rule.clone(),
                connection,
                peer,
            });
        }
        traffic.record(&ForwardEvent::DialFailed {
            rule: rule.clone(),
            connection: 1,
            error: "refused".to_string(),
        });
        traffic.record(&ForwardEvent::SpliceClosed {
            rule: rule.clone(),
            connection: 2,
            stats: SpliceStats {
                bytes_to_destination: 10,
                bytes_to_source: 5,
                duration: Duration::from_millis(1),
            },
            error: None,
        });

        assert_eq!(traffic.open(), 1);
        assert_eq!(traffic.bytes, 15);
        assert!(traffic.changed);
    }
}
