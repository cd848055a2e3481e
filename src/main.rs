//! taskherd entry point.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use taskherd::agent::{Agent, ConfirmationGate, Dispatcher};
use taskherd::channels::channel::{Channel, Outbox};
use taskherd::channels::telegram::TelegramChannel;
use taskherd::classifier::AnthropicClassifier;
use taskherd::cleanup::CleanupService;
use taskherd::config::Config;
use taskherd::journal::Journal;
use taskherd::runtime::{Runtime, render_logs};
use taskherd::scan::{ScanEngine, SummaryPublisher};
use taskherd::sched::{CycleRunner, Scheduler, spawn_scheduler};
use taskherd::state::StateStore;
use taskherd::store::notion::NotionBackend;
use taskherd::store::resilient::ResilientStore;

#[derive(Parser, Debug)]
#[command(name = "taskherd", version, about = "Chat-driven task assistant")]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long, env = "TASKHERD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the assistant: channel event loop plus the cron scheduler (default)
    Run,
    /// Run one full scan and cleanup cycle, then exit
    Scan,
    /// Print recent interaction records
    Logs {
        /// Show only runs that recorded an error
        #[arg(long)]
        errors: bool,
        /// How many records to show
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::from_env()?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Scan => scan_once(config).await,
        Command::Logs { errors, count } => logs(config, errors, count).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("taskherd=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Everything a running assistant consists of, wired once.
struct App {
    runtime: Arc<Runtime>,
    runner: Arc<CycleRunner>,
    channel: Arc<TelegramChannel>,
}

impl App {
    async fn build(config: &Config) -> anyhow::Result<Self> {
        let journal_path = config.journal_path();
        if let Some(dir) = journal_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let state = Arc::new(StateStore::load(config.state_file()).await?);
        let journal = Arc::new(Journal::new(journal_path));

        let store = ResilientStore::new(Arc::new(NotionBackend::new(&config.store)));
        let classifier = Arc::new(AnthropicClassifier::new(&config.classifier));
        let channel = Arc::new(TelegramChannel::new(&config.telegram));
        let outbox = Outbox::new(channel.clone() as Arc<dyn Channel>);

        let gate = Arc::new(ConfirmationGate::new(config.policy.confirm_wait));
        let dispatcher = Dispatcher::new(
            store.clone(),
            gate.clone(),
            outbox.clone(),
            config.catalog.clone(),
        );
        let agent = Arc::new(Agent::new(
            classifier,
            dispatcher,
            store.clone(),
            config.catalog.clone(),
            config.home_offset,
        ));

        let cleanup = CleanupService::new(store.clone(), state.clone(), config.policy.clone());
        let runner = Arc::new(CycleRunner::new(
            ScanEngine::new(store.clone(), config.policy.clone(), config.home_offset),
            SummaryPublisher::new(outbox.clone(), state.clone(), journal.clone()),
            cleanup.clone(),
            agent.clone(),
            outbox.clone(),
            journal.clone(),
            config.policy.clone(),
        ));
        let runtime = Arc::new(Runtime::new(
            agent,
            gate,
            cleanup,
            runner.clone(),
            outbox,
            journal,
            state,
            config.home_offset,
        ));

        Ok(App {
            runtime,
            runner,
            channel,
        })
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let app = App::build(&config).await?;
    let scheduler = Scheduler::new(
        config.schedule.clone(),
        config.home_offset,
        app.runner.clone(),
    );
    let scheduler_task = spawn_scheduler(scheduler);

    tracing::info!("taskherd running");
    let result = app.runtime.run(app.channel).await;
    scheduler_task.abort();
    result.context("event loop failed")
}

async fn scan_once(config: Config) -> anyhow::Result<()> {
    let app = App::build(&config).await?;
    if app.runner.manual(Utc::now()).await {
        println!("Cycle finished.");
        Ok(())
    } else {
        anyhow::bail!("cycle hit its deadline and was cut off");
    }
}

async fn logs(config: Config, errors: bool, count: usize) -> anyhow::Result<()> {
    let journal = Journal::new(config.journal_path());
    let records = journal.tail(count, errors).await?;
    if records.is_empty() {
        println!("No matching interactions logged.");
    } else {
        print!("{}", render_logs(&records, config.home_offset));
    }
    Ok(())
}
