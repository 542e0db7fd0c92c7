pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tollgate_core::config::{AppConfig, ConfigOverrides, LoadOptions, LogFormat};

use crate::commands::knowledge::AddSource;

#[derive(Debug, Parser)]
#[command(
    name = "tollgate",
    about = "Tollgate operator CLI",
    long_about = "Administer prepaid AI wallets, the usage broker caches, and tenant knowledge bases.",
    after_help = "Examples:\n  tollgate migrate\n  tollgate wallet recharge --tenant acme --amount 25.00 --reference pay_123\n  tollgate ask --tenant acme \"Summarize our refund policy\"\n  tollgate cache stats --tenant acme"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a tollgate.toml config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override logging.level for this invocation")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(subcommand, about = "Inspect and fund tenant wallets")]
    Wallet(WalletCommand),
    #[command(subcommand, about = "Inspect or purge the prompt cache")]
    Cache(CacheCommand),
    #[command(subcommand, about = "Usage broker statistics")]
    Broker(BrokerCommand),
    #[command(about = "Send one billed prompt through the usage broker")]
    Ask {
        #[arg(long)]
        tenant: String,
        #[arg(long, help = "Override the provider's default model")]
        model: Option<String>,
        prompt: String,
    },
    #[command(subcommand, about = "Manage tenant knowledge sources")]
    Knowledge(KnowledgeCommand),
}

#[derive(Debug, Subcommand)]
enum WalletCommand {
    #[command(about = "Show a tenant's wallet, creating an empty one if needed")]
    Balance {
        #[arg(long)]
        tenant: String,
    },
    #[command(about = "Credit a tenant's wallet")]
    Recharge {
        #[arg(long)]
        tenant: String,
        #[arg(long, help = "Decimal amount, e.g. 25.00")]
        amount: String,
        #[arg(long, help = "External payment reference")]
        reference: String,
        #[arg(long, default_value = "USD")]
        currency: String,
    },
    #[command(about = "Replay the transaction log against the stored balance")]
    Verify {
        #[arg(long)]
        tenant: String,
    },
    #[command(about = "Recent financial history and open billing reconciliations")]
    History {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    Stats {
        #[arg(long)]
        tenant: Option<String>,
    },
    #[command(about = "Delete cached responses for one tenant, every tenant, or only expired ones")]
    Purge {
        #[arg(long, conflicts_with = "expired")]
        tenant: Option<String>,
        #[arg(long)]
        expired: bool,
    },
}

#[derive(Debug, Subcommand)]
enum BrokerCommand {
    Stats {
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum KnowledgeCommand {
    #[command(about = "Register a knowledge source from inline text, a text file, or a URL")]
    Add {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        text_file: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, help = "Object-storage reference of the original file for attachments")]
        file_ref: Option<String>,
        #[arg(long, help = "Run ingestion immediately")]
        ingest: bool,
    },
    #[command(about = "Extract, chunk and embed a source")]
    Ingest { source_id: String },
    List {
        #[arg(long)]
        tenant: String,
    },
    #[command(about = "Similarity search over a tenant's active chunks")]
    Search {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
        query: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config.clone(),
        require_file: cli.config.is_some(),
        overrides: ConfigOverrides { log_level: cli.log_level.clone(), ..ConfigOverrides::default() },
    };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            let result = commands::CommandResult::failure(
                "config",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
            println!("{}", result.output);
            return ExitCode::from(result.exit_code);
        }
    };
    init_logging(&config);

    let result = dispatch(cli, &config);
    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

fn dispatch(cli: Cli, config: &AppConfig) -> commands::CommandResult {
    match cli.command {
        Command::Migrate => commands::migrate::run(config),
        Command::Config => commands::CommandResult {
            exit_code: 0,
            output: commands::config::run(config, cli.config.as_deref()),
        },
        Command::Wallet(WalletCommand::Balance { tenant }) => {
            commands::wallet::balance(config, &tenant)
        }
        Command::Wallet(WalletCommand::Recharge { tenant, amount, reference, currency }) => {
            commands::wallet::recharge(config, &tenant, &amount, &reference, &currency)
        }
        Command::Wallet(WalletCommand::Verify { tenant }) => commands::wallet::verify(config, &tenant),
        Command::Wallet(WalletCommand::History { tenant, limit }) => {
            commands::wallet::history(config, &tenant, limit)
        }
        Command::Cache(CacheCommand::Stats { tenant }) => {
            commands::broker::cache_stats(config, tenant.as_deref())
        }
        Command::Cache(CacheCommand::Purge { tenant, expired }) => {
            commands::broker::cache_purge(config, tenant.as_deref(), expired)
        }
        Command::Broker(BrokerCommand::Stats { tenant }) => {
            commands::broker::stats(config, tenant.as_deref())
        }
        Command::Ask { tenant, model, prompt } => commands::ask::run(config, &tenant, &prompt, model),
        Command::Knowledge(KnowledgeCommand::Add {
            tenant,
            title,
            text,
            text_file,
            url,
            file_ref,
            ingest,
        }) => commands::knowledge::add(
            config,
            AddSource { tenant_id: tenant, title, text, text_file, url, file_ref, ingest },
        ),
        Command::Knowledge(KnowledgeCommand::Ingest { source_id }) => {
            commands::knowledge::ingest(config, &source_id)
        }
        Command::Knowledge(KnowledgeCommand::List { tenant }) => {
            commands::knowledge::list(config, &tenant)
        }
        Command::Knowledge(KnowledgeCommand::Search { tenant, limit, min_similarity, query }) => {
            commands::knowledge::search(config, &tenant, &query, limit, min_similarity)
        }
    }
}

/// Logs go to stderr; stdout carries the JSON command result.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
