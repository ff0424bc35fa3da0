//! # HR policy retrieval CLI (`hrq`)
//!
//! ## Usage
//!
//! ```bash
//! hrq --config ./config/hrq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hrq sync <role\|all> [--force]` | Sync a role's mirror with the store and rebuild its index |
//! | `hrq rebuild <role\|all>` | Rebuild a role's index from its local mirror |
//! | `hrq query <role> "<text>"` | Print ranked passages with citations |
//! | `hrq answer <role> "<text>"` | Print an extractive answer (uses the response cache) |
//! | `hrq cache stats` | Response cache statistics |
//! | `hrq cache clear [--role <role>]` | Clear cached answers |
//! | `hrq stats <role>` | Document and index statistics for a role |
//! | `hrq serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! hrq sync all
//! hrq sync employee --force
//! hrq query employee "How do I apply for leave?" --top-k 3
//! hrq -v serve
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use policy_retrieval::answer::ExtractiveGenerator;
use policy_retrieval::config::load_config;
use policy_retrieval::scope::SyncMode;
use policy_retrieval::service::Retriever;
use policy_retrieval::{server, RoleScope};

/// Role-partitioned retrieval over HR policy documents.
#[derive(Parser)]
#[command(name = "hrq", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hrq.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). Overridden by RUST_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `[server].bind`.
    Serve,

    #[command(flatten)]
    Retriever(RetrieverCommand),
}

/// Commands that run against a [`Retriever`] opened for the duration of the command.
#[derive(Subcommand)]
enum RetrieverCommand {
    /// Sync one role (or `all`) with the document store.
    ///
    /// Lists the role's prefix, fetches only added or changed documents,
    /// and rebuilds the index when the corpus fingerprint changes.
    Sync {
        /// `executive`, `employee`, `master`, or `all`.
        role: String,

        /// Discard the local mirror, refetch every document, rebuild the
        /// index, and clear the role's cached answers.
        #[arg(long)]
        force: bool,
    },

    /// Rebuild one role's (or `all`) index from the local mirror.
    Rebuild {
        /// `executive`, `employee`, `master`, or `all`.
        role: String,
    },

    /// Retrieve ranked passages for a question.
    Query {
        role: RoleScope,
        text: String,

        /// Maximum number of passages (defaults to `retrieval.default_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the policy documents.
    Answer { role: RoleScope, text: String },

    /// Inspect or clear the response cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Document and index statistics for a role.
    Stats { role: RoleScope },
}

#[derive(Subcommand)]
enum CacheAction {
    Stats,
    Clear {
        #[arg(long)]
        role: Option<RoleScope>,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,policy_retrieval={default},hrq={default}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await,
        Commands::Retriever(command) => {
            let retriever = Retriever::from_config(cfg)
                .await
                .context("failed to open retriever")?;
            let outcome = run_command(&retriever, command).await;
            retriever.close().await?;
            outcome
        }
    }
}

fn parse_roles(role: &str) -> anyhow::Result<Vec<RoleScope>> {
    if role.eq_ignore_ascii_case("all") {
        Ok(RoleScope::ALL.to_vec())
    } else {
        Ok(vec![role.parse().map_err(anyhow::Error::msg)?])
    }
}

async fn run_command(retriever: &Retriever, command: RetrieverCommand) -> anyhow::Result<()> {
    match command {
        RetrieverCommand::Sync { role, force } => {
            let mode = if force { SyncMode::Full } else { SyncMode::Incremental };
            let mut failed = 0;
            for role in parse_roles(&role)? {
                match retriever.refresh_with(role, mode).await {
                    Ok(r) => println!(
                        "{:<10} +{} ~{} -{} ={}  fingerprint {}{}",
                        role.as_str(),
                        r.added.len(),
                        r.changed.len(),
                        r.removed.len(),
                        r.unchanged,
                        &r.new_fingerprint[..r.new_fingerprint.len().min(12)],
                        if r.index_rebuilt { "  (index rebuilt)" } else { "" }
                    ),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{:<10} sync failed: {}", role.as_str(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} role(s) failed to sync", failed);
            }
        }
        RetrieverCommand::Rebuild { role } => {
            let mut failed = 0;
            for role in parse_roles(&role)? {
                match retriever.rebuild(role).await {
                    Ok(r) => println!(
                        "{:<10} {} chunks over {} documents  fingerprint {}  ({} cached answers cleared)",
                        role.as_str(),
                        r.chunks,
                        r.documents,
                        &r.fingerprint[..r.fingerprint.len().min(12)],
                        r.cleared_responses
                    ),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{:<10} rebuild failed: {}", role.as_str(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} role(s) failed to rebuild", failed);
            }
        }
        RetrieverCommand::Query {
            role,
            text,
            top_k,
            json,
        } => {
            let response = retriever.query(&text, role, top_k).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            if response.status.is_degraded() {
                eprintln!("warning: results served from the last good index ({:?})", response.status);
            }
            if response.is_empty() {
                println!("No policy passage matched this question.");
            }
            for (i, p) in response.passages.iter().enumerate() {
                println!(
                    "{}. {} [chunk {}]  score {:.3} (lexical {:.3}, vector {:.3})",
                    i + 1,
                    p.title,
                    p.chunk_index,
                    p.score,
                    p.lexical_score,
                    p.vector_score
                );
                println!("   {}", p.text.replace('\n', "\n   "));
                println!();
            }
        }
        RetrieverCommand::Answer { role, text } => {
            let answer = retriever
                .answer(&text, role, &ExtractiveGenerator::default())
                .await?;
            println!("{}", answer.answer);
            if !answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for c in &answer.citations {
                    println!("  - {}", c.title);
                }
            }
            if answer.cached {
                eprintln!("(cached)");
            }
        }
        RetrieverCommand::Cache { action } => match action {
            CacheAction::Stats => {
                let s = retriever.cache_stats();
                println!("entries:  {}/{}", s.entries, s.capacity);
                println!("hits:     {}", s.hits);
                println!("misses:   {}", s.misses);
                println!("hit rate: {:.1}%", s.hit_rate * 100.0);
            }
            CacheAction::Clear { role } => {
                let removed = retriever.clear_response_cache(role);
                println!("Removed {} cached response(s).", removed);
            }
        },
        RetrieverCommand::Stats { role } => {
            let s = retriever.stats(role)?;
            println!("role:         {}", s.role);
            println!("documents:    {} ({} bytes)", s.documents, s.total_bytes);
            println!(
                "last sync:    {}",
                s.last_sync
                    .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("fingerprint:  {}", s.fingerprint);
            println!(
                "index:        {} chunks over {} documents{}",
                s.index_chunks,
                s.index_documents,
                if s.index_fresh { "" } else { " (stale)" }
            );
            for key in &s.skipped_documents {
                println!("  skipped:    {}", key);
            }
        }
    }
    Ok(())
}
