use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use autodialer_blog::BlogStore;
use autodialer_config::DialerConfig;
use autodialer_core::{wiring, BatchOutcome, Dispatcher};
use autodialer_infer::LlmEngine;
use autodialer_scrape::ScrapeRunner;
use autodialer_store::{PhoneStore, SqlitePhoneStore};
use autodialer_types::RecordId;

#[derive(Parser)]
#[command(name = "autodialer")]
struct Cli {
    /// Log calls instead of placing them.
    #[arg(long, global = true)]
    dry_run: bool,
    /// SQLite database path (overrides configuration).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add numbers (newline or comma separated, up to 100).
    Add { numbers: Vec<String> },
    List,
    Stats,
    CallNow {
        id: RecordId,
        #[arg(long)]
        message: Option<String>,
    },
    /// Dial every pending number in order.
    CallAll {
        #[arg(long)]
        message: Option<String>,
    },
    /// Parse free text and place the call.
    Say { text: Vec<String> },
    /// Show what free text parses to without dialling.
    Parse { text: Vec<String> },
    Reset { id: RecordId },
    Attempts { id: RecordId },
    Blog {
        #[command(subcommand)]
        action: BlogCommand,
    },
    /// Run the profile scraper.
    Scrape,
}

#[derive(Subcommand)]
enum BlogCommand {
    List,
    Show { slug: String },
    /// One topic per argument.
    Generate { topics: Vec<String> },
    Delete { slug: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = DialerConfig::load()?;
    if cli.dry_run {
        cfg.dispatch.dry_run = true;
    }
    if let Some(db) = cli.db {
        cfg.storage.database_path = db;
    }

    let engine = wiring::chat_engine(&cfg.llm)?;

    match cli.command {
        Command::Blog { action } => {
            let blog = BlogStore::new(
                &cfg.blog.dir,
                wiring::chat_engine_or_null(&engine),
                Some(cfg.llm.blog_model.clone()),
            );
            run_blog(&blog, action).await?;
        }
        Command::Scrape => {
            let report = ScrapeRunner::new(cfg.scrape.clone()).run().await?;
            println!(
                "{} (exit {:?})",
                if report.success { "Scrape finished" } else { "Scrape failed" },
                report.exit_code
            );
            if let Some(profiles) = &report.profiles {
                println!("profiles: {}", profiles.display());
            }
            println!("log: {}", report.log.display());
        }
        Command::Parse { text } => {
            let intent = wiring::intent_parser(&engine).parse(&text.join(" ")).await;
            println!("{}", serde_json::to_string_pretty(&intent)?);
        }
        Command::Add { numbers } => {
            let report = open_dialer(&cfg, &engine)?
                .bulk_upload(&numbers.join("\n"))
                .await?;
            println!("Added {} phone numbers", report.created.len());
            for r in &report.rejected {
                println!("  {}: Number {}", r.input, r.reason);
            }
            if report.ignored > 0 {
                println!("  {} entries past the limit were ignored", report.ignored);
            }
        }
        Command::List => {
            for r in open_dialer(&cfg, &engine)?.list().await? {
                println!(
                    "{:>5}  {}  {:<9}  {}",
                    r.id,
                    r.number,
                    r.status.as_str(),
                    r.call_reference_id.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Stats => {
            let s = open_dialer(&cfg, &engine)?.statistics().await?;
            println!(
                "total {}  pending {}  calling {}  completed {}  failed {}",
                s.total, s.pending, s.calling, s.completed, s.failed
            );
        }
        Command::CallNow { id, message } => {
            let done = open_dialer(&cfg, &engine)?
                .call_now(id, message.as_deref())
                .await?;
            println!(
                "Call initiated: {} ({})",
                done.record.number,
                done.record.call_reference_id.as_deref().unwrap_or("-")
            );
        }
        Command::CallAll { message } => {
            let dialer = open_dialer(&cfg, &engine)?;
            match dialer.call_all(message.as_deref()).await? {
                BatchOutcome::NoPending => println!("No pending numbers"),
                BatchOutcome::Ran(report) => {
                    println!("Called {}. Failed: {}", report.succeeded, report.failed);
                    for f in &report.failures {
                        println!("  {} {}: {}", f.id, f.number, f.reason);
                    }
                }
            }
        }
        Command::Say { text } => {
            let out = open_dialer(&cfg, &engine)?
                .call_from_text(&text.join(" "))
                .await?;
            println!(
                "Calling {} with: \"{}\".",
                out.dispatched.record.number, out.intent.message
            );
        }
        Command::Reset { id } => {
            let record = open_dialer(&cfg, &engine)?.reset(id).await?;
            println!("{} reset to pending", record.number);
        }
        Command::Attempts { id } => {
            for a in open_dialer(&cfg, &engine)?.attempts(id).await? {
                println!("{}  {:<8}  {}", a.started_at.to_rfc3339(), a.status, a.message);
            }
        }
    }

    Ok(())
}

fn open_dialer(
    cfg: &DialerConfig,
    engine: &Option<Arc<dyn LlmEngine>>,
) -> anyhow::Result<Dispatcher> {
    let store: Arc<dyn PhoneStore> = Arc::new(SqlitePhoneStore::open(&cfg.storage.database_path)?);
    Ok(wiring::dispatcher(cfg, store, engine)?)
}

async fn run_blog(blog: &BlogStore, action: BlogCommand) -> anyhow::Result<()> {
    match action {
        BlogCommand::List => {
            for p in blog.list().await? {
                println!("{}  {}  {}", p.date.as_deref().unwrap_or("-"), p.slug, p.title);
            }
        }
        BlogCommand::Show { slug } => match blog.read(&slug).await? {
            Some(post) => {
                println!("# {}\n", post.summary.title);
                println!("{}", post.html);
            }
            None => anyhow::bail!("Post not found"),
        },
        BlogCommand::Generate { topics } => {
            let count = blog.generate(&topics.join("\n")).await?;
            if count == 0 {
                anyhow::bail!("No posts generated. Please try again.");
            }
            println!("Generated {count} micro post(s).");
        }
        BlogCommand::Delete { slug } => {
            if !blog.delete(&slug).await? {
                anyhow::bail!("Post not found.");
            }
            println!("Deleted \"{slug}\".");
        }
    }
    Ok(())
}
