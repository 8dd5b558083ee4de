use std::io;
use std::path::{Path, PathBuf};

use access_ingest::ingest::pipeline;
use access_ingest::ingest::source::{
    expand_local_stores, LineFetcher, LineSource, LocalFetcher, RemoteFetcher, StoreDescriptor,
};
use access_ingest::store::database::expand_tilde;
use access_ingest::{EventStore, FieldDecryptor, LineParser};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "access-ingest",
    version,
    about = "Decode extension telemetry from web-server access logs"
)]
struct Cli {
    /// Read stores on this host over ssh instead of the local filesystem
    #[arg(long, global = true, env = "ACCESS_INGEST_REMOTE")]
    remote: Option<String>,

    /// Keep only lines matching this regex (the grep pattern when remote)
    #[arg(long, global = true, env = "ACCESS_INGEST_FILTER")]
    filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every parsed entry as a JSON line
    Inspect {
        /// PEM private key; without it `userid` stays encoded
        #[arg(long, env = "ACCESS_INGEST_KEY")]
        key: Option<PathBuf>,

        /// Stores in ingestion order (live, rotated, archives)
        #[arg(required = true)]
        stores: Vec<String>,
    },

    /// Append previously unseen events to the database
    Ingest {
        /// PEM private key used to decrypt `userid`
        #[arg(long, env = "ACCESS_INGEST_KEY")]
        key: PathBuf,

        /// SQLite database path
        #[arg(long, env = "ACCESS_INGEST_DB")]
        db: PathBuf,

        /// Stores in ingestion order (live, rotated, archives)
        #[arg(required = true)]
        stores: Vec<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_decryptor(key: &Path) -> Result<FieldDecryptor> {
    let path = expand_tilde(&key.to_string_lossy());
    FieldDecryptor::from_pem_file(&path)
        .with_context(|| format!("failed to load private key {}", path.display()))
}

fn line_source(
    remote: Option<&str>,
    filter: Option<&str>,
    stores: &[String],
) -> Result<LineSource<Box<dyn LineFetcher>>> {
    let (fetcher, descriptors): (Box<dyn LineFetcher>, Vec<StoreDescriptor>) = match remote {
        Some(host) => (
            Box::new(RemoteFetcher::new(host, filter.map(str::to_string))),
            stores
                .iter()
                .map(|s| StoreDescriptor::from_location(s.as_str()))
                .collect(),
        ),
        None => {
            let regex = filter
                .map(Regex::new)
                .transpose()
                .context("invalid --filter pattern")?;
            (
                Box::new(LocalFetcher::new(regex)),
                expand_local_stores(stores)?,
            )
        }
    };
    info!("reading {} stores", descriptors.len());
    Ok(LineSource::new(fetcher, descriptors))
}

fn run(cli: Cli) -> Result<()> {
    let remote = cli.remote.as_deref();
    let filter = cli.filter.as_deref();

    match cli.command {
        Command::Inspect { key, stores } => {
            let decryptor = key.as_deref().map(load_decryptor).transpose()?;
            let parser = LineParser::new(decryptor.as_ref());
            let source = line_source(remote, filter, &stores)?;
            let report = pipeline::inspect(source, &parser, &mut io::stdout().lock())?;
            info!(
                "inspected {} lines: {} entries, {} skipped, {} decrypt failures",
                report.lines_read,
                report.entries_parsed,
                report.lines_skipped,
                report.decrypt_failures
            );
        }
        Command::Ingest { key, db, stores } => {
            let decryptor = load_decryptor(&key)?;
            let parser = LineParser::new(Some(&decryptor));
            let mut store = EventStore::open(&db)
                .with_context(|| format!("failed to open database {}", db.display()))?;
            if let Some(path) = store.db_path() {
                info!("ingesting into {}", path.display());
            }
            let source = line_source(remote, filter, &stores)?;
            let report = pipeline::ingest(source, &parser, &mut store)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
