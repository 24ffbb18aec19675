//! Isolate CLI - archive build/test trees into a content-addressed store
//!
//! Commands:
//! - isolate archive -i foo.isolate -s out/foo.isolated      - Archive one target
//! - isolate batcharchive out/a.isolated.gen.json ...        - Archive many targets

mod genfile;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use isolate_core::config::is_valid_variable;
use isolate_core::{open_storage, ArchiveOptions, Archiver, JsonConfigParser, Tree};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Isolate - content-addressed tree archiver
#[derive(Parser)]
#[command(name = "isolate", version, about = "Archive build/test trees into a content-addressed store")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive one target described by an .isolate file
    Archive {
        #[command(flatten)]
        isolate: IsolateFlags,
        #[command(flatten)]
        server: ServerFlags,
    },
    /// Archive every target described by the given .gen.json files
    Batcharchive {
        #[command(flatten)]
        server: ServerFlags,
        /// Write a {target: digest} map to this file
        #[arg(long)]
        dump_json: Option<PathBuf>,
        /// Targets isolated at once (default: CPU cores)
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Gen files produced by the build
        #[arg(required = true)]
        gen_files: Vec<PathBuf>,
    },
}

/// Flags describing one target. Also accepted inside gen files.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct IsolateFlags {
    /// .isolate file to load
    #[arg(short = 'i', long)]
    pub isolate: PathBuf,

    /// .isolated file to generate
    #[arg(short = 's', long)]
    pub isolated: PathBuf,

    /// Config variable used to pick the configuration, KEY=VALUE
    #[arg(long = "config-variable", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub config_variables: Vec<(String, String)>,

    /// Path variable, KEY=VALUE; relative values are relative to the working directory
    #[arg(long = "path-variable", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub path_variables: Vec<(String, String)>,

    /// Extra variable, KEY=VALUE
    #[arg(long = "extra-variable", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub extra_variables: Vec<(String, String)>,

    /// Additional glob pattern skipped when expanding directories
    #[arg(long)]
    pub blacklist: Vec<String>,
}

impl IsolateFlags {
    pub fn to_tree(&self, cwd: &Path) -> Result<Tree> {
        let mut opts = ArchiveOptions::new(&self.isolate, &self.isolated);
        opts.blacklist.extend(self.blacklist.iter().cloned());
        opts.config_variables = to_map("config", &self.config_variables)?;
        opts.path_variables = to_map("path", &self.path_variables)?;
        opts.extra_variables = to_map("extra", &self.extra_variables)?;
        Ok(Tree::new(cwd, opts))
    }
}

#[derive(Args, Debug, Clone)]
struct ServerFlags {
    /// Store to upload to: https://... (S3), file://<dir>, a directory, or memory:
    #[arg(short = 'I', long = "isolate-server")]
    isolate_server: String,

    #[arg(long, default_value = "default-gzip")]
    namespace: String,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))?;
    if !is_valid_variable(key) {
        return Err(format!("invalid variable name {:?}", key));
    }
    Ok((key.to_string(), value.to_string()))
}

fn to_map(kind: &str, pairs: &[(String, String)]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (k, v) in pairs {
        if out.insert(k.clone(), v.clone()).is_some() {
            bail!("{} variable {} was specified twice", kind, k);
        }
    }
    Ok(out)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling...");
            token.cancel();
        }
    });
}

async fn run(
    trees: Vec<Tree>,
    server: &ServerFlags,
    concurrency: Option<usize>,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>> {
    let start = Instant::now();
    let backend = open_storage(&server.isolate_server, &server.namespace)
        .with_context(|| format!("opening {}", server.isolate_server))?;
    let mut archiver = Archiver::new(backend, Arc::new(JsonConfigParser));
    if let Some(n) = concurrency {
        archiver = archiver.concurrency(n);
    }
    let digests = archiver.archive(trees, cancel).await?;
    info!("Done in {:.2?}", start.elapsed());
    Ok(digests)
}

fn print_digests(digests: &BTreeMap<String, String>) {
    for (name, digest) in digests {
        println!("{}  {}", digest, name);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cwd = std::env::current_dir()?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Archive { isolate, server } => {
            let tree = isolate.to_tree(&cwd)?;
            let digests = run(vec![tree], &server, None, &cancel).await?;
            print_digests(&digests);
        }

        Commands::Batcharchive {
            server,
            dump_json,
            concurrency,
            gen_files,
        } => {
            let trees = gen_files
                .iter()
                .map(|path| genfile::tree_from_gen_file(&cwd.join(path)))
                .collect::<Result<Vec<_>>>()?;
            let digests = run(trees, &server, concurrency, &cancel).await?;
            print_digests(&digests);
            if let Some(path) = dump_json {
                let content = serde_json::to_string_pretty(&digests)?;
                std::fs::write(&path, content)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
    }
    Ok(())
}
