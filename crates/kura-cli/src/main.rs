//! `kura`: a command line for a kura file system stored in SQLite.
//!
//! Usage:
//!   kura mkdir /docs
//!   kura put /docs/readme.md ./README.md --mime text/markdown
//!   kura cat /docs/readme.md
//!   kura universe clone / draft
//!   kura export > snapshot.txt
//!   kura --db other.db import < snapshot.txt
//!
//! `RUST_LOG` controls log output, which always goes to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use kura_kernel::{FileContent, Inode, Kura, KuraConfig, SqliteBackend};

/// Content-addressed virtual file system.
#[derive(Parser, Debug)]
#[command(name = "kura")]
#[command(about = "Content-addressed virtual file system")]
struct Cli {
    /// SQLite database (default: the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// RON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a directory
    Mkdir { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file from a local file, or stdin when omitted
    Put {
        path: String,
        source: Option<PathBuf>,
        #[arg(long)]
        mime: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Remove a file
    Rm { path: String },
    /// Remove a directory tree
    Rmdir { path: String },
    /// Move a file or directory
    Mv { src: String, dest: String },
    /// Copy a file or directory
    Cp { src: String, dest: String },
    /// Show inode metadata as JSON
    Stat { path: String },
    /// Show storage usage as JSON
    Du { path: Option<String> },
    /// Delete unreferenced blocks
    Gc,
    /// Manage universes
    Universe {
        #[command(subcommand)]
        action: UniverseAction,
    },
    /// Write the whole state as replication frames, one per line
    Export {
        #[arg(long)]
        frame_size: Option<usize>,
    },
    /// Merge replication frames read from stdin, one per line
    Import,
}

#[derive(Subcommand, Debug)]
enum UniverseAction {
    /// List universe roots
    List,
    /// Replace universe DEST with a copy of SRC
    Clone { src: String, dest: String },
    /// Delete a universe
    Delete { name: String },
}

fn default_db() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("kura").join("kura.db"))
        .unwrap_or_else(|| PathBuf::from("kura.db"))
}

async fn open(cli: &Cli) -> Result<Kura> {
    let mut config = match &cli.config {
        Some(path) => KuraConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KuraConfig::default(),
    };
    // Nothing here produces frames, so don't queue them
    config.sync = false;

    let db = cli.db.clone().unwrap_or_else(default_db);
    if let Some(dir) = db.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    tracing::debug!(db = %db.display(), "opening database");
    let backend = SqliteBackend::open(&db)
        .with_context(|| format!("opening database {}", db.display()))?;

    let kura = Kura::open(Arc::new(backend), config).await?;
    kura.ready().await;
    Ok(kura)
}

async fn read_source(source: Option<&PathBuf>) -> Result<Vec<u8>> {
    match source {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut data = Vec::new();
            tokio::io::stdin().read_to_end(&mut data).await?;
            Ok(data)
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(kura: &Kura, command: Command) -> Result<()> {
    match command {
        Command::Mkdir { path } => kura.mkdir(&path)?,
        Command::Ls { path } => {
            let dir = kura.abspath(&path);
            for name in kura.listdir(Some(&dir))? {
                let child = kura_kernel::path::join(&dir, &name);
                match kura.inode(&child) {
                    Some(Inode::Dir { .. }) => println!("{name}/"),
                    _ => println!("{name}"),
                }
            }
        }
        Command::Put {
            path,
            source,
            mime,
            chunk_size,
        } => {
            let data = read_source(source.as_ref()).await?;
            let content = match mime {
                Some(mime) => FileContent::blob(data, mime),
                None => FileContent::from(data),
            };
            kura.write_file(&path, content, chunk_size).await?;
        }
        Command::Cat { path } => {
            let file = kura.read_file(&path).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&file.data)?;
            stdout.flush()?;
        }
        Command::Rm { path } => kura.rm(&path)?,
        Command::Rmdir { path } => kura.rmdir(&path)?,
        Command::Mv { src, dest } => kura.move_path(&src, &dest)?,
        Command::Cp { src, dest } => kura.copy_path(&src, &dest)?,
        Command::Stat { path } => print_json(&kura.metainfo(&path)?)?,
        Command::Du { path } => print_json(&kura.quota(path.as_deref()))?,
        Command::Gc => match kura.deduplicate().await? {
            Some(report) => println!(
                "scanned {} blocks, removed {}",
                report.scanned,
                report.removed.len()
            ),
            None => println!("a collection pass is already running"),
        },
        Command::Universe { action } => match action {
            UniverseAction::List => {
                for root in kura.list_universes() {
                    println!("{root}");
                }
            }
            UniverseAction::Clone { src, dest } => kura.clone_universe(&src, &dest)?,
            UniverseAction::Delete { name } => {
                if !kura.delete_universe(&name)? {
                    tracing::warn!(universe = %name, "universe did not exist");
                }
            }
        },
        Command::Export { frame_size } => {
            let mut stdout = std::io::stdout().lock();
            for frame in kura.snapshot_frames(frame_size).await? {
                writeln!(stdout, "{frame}")?;
            }
            stdout.flush()?;
        }
        Command::Import => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut total = kura_kernel::MergeReport::default();
            while let Some(line) = lines.next_line().await? {
                let report = kura.push_rx(&line).await;
                total.blocks += report.blocks;
                total.upserts += report.upserts;
                total.deletions += report.deletions;
                total.ignored += report.ignored;
            }
            tracing::info!(
                blocks = total.blocks,
                upserts = total.upserts,
                deletions = total.deletions,
                ignored = total.ignored,
                "import finished"
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = kura_telemetry::init_tracing("kura")?;
    let cli = Cli::parse();

    let kura = open(&cli).await?;
    let result = run(&kura, cli.command).await;
    kura.close().await?;
    result
}
