//! poolfs
//!
//! Inspect and edit a disk-backed pooled filesystem

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poolfs::{DiskStorage, FileSystem, PoolConfig, PooledFs, SnapshotNode, WriteFileOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "poolfs")]
#[command(about = "Inspect and edit a pooled filesystem directory")]
struct Args {
    /// TOML file overriding the pool configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every node and the pool size
    Inspect {
        /// Mount directory
        dir: PathBuf,
    },
    /// Compact the log into a fresh snapshot
    Checkpoint { dir: PathBuf },
    /// List a directory
    Ls {
        dir: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { dir: PathBuf, path: String },
    /// Copy a host file into the filesystem
    Put {
        dir: PathBuf,
        path: String,
        /// Host file to copy
        file: PathBuf,
    },
}

impl Command {
    fn dir(&self) -> &PathBuf {
        match self {
            Command::Inspect { dir }
            | Command::Checkpoint { dir }
            | Command::Ls { dir, .. }
            | Command::Cat { dir, .. }
            | Command::Put { dir, .. } => dir,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PoolConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PoolConfig::default(),
    };

    let dir = args.command.dir();
    let storage = DiskStorage::open(dir)
        .await
        .with_context(|| format!("opening {}", dir.display()))?;
    let mut fs = PooledFs::mount(storage.root(), config)
        .await
        .with_context(|| format!("mounting {}", dir.display()))?;

    match &args.command {
        Command::Inspect { .. } => inspect(&mut fs)?,
        Command::Checkpoint { .. } => {
            fs.checkpoint()?;
            info!("Checkpoint written");
        }
        Command::Ls { path, .. } => {
            for name in fs.readdir(path)? {
                println!("{}", name);
            }
        }
        Command::Cat { path, .. } => {
            let data = fs.read_file(path)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Put { path, file, .. } => {
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            fs.write_file(path, &data, WriteFileOptions::default())?;
            fs.sync_to_fs(false).await?;
            println!("{} bytes written to {}", data.len(), path);
        }
    }

    fs.unmount().context("closing filesystem")?;
    Ok(())
}

fn inspect(fs: &mut PooledFs) -> Result<()> {
    let snapshot = fs.snapshot();
    println!("generation {}", snapshot.generation);
    let mut rows = Vec::new();
    collect("", &snapshot.root, &mut rows);
    for (path, node) in rows {
        match node {
            SnapshotNode::Directory { mode, .. } => {
                println!("{:<40} dir  {:>7o}", path, mode);
            }
            SnapshotNode::File {
                mode,
                backing_filename,
                ..
            } => {
                let size = fs.lstat(&path)?.size;
                println!("{:<40} file {:>7o} {:>12} {}", path, mode, size, backing_filename);
            }
        }
    }
    println!("pool {} free backing files", snapshot.pool.len());
    Ok(())
}

fn collect<'a>(path: &str, node: &'a SnapshotNode, rows: &mut Vec<(String, &'a SnapshotNode)>) {
    let shown = if path.is_empty() { "/".to_string() } else { path.to_string() };
    rows.push((shown, node));
    if let SnapshotNode::Directory { children, .. } = node {
        for (name, child) in children {
            collect(&format!("{}/{}", path, name), child, rows);
        }
    }
}
