use anyhow::{Context, Result};
use cachet::{Cache, Integrity, PutOptions};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::debug;

mod config;

#[derive(Parser)]
#[command(name = "cachet")]
#[command(about = "Content-addressable disk cache", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cache directory (overrides the config file)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file (or stdin) under a key
    Put {
        key: String,
        /// Input file; stdin when omitted
        file: Option<PathBuf>,
        /// JSON metadata stored with the entry
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Fetch the content for a key
    Get {
        key: String,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the entry for a key
    Info { key: String },

    /// List entries
    Ls {
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Remove a key
    Rm {
        key: String,
        /// Also remove its content right away
        #[arg(long)]
        content: bool,
    },

    /// Remove content by integrity string
    RmContent { integrity: String },

    /// Verify content and collect garbage
    Verify {
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show when the cache was last verified
    LastVerified,

    /// Remove everything from the cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `get` can stream payloads on stdout
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = config::resolve(cli.cache)?;
    debug!("Using cache at {}", config.root.display());
    let cache = Cache::open(config)
        .await
        .context("Failed to open cache")?;

    match cli.command {
        Commands::Put {
            key,
            file,
            metadata,
        } => {
            let mut opts = PutOptions::default();
            if let Some(metadata) = metadata {
                opts.metadata =
                    serde_json::from_str(&metadata).context("--metadata is not valid JSON")?;
            }
            let entry = match file {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?;
                    cache.put_stream(&key, file, opts).await?
                }
                None => cache.put_stream(&key, tokio::io::stdin(), opts).await?,
            };
            if let Some(integrity) = &entry.integrity {
                println!("{}", integrity);
            }
        }
        Commands::Get { key, output } => match output {
            Some(path) => {
                let (reader, _) = cache.get_stream(&key).await?;
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                if let Err(e) = reader.copy_to(&mut file).await {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e).context("Content failed verification");
                }
            }
            None => {
                let (data, _) = cache.get(&key).await?;
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
        },
        Commands::Info { key } => match cache.info(&key).await? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => anyhow::bail!("No entry for key {:?}", key),
        },
        Commands::Ls { json } => {
            let mut entries = cache.list();
            while let Some(entry) = entries.try_next().await? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    let integrity = entry
                        .integrity
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    println!("{}\t{}\t{}", entry.key, entry.size, integrity);
                }
            }
        }
        Commands::Rm { key, content } => {
            if content {
                cache.delete_with_content(&key).await?;
            } else {
                cache.delete(&key).await?;
            }
        }
        Commands::RmContent { integrity } => {
            let integrity: Integrity = integrity
                .parse()
                .context("Invalid integrity string")?;
            if !cache.delete_content(&integrity).await? {
                eprintln!("No content for {}", integrity);
            }
        }
        Commands::Verify { concurrency } => {
            let mut opts = cache.verify_options();
            if let Some(concurrency) = concurrency {
                opts = opts.with_concurrency(concurrency);
            }
            let report = cache.verify(opts).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::LastVerified => match cache.last_verified().await {
            Some(at) => println!("{}", at.to_rfc3339()),
            None => println!("never"),
        },
        Commands::Clear => {
            cache.clear().await?;
            println!("Cleared {}", cache.root().display());
        }
    }

    cache.flush().await?;
    Ok(())
}
