//! bloblabel -- browse and classify labelled images in blob storage.
//!
//! Every invocation opens the record location afresh; the catalog and the
//! classifications persist there between runs.

use std::path::PathBuf;

use bloblabel::config::{load_or_create_config, LoggingConfig};
use bloblabel::{LabeledBlobSource, SourceFile};
use clap::{Parser, Subcommand};
use tracing::info;

/// Command-line arguments for bloblabel.
#[derive(Parser, Debug)]
#[command(
    name = "bloblabel",
    version,
    about = "Browse and classify labelled images in Azure Blob Storage"
)]
struct Cli {
    /// Path to the YAML configuration file. Created with defaults if absent.
    #[arg(short, long, default_value = "bloblabel.yaml")]
    config: PathBuf,

    /// Print the Prometheus metrics snapshot before exiting.
    #[arg(long, default_value_t = false)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rescan the storage container and rebuild the catalog
    Acquire,
    /// List catalogued containers with their item counts
    Containers,
    /// Reveal batches of a container's items
    Browse {
        /// Container key or label.
        #[arg(long)]
        container: String,
        /// One-based item to start from.
        #[arg(long)]
        jump: Option<i64>,
        /// Number of forward batches to reveal.
        #[arg(long, default_value_t = 1)]
        batches: usize,
        /// Reveal the previous batch after the forward ones.
        #[arg(long, default_value_t = false)]
        previous: bool,
    },
    /// Record labels for one item
    Classify {
        /// Container key or label.
        #[arg(long)]
        container: String,
        /// Item file name (case-insensitive).
        #[arg(long)]
        item: String,
        /// Label to assign; repeat for several.
        #[arg(long = "label", required = true)]
        labels: Vec<String>,
    },
    /// Print the read token for the configured container
    Token,
    /// Print a blob of the configured container base64-encoded
    Encode {
        /// Blob name within the configured container.
        #[arg(long)]
        blob: String,
    },
    /// Delete downloaded files
    Clean,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_or_create_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config.display());

    if config.observability.metrics || cli.print_metrics {
        bloblabel::metrics::init_metrics();
        bloblabel::metrics::describe_metrics();
    }

    let mut source = LabeledBlobSource::from_config(config)?.with_config_path(&cli.config);

    match cli.command {
        Commands::Acquire => {
            let labels = source.acquire_content().await?;
            println!("{} containers", labels.len());
            for label in labels {
                println!("{label}");
            }
        }
        Commands::Containers => {
            for container in source.containers() {
                source.set_container(&container);
                println!(
                    "{}\t{}\t{}",
                    bloblabel::catalog::container_label(&container),
                    container,
                    source.cursor().collection_count()
                );
            }
        }
        Commands::Browse {
            container,
            jump,
            batches,
            previous,
        } => {
            select(&mut source, &container)?;
            if let Some(target) = jump {
                source.jump_to(target)?;
            }

            let handle = source.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT, stopping after the current item");
                    handle.cancel();
                }
            });

            for _ in 0..batches {
                let start = source.cursor().current_index() + 1;
                let batch = source.next_group().await?;
                if batch.is_empty() {
                    break;
                }
                print_batch(start, &batch);
                if source.cancel_handle().is_cancelled() {
                    break;
                }
            }
            if previous {
                let batch = source.previous_group().await?;
                let start = source.cursor().current_index() + 1 - batch.len() as isize;
                print_batch(start, &batch);
            }
        }
        Commands::Classify {
            container,
            item,
            labels,
        } => {
            select(&mut source, &container)?;
            if source.update_item(&item, &labels)? {
                println!("{}: {}", item, labels.join(", "));
            } else {
                anyhow::bail!("no item named '{}' in {}", item, container);
            }
        }
        Commands::Token => {
            println!("{}", source.gateway().read_token("")?);
        }
        Commands::Encode { blob } => {
            println!("{}", source.gateway().blob_as_base64("", &blob).await?);
        }
        Commands::Clean => {
            let removed = source.clear_source_files()?;
            println!("Removed {removed} files");
        }
    }

    if cli.print_metrics {
        if let Some(text) = bloblabel::metrics::render() {
            print!("{text}");
        }
    }

    Ok(())
}

fn select(source: &mut LabeledBlobSource, name: &str) -> anyhow::Result<()> {
    let container = source
        .resolve_container(name)
        .ok_or_else(|| anyhow::anyhow!("unknown container '{}'; run `acquire` first", name))?;
    source.set_container(&container);
    Ok(())
}

fn print_batch(first_index: isize, batch: &[SourceFile]) {
    for (offset, file) in batch.iter().enumerate() {
        let status = if file.downloaded { "ok" } else { "failed" };
        println!(
            "{:>5}  {:<40} {:<6} {}  [{}]",
            first_index + offset as isize + 1,
            file.name,
            status,
            file.disk_location.display(),
            file.classifications.join(", ")
        );
    }
}
