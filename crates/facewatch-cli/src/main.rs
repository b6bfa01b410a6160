use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facewatch.Gallery1",
    default_service = "org.facewatch.Gallery1",
    default_path = "/org/facewatch/Gallery1"
)]
trait Gallery {
    async fn match_image(&self, image: &[u8], filename: &str) -> zbus::Result<String>;
    async fn add_entry(
        &self,
        label: &str,
        category: &str,
        image: &[u8],
        filename: &str,
    ) -> zbus::Result<String>;
    async fn list_entries(&self) -> zbus::Result<String>;
    async fn remove_entry(&self, id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch gallery matching CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match every face in an image against the gallery
    Match {
        /// Image file (png, jpg, jpeg, gif, bmp)
        path: PathBuf,
    },
    /// Add a reference image to the gallery
    Add {
        /// Name for the identity (defaults to "Unknown")
        #[arg(short, long, default_value = "")]
        label: String,
        /// Category for the identity (defaults to "Unknown")
        #[arg(short, long, default_value = "")]
        category: String,
        path: PathBuf,
    },
    /// List gallery entries
    List,
    /// Remove a gallery entry
    Remove {
        /// Entry ID to remove
        id: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = GalleryProxy::new(&conn).await?;

    match cli.command {
        Commands::Match { path } => {
            let (bytes, filename) = read_image(&path)?;
            let report = proxy.match_image(&bytes, &filename).await?;
            print_json(&report)?;
        }
        Commands::Add {
            label,
            category,
            path,
        } => {
            let (bytes, filename) = read_image(&path)?;
            let entry = proxy.add_entry(&label, &category, &bytes, &filename).await?;
            print_json(&entry)?;
        }
        Commands::List => {
            let entries = proxy.list_entries().await?;
            print_json(&entries)?;
        }
        Commands::Remove { id } => {
            proxy.remove_entry(&id).await?;
            println!("Removed entry {id}");
        }
        Commands::Status => {
            let status = proxy.status().await?;
            print_json(&status)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<(Vec<u8>, String)> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tracing::debug!(filename = %filename, bytes = bytes.len(), "image read");
    Ok((bytes, filename))
}

/// Re-indent a JSON reply from the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
