use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

const METHOD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "mirror", about = "Mirror face engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the most prominent face in an image
    Enroll {
        /// Label stored with the face (e.g., a person's name)
        #[arg(short, long)]
        label: String,
        image: PathBuf,
    },
    /// Identify every face in a still image
    Identify { image: PathBuf },
    /// Feed images to the tracker as consecutive video frames
    Frame {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Delete a gallery record by index
    Delete { index: i64 },
    /// List gallery records
    List,
    /// Save the gallery to disk
    Save,
    /// Reload the gallery from disk, discarding unsaved changes
    Load,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.mirror.FaceEngine1",
    default_service = "org.mirror.FaceEngine1",
    default_path = "/org/mirror/FaceEngine1"
)]
trait FaceEngine {
    async fn enroll(&self, image_path: &str, label: &str) -> zbus::Result<i64>;
    async fn identify(&self, image_path: &str) -> zbus::Result<String>;
    async fn process_frame(&self, image_path: &str) -> zbus::Result<String>;
    async fn delete(&self, index: i64) -> zbus::Result<bool>;
    async fn list_records(&self) -> zbus::Result<String>;
    async fn save(&self) -> zbus::Result<()>;
    async fn load(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

/// The daemon resolves paths in its own working directory, so send absolute ones.
fn absolute(path: &Path) -> Result<String> {
    let resolved = std::fs::canonicalize(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    Ok(resolved.to_string_lossy().into_owned())
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::connection::Builder::session()?
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = FaceEngineProxy::new(&conn)
        .await
        .context("mirrord is not reachable")?;

    match cli.command {
        Commands::Enroll { label, image } => {
            let index = proxy.enroll(&absolute(&image)?, &label).await?;
            println!("Enrolled {label:?} as record {index}");
        }
        Commands::Identify { image } => {
            let json = proxy.identify(&absolute(&image)?).await?;
            println!("{}", pretty(&json));
        }
        Commands::Frame { images } => {
            for image in images {
                tracing::debug!(image = %image.display(), "sending frame");
                let json = proxy.process_frame(&absolute(&image)?).await?;
                println!("{}", pretty(&json));
            }
        }
        Commands::Delete { index } => {
            if proxy.delete(index).await? {
                println!("Deleted record {index}");
            } else {
                println!("No record with index {index}");
            }
        }
        Commands::List => {
            let json = proxy.list_records().await?;
            println!("{}", pretty(&json));
        }
        Commands::Save => {
            proxy.save().await?;
            println!("Gallery saved");
        }
        Commands::Load => {
            proxy.load().await?;
            println!("Gallery loaded");
        }
        Commands::Status => {
            let json = proxy.status().await?;
            println!("{}", pretty(&json));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from(["mirror", "enroll", "--label", "alice", "a.png"]).unwrap();
        match cli.command {
            Commands::Enroll { label, image } => {
                assert_eq!(label, "alice");
                assert_eq!(image, PathBuf::from("a.png"));
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_frame_requires_an_image() {
        assert!(Cli::try_parse_from(["mirror", "frame"]).is_err());
        let cli = Cli::try_parse_from(["mirror", "frame", "1.png", "2.png"]).unwrap();
        assert!(matches!(cli.command, Commands::Frame { images } if images.len() == 2));
    }

    #[test]
    fn test_delete_takes_an_index() {
        assert!(matches!(
            Cli::try_parse_from(["mirror", "delete", "12"]).unwrap().command,
            Commands::Delete { index: 12 }
        ));
        assert!(Cli::try_parse_from(["mirror", "delete", "bob"]).is_err());
    }

    #[test]
    fn test_pretty_prints_json_and_passes_through_other_text() {
        assert_eq!(pretty("{\"a\":1}"), "{\n  \"a\": 1\n}");
        assert_eq!(pretty("not json"), "not json");
    }

    #[test]
    fn test_absolute_resolves_existing_paths() {
        let resolved = absolute(Path::new(".")).unwrap();
        assert!(Path::new(&resolved).is_absolute());
        assert!(absolute(Path::new("/definitely/not/here.png")).is_err());
    }
}
