use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memoryfix_core::delivery::{self, OutputFormat, OutputPreferences, Quality};
use memoryfix_core::{garments, synthesis, Config, Garment, GenderInferenceAdapter, ImageData, Pipeline};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "memoryfix", about = "MemoryFix virtual try-on CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Infer the subject's gender from a photo
    Analyze {
        /// Path to a JPEG or PNG photo
        image: PathBuf,
    },
    /// Run the full try-on pipeline on a photo and write the result
    Convert {
        /// Path to a JPEG or PNG photo
        image: PathBuf,
        /// Garment to composite (suit, hanbok)
        #[arg(short, long)]
        garment: Garment,
        /// Output format (jpg, png)
        #[arg(short, long, default_value = "jpg")]
        format: OutputFormat,
        /// Output quality (balanced, high, ultra)
        #[arg(short, long, default_value = "high")]
        quality: Quality,
        /// Directory to write the result into
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// List the garment catalog
    Garments,
    /// Show daemon status
    Status {
        /// Daemon base URL
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze { image } => {
            let config = Config::from_env()?;
            let adapter = GenderInferenceAdapter::from_config(&config.inference)?;
            let photo = read_image(&image).await?;

            let result = adapter.infer(&photo).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Convert {
            image,
            garment,
            format,
            quality,
            out_dir,
        } => {
            let config = Config::from_env()?;
            let pipeline = Pipeline::new(
                Arc::new(GenderInferenceAdapter::from_config(&config.inference)?),
                synthesis::from_config(&config.synthesis)?,
                &config.pipeline,
            );
            let photo = read_image(&image).await?;

            let analyzed = pipeline.upload(photo).await?;
            println!(
                "Detected: {} (confidence {})",
                analyzed.detected_gender(),
                analyzed.confidence()
            );

            println!("Synthesizing {garment}...");
            let done = pipeline.select_garment(garment).await?;
            if let Some(failure) = done.synthesis_failure() {
                println!("Synthesis failed ({failure}); keeping the original image");
            }
            let result = done
                .result_image()
                .context("pipeline completed without a result image")?;

            let artifact = delivery::export(
                &reqwest::Client::new(),
                result,
                done.selected_garment(),
                OutputPreferences { format, quality },
                &config.app_id,
                chrono::Utc::now(),
            )
            .await?;
            let path = out_dir.join(&artifact.filename);
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Saved {}", path.display());
        }
        Commands::Garments => {
            for asset in garments::list() {
                println!("{:<8} {}  {}", asset.kind.as_str(), asset.asset_path, asset.description);
            }
        }
        Commands::Status { url } => {
            let endpoint = format!("{}/status", url.trim_end_matches('/'));
            match reqwest::get(&endpoint).await {
                Ok(response) => {
                    let status: serde_json::Value = response.error_for_status()?.json().await?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "status request failed");
                    println!("memoryfixd: not reachable at {url}");
                }
            }
        }
    }

    Ok(())
}

async fn read_image(path: &Path) -> Result<ImageData> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    ImageData::from_bytes(bytes).with_context(|| format!("{} is not a supported image", path.display()))
}
