//! Keys command - RSA key pairs for end-to-end encryption

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;
use treesync_transfer::PemKeySource;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum KeysCommand {
    /// Generate a key pair and write it as PEM files
    Generate {
        /// Directory receiving public.pem and private.pem
        #[arg(long)]
        out: PathBuf,

        /// RSA modulus size
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },
}

impl KeysCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        match self {
            KeysCommand::Generate { out, bits } => generate(out, *bits, format).await,
        }
    }
}

async fn generate(out: &Path, bits: usize, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    formatter.info(&format!("Generating {}-bit RSA key pair...", bits));

    // Key generation is CPU bound
    let keys = tokio::task::spawn_blocking(move || PemKeySource::generate(bits))
        .await
        .context("Key generation task failed")??;
    let (public, private) = keys.write_pem(out).context("Failed to write keys")?;
    let thumbprint = keys.thumbprint_hex();
    info!(%thumbprint, dir = %out.display(), "Generated key pair");

    if matches!(format, OutputFormat::Json) {
        formatter.print_json(&serde_json::json!({
            "public_key": public.display().to_string(),
            "private_key": private.map(|p| p.display().to_string()),
            "thumbprint": thumbprint,
        }));
    } else {
        formatter.success(&format!("Public key:  {}", public.display()));
        if let Some(private) = private {
            formatter.success(&format!("Private key: {}", private.display()));
        }
        formatter.info(&format!("Thumbprint:  {}", thumbprint));
        formatter.info("Set encryption.public_key and encryption.private_key to use them.");
    }
    Ok(())
}
