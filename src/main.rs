use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nsz::compress::DEFAULT_COMPRESSION_LEVEL;
use nsz::convert::convert;
use nsz::formats::Keyset;

#[derive(Parser)]
#[command(author, version, about = "Compress NSP/NCA archives into NSZ/NCZ", long_about = None)]
struct Cli {
    /// Input NSP or NCA file
    input: PathBuf,

    /// Path to prod.keys (defaults to ./prod.keys, ./keys.txt, ~/.switch/)
    #[arg(short = 'k', long = "keys")]
    keys: Option<PathBuf>,

    /// Compression level (1-22, higher = slower but smaller)
    #[arg(short = 'l', long = "level", default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    level: i32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!(
        "{}",
        r#"
       _ __  _________
      | '_ \/ __|_  /
      | | | \__ \/ /
      |_| |_|___/___|
    "#
        .cyan()
    );

    let cli = Cli::parse();

    let level = if (1..=22).contains(&cli.level) {
        cli.level
    } else {
        DEFAULT_COMPRESSION_LEVEL
    };

    let keyset = match &cli.keys {
        Some(path) => Keyset::from_file(path),
        None => Keyset::load_default(),
    };
    let mut keyset = match keyset {
        Ok(keyset) => keyset,
        Err(e) => {
            warn!(error = %e, "Could not load keys; provide a file with -k or place prod.keys in ~/.switch/");
            Keyset::default()
        }
    };
    keyset.derive_keys();
    if !keyset.has_required_nca_keys() {
        warn!("Keyset is incomplete; encrypted NCAs may not be processable");
    }

    info!(input = %cli.input.display(), level, "Processing");
    let output = convert(&cli.input, &keyset, level)?;
    info!(output = %output.display(), "Done");

    Ok(())
}
