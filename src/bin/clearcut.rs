//! Clearcut CLI
//!
//! Command-line interface for batch background removal and point-prompted
//! selection using the clearcut library.

#[cfg(feature = "cli")]
use clearcut::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
