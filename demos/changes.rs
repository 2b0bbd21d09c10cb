//! Prints every change for a given set of files.
//!
//! Usage:
//!     changes /path/to/file1 /path/to/file2 ...
//!
//! The files must exist. Existing content is printed first, then anything
//! appended, rotated or removed while the demo runs.

use tailwatch::{TailConfig, TailEngine};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let engine = TailEngine::new(TailConfig::default())?;
    let mut tail = engine.start(args).await?;

    while let Some(change) = tail.next_change().await {
        while let Some(err) = tail.try_next_error() {
            eprintln!("error: {}", err);
        }

        let source = change
            .file()
            .map(|f| f.path().display().to_string())
            .unwrap_or_else(|| "<gone>".to_string());

        println!("{:?} ({})", change.kind(), source);
        for line in change.iter() {
            println!("  {}", line);
        }
    }

    // A notifier failure is reported just before the stream closes.
    while let Some(err) = tail.try_next_error() {
        eprintln!("error: {}", err);
    }

    Ok(())
}
