//! Zero Trust Policy Core — daemon entry point

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // The handle keeps the non-blocking log worker alive until exit.
    let _logging = match trustplane::logging::init_logging() {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("[WARN] Failed to initialize structured logging: {}", e);
            None
        }
    };

    match trustplane::app::run(std::env::args()).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
