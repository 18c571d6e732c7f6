// tabstream - per-tab agent sessions with streamed, formatted output

pub mod config;
pub mod controller;
pub mod error;
pub mod format;
pub mod host;
pub mod playback;
pub mod router;
pub mod session;

use anyhow::Context;

pub use config::PipelineConfig;
pub use controller::CancellationController;
pub use error::{PipelineError, PipelineResult};
pub use host::SessionHost;
pub use router::OutputRouter;
pub use session::{SessionError, SessionSupervisor};

/// Run one interactive session in the current directory until stdin closes or `:quit`
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = PipelineConfig::load().context("failed to load configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(host::run_interactive(config))
}
