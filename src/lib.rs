pub mod audit;
pub mod config;
pub mod flight; // Single-flight control
pub mod pipeline;
pub mod supervisor; // Mode Coordinator / Chainer

use tracing_subscriber::EnvFilter;

pub use audit::{AuditCategory, AuditEntry, AuditLog};
pub use config::{BackendConfig, BackendKind, ConfigError, SupervisorConfig};
pub use flight::ActiveRun;
pub use pipeline::{Delivery, Mode, RunFailure, RunId, RunOutcome, StreamChunk};
pub use supervisor::{GateReason, SubmitError, Supervisor, SupervisorError};

/// Install the fmt subscriber. `RUST_LOG` wins over the built-in filter.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("{} v{} logging initialized", config::APP_NAME, config::APP_VERSION);
    }
}
