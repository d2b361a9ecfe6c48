//! Server startup modules

pub mod bootstrap;
pub mod http;
pub mod logging;
pub mod shutdown;

pub use bootstrap::{SetupOutcome, report_setup};
pub use http::{rpc_scope, rpc_server};
pub use logging::{LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{cancel_on_signal, run_with_shutdown, wait_for_shutdown_signal};
