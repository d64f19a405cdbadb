//! Run lifecycle orchestration.
//!
//! [`Supervisor`] ties the registry, log hub, estimator and launcher
//! together for any number of concurrent runs. After each pipeline ends the
//! post-run processor prunes expired records and saves the registry.

mod controller;
mod post_process;

pub use controller::{run_controller, Supervisor, UiCommand};
pub(crate) use post_process::process_run_completion;
