//! Progress-callback trait for per-step workflow events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the workflow moves from node to node. The CLI drives its
//! progress bar from these hooks; the server does not need them because it
//! forwards the step stream itself.
//!
//! # Example
//!
//! ```rust
//! use edgequake_invoice::{ExtractionProgressCallback, ExtractionConfig, Step};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_step_complete(&self, step: Step, _elapsed_ms: u64) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{step} done ({done} so far)");
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::workflow::Step;
use std::sync::Arc;

/// Called by the workflow as it runs each node.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Steps run one at a time, but the callback lives in
/// a config shared across server requests and the streamed run is polled
/// on whichever runtime thread the response is written from, hence
/// `Send + Sync`.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before the first node runs.
    fn on_run_start(&self, total_steps: usize) {
        let _ = total_steps;
    }

    /// Called just before a node runs.
    fn on_step_start(&self, step: Step) {
        let _ = step;
    }

    /// Called when a node has produced its output.
    fn on_step_complete(&self, step: Step, elapsed_ms: u64) {
        let _ = (step, elapsed_ms);
    }

    /// Called when a node fails, fatally or not.
    fn on_step_error(&self, step: Step, error: &str) {
        let _ = (step, error);
    }

    /// Called once after the run finished or aborted.
    fn on_run_complete(&self, completed_steps: usize, succeeded: bool) {
        let _ = (completed_steps, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
