pub mod chat;
pub mod run;
pub mod stats;

use anyhow::Context;
use melt_runtime::CancelToken;
use melt_runtime::native::simulated::{SimulatedRegistry, registry_for};
use std::time::Duration;

/// Registry of the in-process chat module, knowing only the library of `model_lib`.
pub(crate) fn simulated_registry(
    model_lib: &str,
    max_gen_len: Option<usize>,
    token_latency: Duration,
) -> SimulatedRegistry {
    let registry = registry_for(model_lib).with_token_latency(token_latency);
    match max_gen_len {
        Some(max_gen_len) => registry.with_max_gen_len(max_gen_len),
        None => registry,
    }
}

/// Route Ctrl-C to a cancellation token instead of killing the process.
pub(crate) fn cancel_on_interrupt() -> anyhow::Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::debug!("Interrupt received");
        handler_token.cancel();
    })
    .context("Failed to install the Ctrl-C handler")?;
    Ok(cancel)
}
