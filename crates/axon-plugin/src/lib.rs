//! The plugin pipeline (spec §4.5): an ordered, hot-reloadable chain of
//! pre/post hooks with symmetric LIFO execution, short-circuit outcomes, and
//! per-plugin panic isolation.

mod pipeline;
mod plugin;

pub use pipeline::{Pipeline, PreHookRun};
pub use plugin::{Plugin, PreHookOutcome};
