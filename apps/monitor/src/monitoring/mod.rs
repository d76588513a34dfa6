/// Scheduled probing core.
///
/// This module owns:
/// - the priority queue of outstanding checks (`queue`)
/// - the staggered worker pool and hot-reload reconciler (`manager`)
/// - the name → probe dispatch tables (`registry`)
/// - the result sink with its change detector (`sink`)
/// - the probe implementations themselves (`probes`)
pub mod manager;
pub mod probes;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod util;

pub use manager::CheckManager;
pub use queue::{CheckItem, CheckQueue};
pub use registry::CheckRegistry;
pub use sink::ResultSink;
