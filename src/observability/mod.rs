//! Observability for recovery and failover
//!
//! - Structured single-line JSON logging
//! - Typed lifecycle events
//! - Atomic counters
//! - Scope-bracketed work units
//!
//! Observability is read-only: nothing here changes recovery behavior, and
//! a failed log write is dropped rather than surfaced.
//!
//! ```ignore
//! use rangekeeper::observability::{Event, Logger, ObservationScope};
//!
//! Logger::event(Event::BarrierOpened, &[("class", "root")]);
//!
//! let scope = ObservationScope::with_fields("CLASS_REPLAY", &[("class", "user")]);
//! // ... replay ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};
