pub mod breaker;
pub mod classify;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod selector;
pub mod traits;

mod engine_tests;

pub use breaker::{BreakerBank, BreakerStats, CircuitBreaker, CircuitState};
pub use classify::{classify_invocation_error, DispatchFailureKind};
pub use engine::{
    AttemptOutcome, AttemptRecord, DispatchEngine, DispatchOutcome, DispatchStats,
    TelemetrySnapshot,
};
pub use error::{
    AggregateDispatchError, AttemptFailure, DispatchError, RejectReason, RejectedCandidate,
};
pub use fallback::{FallbackRegistry, FallbackStrategy};
pub use metrics::{BackendMetrics, MetricsCache};
pub use quota::{QuotaGate, QuotaSnapshot};
pub use rate_limit::{RateLimiter, RateLimiterBank};
pub use selector::{ProviderSelection, ProviderSelector, RoutingContext};
pub use traits::Dispatcher;
