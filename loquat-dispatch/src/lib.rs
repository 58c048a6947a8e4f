//! Loquat Dispatch Library
//!
//! This library provides the routing and resilience core for the Loquat
//! gateway including:
//! - Weighted random provider selection with admission filtering
//! - Per-backend circuit breaking
//! - Quota and rate-limit gates
//! - Latency and error-rate telemetry
//! - Ordered fallback chains and the dispatch engine

pub mod dispatch;

pub use dispatch::{
    classify_invocation_error, AggregateDispatchError, AttemptFailure, AttemptOutcome,
    AttemptRecord, BackendMetrics, BreakerBank, BreakerStats, CircuitBreaker, CircuitState,
    DispatchEngine, DispatchError, DispatchFailureKind, DispatchOutcome, DispatchStats,
    Dispatcher, FallbackRegistry, FallbackStrategy, MetricsCache, ProviderSelection,
    ProviderSelector, QuotaGate, QuotaSnapshot, RateLimiter, RateLimiterBank, RejectReason,
    RejectedCandidate, RoutingContext, TelemetrySnapshot,
};
