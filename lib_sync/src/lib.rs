//! # lib_sync
//!
//! Client-side asynchronous synchronization core for the Intel Scout
//! dashboard: a process-wide resource lifecycle registry, a push-stream
//! synchronization client, and a polling state machine for long-running
//! generation jobs. UI consumers supply an endpoint or signal id plus
//! optional mapping functions and get back a reactive state handle; the
//! registry guarantees no timer or in-flight request survives past process
//! lifecycle boundaries.

pub mod core;
pub mod retrieve;
pub mod sync;

pub use crate::core::registry::{
    CleanupHandle, CleanupRegistry, ManagedOperation, ManagedTimer, ResourceCounts,
};
pub use crate::core::signals::install_signal_hooks;
pub use crate::retrieve::http::{ApiClient, ApiResponse};
pub use crate::sync::envelope::{ItemMapper, SnapshotMapper, StreamEnvelope};
pub use crate::sync::generation::{
    poll_interval, EmailGenerationStatus, EmailOutcome, GeneratedEmail, GenerationApi,
    GenerationConfig, GenerationError, GenerationRequest, GenerationStarted, GenerationTracker,
    HttpGenerationApi, JobStatus, SignalLookup, TrackerState,
};
pub use crate::sync::stream::{
    next_phase, ConnectionPhase, ConnectionSignal, StreamClient, StreamHandlers, StreamOptions,
    StreamState, DEFAULT_RECONNECT_INTERVAL,
};
pub use crate::sync::transport::{
    SseDecoder, SseTransport, StreamConnection, StreamError, StreamTransport,
};
