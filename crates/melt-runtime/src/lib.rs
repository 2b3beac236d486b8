//! Instrumented chat-inference sessions for energy measurements.
//!
//! A [`SessionController`] drives one native chat module through its lifecycle (reload, reset,
//! prefill, decode, message retrieval, unload) and brackets every call with timestamped events on
//! a [`Timeline`], which can be exported as CSV and aligned with external power traces.
//!
//! The main pieces are:
//! * [`native`]: the boundary to the native chat module, plus an in-process simulation of it.
//! * [`InferenceSession`]: entry point binding and the session state machine.
//! * [`SessionController`]: instrumentation and per-operation counters around the session.
//! * [`SessionHost`]: runs a controller on its own worker thread.
//! * [`MeasurementRun`]: replays scripted conversations and writes measurement records.
pub mod automation;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod counters;
pub mod error;
pub mod host;
pub mod native;
pub mod notify;
pub mod records;
pub mod session;
pub mod stats;
pub mod timeline;

pub use automation::{AutomationError, AutomationReport, MeasurementRun, load_conversations};
pub use cancel::CancelToken;
pub use clock::{Clock, MonotonicClock, SteppingClock};
pub use config::{ConfigError, MeasurementConfig};
pub use controller::{FinishReason, Generation, SessionController};
pub use counters::{Operation, OperationCounters};
pub use error::SessionError;
pub use host::{HostError, SessionHandle, SessionHost};
pub use native::{Device, DeviceKind, NativeError, NativeRegistry};
pub use session::{InferenceSession, LoadedModel, SessionState};
pub use stats::{PhaseStats, RuntimeStats, StatsError};
pub use timeline::{Event, EventKey, InstrumentationError, Phase, Timeline};
