//! Instrumented façade over an [`InferenceSession`].
//!
//! Every call is bracketed by a start and an end event on the controller's [`Timeline`]. Counted
//! operations (see [`Operation::COUNTED`]) label their events with a sequence number that advances
//! after the end event, so `decode.0`, `decode.1`, ... identify successive calls. Operations
//! without a counter reuse the same event names on every call and keep only the latest timing.
//!
//! When the native call fails, the start event stays in the timeline, no end event is written
//! and the counter does not advance.

use crate::cancel::CancelToken;
use crate::clock::{Clock, MonotonicClock};
use crate::counters::{Operation, OperationCounters};
use crate::error::SessionError;
use crate::native::{Device, NativeRegistry};
use crate::session::InferenceSession;
use crate::timeline::{EventKey, InstrumentationError, Timeline};
use std::path::Path;
use std::sync::Arc;

/// Outcome of [`SessionController::generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub message: String,
    pub decode_steps: usize,
    pub finish: FinishReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FinishReason {
    /// The native module reported a stopping condition.
    Stopped,
    /// The caller's step limit was reached first.
    StepLimit,
    Cancelled,
}

pub struct SessionController<C: Clock = MonotonicClock> {
    session: InferenceSession,
    timeline: Timeline,
    counters: OperationCounters,
    clock: C,
}

impl SessionController<MonotonicClock> {
    pub fn new(registry: Arc<dyn NativeRegistry>, device: Device) -> Result<Self, SessionError> {
        Self::with_clock(registry, device, MonotonicClock::new())
    }
}

impl<C: Clock> SessionController<C> {
    /// Create the session, recording its construction as `init.start` / `init.end`.
    pub fn with_clock(
        registry: Arc<dyn NativeRegistry>,
        device: Device,
        mut clock: C,
    ) -> Result<Self, SessionError> {
        let mut timeline = Timeline::new();
        timeline.record(EventKey::start(Operation::Init, None), clock.now_nanos());
        let session = InferenceSession::new(registry, device)?;
        timeline.record(EventKey::end(Operation::Init, None), clock.now_nanos());

        Ok(Self {
            session,
            timeline,
            counters: OperationCounters::new(),
            clock,
        })
    }

    fn instrumented<T>(
        &mut self,
        op: Operation,
        f: impl FnOnce(&mut InferenceSession) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let sequence = self.counters.current(op);
        self.timeline
            .record(EventKey::start(op, sequence), self.clock.now_nanos());
        let result = f(&mut self.session)?;
        self.timeline
            .record(EventKey::end(op, sequence), self.clock.now_nanos());
        self.counters.advance(op);
        Ok(result)
    }

    pub fn unload(&mut self) -> Result<(), SessionError> {
        self.instrumented(Operation::Unload, InferenceSession::unload)
    }

    /// Load `model_path` with the library registered for `model_lib`.
    ///
    /// Library resolution happens before the start event; only the native reload is timed.
    pub fn reload(&mut self, model_lib: &str, model_path: &str) -> Result<(), SessionError> {
        let library = self.session.resolve_library(model_lib)?;
        self.instrumented(Operation::Reload, |s| {
            s.reload_with_library(library, model_path)
        })
    }

    pub fn reset_chat(&mut self) -> Result<(), SessionError> {
        self.instrumented(Operation::ResetChat, InferenceSession::reset_chat)
    }

    pub fn prefill(&mut self, input: &str) -> Result<(), SessionError> {
        self.instrumented(Operation::Prefill, |s| s.prefill(input))
    }

    pub fn decode(&mut self) -> Result<(), SessionError> {
        self.instrumented(Operation::Decode, InferenceSession::decode)
    }

    pub fn get_message(&mut self) -> Result<String, SessionError> {
        self.instrumented(Operation::GetMessage, InferenceSession::get_message)
    }

    pub fn stopped(&mut self) -> Result<bool, SessionError> {
        self.instrumented(Operation::Stopped, InferenceSession::stopped)
    }

    pub fn runtime_stats_text(&mut self) -> Result<String, SessionError> {
        self.instrumented(
            Operation::RuntimeStatsText,
            InferenceSession::runtime_stats_text,
        )
    }

    pub fn verbose_runtime_stats_text(&mut self) -> Result<String, SessionError> {
        self.instrumented(
            Operation::VerboseRuntimeStatsText,
            InferenceSession::verbose_runtime_stats_text,
        )
    }

    pub fn evaluate(&mut self) -> Result<(), SessionError> {
        self.instrumented(Operation::Evaluate, InferenceSession::evaluate)
    }

    /// Prefill `prompt`, then decode until the module stops, the step limit is hit or `cancel`
    /// fires. `on_progress` receives the accumulated message after every decode step.
    pub fn generate(
        &mut self,
        prompt: &str,
        max_steps: Option<usize>,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(&str),
    ) -> Result<Generation, SessionError> {
        self.prefill(prompt)?;
        let mut decode_steps = 0;
        let finish = loop {
            if self.stopped()? {
                break FinishReason::Stopped;
            }
            if cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if max_steps.is_some_and(|max| decode_steps >= max) {
                break FinishReason::StepLimit;
            }
            self.decode()?;
            decode_steps += 1;
            let partial = self.get_message()?;
            on_progress(&partial);
        };
        let message = self.get_message()?;
        log::debug!("Generation finished after {decode_steps} decode step(s): {finish}");
        Ok(Generation {
            message,
            decode_steps,
            finish,
        })
    }

    /// Clear every recorded event and reset all operation counters to zero.
    pub fn reset_instrumentation(&mut self) {
        self.timeline.clear();
        self.counters.reset();
    }

    /// Export the timeline as `name,timestamp` lines.
    pub fn save_instrumentation(&self, path: impl AsRef<Path>) -> Result<(), InstrumentationError> {
        let path = path.as_ref();
        self.timeline.export(path)?;
        log::debug!(
            "Saved {} instrumentation event(s) to {}",
            self.timeline.len(),
            path.display()
        );
        Ok(())
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn counters(&self) -> &OperationCounters {
        &self.counters
    }

    pub fn session(&self) -> &InferenceSession {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use crate::native::simulated::{SimulatedRegistry, registry_for};
    use crate::timeline::Phase;

    fn controller(registry: SimulatedRegistry) -> SessionController<SteppingClock> {
        SessionController::with_clock(
            Arc::new(registry),
            Device::default(),
            SteppingClock::new(1_000, 10),
        )
        .unwrap()
    }

    #[test]
    fn construction_is_recorded() {
        let controller = controller(SimulatedRegistry::new());
        let names: Vec<String> = controller
            .timeline()
            .iter()
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(names, ["init.start", "init.end"]);
    }

    #[test]
    fn failed_call_leaves_open_start_event() {
        let registry = registry_for("m").failing_entry_point("decode");
        let mut controller = controller(registry);
        controller.reload("m", "/models/m").unwrap();
        controller.prefill("hello").unwrap();

        assert!(controller.decode().is_err());
        let timeline = controller.timeline();
        assert!(timeline
            .get(&EventKey::start(Operation::Decode, Some(0)))
            .is_some());
        assert!(timeline
            .get(&EventKey::end(Operation::Decode, Some(0)))
            .is_none());
        assert_eq!(controller.counters().current(Operation::Decode), Some(0));
    }

    #[test]
    fn library_resolution_failure_records_nothing() {
        let mut controller = controller(SimulatedRegistry::new());
        assert!(controller.reload("m", "/models/m").is_err());
        assert_eq!(controller.timeline().len(), 2);
        assert_eq!(controller.counters().current(Operation::Reload), Some(0));
    }

    #[test]
    fn uncounted_operations_overwrite() {
        let mut controller = controller(registry_for("m"));
        controller.reload("m", "/models/m").unwrap();
        controller.runtime_stats_text().unwrap();
        let first = controller
            .timeline()
            .get(&EventKey::end(Operation::RuntimeStatsText, None))
            .unwrap();
        let len = controller.timeline().len();

        controller.runtime_stats_text().unwrap();
        let second = controller
            .timeline()
            .get(&EventKey::end(Operation::RuntimeStatsText, None))
            .unwrap();
        assert_eq!(controller.timeline().len(), len);
        assert!(second > first);
    }

    #[test]
    fn generate_follows_protocol() {
        let mut controller = controller(registry_for("m"));
        controller.reload("m", "/models/m").unwrap();
        controller.reset_chat().unwrap();

        let mut progress = Vec::new();
        let generation = controller
            .generate("a b c", None, &CancelToken::new(), |m| {
                progress.push(m.to_string())
            })
            .unwrap();

        assert_eq!(generation.message, "a b c");
        assert_eq!(generation.decode_steps, 3);
        assert_eq!(generation.finish, FinishReason::Stopped);
        assert_eq!(progress, ["a", "a b", "a b c"]);
        assert_eq!(controller.counters().current(Operation::Stopped), Some(4));
    }

    #[test]
    fn generate_honours_step_limit_and_cancel() {
        let mut controller = controller(registry_for("m"));
        controller.reload("m", "/models/m").unwrap();

        let limited = controller
            .generate("a b c d", Some(2), &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(limited.finish, FinishReason::StepLimit);
        assert_eq!(limited.message, "a b");

        let cancel = CancelToken::new();
        cancel.cancel();
        let cancelled = controller.generate("x y", None, &cancel, |_| {}).unwrap();
        assert_eq!(cancelled.finish, FinishReason::Cancelled);
        assert_eq!(cancelled.decode_steps, 0);
    }

    #[test]
    fn reset_instrumentation_restarts_sequences() {
        let mut controller = controller(registry_for("m"));
        controller.reload("m", "/models/m").unwrap();
        controller.prefill("a").unwrap();
        controller.prefill("b").unwrap();
        controller.reset_instrumentation();
        assert!(controller.timeline().is_empty());

        controller.prefill("c").unwrap();
        let keys: Vec<_> = controller.timeline().iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            [
                EventKey::new(Operation::Prefill, Some(0), Phase::Start),
                EventKey::new(Operation::Prefill, Some(0), Phase::End),
            ]
        );
    }
}
