//! Dedicated worker thread owning a [`SessionController`].
//!
//! Native calls block, so interactive callers keep the controller on its own thread and talk to
//! it through cloneable [`SessionHandle`]s. Calls are executed one at a time, in arrival order,
//! so the instrumentation timeline sees the same serial sequence of operations as a direct caller.
//!
//! Unlike a plain model host, the worker hands its controller back: [`SessionHost::into_controller`]
//! stops the thread and returns the controller with its timeline and counters intact, ready for
//! export. A call that panics takes the worker down; pending and later calls then fail with
//! [`HostError::Disconnected`] and `into_controller` reports the panic message as
//! [`HostError::ThreadPanicked`].

use crate::clock::{Clock, MonotonicClock};
use crate::controller::SessionController;
use std::any::Any;
use std::thread::JoinHandle;

type BoxAny = Box<dyn Any + Send>;
type Call<C> = Box<dyn FnOnce(&mut SessionController<C>) + Send>;
type CallRet<C> = Box<dyn FnOnce(&mut SessionController<C>) -> BoxAny + Send>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Session worker is no longer running")]
    Disconnected,
    #[error("Session worker returned an unexpected value type")]
    UnexpectedReturn,
    #[error("Session worker thread panicked: {0}")]
    ThreadPanicked(String),
}

enum Msg<C: Clock> {
    Call {
        f: Call<C>,
        done: crossbeam::channel::Sender<()>,
    },
    CallRet {
        f: CallRet<C>,
        ret: crossbeam::channel::Sender<BoxAny>,
    },
}

pub struct SessionHost<C: Clock = MonotonicClock> {
    handle: SessionHandle<C>,
    abort_tx: crossbeam::channel::Sender<()>,
    join_handle: Option<JoinHandle<SessionController<C>>>,
}

impl<C: Clock> SessionHost<C> {
    /// Move `controller` onto a new worker thread.
    pub fn spawn(controller: SessionController<C>) -> Self {
        let (abort_tx, abort_rx) = crossbeam::channel::unbounded::<()>();
        let (tx, rx) = crossbeam::channel::unbounded::<Msg<C>>();
        let join_handle = std::thread::spawn(move || {
            let mut controller = controller;
            loop {
                crossbeam::channel::select! {
                    recv(rx) -> msg => {
                        match msg {
                            Ok(Msg::Call { f, done }) => {
                                f(&mut controller);
                                let _ = done.send(());
                            }
                            Ok(Msg::CallRet { f, ret }) => {
                                let r = f(&mut controller);
                                let _ = ret.send(r);
                            }
                            Err(_) => break,
                        }
                    }
                    recv(abort_rx) -> _ => {
                        break;
                    }
                }
            }
            log::debug!("Session worker stopped");
            controller
        });
        Self {
            handle: SessionHandle { tx },
            abort_tx,
            join_handle: Some(join_handle),
        }
    }

    pub fn handle(&self) -> SessionHandle<C> {
        self.handle.clone()
    }

    /// Stop the worker and take the controller back.
    pub fn into_controller(mut self) -> Result<SessionController<C>, HostError> {
        let _ = self.abort_tx.send(());
        let join_handle = self.join_handle.take().ok_or(HostError::Disconnected)?;
        join_handle.join().map_err(|e| {
            let msg = e
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| e.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            HostError::ThreadPanicked(msg)
        })
    }
}

impl<C: Clock> std::ops::Deref for SessionHost<C> {
    type Target = SessionHandle<C>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<C: Clock> Drop for SessionHost<C> {
    fn drop(&mut self) {
        let _ = self.abort_tx.send(());
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

pub struct SessionHandle<C: Clock> {
    tx: crossbeam::channel::Sender<Msg<C>>,
}

impl<C: Clock> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: Clock> SessionHandle<C> {
    /// Run `f` against the controller on the worker thread and return its result.
    pub fn with<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut SessionController<C>) -> R + Send + 'static,
    ) -> Result<R, HostError> {
        let (ret_tx, ret_rx) = crossbeam::channel::bounded(1);
        self.tx
            .send(Msg::CallRet {
                f: Box::new(move |c| Box::new(f(c)) as BoxAny),
                ret: ret_tx,
            })
            .map_err(|_| HostError::Disconnected)?;
        let r = ret_rx.recv().map_err(|_| HostError::Disconnected)?;
        r.downcast::<R>()
            .map(|r| *r)
            .map_err(|_| HostError::UnexpectedReturn)
    }

    /// Run `f` against the controller and wait for it to complete.
    pub fn fire(
        &self,
        f: impl FnOnce(&mut SessionController<C>) + Send + 'static,
    ) -> Result<(), HostError> {
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        self.tx
            .send(Msg::Call {
                f: Box::new(f),
                done: done_tx,
            })
            .map_err(|_| HostError::Disconnected)?;
        done_rx.recv().map_err(|_| HostError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::clock::SteppingClock;
    use crate::controller::FinishReason;
    use crate::counters::Operation;
    use crate::native::Device;
    use crate::native::simulated::registry_for;
    use std::sync::Arc;

    fn host() -> SessionHost<SteppingClock> {
        let controller = SessionController::with_clock(
            Arc::new(registry_for("m")),
            Device::default(),
            SteppingClock::new(0, 1),
        )
        .unwrap();
        SessionHost::spawn(controller)
    }

    #[test]
    fn calls_run_on_worker_and_return_values() {
        let host = host();
        host.with(|c| c.reload("m", "/models/m")).unwrap().unwrap();

        let worker = host.handle();
        let message = std::thread::spawn(move || {
            worker
                .with(|c| {
                    c.generate("hello world", None, &CancelToken::new(), |_| {})
                        .map(|g| g.message)
                })
                .unwrap()
        })
        .join()
        .unwrap()
        .unwrap();
        assert_eq!(message, "hello world");

        host.fire(|c| c.reset_instrumentation()).unwrap();
        let controller = host.into_controller().unwrap();
        assert!(controller.timeline().is_empty());
        assert_eq!(controller.counters().current(Operation::Decode), Some(0));
    }

    #[test]
    fn cancel_token_is_visible_from_worker() {
        let host = host();
        host.with(|c| c.reload("m", "/models/m")).unwrap().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let token = cancel.clone();
        let finish = host
            .with(move |c| c.generate("a b c", None, &token, |_| {}).map(|g| g.finish))
            .unwrap()
            .unwrap();
        assert_eq!(finish, FinishReason::Cancelled);
    }

    #[test]
    fn panicking_call_is_reported() {
        let host = host();
        let result = host.with(|c| {
            if c.timeline().len() == 2 {
                panic!("native module crashed");
            }
        });
        assert!(matches!(result, Err(HostError::Disconnected)));
        assert!(matches!(
            host.fire(|c| c.reset_instrumentation()),
            Err(HostError::Disconnected)
        ));
        match host.into_controller() {
            Err(HostError::ThreadPanicked(msg)) => assert_eq!(msg, "native module crashed"),
            other => panic!("unexpected outcome: {:?}", other.map(|c| c.timeline().len())),
        }
    }

    #[test]
    fn handle_reports_disconnect_after_shutdown() {
        let host = host();
        let handle = host.handle();
        drop(host);
        assert!(matches!(
            handle.with(|c| c.timeline().len()),
            Err(HostError::Disconnected)
        ));
    }
}
