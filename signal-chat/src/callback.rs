//! Carrying listener errors through native calls.
//!
//! Native code only sees an integer status from a callback. While a native
//! call that may invoke callbacks is running on this thread, the first error
//! a callback raises is parked in a thread-local slot; when the call then
//! fails with `CallbackError`, that original error is returned instead.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use signal_chat_sys::SIGNAL_CALLBACK_FAILED;

use crate::error::{BoxError, Error, Result};

thread_local! {
    static SLOTS: RefCell<Vec<Option<BoxError>>> = const { RefCell::new(Vec::new()) };
}

/// One capture slot, popped when dropped (also on unwind).
struct CaptureScope;

impl CaptureScope {
    fn enter() -> Self {
        SLOTS.with_borrow_mut(|slots| slots.push(None));
        Self
    }

    fn take(&self) -> Option<BoxError> {
        SLOTS.with_borrow_mut(|slots| slots.last_mut().and_then(Option::take))
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        SLOTS.with_borrow_mut(|slots| {
            slots.pop();
        });
    }
}

/// Run a callback-bearing native call, surfacing a captured callback error.
pub(crate) fn rethrow_callback_errors<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    let scope = CaptureScope::enter();
    let result = f();
    let captured = scope.take();
    match (result, captured) {
        (Err(Error::Callback(_)), Some(original)) => Err(Error::Listener(original)),
        (result, Some(discarded)) => {
            tracing::debug!(error = %discarded, "discarding listener error the native call did not report");
            result
        }
        (result, None) => result,
    }
}

/// Run host callback code invoked by native code; returns the native status.
///
/// An error or panic is parked in the innermost capture slot (the first one
/// wins) and reported to native code as [`SIGNAL_CALLBACK_FAILED`].
pub(crate) fn catch_callback_errors(f: impl FnOnce() -> std::result::Result<(), BoxError>) -> i32 {
    let error = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return 0,
        Ok(Err(error)) => error,
        Err(payload) => panic_message(payload.as_ref()).into(),
    };
    let unclaimed = SLOTS.with_borrow_mut(|slots| match slots.last_mut() {
        Some(slot) if slot.is_none() => {
            *slot = Some(error);
            None
        }
        _ => Some(error),
    });
    if let Some(error) = unclaimed {
        tracing::warn!(%error, "listener callback failed");
    }
    SIGNAL_CALLBACK_FAILED
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    format!("listener panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("listener exploded")]
    struct Exploded;

    fn fail_in_callback() -> i32 {
        catch_callback_errors(|| Err(Exploded.into()))
    }

    #[test]
    fn callback_error_unwrapped_to_original() {
        let err = rethrow_callback_errors(|| -> Result<()> {
            assert_eq!(fail_in_callback(), SIGNAL_CALLBACK_FAILED);
            Err(Error::Callback("callback failed".into()))
        })
        .unwrap_err();
        match err {
            Error::Listener(original) => assert!(original.downcast_ref::<Exploded>().is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn callback_error_without_capture_propagates() {
        let err = rethrow_callback_errors(|| -> Result<()> {
            Err(Error::Callback("native callback failed".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Callback(_)));
    }

    #[test]
    fn other_outcomes_discard_capture() {
        let ok = rethrow_callback_errors(|| {
            fail_in_callback();
            Ok(7)
        });
        assert_eq!(ok.unwrap(), 7);

        let err = rethrow_callback_errors(|| -> Result<()> {
            fail_in_callback();
            Err(Error::Network("reset".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        SLOTS.with_borrow(|slots| assert!(slots.is_empty()));
    }

    #[test]
    fn first_error_wins() {
        let err = rethrow_callback_errors(|| -> Result<()> {
            fail_in_callback();
            catch_callback_errors(|| Err("second".into()));
            Err(Error::Callback(String::new()))
        })
        .unwrap_err();
        match err {
            Error::Listener(original) => assert!(original.is::<Exploded>()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn panics_are_captured() {
        let err = rethrow_callback_errors(|| -> Result<()> {
            let status = catch_callback_errors(|| panic!("boom"));
            assert_eq!(status, SIGNAL_CALLBACK_FAILED);
            Err(Error::Callback(String::new()))
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn no_active_scope_still_reports_failure() {
        assert_eq!(fail_in_callback(), SIGNAL_CALLBACK_FAILED);
        assert_eq!(catch_callback_errors(|| Ok(())), 0);
    }

    #[test]
    fn nested_scopes_are_isolated() {
        let outer = rethrow_callback_errors(|| -> Result<()> {
            let inner = rethrow_callback_errors(|| -> Result<()> {
                fail_in_callback();
                Err(Error::Callback(String::new()))
            });
            assert!(matches!(inner, Err(Error::Listener(_))));
            Err(Error::Callback("outer".into()))
        })
        .unwrap_err();
        assert!(matches!(outer, Error::Callback(_)));
    }
}
