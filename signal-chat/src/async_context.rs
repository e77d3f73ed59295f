#![allow(unsafe_code)]
//! Bridge from native promise-style entry points to Rust futures.
//!
//! Each submission boxes a [`Completer`] and hands its address to the native
//! runtime as the promise context. The native runtime calls [`complete`]
//! exactly once, on whatever thread it likes; the trampoline reclaims the box,
//! converts the payload, and wakes the [`PendingOperation`].

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use signal_chat_sys::{SignalCPromise, SignalFfiApi, SignalFfiError, SignalTokioAsyncContext};
use tokio::sync::oneshot;

use crate::error::{self, Error, Result};
use crate::ffi::{HandleLease, NativeHandleOwner, invoke_fn_returning_native_handle};

/// A value delivered through a native promise.
pub(crate) trait AsyncResult: Send + Sized + 'static {
    /// The `#[repr(C)]` payload the native side completes with.
    type Raw;

    /// Take ownership of everything reachable from `raw`.
    ///
    /// `raw` is only valid for the duration of this call.
    unsafe fn consume(api: &'static SignalFfiApi, raw: *const Self::Raw) -> Result<Self>;
}

impl AsyncResult for bool {
    type Raw = bool;

    unsafe fn consume(_api: &'static SignalFfiApi, raw: *const bool) -> Result<bool> {
        unsafe { raw.as_ref() }
            .copied()
            .ok_or_else(|| Error::Precondition("null promise result".into()))
    }
}

/// Native async runtime handle.
pub(crate) struct TokioAsyncContext {
    handle: NativeHandleOwner<SignalTokioAsyncContext>,
}

impl TokioAsyncContext {
    pub(crate) fn new(api: &'static SignalFfiApi) -> Result<Self> {
        let handle = invoke_fn_returning_native_handle(api, |out| unsafe {
            (api.tokio_async_context_new)(out)
        })?;
        Ok(Self { handle })
    }

    /// Lend the runtime handle for one synchronous call.
    pub(crate) fn with_native_handle<R>(
        &self,
        f: impl FnOnce(*const SignalTokioAsyncContext) -> R,
    ) -> R {
        self.handle.with_native_handle(f)
    }

    /// Submit one native async operation.
    ///
    /// `retain` is kept alive until the operation completes (pass leases on
    /// every handle `submit` gives to native code). A synchronous submission
    /// failure is returned immediately.
    pub(crate) fn invoke_async_function<T, L>(
        &self,
        retain: L,
        submit: impl FnOnce(
            *mut SignalCPromise<T::Raw>,
            *const SignalTokioAsyncContext,
        ) -> *mut SignalFfiError,
    ) -> Result<PendingOperation<T>>
    where
        T: AsyncResult,
        L: Send + 'static,
    {
        let api = self.handle.api();
        let (tx, rx) = oneshot::channel();
        let completer = Box::into_raw(Box::new(Completer::<T> {
            tx,
            api,
            _retained: Box::new((self.handle.lease(), retain)),
        }));
        let mut promise = SignalCPromise {
            complete: Some(complete::<T>),
            context: completer.cast_const().cast::<c_void>(),
            cancellation_id: 0,
        };
        let rc = self
            .handle
            .with_native_handle(|runtime| submit(&raw mut promise, runtime));
        if let Err(e) = error::check(api, rc) {
            // Never handed to the native runtime.
            drop(unsafe { Box::from_raw(completer) });
            return Err(e);
        }
        Ok(PendingOperation {
            rx,
            cancellation: Some(Cancellation {
                runtime: self.handle.lease(),
                id: promise.cancellation_id,
            }),
        })
    }
}

impl fmt::Debug for TokioAsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioAsyncContext")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Completion slot of one submission; owned by the native runtime until it fires.
struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
    api: &'static SignalFfiApi,
    _retained: Box<dyn Any + Send>,
}

unsafe extern "C" fn complete<T: AsyncResult>(
    error: *mut SignalFfiError,
    result: *const T::Raw,
    context: *const c_void,
) {
    if context.is_null() {
        tracing::warn!("promise completed without context");
        return;
    }
    let completer = unsafe { Box::from_raw(context.cast_mut().cast::<Completer<T>>()) };
    let Completer { tx, api, _retained } = *completer;
    let outcome = error::check(api, error).and_then(|()| unsafe { T::consume(api, result) });
    if tx.send(outcome).is_err() {
        tracing::debug!("async result dropped, nobody is waiting");
    }
    // Retained leases are released here, possibly destroying handles.
}

/// Asks the native runtime to cancel an unresolved operation.
struct Cancellation {
    runtime: HandleLease<SignalTokioAsyncContext>,
    id: u64,
}

impl Cancellation {
    fn cancel(self) {
        let api = self.runtime.api();
        let rc = self
            .runtime
            .with_native_handle(|runtime| unsafe { (api.tokio_async_context_cancel)(runtime, self.id) });
        match error::check(api, rc) {
            Ok(()) => tracing::debug!(cancellation_id = self.id, "cancellation requested"),
            Err(e) => tracing::warn!(cancellation_id = self.id, error = %e, "failed to cancel operation"),
        }
    }
}

/// Future of one native async operation; resolves exactly once.
///
/// Dropping it before resolution requests cancellation. Whatever the native
/// side still writes into is owned by the native completion, not by this value.
#[must_use = "futures do nothing unless awaited"]
pub(crate) struct PendingOperation<T> {
    rx: oneshot::Receiver<Result<T>>,
    cancellation: Option<Cancellation>,
}

impl<T> Future for PendingOperation<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        self.cancellation = None;
        Poll::Ready(match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(
                "native runtime dropped the operation without completing it".into(),
            )),
        })
    }
}

impl<T> Drop for PendingOperation<T> {
    fn drop(&mut self) {
        if let Some(cancellation) = self.cancellation.take() {
            cancellation.cancel();
        }
    }
}

impl<T> fmt::Debug for PendingOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("cancellation_id", &self.cancellation.as_ref().map(|c| c.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use signal_chat_sys::{SignalCPromisebool, SignalErrorCodeInternalError};

    use super::*;

    static SUBMITTED: AtomicUsize = AtomicUsize::new(0);

    /// Resolves the promise with `true` from a thread the runtime does not own.
    unsafe extern "C" fn complete_from_thread(
        promise: *mut SignalCPromisebool,
        _runtime: *const SignalTokioAsyncContext,
    ) -> *mut SignalFfiError {
        SUBMITTED.fetch_add(1, Ordering::SeqCst);
        let promise = unsafe { &mut *promise };
        promise.cancellation_id = 7;
        let complete = promise.complete.unwrap();
        let context = promise.context as usize;
        std::thread::spawn(move || {
            let value = true;
            unsafe { complete(std::ptr::null_mut(), &raw const value, context as *const c_void) };
        });
        std::ptr::null_mut()
    }

    fn context() -> TokioAsyncContext {
        TokioAsyncContext::new(signal_chat_ffi::api()).unwrap()
    }

    #[tokio::test]
    async fn resolves_from_foreign_thread() {
        let ctx = context();
        let pending = ctx
            .invoke_async_function::<bool, _>((), |promise, runtime| unsafe {
                complete_from_thread(promise, runtime)
            })
            .unwrap();
        assert!(pending.await.unwrap());
        assert!(SUBMITTED.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn submission_failure_returns_immediately() {
        let ctx = context();
        let retained = std::sync::Arc::new(());
        let err = ctx
            .invoke_async_function::<bool, _>(std::sync::Arc::clone(&retained), |_, _| {
                signal_chat_ffi::ffi_error(SignalErrorCodeInternalError, "rejected")
            })
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // The completion slot and what it retained were reclaimed.
        assert_eq!(std::sync::Arc::strong_count(&retained), 1);
    }
}
