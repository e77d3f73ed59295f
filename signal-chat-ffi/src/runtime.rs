//! Native async runtime: promise completion and cancellation.

use std::collections::HashMap;
use std::ffi::c_void;
use std::future::Future;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use signal_chat_sys::{
    SignalCPromise, SignalCompleteFn, SignalErrorCodeCancelled, SignalErrorCodeInternalError,
    SignalFfiError, SignalTokioAsyncContext,
};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;

use crate::ffi::{FfiError, FfiResult, catch, destroy, ref_from, write_out};

type CancellationRegistry = Mutex<HashMap<u64, oneshot::Sender<()>>>;

/// Opaque async runtime handle.
pub struct TokioAsyncContext {
    runtime: Option<Runtime>,
    cancellations: Arc<CancellationRegistry>,
    next_cancellation_id: AtomicU64,
}

impl std::fmt::Debug for TokioAsyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioAsyncContext")
            .field("next_cancellation_id", &self.next_cancellation_id)
            .finish_non_exhaustive()
    }
}

/// Conversion of an operation's output into the `#[repr(C)]` payload handed
/// to `complete`. Ownership of every allocation reachable from the payload
/// passes to the receiver.
pub(crate) trait IntoFfiResult: Send + 'static {
    type Ffi: 'static;

    fn into_ffi(self) -> FfiResult<Self::Ffi>;
}

impl IntoFfiResult for bool {
    type Ffi = bool;

    fn into_ffi(self) -> FfiResult<bool> {
        Ok(self)
    }
}

/// Completion slot copied out of a `SignalCPromise` at submission.
struct Promise<R> {
    complete: SignalCompleteFn<R>,
    context: usize,
}

impl<R> Promise<R> {
    fn resolve<V: IntoFfiResult<Ffi = R>>(self, outcome: FfiResult<V>) {
        let context = self.context as *const c_void;
        match outcome.and_then(IntoFfiResult::into_ffi) {
            Ok(raw) => unsafe { (self.complete)(ptr::null_mut(), &raw const raw, context) },
            Err(e) => unsafe { (self.complete)(e.into_raw(), ptr::null(), context) },
        }
    }
}

impl TokioAsyncContext {
    fn new() -> FfiResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("signal-chat-native")
            .enable_all()
            .build()
            .map_err(|e| {
                FfiError::new(
                    SignalErrorCodeInternalError,
                    format!("failed to create tokio runtime: {e}"),
                )
            })?;
        Ok(Self {
            runtime: Some(runtime),
            cancellations: Arc::default(),
            next_cancellation_id: AtomicU64::new(1),
        })
    }

    /// Handle for spawning work that is not tied to a promise.
    pub(crate) fn handle(&self) -> FfiResult<&Handle> {
        self.runtime
            .as_ref()
            .map(Runtime::handle)
            .ok_or_else(|| FfiError::new(SignalErrorCodeInternalError, "runtime shut down"))
    }

    /// Spawn `future` and resolve `promise` with its output exactly once.
    ///
    /// Writes the promise's cancellation id before returning. A cancelled
    /// operation completes with a `Cancelled` error.
    pub(crate) fn run_future<V, F>(
        &self,
        promise: *mut SignalCPromise<V::Ffi>,
        future: F,
    ) -> FfiResult<()>
    where
        V: IntoFfiResult,
        F: Future<Output = FfiResult<V>> + Send + 'static,
    {
        let handle = self.handle()?.clone();
        let promise = unsafe { promise.as_mut() }.ok_or_else(|| FfiError::null_parameter("promise"))?;
        let complete = promise
            .complete
            .ok_or_else(|| FfiError::null_parameter("promise.complete"))?;
        let slot = Promise {
            complete,
            context: promise.context as usize,
        };

        let id = self.next_cancellation_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cancel_tx);
        promise.cancellation_id = id;

        let registry = Arc::clone(&self.cancellations);
        handle.spawn(async move {
            let outcome = tokio::select! {
                outcome = future => outcome,
                Ok(()) = cancel_rx => Err(FfiError::new(SignalErrorCodeCancelled, "operation cancelled")),
            };
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            slot.resolve(outcome);
        });
        Ok(())
    }

    fn cancel(&self, cancellation_id: u64) {
        let sender = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cancellation_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => tracing::trace!(cancellation_id, "cancel for finished operation"),
        }
    }
}

impl Drop for TokioAsyncContext {
    fn drop(&mut self) {
        // Safe from any thread, including this runtime's own workers.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

pub(crate) unsafe fn async_context<'a>(
    ptr: *const SignalTokioAsyncContext,
) -> FfiResult<&'a TokioAsyncContext> {
    unsafe { ref_from(ptr.cast::<TokioAsyncContext>(), "async runtime") }
}

/// Create a native async runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_tokio_async_context_new(
    out: *mut *mut SignalTokioAsyncContext,
) -> *mut SignalFfiError {
    catch(|| unsafe { write_out(out, TokioAsyncContext::new()?) })
}

/// Destroy a native async runtime. Pending operations are abandoned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_tokio_async_context_destroy(
    ctx: *mut SignalTokioAsyncContext,
) -> *mut SignalFfiError {
    unsafe { destroy::<TokioAsyncContext, _>(ctx) }
}

/// Ask the runtime to cancel an operation. Unknown ids are ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_tokio_async_context_cancel(
    ctx: *const SignalTokioAsyncContext,
    cancellation_id: u64,
) -> *mut SignalFfiError {
    catch(|| {
        unsafe { async_context(ctx)? }.cancel(cancellation_id);
        Ok(())
    })
}
