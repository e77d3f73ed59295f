//! Core FFI infrastructure: error descriptors, panic catching, memory helpers.

use std::ffi::{CStr, CString, c_char};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::OnceLock;

use signal_chat_sys::{
    SignalBytestringArray, SignalErrorCode, SignalErrorCodeCallbackError,
    SignalErrorCodeInternalError, SignalErrorCodeInvalidArgument, SignalErrorCodeInvalidType,
    SignalErrorCodeInvalidUtf8String, SignalErrorCodeNullParameter, SignalErrorCodeRateLimited,
    SignalFfiError, SignalOwnedBuffer, SignalOwnedBufferOfusize,
};

// ---------------------------------------------------------------------------
// Error descriptors
// ---------------------------------------------------------------------------

/// Error carried across the boundary behind `*mut SignalFfiError`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct FfiError {
    pub(crate) code: SignalErrorCode,
    pub(crate) message: String,
    pub(crate) retry_after: Option<u32>,
}

/// Result type of every native operation.
pub(crate) type FfiResult<T> = Result<T, FfiError>;

impl FfiError {
    /// An error with the given code and message.
    pub fn new(code: SignalErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A rate-limit error asking the client to wait `retry_after_seconds`.
    pub fn rate_limited(retry_after_seconds: u32, message: impl Into<String>) -> Self {
        Self {
            code: SignalErrorCodeRateLimited,
            message: message.into(),
            retry_after: Some(retry_after_seconds),
        }
    }

    pub(crate) fn null_parameter(name: &str) -> Self {
        Self::new(SignalErrorCodeNullParameter, format!("{name} is null"))
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(SignalErrorCodeInvalidArgument, message)
    }

    pub(crate) fn callback_failed() -> Self {
        Self::new(SignalErrorCodeCallbackError, "listener callback reported an error")
    }

    /// Hand the descriptor over to the caller.
    #[must_use]
    pub fn into_raw(self) -> *mut SignalFfiError {
        into_raw(self).cast()
    }
}

/// Reborrow a descriptor handed out by [`FfiError::into_raw`].
unsafe fn error_from<'a>(err: *const SignalFfiError) -> FfiResult<&'a FfiError> {
    unsafe { ref_from(err.cast::<FfiError>(), "error") }
}

// ---------------------------------------------------------------------------
// Error-catching wrapper
// ---------------------------------------------------------------------------

/// Run an entry point body, turning its error (or a panic) into a descriptor.
pub(crate) fn catch<F>(f: F) -> *mut SignalFfiError
where
    F: FnOnce() -> FfiResult<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => ptr::null_mut(),
        Ok(Err(e)) => e.into_raw(),
        Err(_) => FfiError::new(SignalErrorCodeInternalError, "panic in native call").into_raw(),
    }
}

// ---------------------------------------------------------------------------
// Error accessors
// ---------------------------------------------------------------------------

/// Error code of `err`. Unknown (`1`) for null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_error_get_type(err: *const SignalFfiError) -> SignalErrorCode {
    unsafe { error_from(err) }.map_or(signal_chat_sys::SignalErrorCodeUnknownError, |e| e.code)
}

/// Message of `err`. Caller frees the string with [`signal_free_string`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_error_get_message(
    out: *mut *const c_char,
    err: *const SignalFfiError,
) -> *mut SignalFfiError {
    catch(|| {
        if out.is_null() {
            return Err(FfiError::null_parameter("output pointer"));
        }
        let e = unsafe { error_from(err)? };
        let s = to_c_string(&e.message)?;
        unsafe { out.write(s.cast_const()) };
        Ok(())
    })
}

/// Retry-after hint of a rate-limit error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_error_get_retry_after_seconds(
    out: *mut u32,
    err: *const SignalFfiError,
) -> *mut SignalFfiError {
    catch(|| {
        let e = unsafe { error_from(err)? };
        let secs = e
            .retry_after
            .ok_or_else(|| FfiError::new(SignalErrorCodeInvalidType, "not a rate-limit error"))?;
        unsafe { write_value(out, secs) }
    })
}

/// Release an error descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_error_free(err: *mut SignalFfiError) {
    if !err.is_null() {
        drop(unsafe { Box::from_raw(err.cast::<FfiError>()) });
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Free a string previously returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_free_string(s: *const c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s.cast_mut()) });
    }
}

/// Free a byte buffer previously returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_free_buffer(base: *const u8, length: usize) {
    if !base.is_null() {
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base.cast_mut(), length)) });
    }
}

/// Free both halves of a byte string array previously returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_free_bytestring_array(array: SignalBytestringArray) {
    unsafe { signal_free_buffer(array.bytes.base, array.bytes.length) };
    let lengths = array.lengths;
    if !lengths.base.is_null() {
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(lengths.base, lengths.length)) });
    }
}

/// Move bytes into a buffer released by [`signal_free_buffer`].
pub(crate) fn owned_buffer(bytes: Vec<u8>) -> SignalOwnedBuffer {
    let boxed = bytes.into_boxed_slice();
    let length = boxed.len();
    SignalOwnedBuffer {
        base: Box::into_raw(boxed).cast::<u8>(),
        length,
    }
}

/// Concatenate `items` into an array released by [`signal_free_bytestring_array`].
pub(crate) fn bytestring_array<I>(items: I) -> SignalBytestringArray
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut bytes = Vec::new();
    let mut lengths = Vec::new();
    for item in items {
        let item = item.as_ref();
        bytes.extend_from_slice(item);
        lengths.push(item.len());
    }
    let lengths = lengths.into_boxed_slice();
    let count = lengths.len();
    SignalBytestringArray {
        bytes: owned_buffer(bytes),
        lengths: SignalOwnedBufferOfusize {
            base: Box::into_raw(lengths).cast::<usize>(),
            length: count,
        },
    }
}

// ---------------------------------------------------------------------------
// String helpers
// ---------------------------------------------------------------------------

/// Convert a C string to an owned `String`.
pub(crate) unsafe fn c_str_to_string(s: *const c_char, name: &str) -> FfiResult<String> {
    if s.is_null() {
        return Err(FfiError::null_parameter(name));
    }
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map(str::to_owned)
        .map_err(|e| FfiError::new(SignalErrorCodeInvalidUtf8String, format!("{name}: {e}")))
}

/// Allocate a C string. Caller frees with [`signal_free_string`].
pub(crate) fn to_c_string(s: &str) -> FfiResult<*mut c_char> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|_| FfiError::invalid_argument("string contains NUL"))
}

// ---------------------------------------------------------------------------
// Handle helpers
// ---------------------------------------------------------------------------

/// Validate a pointer and create a safe reference.
pub(crate) unsafe fn ref_from<'a, T>(ptr: *const T, name: &str) -> FfiResult<&'a T> {
    unsafe { ptr.as_ref() }.ok_or_else(|| FfiError::null_parameter(name))
}

/// Box a value and return a raw pointer.
pub(crate) fn into_raw<T>(val: T) -> *mut T {
    Box::into_raw(Box::new(val))
}

/// Box `val` and write the pointer into an output parameter.
pub(crate) unsafe fn write_out<T, R>(out: *mut *mut R, val: T) -> FfiResult<()> {
    if out.is_null() {
        return Err(FfiError::null_parameter("output pointer"));
    }
    unsafe { *out = into_raw(val).cast::<R>() };
    Ok(())
}

/// Write a plain value into an output parameter.
pub(crate) unsafe fn write_value<T>(out: *mut T, val: T) -> FfiResult<()> {
    if out.is_null() {
        return Err(FfiError::null_parameter("output pointer"));
    }
    unsafe { out.write(val) };
    Ok(())
}

/// Reclaim a handle boxed by [`write_out`].
pub(crate) unsafe fn destroy<T, R>(handle: *mut R) -> *mut SignalFfiError {
    catch(|| {
        if handle.is_null() {
            return Err(FfiError::null_parameter("handle"));
        }
        drop(unsafe { Box::from_raw(handle.cast::<T>()) });
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the tracing subscriber. Only the first call has an effect.
///
/// `level` is an `EnvFilter` directive such as `"debug"` or
/// `"signal_chat=trace"`; null means `"info"`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_init_logger(level: *const c_char) -> *mut SignalFfiError {
    catch(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};
        let filter_str = if level.is_null() {
            "info".to_owned()
        } else {
            unsafe { c_str_to_string(level, "level")? }
        };
        LOGGER_INIT.get_or_init(|| {
            let filter = EnvFilter::builder().parse_lossy(&filter_str);
            // Another subscriber may already be installed by the host.
            let _ = tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init();
        });
        Ok(())
    })
}
