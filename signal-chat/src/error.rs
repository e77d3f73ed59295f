#![allow(unsafe_code)]
//! Unified error type and the conversion of native error descriptors.

use std::ffi::{CStr, c_char};
use std::ptr;
use std::time::Duration;

use signal_chat_sys::{
    SignalErrorCodeAppExpired, SignalErrorCodeCallbackError, SignalErrorCodeChatServiceInactive,
    SignalErrorCodeConnectionFailed, SignalErrorCodeConnectionTimedOut,
    SignalErrorCodeDeviceDelinked, SignalErrorCodeInvalidArgument, SignalErrorCodeIoError,
    SignalErrorCodeNetworkProtocol, SignalErrorCodeNullParameter, SignalErrorCodeRateLimited,
    SignalErrorCodeWebSocket, SignalFfiApi, SignalFfiError,
};

use crate::ffi::invoke_fn_returning_integer;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type listeners return; carried back to the caller unchanged.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type of the chat bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection is not established (or was closed).
    #[error("chat service inactive: {0}")]
    ServiceInactive(String),

    /// The server rejected this client version.
    #[error("app expired: {0}")]
    AppExpired(String),

    /// The device is no longer registered with the account.
    #[error("device deregistered: {0}")]
    DeviceDeregistered(String),

    /// The server asked the client to back off.
    #[error("rate limited, retry after {}s: {message}", .retry_after.as_secs())]
    RateLimited {
        /// How long to wait before retrying.
        retry_after: Duration,
        /// Server-provided description.
        message: String,
    },

    /// A callback failed inside a native call and no host error was recorded.
    #[error("callback error: {0}")]
    Callback(String),

    /// A listener callback failed inside a native call; carries its error.
    #[error("listener failed: {0}")]
    Listener(#[source] BoxError),

    /// An internal invariant of the bridge or the native layer was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// An argument was rejected before or by the native layer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport or protocol failure.
    #[error("network: {0}")]
    Network(String),

    /// Any other native failure.
    #[error("internal: {0}")]
    Internal(String),
}

/// Check the error returned by a native entry point. Null = success.
///
/// A non-null descriptor is converted and released.
pub(crate) fn check(api: &'static SignalFfiApi, err: *mut SignalFfiError) -> Result<()> {
    if err.is_null() {
        return Ok(());
    }
    let error = unsafe { describe(api, err) };
    unsafe { (api.error_free)(err) };
    Err(error)
}

/// Map a live descriptor to exactly one [`Error`]. Does not free it.
// Error codes keep their C header names.
#[allow(non_upper_case_globals)]
unsafe fn describe(api: &'static SignalFfiApi, err: *mut SignalFfiError) -> Error {
    let code = unsafe { (api.error_get_type)(err) };
    let message = unsafe { message(api, err) };
    match code {
        SignalErrorCodeChatServiceInactive => Error::ServiceInactive(message),
        SignalErrorCodeAppExpired => Error::AppExpired(message),
        SignalErrorCodeDeviceDelinked => Error::DeviceDeregistered(message),
        SignalErrorCodeRateLimited => {
            let seconds = invoke_fn_returning_integer(api, |out| unsafe {
                (api.error_get_retry_after_seconds)(out, err)
            })
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "rate limit error without retry-after");
                0
            });
            Error::RateLimited {
                retry_after: Duration::from_secs(seconds.into()),
                message,
            }
        }
        SignalErrorCodeCallbackError => Error::Callback(message),
        SignalErrorCodeNullParameter | SignalErrorCodeInvalidArgument => {
            Error::InvalidArgument(message)
        }
        SignalErrorCodeIoError
        | SignalErrorCodeConnectionTimedOut
        | SignalErrorCodeNetworkProtocol
        | SignalErrorCodeWebSocket
        | SignalErrorCodeConnectionFailed => Error::Network(message),
        _ => Error::Internal(message),
    }
}

/// Message of a descriptor. Failures here never recurse into [`check`].
unsafe fn message(api: &'static SignalFfiApi, err: *mut SignalFfiError) -> String {
    let mut out: *const c_char = ptr::null();
    let nested = unsafe { (api.error_get_message)(&raw mut out, err) };
    if !nested.is_null() {
        unsafe { (api.error_free)(nested) };
    }
    if out.is_null() {
        return "(no message)".to_owned();
    }
    let message = unsafe { CStr::from_ptr(out) }
        .to_string_lossy()
        .into_owned();
    unsafe { (api.free_string)(out) };
    message
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use signal_chat_sys::{
        SignalErrorCodeCancelled, SignalErrorCodeInternalError, SignalErrorCodeUnknownError,
    };

    use super::*;

    fn convert(code: u32, message: &str) -> Error {
        check(signal_chat_ffi::api(), signal_chat_ffi::ffi_error(code, message)).unwrap_err()
    }

    #[test]
    fn null_is_success() {
        assert!(check(signal_chat_ffi::api(), ptr::null_mut()).is_ok());
    }

    #[test]
    fn maps_chat_codes() {
        assert!(matches!(
            convert(SignalErrorCodeChatServiceInactive, "inactive"),
            Error::ServiceInactive(m) if m == "inactive"
        ));
        assert!(matches!(
            convert(SignalErrorCodeAppExpired, "expired"),
            Error::AppExpired(_)
        ));
        assert!(matches!(
            convert(SignalErrorCodeDeviceDelinked, "gone"),
            Error::DeviceDeregistered(_)
        ));
        assert!(matches!(
            convert(SignalErrorCodeCallbackError, "cb"),
            Error::Callback(_)
        ));
    }

    #[test]
    fn maps_transport_codes_to_network() {
        for code in [
            SignalErrorCodeIoError,
            SignalErrorCodeConnectionTimedOut,
            SignalErrorCodeNetworkProtocol,
            SignalErrorCodeWebSocket,
            SignalErrorCodeConnectionFailed,
        ] {
            assert!(matches!(convert(code, "net"), Error::Network(_)), "code {code}");
        }
    }

    #[test]
    fn maps_argument_codes() {
        assert!(matches!(
            convert(SignalErrorCodeNullParameter, "null"),
            Error::InvalidArgument(_)
        ));
        assert!(matches!(
            convert(SignalErrorCodeInvalidArgument, "bad"),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn unknown_codes_are_internal() {
        for code in [
            SignalErrorCodeUnknownError,
            SignalErrorCodeInternalError,
            SignalErrorCodeCancelled,
            9999,
        ] {
            assert!(matches!(convert(code, "x"), Error::Internal(_)), "code {code}");
        }
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = check(
            signal_chat_ffi::api(),
            signal_chat_ffi::rate_limited_error(42, "slow down"),
        )
        .unwrap_err();
        match err {
            Error::RateLimited {
                retry_after,
                message,
            } => {
                assert_eq!(retry_after, Duration::from_secs(42));
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_limit_without_hint_defaults_to_zero() {
        let err = convert(SignalErrorCodeRateLimited, "slow down");
        assert!(matches!(err, Error::RateLimited { retry_after, .. } if retry_after.is_zero()));
    }

    thread_local! {
        static FREED: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn counting_error_free(err: *mut SignalFfiError) {
        FREED.set(FREED.get() + 1);
        unsafe { signal_chat_ffi::signal_error_free(err) };
    }

    static COUNTING: SignalFfiApi = SignalFfiApi {
        error_free: counting_error_free,
        ..signal_chat_ffi::API
    };

    #[test]
    fn descriptor_released_once() {
        let before = FREED.get();
        let err = check(
            &COUNTING,
            signal_chat_ffi::ffi_error(SignalErrorCodeAppExpired, "expired"),
        );
        assert!(err.is_err());
        assert_eq!(FREED.get() - before, 1);
    }
}
