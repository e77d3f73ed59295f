//! Raw C ABI of the native chat service library.
//!
//! Everything here mirrors the library's C header one to one: opaque handle
//! types, flat `#[repr(C)]` transfer structs, error codes, and
//! [`SignalFfiApi`], the table of entry points the library exports. Nothing in
//! this crate is safe to call directly; `signal-chat` is the safe layer.
//!
//! # Conventions
//!
//! - Every fallible entry point returns `*mut SignalFfiError`: null on success,
//!   otherwise an owned error descriptor that must be released with
//!   [`SignalFfiApi::error_free`].
//! - Outputs are written through out-parameters, which come first.
//! - Buffers, strings and string arrays written to out-parameters (or handed to
//!   callbacks) are owned by the caller and released with the matching `free_*`
//!   entry point. The `free_*` entry points accept null.
//! - Async entry points take a `*mut SignalCPromise<T>`. During submission the
//!   library fills in `cancellation_id`; if submission succeeds, `complete` is
//!   invoked exactly once later, on an arbitrary thread, with either an error or
//!   a pointer to the result. Ownership of everything reachable from the result
//!   passes to the callee of `complete`. If submission fails, `complete` is
//!   never invoked.
//! - Handles passed to async entry points only need to stay valid until the
//!   promise completes.
//! - Native handles are safe to use from any thread.

// sys crate: unsafe FFI, names follow the C header
#![allow(
    unsafe_code,
    non_camel_case_types,
    non_upper_case_globals,
    non_snake_case,
    clippy::missing_safety_doc
)]

use std::ffi::{c_char, c_void};
use std::marker::{PhantomData, PhantomPinned};

macro_rules! opaque_types {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[repr(C)]
            pub struct $name {
                _data: [u8; 0],
                _marker: PhantomData<(*mut u8, PhantomPinned)>,
            }

            impl std::fmt::Debug for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(stringify!($name))
                }
            }
        )*
    };
}

opaque_types! {
    /// Error descriptor returned by fallible entry points.
    SignalFfiError;
    /// Native async runtime.
    SignalTokioAsyncContext;
    /// Connection manager shared by chat connections of one environment.
    SignalConnectionManager;
    /// Authenticated chat connection.
    SignalAuthChat;
    /// Unauthenticated chat connection.
    SignalUnauthChat;
    /// HTTP-style request sent over a chat connection.
    SignalHttpRequest;
    /// Pending acknowledgement of one incoming server message.
    SignalServerMessageAck;
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Value returned by [`SignalFfiApi::error_get_type`].
pub type SignalErrorCode = u32;

pub const SignalErrorCodeUnknownError: SignalErrorCode = 1;
pub const SignalErrorCodeInternalError: SignalErrorCode = 2;
pub const SignalErrorCodeNullParameter: SignalErrorCode = 3;
pub const SignalErrorCodeInvalidArgument: SignalErrorCode = 4;
pub const SignalErrorCodeInvalidType: SignalErrorCode = 5;
pub const SignalErrorCodeInvalidUtf8String: SignalErrorCode = 6;
pub const SignalErrorCodeCancelled: SignalErrorCode = 7;
pub const SignalErrorCodeCallbackError: SignalErrorCode = 100;
pub const SignalErrorCodeIoError: SignalErrorCode = 130;
pub const SignalErrorCodeConnectionTimedOut: SignalErrorCode = 143;
pub const SignalErrorCodeNetworkProtocol: SignalErrorCode = 144;
pub const SignalErrorCodeRateLimited: SignalErrorCode = 145;
pub const SignalErrorCodeWebSocket: SignalErrorCode = 146;
pub const SignalErrorCodeConnectionFailed: SignalErrorCode = 148;
pub const SignalErrorCodeChatServiceInactive: SignalErrorCode = 149;
pub const SignalErrorCodeAppExpired: SignalErrorCode = 150;
pub const SignalErrorCodeDeviceDelinked: SignalErrorCode = 151;

/// Status a callback returns to tell the library to stop: "an error occurred".
pub const SIGNAL_CALLBACK_FAILED: i32 = -1;

// ---------------------------------------------------------------------------
// Flat transfer types
// ---------------------------------------------------------------------------

/// Byte buffer allocated by the library. Release with [`SignalFfiApi::free_buffer`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalOwnedBuffer {
    pub base: *mut u8,
    pub length: usize,
}

impl Default for SignalOwnedBuffer {
    fn default() -> Self {
        Self {
            base: std::ptr::null_mut(),
            length: 0,
        }
    }
}

/// Byte buffer lent to the library for the duration of one call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalBorrowedBuffer {
    pub base: *const u8,
    pub length: usize,
}

impl Default for SignalBorrowedBuffer {
    fn default() -> Self {
        Self {
            base: std::ptr::null(),
            length: 0,
        }
    }
}

/// Array of lengths allocated by the library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalOwnedBufferOfusize {
    pub base: *mut usize,
    pub length: usize,
}

impl Default for SignalOwnedBufferOfusize {
    fn default() -> Self {
        Self {
            base: std::ptr::null_mut(),
            length: 0,
        }
    }
}

/// A list of byte strings: `bytes` holds every element back to back and
/// `lengths` holds the length of each element in order.
///
/// Release the whole structure once with [`SignalFfiApi::free_bytestring_array`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalBytestringArray {
    pub bytes: SignalOwnedBuffer,
    pub lengths: SignalOwnedBufferOfusize,
}

/// A [`SignalBytestringArray`] whose elements are UTF-8.
pub type SignalStringArray = SignalBytestringArray;

/// A UUID in network byte order.
pub type SignalUuid = [u8; 16];

/// A service id: one kind byte (0 = ACI, 1 = PNI) followed by the UUID bytes.
pub type SignalServiceIdFixedWidthBinaryBytes = [u8; 17];

/// Connection details reported by connect and send-and-debug operations.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalFfiChatServiceDebugInfo {
    /// 0 = unknown, 1 = IPv4, 2 = IPv6.
    pub ip_type: u8,
    pub duration_secs: f64,
    /// Owned string, may be null.
    pub connection_info: *const c_char,
}

/// Response to a chat request.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalFfiChatResponse {
    pub status: u16,
    /// Owned string, may be null.
    pub message: *const c_char,
    /// Owned; every element is `name:value`.
    pub headers: SignalStringArray,
    /// Owned.
    pub body: SignalOwnedBuffer,
}

/// Response plus debug info for the same request.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalFfiResponseAndDebugInfo {
    pub response: SignalFfiChatResponse,
    pub debug_info: SignalFfiChatServiceDebugInfo,
}

// ---------------------------------------------------------------------------
// Promises
// ---------------------------------------------------------------------------

/// Completion callback of a [`SignalCPromise`]. `result` is null when `error` is not.
pub type SignalCompleteFn<T> =
    unsafe extern "C" fn(error: *mut SignalFfiError, result: *const T, context: *const c_void);

/// A single-resolution completion slot handed to an async entry point.
#[repr(C)]
#[derive(Debug)]
pub struct SignalCPromise<T> {
    pub complete: Option<SignalCompleteFn<T>>,
    pub context: *const c_void,
    /// Written by the library during submission.
    pub cancellation_id: u64,
}

pub type SignalCPromisebool = SignalCPromise<bool>;
pub type SignalCPromiseFfiChatServiceDebugInfo = SignalCPromise<SignalFfiChatServiceDebugInfo>;
pub type SignalCPromiseFfiChatResponse = SignalCPromise<SignalFfiChatResponse>;
pub type SignalCPromiseFfiResponseAndDebugInfo = SignalCPromise<SignalFfiResponseAndDebugInfo>;

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Incoming message callback. Ownership of `envelope` and `ack` passes to the callee.
pub type SignalReceivedIncomingMessage = unsafe extern "C" fn(
    ctx: *mut c_void,
    envelope: SignalOwnedBuffer,
    timestamp: u64,
    ack: *mut SignalServerMessageAck,
) -> i32;

/// Queue-empty callback.
pub type SignalReceivedQueueEmpty = unsafe extern "C" fn(ctx: *mut c_void) -> i32;

/// Connection-interrupted callback. `error` is null when the client asked for
/// the disconnect; otherwise ownership passes to the callee.
pub type SignalConnectionInterrupted =
    unsafe extern "C" fn(ctx: *mut c_void, error: *mut SignalFfiError) -> i32;

/// Releases `ctx`. Called exactly once per registration.
pub type SignalDestroyListener = unsafe extern "C" fn(ctx: *mut c_void);

/// Push-event listener. Callbacks run on arbitrary threads and return 0 on
/// success or [`SIGNAL_CALLBACK_FAILED`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalFfiChatListenerStruct {
    pub ctx: *mut c_void,
    pub received_incoming_message: SignalReceivedIncomingMessage,
    pub received_queue_empty: SignalReceivedQueueEmpty,
    pub connection_interrupted: SignalConnectionInterrupted,
    pub destroy: SignalDestroyListener,
}

// ---------------------------------------------------------------------------
// Entry point signatures
// ---------------------------------------------------------------------------

/// Destructor of a handle type.
pub type SignalDestroyFn<T> = unsafe extern "C" fn(handle: *mut T) -> *mut SignalFfiError;

/// Connect entry point of a chat connection type.
pub type SignalChatConnectFn<C> = unsafe extern "C" fn(
    promise: *mut SignalCPromiseFfiChatServiceDebugInfo,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const C,
) -> *mut SignalFfiError;

/// Disconnect entry point of a chat connection type.
pub type SignalChatDisconnectFn<C> = unsafe extern "C" fn(
    promise: *mut SignalCPromisebool,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const C,
) -> *mut SignalFfiError;

/// Send entry point of a chat connection type.
pub type SignalChatSendFn<C, R> = unsafe extern "C" fn(
    promise: *mut SignalCPromise<R>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const C,
    request: *const SignalHttpRequest,
    timeout_millis: u32,
) -> *mut SignalFfiError;

/// Listener registration entry point of a chat connection type. `listener` may be null.
pub type SignalChatSetListenerFn<C> = unsafe extern "C" fn(
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const C,
    listener: *const SignalFfiChatListenerStruct,
) -> *mut SignalFfiError;

/// Connection state query of a chat connection type.
pub type SignalChatIsConnectedFn<C> =
    unsafe extern "C" fn(out: *mut bool, chat: *const C) -> *mut SignalFfiError;

/// Every entry point exported by the library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalFfiApi {
    // errors
    pub error_get_type: unsafe extern "C" fn(err: *const SignalFfiError) -> SignalErrorCode,
    pub error_get_message:
        unsafe extern "C" fn(out: *mut *const c_char, err: *const SignalFfiError) -> *mut SignalFfiError,
    pub error_get_retry_after_seconds:
        unsafe extern "C" fn(out: *mut u32, err: *const SignalFfiError) -> *mut SignalFfiError,
    pub error_free: unsafe extern "C" fn(err: *mut SignalFfiError),

    // memory
    pub free_string: unsafe extern "C" fn(s: *const c_char),
    pub free_buffer: unsafe extern "C" fn(base: *const u8, length: usize),
    pub free_bytestring_array: unsafe extern "C" fn(array: SignalBytestringArray),

    // logging
    pub init_logger: unsafe extern "C" fn(level: *const c_char) -> *mut SignalFfiError,

    // async runtime
    pub tokio_async_context_new:
        unsafe extern "C" fn(out: *mut *mut SignalTokioAsyncContext) -> *mut SignalFfiError,
    pub tokio_async_context_destroy: SignalDestroyFn<SignalTokioAsyncContext>,
    pub tokio_async_context_cancel: unsafe extern "C" fn(
        async_runtime: *const SignalTokioAsyncContext,
        cancellation_id: u64,
    ) -> *mut SignalFfiError,

    // connection manager
    pub connection_manager_new: unsafe extern "C" fn(
        out: *mut *mut SignalConnectionManager,
        environment: u8,
        user_agent: *const c_char,
    ) -> *mut SignalFfiError,
    pub connection_manager_destroy: SignalDestroyFn<SignalConnectionManager>,
    pub connection_manager_on_network_change:
        unsafe extern "C" fn(manager: *const SignalConnectionManager) -> *mut SignalFfiError,

    // requests
    pub http_request_new: unsafe extern "C" fn(
        out: *mut *mut SignalHttpRequest,
        method: *const c_char,
        path: *const c_char,
        body: SignalBorrowedBuffer,
    ) -> *mut SignalFfiError,
    pub http_request_add_header: unsafe extern "C" fn(
        request: *const SignalHttpRequest,
        name: *const c_char,
        value: *const c_char,
    ) -> *mut SignalFfiError,
    pub http_request_destroy: SignalDestroyFn<SignalHttpRequest>,

    // acks
    pub server_message_ack_send:
        unsafe extern "C" fn(ack: *const SignalServerMessageAck) -> *mut SignalFfiError,
    pub server_message_ack_destroy: SignalDestroyFn<SignalServerMessageAck>,

    // service ids
    pub service_id_parse_from_service_id_string: unsafe extern "C" fn(
        out: *mut SignalServiceIdFixedWidthBinaryBytes,
        input: *const c_char,
    ) -> *mut SignalFfiError,
    pub service_id_service_id_string: unsafe extern "C" fn(
        out: *mut *const c_char,
        value: *const SignalServiceIdFixedWidthBinaryBytes,
    ) -> *mut SignalFfiError,
    pub service_id_service_id_binary: unsafe extern "C" fn(
        out: *mut SignalOwnedBuffer,
        value: *const SignalServiceIdFixedWidthBinaryBytes,
    ) -> *mut SignalFfiError,

    // authenticated chat
    pub chat_service_new_auth: unsafe extern "C" fn(
        out: *mut *mut SignalAuthChat,
        manager: *const SignalConnectionManager,
        username: *const c_char,
        password: *const c_char,
        receive_stories: bool,
    ) -> *mut SignalFfiError,
    pub auth_chat_destroy: SignalDestroyFn<SignalAuthChat>,
    pub chat_service_connect_auth: SignalChatConnectFn<SignalAuthChat>,
    pub chat_service_disconnect_auth: SignalChatDisconnectFn<SignalAuthChat>,
    pub chat_service_auth_send: SignalChatSendFn<SignalAuthChat, SignalFfiChatResponse>,
    pub chat_service_auth_send_and_debug:
        SignalChatSendFn<SignalAuthChat, SignalFfiResponseAndDebugInfo>,
    pub chat_service_set_listener_auth: SignalChatSetListenerFn<SignalAuthChat>,
    pub chat_service_is_connected_auth: SignalChatIsConnectedFn<SignalAuthChat>,

    // unauthenticated chat
    pub chat_service_new_unauth: unsafe extern "C" fn(
        out: *mut *mut SignalUnauthChat,
        manager: *const SignalConnectionManager,
    ) -> *mut SignalFfiError,
    pub unauth_chat_destroy: SignalDestroyFn<SignalUnauthChat>,
    pub chat_service_connect_unauth: SignalChatConnectFn<SignalUnauthChat>,
    pub chat_service_disconnect_unauth: SignalChatDisconnectFn<SignalUnauthChat>,
    pub chat_service_unauth_send: SignalChatSendFn<SignalUnauthChat, SignalFfiChatResponse>,
    pub chat_service_unauth_send_and_debug:
        SignalChatSendFn<SignalUnauthChat, SignalFfiResponseAndDebugInfo>,
    pub chat_service_set_listener_unauth: SignalChatSetListenerFn<SignalUnauthChat>,
    pub chat_service_is_connected_unauth: SignalChatIsConnectedFn<SignalUnauthChat>,
}
