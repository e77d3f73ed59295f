//! `signal-chat-ffi`: in-process loopback implementation of the native chat
//! service C ABI declared by `signal-chat-sys`.
//!
//! Design principles:
//! - Every fallible entry point returns `*mut SignalFfiError` (null = ok).
//! - Opaque handles are heap-allocated `Box<T>` behind `*mut T` with explicit `_destroy` functions.
//! - Async entry points spawn onto the runtime of the `SignalTokioAsyncContext` they are
//!   given and resolve their promise exactly once.
//! - One in-memory server per connection manager: `PUT /v1/messages/{username}` delivers
//!   the body to that user's authenticated chats, every other request is echoed back.
//!
//! Every entry point is exported both as a `#[no_mangle]` symbol and through [`API`].
#![allow(unsafe_code)]

mod chat;
mod ffi;
mod net;
mod request;
mod runtime;
mod service_id;

use signal_chat_sys::{SignalErrorCode, SignalFfiApi, SignalFfiError};

pub use chat::*;
pub use ffi::*;
pub use net::*;
pub use request::*;
pub use runtime::*;
pub use service_id::*;

/// The entry point table of this library.
pub const API: SignalFfiApi = SignalFfiApi {
    error_get_type: signal_error_get_type,
    error_get_message: signal_error_get_message,
    error_get_retry_after_seconds: signal_error_get_retry_after_seconds,
    error_free: signal_error_free,

    free_string: signal_free_string,
    free_buffer: signal_free_buffer,
    free_bytestring_array: signal_free_bytestring_array,

    init_logger: signal_init_logger,

    tokio_async_context_new: signal_tokio_async_context_new,
    tokio_async_context_destroy: signal_tokio_async_context_destroy,
    tokio_async_context_cancel: signal_tokio_async_context_cancel,

    connection_manager_new: signal_connection_manager_new,
    connection_manager_destroy: signal_connection_manager_destroy,
    connection_manager_on_network_change: signal_connection_manager_on_network_change,

    http_request_new: signal_http_request_new,
    http_request_add_header: signal_http_request_add_header,
    http_request_destroy: signal_http_request_destroy,

    server_message_ack_send: signal_server_message_ack_send,
    server_message_ack_destroy: signal_server_message_ack_destroy,

    service_id_parse_from_service_id_string: signal_service_id_parse_from_service_id_string,
    service_id_service_id_string: signal_service_id_service_id_string,
    service_id_service_id_binary: signal_service_id_service_id_binary,

    chat_service_new_auth: signal_chat_service_new_auth,
    auth_chat_destroy: signal_auth_chat_destroy,
    chat_service_connect_auth: signal_chat_service_connect_auth,
    chat_service_disconnect_auth: signal_chat_service_disconnect_auth,
    chat_service_auth_send: signal_chat_service_auth_send,
    chat_service_auth_send_and_debug: signal_chat_service_auth_send_and_debug,
    chat_service_set_listener_auth: signal_chat_service_set_listener_auth,
    chat_service_is_connected_auth: signal_chat_service_is_connected_auth,

    chat_service_new_unauth: signal_chat_service_new_unauth,
    unauth_chat_destroy: signal_unauth_chat_destroy,
    chat_service_connect_unauth: signal_chat_service_connect_unauth,
    chat_service_disconnect_unauth: signal_chat_service_disconnect_unauth,
    chat_service_unauth_send: signal_chat_service_unauth_send,
    chat_service_unauth_send_and_debug: signal_chat_service_unauth_send_and_debug,
    chat_service_set_listener_unauth: signal_chat_service_set_listener_unauth,
    chat_service_is_connected_unauth: signal_chat_service_is_connected_unauth,
};

/// [`API`] with a `'static` address.
pub static EXPORTED_API: SignalFfiApi = API;

/// The entry point table of this library.
#[must_use]
pub fn api() -> &'static SignalFfiApi {
    &EXPORTED_API
}

/// Build an owned error descriptor, as a native entry point would return it.
#[must_use]
pub fn ffi_error(code: SignalErrorCode, message: &str) -> *mut SignalFfiError {
    FfiError::new(code, message).into_raw()
}

/// Build an owned rate-limit error descriptor.
#[must_use]
pub fn rate_limited_error(retry_after_seconds: u32, message: &str) -> *mut SignalFfiError {
    FfiError::rate_limited(retry_after_seconds, message).into_raw()
}
