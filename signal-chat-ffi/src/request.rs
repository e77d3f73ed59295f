//! HTTP-style requests, incoming message acks, and the payloads chats report.

use std::ffi::c_char;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use signal_chat_sys::{
    SignalBorrowedBuffer, SignalFfiChatResponse, SignalFfiChatServiceDebugInfo, SignalFfiError,
    SignalFfiResponseAndDebugInfo, SignalHttpRequest, SignalServerMessageAck,
};

use crate::ffi::{
    FfiError, FfiResult, bytestring_array, c_str_to_string, catch, destroy, owned_buffer,
    ref_from, signal_free_string, to_c_string, write_out,
};
use crate::runtime::IntoFfiResult;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Opaque request handle.
#[derive(Debug)]
pub struct HttpRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) body: Vec<u8>,
    pub(crate) headers: Mutex<Vec<(String, String)>>,
}

/// Copy of a request taken at submission, so async work never touches the handle.
#[derive(Debug, Clone)]
pub(crate) struct RequestParts {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl RequestParts {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl HttpRequest {
    pub(crate) fn parts(&self) -> RequestParts {
        RequestParts {
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self
                .headers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            body: self.body.clone(),
        }
    }
}

pub(crate) unsafe fn http_request<'a>(ptr: *const SignalHttpRequest) -> FfiResult<&'a HttpRequest> {
    unsafe { ref_from(ptr.cast::<HttpRequest>(), "request") }
}

/// Create a request. The body is copied.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_http_request_new(
    out: *mut *mut SignalHttpRequest,
    method: *const c_char,
    path: *const c_char,
    body: SignalBorrowedBuffer,
) -> *mut SignalFfiError {
    catch(|| {
        let method = unsafe { c_str_to_string(method, "method")? };
        let path = unsafe { c_str_to_string(path, "path")? };
        let body = if body.base.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(body.base, body.length) }.to_vec()
        };
        unsafe {
            write_out(
                out,
                HttpRequest {
                    method,
                    path,
                    body,
                    headers: Mutex::default(),
                },
            )
        }
    })
}

/// Append a header to a request.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_http_request_add_header(
    request: *const SignalHttpRequest,
    name: *const c_char,
    value: *const c_char,
) -> *mut SignalFfiError {
    catch(|| {
        let request = unsafe { http_request(request)? };
        let name = unsafe { c_str_to_string(name, "name")? };
        let value = unsafe { c_str_to_string(value, "value")? };
        if name.is_empty() || name.contains(':') {
            return Err(FfiError::invalid_argument(format!("invalid header name {name:?}")));
        }
        request
            .headers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, value));
        Ok(())
    })
}

/// Destroy a request.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_http_request_destroy(
    request: *mut SignalHttpRequest,
) -> *mut SignalFfiError {
    unsafe { destroy::<HttpRequest, _>(request) }
}

// ---------------------------------------------------------------------------
// Acks
// ---------------------------------------------------------------------------

/// Opaque acknowledgement handle for one incoming message.
#[derive(Debug)]
pub struct ServerMessageAck {
    pub(crate) timestamp: u64,
    sent: AtomicBool,
}

impl ServerMessageAck {
    pub(crate) fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            sent: AtomicBool::new(false),
        }
    }
}

/// Acknowledge the message. An ack can be sent once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_server_message_ack_send(
    ack: *const SignalServerMessageAck,
) -> *mut SignalFfiError {
    catch(|| {
        let ack = unsafe { ref_from(ack.cast::<ServerMessageAck>(), "ack")? };
        if ack.sent.swap(true, Ordering::AcqRel) {
            return Err(FfiError::invalid_argument("ack already sent"));
        }
        tracing::debug!(timestamp = ack.timestamp, "message acknowledged");
        Ok(())
    })
}

/// Destroy an ack.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_server_message_ack_destroy(
    ack: *mut SignalServerMessageAck,
) -> *mut SignalFfiError {
    unsafe { destroy::<ServerMessageAck, _>(ack) }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct DebugInfo {
    pub(crate) ip_type: u8,
    pub(crate) duration: Duration,
    pub(crate) connection_info: String,
}

impl DebugInfo {
    fn into_raw(self) -> FfiResult<SignalFfiChatServiceDebugInfo> {
        Ok(SignalFfiChatServiceDebugInfo {
            ip_type: self.ip_type,
            duration_secs: self.duration.as_secs_f64(),
            connection_info: to_c_string(&self.connection_info)?.cast_const(),
        })
    }
}

impl IntoFfiResult for DebugInfo {
    type Ffi = SignalFfiChatServiceDebugInfo;

    fn into_ffi(self) -> FfiResult<Self::Ffi> {
        self.into_raw()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Response {
    pub(crate) status: u16,
    pub(crate) message: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl Response {
    fn into_raw(self) -> FfiResult<SignalFfiChatResponse> {
        let message = match &self.message {
            Some(m) => to_c_string(m)?.cast_const(),
            None => ptr::null(),
        };
        let headers = bytestring_array(
            self.headers
                .iter()
                .map(|(name, value)| format!("{name}:{value}")),
        );
        Ok(SignalFfiChatResponse {
            status: self.status,
            message,
            headers,
            body: owned_buffer(self.body),
        })
    }
}

impl IntoFfiResult for Response {
    type Ffi = SignalFfiChatResponse;

    fn into_ffi(self) -> FfiResult<Self::Ffi> {
        self.into_raw()
    }
}

impl IntoFfiResult for (Response, DebugInfo) {
    type Ffi = SignalFfiResponseAndDebugInfo;

    fn into_ffi(self) -> FfiResult<Self::Ffi> {
        let (response, debug_info) = self;
        let debug_info = debug_info.into_raw()?;
        match response.into_raw() {
            Ok(response) => Ok(SignalFfiResponseAndDebugInfo {
                response,
                debug_info,
            }),
            Err(e) => {
                unsafe { signal_free_string(debug_info.connection_info) };
                Err(e)
            }
        }
    }
}
