#![allow(unsafe_code)]
//! Owned Rust types for requests, responses and connection details.

use std::fmt;
use std::time::Duration;

use signal_chat_sys::{
    SignalFfiApi, SignalFfiChatResponse, SignalFfiChatServiceDebugInfo,
    SignalFfiResponseAndDebugInfo, SignalHttpRequest,
};

use crate::async_context::AsyncResult;
use crate::error::{self, Error, Result};
use crate::ffi::{
    NativeBytes, NativeHandleOwner, NativeString, borrowed_buffer,
    invoke_fn_returning_native_handle, take_string_array, to_c_string,
};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Generate a `#[repr]` enum with a checked conversion from its native value.
macro_rules! ffi_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident: $repr:ident {
        $($(#[$vm:meta])* $variant:ident = $val:expr),* $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        $vis enum $name { $($(#[$vm])* $variant = $val),* }

        impl $name {
            /// Convert from the native value. Returns `None` for unknown values.
            #[must_use]
            pub fn from_ffi(v: $repr) -> Option<Self> {
                match v { $($val => Some(Self::$variant),)* _ => None }
            }

            /// The native value of this variant.
            #[must_use]
            pub fn to_ffi(self) -> $repr {
                self as $repr
            }
        }
    };
}

ffi_enum! {
    /// IP family of the established connection.
    pub enum IpType: u8 {
        /// Not reported.
        Unknown = 0,
        /// IPv4.
        V4 = 1,
        /// IPv6.
        V6 = 2,
    }
}

ffi_enum! {
    /// Server environment a connection manager targets.
    #[derive(Default)]
    pub enum Environment: u8 {
        /// Staging servers.
        #[default]
        Staging = 0,
        /// Production servers.
        Production = 1,
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// An HTTP-shaped request sent over a chat connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /// HTTP method, e.g. `GET`.
    pub method: String,
    /// Path including the query string.
    pub path: String,
    /// Header name/value pairs, in order.
    pub headers: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<Vec<u8>>,
    /// How long to wait for the response.
    pub timeout: Duration,
}

impl ChatRequest {
    /// Timeout used when none is set.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Create a request without headers or body.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Timeout in whole milliseconds, saturated to the native width.
    pub(crate) fn timeout_millis(&self) -> u32 {
        u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX)
    }

    /// Build the native request object. Dropped after the send completes.
    pub(crate) fn to_native(
        &self,
        api: &'static SignalFfiApi,
    ) -> Result<NativeHandleOwner<SignalHttpRequest>> {
        let method = to_c_string(&self.method)?;
        let path = to_c_string(&self.path)?;
        let body = borrowed_buffer(self.body.as_deref().unwrap_or_default());
        let request = invoke_fn_returning_native_handle(api, |out| unsafe {
            (api.http_request_new)(out, method.as_ptr(), path.as_ptr(), body)
        })?;
        for (name, value) in &self.headers {
            let name = to_c_string(name)?;
            let value = to_c_string(value)?;
            let rc = request.with_native_handle(|request| unsafe {
                (api.http_request_add_header)(request, name.as_ptr(), value.as_ptr())
            });
            error::check(api, rc)?;
        }
        Ok(request)
    }
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(hex::encode))
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Response to a [`ChatRequest`].
#[derive(Clone, PartialEq, Eq)]
pub struct ChatResponse {
    /// HTTP status code.
    pub status: u16,
    /// Status message, if the server sent one.
    pub message: Option<String>,
    /// Header name/value pairs, in order.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl ChatResponse {
    /// First value of the header `name` (ASCII case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Adopts every allocation of `raw` before converting any of it.
    unsafe fn from_raw(api: &'static SignalFfiApi, raw: &SignalFfiChatResponse) -> Result<Self> {
        let body = unsafe { NativeBytes::adopt(api, raw.body) };
        let message = unsafe { NativeString::adopt(api, raw.message) };
        let headers = unsafe { take_string_array(api, raw.headers) }?
            .into_iter()
            .map(|line| match line.split_once(':') {
                Some((name, value)) => Ok((name.to_owned(), value.trim_start().to_owned())),
                None => Err(Error::Precondition(format!("malformed response header {line:?}"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            status: raw.status,
            message: message.map(|m| m.to_string_lossy()),
            headers,
            body: body.to_vec(),
        })
    }
}

impl fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatResponse")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("headers", &self.headers)
            .field("body", &hex::encode(&self.body))
            .finish()
    }
}

/// Details about the connection a request or connect went over.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugInfo {
    /// IP family.
    pub ip_type: IpType,
    /// How long the operation took.
    pub duration: Duration,
    /// Free-form description of the connection.
    pub connection_info: String,
}

impl DebugInfo {
    unsafe fn from_raw(
        api: &'static SignalFfiApi,
        raw: &SignalFfiChatServiceDebugInfo,
    ) -> Result<Self> {
        let connection_info = unsafe { NativeString::adopt(api, raw.connection_info) }
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        let duration = Duration::try_from_secs_f64(raw.duration_secs).map_err(|e| {
            Error::Precondition(format!("invalid duration {}: {e}", raw.duration_secs))
        })?;
        let ip_type = IpType::from_ffi(raw.ip_type).unwrap_or_else(|| {
            tracing::debug!(ip_type = raw.ip_type, "unrecognized ip type");
            IpType::Unknown
        });
        Ok(Self {
            ip_type,
            duration,
            connection_info,
        })
    }
}

fn non_null<'a, T>(raw: *const T) -> Result<&'a T> {
    unsafe { raw.as_ref() }.ok_or_else(|| Error::Precondition("null promise result".into()))
}

impl AsyncResult for DebugInfo {
    type Raw = SignalFfiChatServiceDebugInfo;

    unsafe fn consume(api: &'static SignalFfiApi, raw: *const Self::Raw) -> Result<Self> {
        unsafe { Self::from_raw(api, non_null(raw)?) }
    }
}

impl AsyncResult for ChatResponse {
    type Raw = SignalFfiChatResponse;

    unsafe fn consume(api: &'static SignalFfiApi, raw: *const Self::Raw) -> Result<Self> {
        unsafe { Self::from_raw(api, non_null(raw)?) }
    }
}

impl AsyncResult for (ChatResponse, DebugInfo) {
    type Raw = SignalFfiResponseAndDebugInfo;

    unsafe fn consume(api: &'static SignalFfiApi, raw: *const Self::Raw) -> Result<Self> {
        let raw = non_null(raw)?;
        // Both halves adopt their allocations before either can fail.
        let debug_info = unsafe { DebugInfo::from_raw(api, &raw.debug_info) };
        let response = unsafe { ChatResponse::from_raw(api, &raw.response) };
        Ok((response?, debug_info?))
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::ptr;

    use signal_chat_sys::{SignalBytestringArray, SignalOwnedBuffer, SignalOwnedBufferOfusize};

    use super::*;

    fn native_string(s: &str) -> *const std::ffi::c_char {
        CString::new(s).unwrap().into_raw().cast_const()
    }

    fn native_buffer(bytes: &[u8]) -> SignalOwnedBuffer {
        let boxed: Box<[u8]> = bytes.into();
        let length = boxed.len();
        SignalOwnedBuffer {
            base: Box::into_raw(boxed).cast::<u8>(),
            length,
        }
    }

    fn native_headers(lines: &[&str]) -> SignalBytestringArray {
        let bytes: Vec<u8> = lines.iter().flat_map(|l| l.bytes()).collect();
        let lengths: Box<[usize]> = lines.iter().map(|l| l.len()).collect();
        let count = lengths.len();
        SignalBytestringArray {
            bytes: native_buffer(&bytes),
            lengths: SignalOwnedBufferOfusize {
                base: Box::into_raw(lengths).cast::<usize>(),
                length: count,
            },
        }
    }

    #[test]
    fn response_headers_and_body() {
        let raw = SignalFfiChatResponse {
            status: 204,
            message: native_string("No Content"),
            headers: native_headers(&["Content-Type:text/plain", "x-id: 7"]),
            body: native_buffer(b"hi"),
        };
        let response =
            unsafe { ChatResponse::consume(signal_chat_ffi::api(), &raw const raw) }.unwrap();
        assert!(response.is_success());
        assert_eq!(response.message.as_deref(), Some("No Content"));
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header("X-ID"), Some("7"));
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn malformed_header_is_precondition() {
        let raw = SignalFfiChatResponse {
            status: 200,
            message: ptr::null(),
            headers: native_headers(&["no-colon"]),
            body: SignalOwnedBuffer::default(),
        };
        let err = unsafe { ChatResponse::consume(signal_chat_ffi::api(), &raw const raw) }
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn debug_info_conversion() {
        let raw = SignalFfiChatServiceDebugInfo {
            ip_type: 2,
            duration_secs: 1.5,
            connection_info: native_string("edge"),
        };
        let info = unsafe { DebugInfo::consume(signal_chat_ffi::api(), &raw const raw) }.unwrap();
        assert_eq!(info.ip_type, IpType::V6);
        assert_eq!(info.duration, Duration::from_millis(1500));
        assert_eq!(info.connection_info, "edge");
    }

    #[test]
    fn negative_duration_is_precondition() {
        let raw = SignalFfiChatServiceDebugInfo {
            ip_type: 9,
            duration_secs: -1.0,
            connection_info: ptr::null(),
        };
        let err = unsafe { DebugInfo::consume(signal_chat_ffi::api(), &raw const raw) }.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn null_result_is_precondition() {
        let err = unsafe { ChatResponse::consume(signal_chat_ffi::api(), ptr::null()) }.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn enum_values() {
        assert_eq!(IpType::from_ffi(1), Some(IpType::V4));
        assert_eq!(IpType::from_ffi(3), None);
        assert_eq!(Environment::default().to_ffi(), 0);
        assert_eq!(Environment::from_ffi(1), Some(Environment::Production));
    }

    #[test]
    fn request_builder_and_timeout() {
        let request = ChatRequest::new("PUT", "/v1/x")
            .with_header("a", "b")
            .with_body(vec![0xab])
            .with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(request.timeout_millis(), u32::MAX);
        assert_eq!(ChatRequest::new("GET", "/").timeout_millis(), 15_000);
        assert!(format!("{request:?}").contains("ab"));
    }

    #[test]
    fn nul_in_header_rejected_before_native_call() {
        let request = ChatRequest::new("GET", "/").with_header("x", "a\0b");
        let err = request.to_native(signal_chat_ffi::api()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
