#![allow(unsafe_code)]
//! Native handle ownership and value marshaling.
//!
//! Every native allocation that crosses into Rust is adopted by a guard
//! before the call's error is inspected, so it is released exactly once on
//! both the success and the failure path. Free functions are never called
//! with null.

use std::any::type_name;
use std::ffi::{CStr, CString, c_char};
use std::fmt;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use signal_chat_sys::{
    SignalAuthChat, SignalBorrowedBuffer, SignalBytestringArray, SignalConnectionManager,
    SignalDestroyFn, SignalFfiApi, SignalFfiError, SignalHttpRequest, SignalOwnedBuffer,
    SignalServerMessageAck, SignalStringArray, SignalTokioAsyncContext, SignalUnauthChat,
};

use crate::error::{self, Error, Result};

// ---------------------------------------------------------------------------
// Native handles
// ---------------------------------------------------------------------------

mod private {
    pub trait Sealed {}
}

/// A native object type together with its destructor entry point.
///
/// Implemented for every opaque handle type of the native library; cannot be
/// implemented outside this crate.
pub trait NativeHandle: private::Sealed + Sized + 'static {
    /// Type name used in diagnostics.
    const NAME: &'static str;

    /// The destructor for this handle kind.
    fn destroy_fn(api: &SignalFfiApi) -> SignalDestroyFn<Self>;
}

macro_rules! native_handle {
    ($($ty:ident => $destroy:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}

            impl NativeHandle for $ty {
                const NAME: &'static str = stringify!($ty);

                fn destroy_fn(api: &SignalFfiApi) -> SignalDestroyFn<Self> {
                    api.$destroy
                }
            }
        )*
    };
}

native_handle! {
    SignalTokioAsyncContext => tokio_async_context_destroy,
    SignalConnectionManager => connection_manager_destroy,
    SignalHttpRequest => http_request_destroy,
    SignalServerMessageAck => server_message_ack_destroy,
    SignalAuthChat => auth_chat_destroy,
    SignalUnauthChat => unauth_chat_destroy,
}

/// The one owner of a native pointer. Destroys it when dropped.
struct Owned<T: NativeHandle> {
    ptr: NonNull<T>,
    api: &'static SignalFfiApi,
}

// Native handles are usable from any thread.
unsafe impl<T: NativeHandle> Send for Owned<T> {}
unsafe impl<T: NativeHandle> Sync for Owned<T> {}

impl<T: NativeHandle> Drop for Owned<T> {
    fn drop(&mut self) {
        let rc = unsafe { (T::destroy_fn(self.api))(self.ptr.as_ptr()) };
        match error::check(self.api, rc) {
            Ok(()) => tracing::trace!(handle = T::NAME, "native handle destroyed"),
            Err(e) => tracing::warn!(handle = T::NAME, error = %e, "failed to destroy native handle"),
        }
    }
}

/// RAII owner of a native handle.
///
/// The destructor runs exactly once, after the owner and every
/// [`HandleLease`] taken from it are gone.
pub struct NativeHandleOwner<T: NativeHandle> {
    inner: Arc<Owned<T>>,
}

impl<T: NativeHandle> NativeHandleOwner<T> {
    /// Take ownership of a pointer just returned by a native constructor.
    pub(crate) fn new(api: &'static SignalFfiApi, ptr: *mut T) -> Result<Self> {
        NonNull::new(ptr)
            .map(|ptr| Self::from_non_null(api, ptr))
            .ok_or_else(|| Error::Precondition(format!("null {} handle", T::NAME)))
    }

    fn from_non_null(api: &'static SignalFfiApi, ptr: NonNull<T>) -> Self {
        Self {
            inner: Arc::new(Owned { ptr, api }),
        }
    }

    /// Lend the raw handle for the duration of `f`.
    pub fn with_native_handle<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        f(self.inner.ptr.as_ptr().cast_const())
    }

    /// Keep the handle alive independently of this owner.
    #[must_use]
    pub fn lease(&self) -> HandleLease<T> {
        HandleLease {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn api(&self) -> &'static SignalFfiApi {
        self.inner.api
    }
}

impl<T: NativeHandle> fmt::Debug for NativeHandleOwner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandleOwner")
            .field("kind", &T::NAME)
            .field("ptr", &self.inner.ptr)
            .finish()
    }
}

/// Keep-alive token for a native handle; postpones its destruction.
pub struct HandleLease<T: NativeHandle> {
    inner: Arc<Owned<T>>,
}

impl<T: NativeHandle> HandleLease<T> {
    pub(crate) fn with_native_handle<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        f(self.inner.ptr.as_ptr().cast_const())
    }

    pub(crate) fn api(&self) -> &'static SignalFfiApi {
        self.inner.api
    }
}

impl<T: NativeHandle> fmt::Debug for HandleLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease")
            .field("kind", &T::NAME)
            .field("ptr", &self.inner.ptr)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Native allocations
// ---------------------------------------------------------------------------

/// Bytes allocated by the native library, handed over without copying.
///
/// Dereferences to `[u8]`; the allocation is released on drop.
pub struct NativeBytes {
    base: Option<NonNull<u8>>,
    length: usize,
    api: &'static SignalFfiApi,
}

// The buffer is plain memory owned by this value.
unsafe impl Send for NativeBytes {}
unsafe impl Sync for NativeBytes {}

impl NativeBytes {
    /// Adopt a buffer written by the native library.
    pub(crate) unsafe fn adopt(api: &'static SignalFfiApi, buffer: SignalOwnedBuffer) -> Self {
        Self {
            base: NonNull::new(buffer.base),
            length: buffer.length,
            api,
        }
    }
}

impl Deref for NativeBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.base {
            Some(base) => unsafe { std::slice::from_raw_parts(base.as_ptr(), self.length) },
            None => &[],
        }
    }
}

impl AsRef<[u8]> for NativeBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for NativeBytes {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe { (self.api.free_buffer)(base.as_ptr(), self.length) };
        }
    }
}

impl fmt::Debug for NativeBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeBytes({})", hex::encode(&**self))
    }
}

/// A NUL-terminated string allocated by the native library.
pub(crate) struct NativeString {
    ptr: NonNull<c_char>,
    api: &'static SignalFfiApi,
}

impl NativeString {
    /// Adopt a string written by the native library. `None` for null.
    pub(crate) unsafe fn adopt(api: &'static SignalFfiApi, ptr: *const c_char) -> Option<Self> {
        NonNull::new(ptr.cast_mut()).map(|ptr| Self { ptr, api })
    }

    pub(crate) fn to_string_lossy(&self) -> String {
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for NativeString {
    fn drop(&mut self) {
        unsafe { (self.api.free_string)(self.ptr.as_ptr()) };
    }
}

/// A byte string array allocated by the native library.
pub(crate) struct NativeBytestringArray {
    raw: SignalBytestringArray,
    api: &'static SignalFfiApi,
}

impl NativeBytestringArray {
    pub(crate) unsafe fn adopt(api: &'static SignalFfiApi, raw: SignalBytestringArray) -> Self {
        Self { raw, api }
    }

    /// Slice the concatenated data by the successive element lengths.
    pub(crate) fn elements(&self) -> Result<Vec<&[u8]>> {
        let bytes = unsafe { slice_or_empty(self.raw.bytes.base, self.raw.bytes.length) };
        let lengths = unsafe { slice_or_empty(self.raw.lengths.base, self.raw.lengths.length) };
        let mut offset = 0usize;
        let mut elements = Vec::with_capacity(lengths.len());
        for &length in lengths {
            let end = offset
                .checked_add(length)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "string array element of {length} bytes at offset {offset} overruns {} bytes",
                        bytes.len()
                    ))
                })?;
            elements.push(&bytes[offset..end]);
            offset = end;
        }
        Ok(elements)
    }
}

impl Drop for NativeBytestringArray {
    fn drop(&mut self) {
        if !self.raw.bytes.base.is_null() || !self.raw.lengths.base.is_null() {
            unsafe { (self.api.free_bytestring_array)(self.raw) };
        }
    }
}

unsafe fn slice_or_empty<'a, T>(base: *const T, length: usize) -> &'a [T] {
    if base.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(base, length) }
    }
}

/// Take a native string array, decoding each element as lossy UTF-8.
///
/// The array is released once, after every element has been copied out.
pub(crate) unsafe fn take_string_array(
    api: &'static SignalFfiApi,
    raw: SignalStringArray,
) -> Result<Vec<String>> {
    let array = unsafe { NativeBytestringArray::adopt(api, raw) };
    let strings = array
        .elements()?
        .into_iter()
        .map(|element| String::from_utf8_lossy(element).into_owned())
        .collect();
    Ok(strings)
}

// ---------------------------------------------------------------------------
// Invoke-and-convert adapters
// ---------------------------------------------------------------------------

/// Run a call that fills a fixed-size output region and return its bytes.
///
/// `Out` must be byte-aligned; the region is zeroed before the call.
pub(crate) fn invoke_fn_returning_fixed_length<Out>(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut Out) -> *mut SignalFfiError,
) -> Result<Vec<u8>> {
    if align_of::<Out>() != 1 {
        return Err(Error::Precondition(format!(
            "{} is not byte-aligned",
            type_name::<Out>()
        )));
    }
    let mut region = vec![0u8; size_of::<Out>()];
    let rc = f(region.as_mut_ptr().cast::<Out>());
    error::check(api, rc)?;
    Ok(region)
}

/// Run a call that fills a fixed-size region and parse the value out of it.
pub(crate) fn invoke_fn_returning_serialized<Out, T>(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut Out) -> *mut SignalFfiError,
) -> Result<T>
where
    T: for<'a> TryFrom<&'a [u8], Error = Error>,
{
    let region = invoke_fn_returning_fixed_length(api, f)?;
    T::try_from(region.as_slice())
}

/// Run a call that returns a native buffer; hand the buffer over as is.
pub(crate) fn invoke_fn_returning_native_bytes(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut SignalOwnedBuffer) -> *mut SignalFfiError,
) -> Result<NativeBytes> {
    let mut out = SignalOwnedBuffer::default();
    let rc = f(&raw mut out);
    let bytes = unsafe { NativeBytes::adopt(api, out) };
    error::check(api, rc)?;
    Ok(bytes)
}

/// Run a call that returns a native buffer and copy it out.
pub(crate) fn invoke_fn_returning_bytes(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut SignalOwnedBuffer) -> *mut SignalFfiError,
) -> Result<Vec<u8>> {
    invoke_fn_returning_native_bytes(api, f).map(|bytes| bytes.to_vec())
}

/// Run a call that returns a nullable native string.
pub(crate) fn invoke_fn_returning_optional_string(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut *const c_char) -> *mut SignalFfiError,
) -> Result<Option<String>> {
    let mut out: *const c_char = ptr::null();
    let rc = f(&raw mut out);
    let string = unsafe { NativeString::adopt(api, out) };
    error::check(api, rc)?;
    Ok(string.map(|s| s.to_string_lossy()))
}

/// Run a call that must return a native string.
pub(crate) fn invoke_fn_returning_string(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut *const c_char) -> *mut SignalFfiError,
) -> Result<String> {
    invoke_fn_returning_optional_string(api, f)?
        .ok_or_else(|| Error::Precondition("native call returned a null string".into()))
}

/// Run a call that writes an integer of the exact native width.
pub(crate) fn invoke_fn_returning_integer<Out: Copy + Default>(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut Out) -> *mut SignalFfiError,
) -> Result<Out> {
    let mut out = Out::default();
    let rc = f(&raw mut out);
    error::check(api, rc)?;
    Ok(out)
}

/// Run a call that writes a boolean.
pub(crate) fn invoke_fn_returning_bool(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut bool) -> *mut SignalFfiError,
) -> Result<bool> {
    invoke_fn_returning_integer(api, f)
}

/// Run a constructor that may legitimately return no handle.
pub(crate) fn invoke_fn_returning_optional_native_handle<T: NativeHandle>(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut *mut T) -> *mut SignalFfiError,
) -> Result<Option<NativeHandleOwner<T>>> {
    let mut out: *mut T = ptr::null_mut();
    let rc = f(&raw mut out);
    // Adopted first so a handle written alongside an error is still destroyed.
    let owner = NonNull::new(out).map(|ptr| NativeHandleOwner::from_non_null(api, ptr));
    error::check(api, rc)?;
    Ok(owner)
}

/// Run a constructor that must return a handle.
pub(crate) fn invoke_fn_returning_native_handle<T: NativeHandle>(
    api: &'static SignalFfiApi,
    f: impl FnOnce(*mut *mut T) -> *mut SignalFfiError,
) -> Result<NativeHandleOwner<T>> {
    invoke_fn_returning_optional_native_handle(api, f)?
        .ok_or_else(|| Error::Precondition(format!("native call returned a null {}", T::NAME)))
}

// ---------------------------------------------------------------------------
// Host-to-native helpers
// ---------------------------------------------------------------------------

/// Convert `&str` to `CString` for FFI.
pub(crate) fn to_c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument(format!("string contains NUL: {s:?}")))
}

/// Lend a byte slice for the duration of one call.
pub(crate) fn borrowed_buffer(bytes: &[u8]) -> SignalBorrowedBuffer {
    SignalBorrowedBuffer {
        base: bytes.as_ptr(),
        length: bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use signal_chat_sys::{SignalErrorCodeInternalError, SignalOwnedBufferOfusize};

    use super::*;

    thread_local! {
        static BUFFERS_FREED: Cell<usize> = const { Cell::new(0) };
        static ARRAYS_FREED: Cell<usize> = const { Cell::new(0) };
        static REQUESTS_DESTROYED: Cell<usize> = const { Cell::new(0) };
    }

    // Test buffers live on the test's stack; freeing only counts.
    unsafe extern "C" fn count_buffer_free(_base: *const u8, _length: usize) {
        BUFFERS_FREED.set(BUFFERS_FREED.get() + 1);
    }

    unsafe extern "C" fn count_array_free(_array: SignalBytestringArray) {
        ARRAYS_FREED.set(ARRAYS_FREED.get() + 1);
    }

    unsafe extern "C" fn count_request_destroy(
        request: *mut SignalHttpRequest,
    ) -> *mut SignalFfiError {
        REQUESTS_DESTROYED.set(REQUESTS_DESTROYED.get() + 1);
        unsafe { signal_chat_ffi::signal_http_request_destroy(request) }
    }

    static COUNTING: SignalFfiApi = SignalFfiApi {
        free_buffer: count_buffer_free,
        free_bytestring_array: count_array_free,
        http_request_destroy: count_request_destroy,
        ..signal_chat_ffi::API
    };

    fn array_over(bytes: &mut [u8], lengths: &mut [usize]) -> SignalBytestringArray {
        SignalBytestringArray {
            bytes: SignalOwnedBuffer {
                base: bytes.as_mut_ptr(),
                length: bytes.len(),
            },
            lengths: SignalOwnedBufferOfusize {
                base: lengths.as_mut_ptr(),
                length: lengths.len(),
            },
        }
    }

    fn new_request(api: &'static SignalFfiApi) -> NativeHandleOwner<SignalHttpRequest> {
        let method = to_c_string("GET").unwrap();
        let path = to_c_string("/").unwrap();
        invoke_fn_returning_native_handle(api, |out| unsafe {
            (api.http_request_new)(out, method.as_ptr(), path.as_ptr(), borrowed_buffer(&[]))
        })
        .unwrap()
    }

    #[test]
    fn string_array_sliced_by_lengths() {
        let mut bytes = *b"abchello";
        let mut lengths = [3, 0, 5];
        let before = ARRAYS_FREED.get();
        let strings =
            unsafe { take_string_array(&COUNTING, array_over(&mut bytes, &mut lengths)) }.unwrap();
        assert_eq!(strings, ["abc", "", "hello"]);
        assert_eq!(ARRAYS_FREED.get() - before, 1);
    }

    #[test]
    fn string_array_overrun_is_precondition_and_still_freed() {
        let mut bytes = *b"abc";
        let mut lengths = [2, 2];
        let before = ARRAYS_FREED.get();
        let err = unsafe { take_string_array(&COUNTING, array_over(&mut bytes, &mut lengths)) }
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(ARRAYS_FREED.get() - before, 1);
    }

    #[test]
    fn empty_string_array_is_not_freed() {
        let before = ARRAYS_FREED.get();
        let strings =
            unsafe { take_string_array(&COUNTING, SignalBytestringArray::default()) }.unwrap();
        assert!(strings.is_empty());
        assert_eq!(ARRAYS_FREED.get(), before);
    }

    #[test]
    fn buffer_released_on_success_and_failure() {
        let mut data = *b"payload";
        let before = BUFFERS_FREED.get();

        let bytes = invoke_fn_returning_bytes(&COUNTING, |out| {
            unsafe {
                *out = SignalOwnedBuffer {
                    base: data.as_mut_ptr(),
                    length: data.len(),
                }
            };
            ptr::null_mut()
        })
        .unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(BUFFERS_FREED.get() - before, 1);

        let err = invoke_fn_returning_bytes(&COUNTING, |out| {
            unsafe {
                *out = SignalOwnedBuffer {
                    base: data.as_mut_ptr(),
                    length: data.len(),
                }
            };
            signal_chat_ffi::ffi_error(SignalErrorCodeInternalError, "failed after allocating")
        });
        assert!(err.is_err());
        assert_eq!(BUFFERS_FREED.get() - before, 2);
    }

    #[test]
    fn null_buffer_never_freed() {
        let before = BUFFERS_FREED.get();
        let bytes = invoke_fn_returning_bytes(&COUNTING, |_| ptr::null_mut()).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(BUFFERS_FREED.get(), before);
    }

    #[test]
    fn native_bytes_freed_on_drop() {
        let mut data = *b"zero-copy";
        let before = BUFFERS_FREED.get();
        let bytes = invoke_fn_returning_native_bytes(&COUNTING, |out| {
            unsafe {
                *out = SignalOwnedBuffer {
                    base: data.as_mut_ptr(),
                    length: data.len(),
                }
            };
            ptr::null_mut()
        })
        .unwrap();
        assert_eq!(&*bytes, b"zero-copy");
        assert_eq!(BUFFERS_FREED.get(), before);
        drop(bytes);
        assert_eq!(BUFFERS_FREED.get() - before, 1);
    }

    #[test]
    fn fixed_length_requires_byte_alignment() {
        let mut called = false;
        let err = invoke_fn_returning_fixed_length::<u32>(&COUNTING, |_| {
            called = true;
            ptr::null_mut()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(!called);
    }

    #[test]
    fn fixed_length_region_is_zeroed() {
        let region = invoke_fn_returning_fixed_length::<[u8; 17]>(&COUNTING, |out| {
            assert_eq!(unsafe { *out }, [0; 17]);
            ptr::null_mut()
        })
        .unwrap();
        assert_eq!(region.len(), 17);
    }

    #[test]
    fn null_handle_is_precondition() {
        let err = NativeHandleOwner::<SignalHttpRequest>::new(&COUNTING, ptr::null_mut())
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        let err =
            invoke_fn_returning_native_handle::<SignalHttpRequest>(&COUNTING, |_| ptr::null_mut())
                .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn owner_destroys_exactly_once() {
        let before = REQUESTS_DESTROYED.get();
        let owner = new_request(&COUNTING);
        assert_eq!(REQUESTS_DESTROYED.get(), before);
        drop(owner);
        assert_eq!(REQUESTS_DESTROYED.get() - before, 1);
    }

    #[test]
    fn lease_defers_destruction() {
        let before = REQUESTS_DESTROYED.get();
        let owner = new_request(&COUNTING);
        let lease = owner.lease();
        let second = owner.lease();
        drop(owner);
        assert_eq!(REQUESTS_DESTROYED.get(), before);
        drop(lease);
        assert_eq!(REQUESTS_DESTROYED.get(), before);
        drop(second);
        assert_eq!(REQUESTS_DESTROYED.get() - before, 1);
    }

    #[test]
    fn nul_in_string_is_invalid_argument() {
        assert!(matches!(to_c_string("a\0b"), Err(Error::InvalidArgument(_))));
    }
}
