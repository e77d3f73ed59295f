#![allow(unsafe_code)]
//! Chat connections: connect, send, listen.
//!
//! [`AuthenticatedChatService`] and [`UnauthenticatedChatService`] share one
//! implementation, [`ChatConnection`], parameterized by a sealed marker type
//! that selects the native entry points and the listener trait.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use signal_chat_sys::{
    SignalAuthChat, SignalCPromise, SignalChatConnectFn, SignalChatDisconnectFn,
    SignalChatIsConnectedFn, SignalChatSendFn, SignalChatSetListenerFn, SignalConnectionManager,
    SignalFfiApi, SignalFfiChatResponse, SignalFfiError, SignalFfiResponseAndDebugInfo,
    SignalTokioAsyncContext, SignalUnauthChat,
};

use crate::async_context::{AsyncResult, PendingOperation, TokioAsyncContext};
use crate::callback::rethrow_callback_errors;
use crate::error::{self, Error, Result};
use crate::ffi::{HandleLease, NativeBytes, NativeHandle, NativeHandleOwner, invoke_fn_returning_bool};
use crate::net::Net;
use crate::types::{ChatRequest, ChatResponse, DebugInfo};

mod listener;

use listener::ListenerBridge;
pub use listener::{
    ChatServiceListener, ConnectionEventsListener, ListenerResult, ServerMessageAck,
};

mod private {
    pub trait Sealed {}
}

/// Selects the native entry points of one connection variant. Sealed.
pub trait ChatKind: private::Sealed + Send + Sync + Sized + 'static {
    /// Native handle type.
    type Raw: NativeHandle;
    /// Listener trait object accepted by `set_listener`.
    type Listener: ?Sized + Send + Sync + 'static;
    /// Variant name used in diagnostics.
    const NAME: &'static str;

    #[doc(hidden)]
    fn connect_fn(api: &SignalFfiApi) -> SignalChatConnectFn<Self::Raw>;
    #[doc(hidden)]
    fn disconnect_fn(api: &SignalFfiApi) -> SignalChatDisconnectFn<Self::Raw>;
    #[doc(hidden)]
    fn send_fn(api: &SignalFfiApi) -> SignalChatSendFn<Self::Raw, SignalFfiChatResponse>;
    #[doc(hidden)]
    fn send_and_debug_fn(
        api: &SignalFfiApi,
    ) -> SignalChatSendFn<Self::Raw, SignalFfiResponseAndDebugInfo>;
    #[doc(hidden)]
    fn set_listener_fn(api: &SignalFfiApi) -> SignalChatSetListenerFn<Self::Raw>;
    #[doc(hidden)]
    fn is_connected_fn(api: &SignalFfiApi) -> SignalChatIsConnectedFn<Self::Raw>;

    #[doc(hidden)]
    fn received_incoming_message(
        listener: &Self::Listener,
        chat: &ChatConnection<Self>,
        envelope: NativeBytes,
        server_delivery_timestamp: u64,
        ack: ServerMessageAck,
    ) -> ListenerResult;
    #[doc(hidden)]
    fn received_queue_empty(
        listener: &Self::Listener,
        chat: &ChatConnection<Self>,
    ) -> ListenerResult;
    #[doc(hidden)]
    fn connection_interrupted(
        listener: &Self::Listener,
        chat: &ChatConnection<Self>,
        error: Option<Error>,
    ) -> ListenerResult;
}

/// Marker for connections made with account credentials.
#[derive(Debug)]
pub enum Authenticated {}

/// Marker for anonymous connections.
#[derive(Debug)]
pub enum Unauthenticated {}

/// Connection authenticated as one device of an account.
pub type AuthenticatedChatService = ChatConnection<Authenticated>;

/// Anonymous connection.
pub type UnauthenticatedChatService = ChatConnection<Unauthenticated>;

impl private::Sealed for Authenticated {}

impl ChatKind for Authenticated {
    type Raw = SignalAuthChat;
    type Listener = dyn ChatServiceListener;
    const NAME: &'static str = "auth";

    fn connect_fn(api: &SignalFfiApi) -> SignalChatConnectFn<SignalAuthChat> {
        api.chat_service_connect_auth
    }

    fn disconnect_fn(api: &SignalFfiApi) -> SignalChatDisconnectFn<SignalAuthChat> {
        api.chat_service_disconnect_auth
    }

    fn send_fn(api: &SignalFfiApi) -> SignalChatSendFn<SignalAuthChat, SignalFfiChatResponse> {
        api.chat_service_auth_send
    }

    fn send_and_debug_fn(
        api: &SignalFfiApi,
    ) -> SignalChatSendFn<SignalAuthChat, SignalFfiResponseAndDebugInfo> {
        api.chat_service_auth_send_and_debug
    }

    fn set_listener_fn(api: &SignalFfiApi) -> SignalChatSetListenerFn<SignalAuthChat> {
        api.chat_service_set_listener_auth
    }

    fn is_connected_fn(api: &SignalFfiApi) -> SignalChatIsConnectedFn<SignalAuthChat> {
        api.chat_service_is_connected_auth
    }

    fn received_incoming_message(
        listener: &Self::Listener,
        chat: &AuthenticatedChatService,
        envelope: NativeBytes,
        server_delivery_timestamp: u64,
        ack: ServerMessageAck,
    ) -> ListenerResult {
        listener.received_incoming_message(chat, envelope, server_delivery_timestamp, ack)
    }

    fn received_queue_empty(
        listener: &Self::Listener,
        chat: &AuthenticatedChatService,
    ) -> ListenerResult {
        listener.received_queue_empty(chat)
    }

    fn connection_interrupted(
        listener: &Self::Listener,
        chat: &AuthenticatedChatService,
        error: Option<Error>,
    ) -> ListenerResult {
        listener.connection_interrupted(chat, error)
    }
}

impl private::Sealed for Unauthenticated {}

impl ChatKind for Unauthenticated {
    type Raw = SignalUnauthChat;
    type Listener = dyn ConnectionEventsListener<UnauthenticatedChatService>;
    const NAME: &'static str = "unauth";

    fn connect_fn(api: &SignalFfiApi) -> SignalChatConnectFn<SignalUnauthChat> {
        api.chat_service_connect_unauth
    }

    fn disconnect_fn(api: &SignalFfiApi) -> SignalChatDisconnectFn<SignalUnauthChat> {
        api.chat_service_disconnect_unauth
    }

    fn send_fn(api: &SignalFfiApi) -> SignalChatSendFn<SignalUnauthChat, SignalFfiChatResponse> {
        api.chat_service_unauth_send
    }

    fn send_and_debug_fn(
        api: &SignalFfiApi,
    ) -> SignalChatSendFn<SignalUnauthChat, SignalFfiResponseAndDebugInfo> {
        api.chat_service_unauth_send_and_debug
    }

    fn set_listener_fn(api: &SignalFfiApi) -> SignalChatSetListenerFn<SignalUnauthChat> {
        api.chat_service_set_listener_unauth
    }

    fn is_connected_fn(api: &SignalFfiApi) -> SignalChatIsConnectedFn<SignalUnauthChat> {
        api.chat_service_is_connected_unauth
    }

    fn received_incoming_message(
        _listener: &Self::Listener,
        _chat: &UnauthenticatedChatService,
        envelope: NativeBytes,
        server_delivery_timestamp: u64,
        _ack: ServerMessageAck,
    ) -> ListenerResult {
        tracing::warn!(
            len = envelope.len(),
            server_delivery_timestamp,
            "dropping message pushed to an unauthenticated connection"
        );
        Ok(())
    }

    fn received_queue_empty(
        _listener: &Self::Listener,
        _chat: &UnauthenticatedChatService,
    ) -> ListenerResult {
        tracing::debug!("ignoring queue-empty on an unauthenticated connection");
        Ok(())
    }

    fn connection_interrupted(
        listener: &Self::Listener,
        chat: &UnauthenticatedChatService,
        error: Option<Error>,
    ) -> ListenerResult {
        listener.connection_interrupted(chat, error)
    }
}

// ---------------------------------------------------------------------------
// ChatConnection
// ---------------------------------------------------------------------------

pub(crate) struct ChatInner<K: ChatKind> {
    handle: NativeHandleOwner<K::Raw>,
    async_context: Arc<TokioAsyncContext>,
    _connection_manager: HandleLease<SignalConnectionManager>,
    /// Bumped on every `set_listener`; older registrations stop dispatching.
    listener_generation: AtomicU64,
    /// Held across the bump and the native call, so the registration native
    /// code ends up with always carries the current generation.
    listener_update: Mutex<()>,
    _kind: PhantomData<fn() -> K>,
}

/// A chat connection. Cheap to clone; clones share the native handle.
///
/// Created through [`Net`]; starts disconnected.
pub struct ChatConnection<K: ChatKind> {
    inner: Arc<ChatInner<K>>,
}

impl<K: ChatKind> ChatConnection<K> {
    pub(crate) fn from_parts(handle: NativeHandleOwner<K::Raw>, net: &Net) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                handle,
                async_context: Arc::clone(&net.async_context),
                _connection_manager: net.connection_manager.lease(),
                listener_generation: AtomicU64::new(0),
                listener_update: Mutex::new(()),
                _kind: PhantomData,
            }),
        }
    }

    fn api(&self) -> &'static SignalFfiApi {
        self.inner.handle.api()
    }

    /// Submit an operation that only needs the connection handle.
    fn submit<T: AsyncResult>(
        &self,
        call: impl FnOnce(
            *mut SignalCPromise<T::Raw>,
            *const SignalTokioAsyncContext,
            *const K::Raw,
        ) -> *mut SignalFfiError,
    ) -> Result<PendingOperation<T>> {
        let handle = &self.inner.handle;
        self.inner
            .async_context
            .invoke_async_function(handle.lease(), |promise, runtime| {
                handle.with_native_handle(|chat| call(promise, runtime, chat))
            })
    }

    /// Submit a request; the native request object lives until completion.
    fn submit_request<T: AsyncResult>(
        &self,
        request: &ChatRequest,
        send: SignalChatSendFn<K::Raw, T::Raw>,
    ) -> Result<PendingOperation<T>> {
        let native = request.to_native(self.api())?;
        let timeout_millis = request.timeout_millis();
        let handle = &self.inner.handle;
        self.inner.async_context.invoke_async_function(
            (handle.lease(), native.lease()),
            |promise, runtime| {
                handle.with_native_handle(|chat| {
                    native.with_native_handle(|request| unsafe {
                        send(promise, runtime, chat, request, timeout_millis)
                    })
                })
            },
        )
    }

    /// Open the connection. Returns details about the established connection.
    ///
    /// # Errors
    ///
    /// Returns the native connect error, for example
    /// [`Error::DeviceDeregistered`] for rejected credentials or
    /// [`Error::Network`].
    pub async fn connect(&self) -> Result<DebugInfo> {
        let connect = K::connect_fn(self.api());
        let pending = self
            .submit::<DebugInfo>(|promise, runtime, chat| unsafe { connect(promise, runtime, chat) })?;
        let info = pending.await?;
        tracing::debug!(chat = K::NAME, ?info, "connected");
        Ok(info)
    }

    /// Close the connection. The listener sees `connection_interrupted(None)`.
    ///
    /// # Errors
    ///
    /// Returns the native error.
    pub async fn disconnect(&self) -> Result<()> {
        let disconnect = K::disconnect_fn(self.api());
        let pending = self
            .submit::<bool>(|promise, runtime, chat| unsafe { disconnect(promise, runtime, chat) })?;
        pending.await?;
        tracing::debug!(chat = K::NAME, "disconnected");
        Ok(())
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ServiceInactive`] unless connected, and with
    /// [`Error::Network`] if no response arrives within the request timeout.
    pub async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let pending = self.submit_request(request, K::send_fn(self.api()))?;
        pending.await
    }

    /// Like [`send`](Self::send), also returning connection details.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub async fn send_and_debug(&self, request: &ChatRequest) -> Result<(ChatResponse, DebugInfo)> {
        let pending = self.submit_request(request, K::send_and_debug_fn(self.api()))?;
        pending.await
    }

    /// Register `listener`, replacing any previous one, or clear it with `None`.
    ///
    /// Only a weak reference is kept: keep the `Arc` alive for as long as
    /// events are wanted. Messages held while no listener was registered are
    /// replayed before this returns; a listener error during the replay is
    /// returned as [`Error::Listener`].
    ///
    /// Concurrent calls are serialized; the last one to return wins. Must not
    /// be called from inside a callback of this connection's listener.
    ///
    /// # Errors
    ///
    /// Returns the native error, or the listener's error from the replay.
    pub fn set_listener(&self, listener: Option<&Arc<K::Listener>>) -> Result<()> {
        let api = self.api();
        let _update = self
            .inner
            .listener_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = self.inner.listener_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let set_listener = K::set_listener_fn(api);
        rethrow_callback_errors(|| {
            let raw = listener.map(|listener| {
                ListenerBridge::<K>::into_native(
                    Arc::downgrade(&self.inner),
                    generation,
                    Arc::downgrade(listener),
                    api,
                )
            });
            let raw_ptr = raw.as_ref().map_or(ptr::null(), ptr::from_ref);
            let rc = self.inner.async_context.with_native_handle(|runtime| {
                self.inner
                    .handle
                    .with_native_handle(|chat| unsafe { set_listener(runtime, chat, raw_ptr) })
            });
            error::check(api, rc)
        })?;
        tracing::debug!(
            chat = K::NAME,
            generation,
            registered = listener.is_some(),
            "listener updated"
        );
        Ok(())
    }

    /// Whether the connection is currently up.
    ///
    /// # Errors
    ///
    /// Returns the native error.
    pub fn is_connected(&self) -> Result<bool> {
        let api = self.api();
        let is_connected = K::is_connected_fn(api);
        self.inner.handle.with_native_handle(|chat| {
            invoke_fn_returning_bool(api, |out| unsafe { is_connected(out, chat) })
        })
    }
}

impl<K: ChatKind> Clone for ChatConnection<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: ChatKind> fmt::Debug for ChatConnection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatConnection")
            .field("kind", &K::NAME)
            .field("handle", &self.inner.handle)
            .finish()
    }
}
