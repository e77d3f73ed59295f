#![allow(unsafe_code)]
//! Push-event listeners and the native callback trampolines behind them.
//!
//! A registration hands native code a boxed `ListenerBridge` holding only
//! weak references to the connection and the listener, so neither keeps the
//! other alive. Each registration carries the generation it was made in; a
//! callback from a superseded registration is dropped without reaching any
//! listener.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Weak;

use signal_chat_sys::{
    SIGNAL_CALLBACK_FAILED, SignalFfiApi, SignalFfiChatListenerStruct, SignalFfiError,
    SignalOwnedBuffer, SignalServerMessageAck,
};

use super::{AuthenticatedChatService, ChatConnection, ChatInner, ChatKind};
use crate::callback::catch_callback_errors;
use crate::error::{self, BoxError, Error, Result};
use crate::ffi::{NativeBytes, NativeHandleOwner};

/// What listener callbacks return. An error is reported to the native layer
/// and, during a synchronous replay, returned from `set_listener`.
pub type ListenerResult = std::result::Result<(), BoxError>;

/// Connectivity events, delivered for both connection variants.
pub trait ConnectionEventsListener<S>: Send + Sync {
    /// The connection went down. `None` means the client asked for it.
    fn connection_interrupted(&self, chat: &S, error: Option<Error>) -> ListenerResult;
}

/// Server pushes on an authenticated connection.
pub trait ChatServiceListener: ConnectionEventsListener<AuthenticatedChatService> {
    /// A message was delivered. Acknowledge it with [`ServerMessageAck::send`].
    fn received_incoming_message(
        &self,
        chat: &AuthenticatedChatService,
        envelope: NativeBytes,
        server_delivery_timestamp: u64,
        ack: ServerMessageAck,
    ) -> ListenerResult;

    /// Everything queued on the server has been delivered.
    fn received_queue_empty(&self, chat: &AuthenticatedChatService) -> ListenerResult;
}

/// Acknowledgement token for one incoming message.
pub struct ServerMessageAck {
    handle: NativeHandleOwner<SignalServerMessageAck>,
}

impl ServerMessageAck {
    /// Tell the server the message was processed.
    ///
    /// # Errors
    ///
    /// Returns the native error if the acknowledgement cannot be sent.
    pub fn send(self) -> Result<()> {
        let api = self.handle.api();
        let rc = self
            .handle
            .with_native_handle(|ack| unsafe { (api.server_message_ack_send)(ack) });
        error::check(api, rc)
    }
}

impl fmt::Debug for ServerMessageAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMessageAck")
            .field("handle", &self.handle)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Native registration
// ---------------------------------------------------------------------------

/// Context pointer of one native listener registration.
pub(super) struct ListenerBridge<K: ChatKind> {
    chat: Weak<ChatInner<K>>,
    generation: u64,
    listener: Weak<K::Listener>,
    api: &'static SignalFfiApi,
}

impl<K: ChatKind> ListenerBridge<K> {
    /// Box a registration for native code, which owns it from here on.
    pub(super) fn into_native(
        chat: Weak<ChatInner<K>>,
        generation: u64,
        listener: Weak<K::Listener>,
        api: &'static SignalFfiApi,
    ) -> SignalFfiChatListenerStruct {
        let bridge = Box::new(Self {
            chat,
            generation,
            listener,
            api,
        });
        SignalFfiChatListenerStruct {
            ctx: Box::into_raw(bridge).cast::<c_void>(),
            received_incoming_message: received_incoming_message::<K>,
            received_queue_empty: received_queue_empty::<K>,
            connection_interrupted: connection_interrupted::<K>,
            destroy: destroy::<K>,
        }
    }

    fn dispatch(
        &self,
        f: impl FnOnce(&K::Listener, &ChatConnection<K>) -> ListenerResult,
    ) -> ListenerResult {
        let Some(inner) = self.chat.upgrade() else {
            tracing::trace!(chat = K::NAME, "event for a dropped connection");
            return Ok(());
        };
        if inner.listener_generation.load(Ordering::SeqCst) != self.generation {
            tracing::trace!(
                chat = K::NAME,
                generation = self.generation,
                "event for a superseded listener"
            );
            return Ok(());
        }
        let Some(listener) = self.listener.upgrade() else {
            tracing::trace!(chat = K::NAME, "event for a dropped listener");
            return Ok(());
        };
        f(&*listener, &ChatConnection { inner })
    }
}

unsafe fn bridge<'a, K: ChatKind>(ctx: *mut c_void) -> Option<&'a ListenerBridge<K>> {
    let bridge = unsafe { ctx.cast::<ListenerBridge<K>>().as_ref() };
    if bridge.is_none() {
        tracing::warn!(chat = K::NAME, "listener callback without context");
    }
    bridge
}

unsafe extern "C" fn received_incoming_message<K: ChatKind>(
    ctx: *mut c_void,
    envelope: SignalOwnedBuffer,
    timestamp: u64,
    ack: *mut SignalServerMessageAck,
) -> i32 {
    let Some(bridge) = (unsafe { bridge::<K>(ctx) }) else {
        return SIGNAL_CALLBACK_FAILED;
    };
    // Both are ours now, whatever the listener does.
    let envelope = unsafe { NativeBytes::adopt(bridge.api, envelope) };
    let ack = NativeHandleOwner::new(bridge.api, ack).map(|handle| ServerMessageAck { handle });
    catch_callback_errors(|| {
        let ack = ack?;
        bridge.dispatch(|listener, chat| {
            K::received_incoming_message(listener, chat, envelope, timestamp, ack)
        })
    })
}

unsafe extern "C" fn received_queue_empty<K: ChatKind>(ctx: *mut c_void) -> i32 {
    let Some(bridge) = (unsafe { bridge::<K>(ctx) }) else {
        return SIGNAL_CALLBACK_FAILED;
    };
    catch_callback_errors(|| bridge.dispatch(K::received_queue_empty))
}

unsafe extern "C" fn connection_interrupted<K: ChatKind>(
    ctx: *mut c_void,
    error: *mut SignalFfiError,
) -> i32 {
    let Some(bridge) = (unsafe { bridge::<K>(ctx) }) else {
        return SIGNAL_CALLBACK_FAILED;
    };
    let error = error::check(bridge.api, error).err();
    catch_callback_errors(|| {
        bridge.dispatch(|listener, chat| K::connection_interrupted(listener, chat, error))
    })
}

unsafe extern "C" fn destroy<K: ChatKind>(ctx: *mut c_void) {
    if ctx.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(ctx.cast::<ListenerBridge<K>>()) });
    tracing::trace!(chat = K::NAME, "listener registration released");
}

