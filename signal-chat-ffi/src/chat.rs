//! Chat connections: connection state, request handling, and listener delivery.

use std::collections::VecDeque;
use std::ffi::c_char;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use signal_chat_sys::{
    SignalAuthChat, SignalCPromise, SignalCPromiseFfiChatServiceDebugInfo, SignalCPromisebool,
    SignalConnectionManager, SignalErrorCodeChatServiceInactive,
    SignalErrorCodeConnectionTimedOut, SignalErrorCodeDeviceDelinked,
    SignalErrorCodeNetworkProtocol, SignalFfiChatListenerStruct, SignalFfiChatResponse,
    SignalFfiError, SignalFfiResponseAndDebugInfo, SignalHttpRequest, SignalTokioAsyncContext,
    SignalUnauthChat,
};
use tokio::runtime::Handle;

use crate::ffi::{
    FfiError, FfiResult, c_str_to_string, catch, destroy, into_raw, owned_buffer, ref_from,
    write_out, write_value,
};
use crate::net::{ConnectionManager, Server, connection_manager};
use crate::request::{DebugInfo, RequestParts, Response, ServerMessageAck, http_request};
use crate::runtime::{IntoFfiResult, async_context};

/// Request header that delays the loopback response, in milliseconds.
pub const DELAY_HEADER: &str = "x-loopback-delay-ms";

const MESSAGES_PATH: &str = "/v1/messages/";

/// A message on its way to a client.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) body: Vec<u8>,
    pub(crate) timestamp: u64,
}

#[derive(Debug)]
struct Credentials {
    username: String,
    password: String,
    receive_stories: bool,
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Connecting,
    Connected { runtime: Handle },
    Disconnecting,
}

/// The single listener of a chat plus the events held while there is none.
#[derive(Debug, Default)]
struct Registration {
    listener: Option<Arc<RegisteredListener>>,
    backlog: VecDeque<Envelope>,
    queue_empty_pending: bool,
}

/// Opaque chat handle, shared by both connection flavors.
#[derive(Debug)]
pub struct Chat {
    state: Arc<ChatState>,
}

#[derive(Debug)]
pub(crate) struct ChatState {
    server: Arc<Server>,
    environment: u8,
    user_agent: String,
    credentials: Option<Credentials>,
    phase: Mutex<Phase>,
    registration: Mutex<Registration>,
}

impl ChatState {
    fn new(manager: &ConnectionManager, credentials: Option<Credentials>) -> Arc<Self> {
        let state = Arc::new(Self {
            server: Arc::clone(&manager.server),
            environment: manager.environment,
            user_agent: manager.user_agent.clone(),
            credentials,
            phase: Mutex::new(Phase::Disconnected),
            registration: Mutex::default(),
        });
        manager.server.register(&state);
        state
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registration(&self) -> MutexGuard<'_, Registration> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Username of an authenticated chat.
    pub(crate) fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(*self.phase(), Phase::Connected { .. })
    }

    fn debug_info(&self, duration: Duration) -> DebugInfo {
        DebugInfo {
            ip_type: 1,
            duration,
            connection_info: format!(
                "loopback environment={} user_agent={}",
                self.environment, self.user_agent
            ),
        }
    }

    // -- listener ---------------------------------------------------------

    fn listener(&self) -> Option<Arc<RegisteredListener>> {
        self.registration().listener.clone()
    }

    /// Swap the listener, returning the previous one.
    fn replace_listener(
        &self,
        listener: Option<Arc<RegisteredListener>>,
    ) -> Option<Arc<RegisteredListener>> {
        std::mem::replace(&mut self.registration().listener, listener)
    }

    /// Hand held events to `listener` while it is still the registered one.
    fn replay(&self, listener: &Arc<RegisteredListener>) -> FfiResult<()> {
        loop {
            let next = {
                let mut reg = self.registration();
                let current = reg
                    .listener
                    .as_ref()
                    .is_some_and(|l| Arc::ptr_eq(l, listener));
                if !current {
                    return Ok(());
                }
                if let Some(envelope) = reg.backlog.pop_front() {
                    Some(envelope)
                } else if reg.queue_empty_pending {
                    reg.queue_empty_pending = false;
                    None
                } else {
                    return Ok(());
                }
            };
            let delivered = match next {
                Some(envelope) => listener.received_incoming_message(envelope),
                None => listener.received_queue_empty(),
            };
            if !delivered {
                return Err(FfiError::callback_failed());
            }
        }
    }

    pub(crate) fn deliver(&self, envelope: Envelope) {
        let listener = {
            let mut reg = self.registration();
            let Some(listener) = reg.listener.clone() else {
                reg.backlog.push_back(envelope);
                return;
            };
            listener
        };
        if !listener.received_incoming_message(envelope) {
            tracing::warn!("listener failed to handle incoming message");
        }
    }

    fn deliver_queue_empty(&self) {
        let listener = {
            let mut reg = self.registration();
            let Some(listener) = reg.listener.clone() else {
                reg.queue_empty_pending = true;
                return;
            };
            listener
        };
        if !listener.received_queue_empty() {
            tracing::warn!("listener failed to handle queue empty");
        }
    }

    fn interrupt(&self, error: Option<FfiError>) {
        if let Some(listener) = self.listener() {
            if !listener.connection_interrupted(error) {
                tracing::warn!("listener failed to handle connection interruption");
            }
        }
    }

    /// Deliver mail held while offline, then report the queue as drained.
    fn flush_mailbox(&self) {
        let Some(username) = self.username() else {
            return;
        };
        for envelope in self.server.drain_mailbox(username) {
            self.deliver(envelope);
        }
        self.deliver_queue_empty();
    }

    // -- operations -------------------------------------------------------

    async fn connect(self: Arc<Self>) -> FfiResult<DebugInfo> {
        let started = Instant::now();
        if self.credentials.as_ref().is_some_and(|c| c.password.is_empty()) {
            return Err(FfiError::new(
                SignalErrorCodeDeviceDelinked,
                "device is no longer registered",
            ));
        }
        {
            let mut phase = self.phase();
            if matches!(*phase, Phase::Connected { .. }) {
                return Ok(self.debug_info(started.elapsed()));
            }
            *phase = Phase::Connecting;
        }
        tokio::task::yield_now().await;
        *self.phase() = Phase::Connected {
            runtime: Handle::current(),
        };
        tracing::debug!(
            username = self.username(),
            receive_stories = self.credentials.as_ref().is_some_and(|c| c.receive_stories),
            "chat connected"
        );
        self.flush_mailbox();
        Ok(self.debug_info(started.elapsed()))
    }

    async fn disconnect(self: Arc<Self>) -> FfiResult<bool> {
        {
            let mut phase = self.phase();
            if !matches!(*phase, Phase::Connected { .. }) {
                return Ok(false);
            }
            *phase = Phase::Disconnecting;
        }
        tokio::task::yield_now().await;
        *self.phase() = Phase::Disconnected;
        tracing::debug!(username = self.username(), "chat disconnected");
        self.interrupt(None);
        Ok(true)
    }

    async fn send(
        self: Arc<Self>,
        request: RequestParts,
        timeout: Duration,
    ) -> FfiResult<(Response, DebugInfo)> {
        let started = Instant::now();
        if !self.is_connected() {
            return Err(FfiError::new(
                SignalErrorCodeChatServiceInactive,
                "chat service is not connected",
            ));
        }
        let response = tokio::time::timeout(timeout, self.handle_request(request))
            .await
            .map_err(|_| FfiError::new(SignalErrorCodeConnectionTimedOut, "request timed out"))?;
        Ok((response, self.debug_info(started.elapsed())))
    }

    async fn handle_request(&self, request: RequestParts) -> Response {
        if let Some(millis) = request.header(DELAY_HEADER).and_then(|v| v.parse().ok()) {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        if request.method == "PUT" {
            if let Some(recipient) = request.path.strip_prefix(MESSAGES_PATH) {
                self.server.route(recipient, request.body);
                return Response {
                    status: 200,
                    message: Some("OK".to_owned()),
                    headers: Vec::new(),
                    body: Vec::new(),
                };
            }
        }
        Response {
            status: 200,
            message: Some("OK".to_owned()),
            headers: request.headers,
            body: request.body,
        }
    }

    /// Interrupt the connection and re-establish it on its runtime.
    pub(crate) fn network_changed(self: &Arc<Self>) {
        let runtime = match &*self.phase() {
            Phase::Connected { runtime } => runtime.clone(),
            _ => return,
        };
        let chat = Arc::clone(self);
        runtime.spawn(async move {
            chat.interrupt(Some(FfiError::new(
                SignalErrorCodeNetworkProtocol,
                "network changed",
            )));
            if chat.is_connected() {
                tracing::debug!(username = chat.username(), "chat reconnected");
                chat.flush_mailbox();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Listener registration
// ---------------------------------------------------------------------------

/// A listener struct handed over by the client. Destroys its context on drop.
#[derive(Debug)]
struct RegisteredListener {
    raw: SignalFfiChatListenerStruct,
}

// The client guarantees the callbacks and context are usable from any thread.
unsafe impl Send for RegisteredListener {}
unsafe impl Sync for RegisteredListener {}

impl RegisteredListener {
    fn received_incoming_message(&self, envelope: Envelope) -> bool {
        let ack = into_raw(ServerMessageAck::new(envelope.timestamp)).cast();
        let status = unsafe {
            (self.raw.received_incoming_message)(
                self.raw.ctx,
                owned_buffer(envelope.body),
                envelope.timestamp,
                ack,
            )
        };
        status == 0
    }

    fn received_queue_empty(&self) -> bool {
        unsafe { (self.raw.received_queue_empty)(self.raw.ctx) == 0 }
    }

    fn connection_interrupted(&self, error: Option<FfiError>) -> bool {
        let error = error.map_or(ptr::null_mut(), FfiError::into_raw);
        unsafe { (self.raw.connection_interrupted)(self.raw.ctx, error) == 0 }
    }
}

impl Drop for RegisteredListener {
    fn drop(&mut self) {
        unsafe { (self.raw.destroy)(self.raw.ctx) };
    }
}

// ---------------------------------------------------------------------------
// Shared entry point bodies
// ---------------------------------------------------------------------------

unsafe fn chat_state<'a, R>(chat: *const R) -> FfiResult<&'a Arc<ChatState>> {
    unsafe { ref_from(chat.cast::<Chat>(), "chat") }.map(|c| &c.state)
}

unsafe fn run<R, V, F>(
    promise: *mut SignalCPromise<V::Ffi>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const R,
    op: impl FnOnce(Arc<ChatState>) -> F,
) -> *mut SignalFfiError
where
    V: IntoFfiResult,
    F: Future<Output = FfiResult<V>> + Send + 'static,
{
    catch(|| {
        let runtime = unsafe { async_context(async_runtime)? };
        let chat = Arc::clone(unsafe { chat_state(chat)? });
        runtime.run_future(promise, op(chat))
    })
}

unsafe fn send_parts(
    request: *const SignalHttpRequest,
    timeout_millis: u32,
) -> FfiResult<(RequestParts, Duration)> {
    let request = unsafe { http_request(request)? };
    Ok((request.parts(), Duration::from_millis(timeout_millis.into())))
}

unsafe fn send<R, V>(
    promise: *mut SignalCPromise<V::Ffi>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const R,
    request: *const SignalHttpRequest,
    timeout_millis: u32,
    finish: fn((Response, DebugInfo)) -> V,
) -> *mut SignalFfiError
where
    V: IntoFfiResult,
{
    let parts = match unsafe { send_parts(request, timeout_millis) } {
        Ok(parts) => parts,
        Err(e) => return e.into_raw(),
    };
    unsafe {
        run(promise, async_runtime, chat, move |chat| async move {
            let (request, timeout) = parts;
            chat.send(request, timeout).await.map(finish)
        })
    }
}

unsafe fn set_listener<R>(
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const R,
    listener: *const SignalFfiChatListenerStruct,
) -> *mut SignalFfiError {
    catch(|| {
        // Owned from here on, even if the call fails.
        let listener = unsafe { listener.as_ref() }
            .map(|raw| Arc::new(RegisteredListener { raw: *raw }));
        unsafe { async_context(async_runtime)? };
        let chat = unsafe { chat_state(chat)? };
        drop(chat.replace_listener(listener.clone()));
        match listener {
            Some(listener) => chat.replay(&listener),
            None => Ok(()),
        }
    })
}

unsafe fn is_connected<R>(out: *mut bool, chat: *const R) -> *mut SignalFfiError {
    catch(|| {
        let chat = unsafe { chat_state(chat)? };
        unsafe { write_value(out, chat.is_connected()) }
    })
}

// ---------------------------------------------------------------------------
// Authenticated chat
// ---------------------------------------------------------------------------

/// Create an authenticated chat. An empty password is accepted here but
/// rejected with `DeviceDelinked` on connect.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_new_auth(
    out: *mut *mut SignalAuthChat,
    manager: *const SignalConnectionManager,
    username: *const c_char,
    password: *const c_char,
    receive_stories: bool,
) -> *mut SignalFfiError {
    catch(|| {
        let manager = unsafe { connection_manager(manager)? };
        let credentials = Credentials {
            username: unsafe { c_str_to_string(username, "username")? },
            password: unsafe { c_str_to_string(password, "password")? },
            receive_stories,
        };
        let state = ChatState::new(manager, Some(credentials));
        unsafe { write_out(out, Chat { state }) }
    })
}

/// Destroy an authenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_auth_chat_destroy(chat: *mut SignalAuthChat) -> *mut SignalFfiError {
    unsafe { destroy::<Chat, _>(chat) }
}

/// Connect an authenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_connect_auth(
    promise: *mut SignalCPromiseFfiChatServiceDebugInfo,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalAuthChat,
) -> *mut SignalFfiError {
    unsafe { run(promise, async_runtime, chat, ChatState::connect) }
}

/// Disconnect an authenticated chat. Resolves to whether it was connected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_disconnect_auth(
    promise: *mut SignalCPromisebool,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalAuthChat,
) -> *mut SignalFfiError {
    unsafe { run(promise, async_runtime, chat, ChatState::disconnect) }
}

/// Send a request over an authenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_auth_send(
    promise: *mut SignalCPromise<SignalFfiChatResponse>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalAuthChat,
    request: *const SignalHttpRequest,
    timeout_millis: u32,
) -> *mut SignalFfiError {
    unsafe { send(promise, async_runtime, chat, request, timeout_millis, |(r, _)| r) }
}

/// Send a request over an authenticated chat, also reporting debug info.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_auth_send_and_debug(
    promise: *mut SignalCPromise<SignalFfiResponseAndDebugInfo>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalAuthChat,
    request: *const SignalHttpRequest,
    timeout_millis: u32,
) -> *mut SignalFfiError {
    unsafe { send(promise, async_runtime, chat, request, timeout_millis, |pair| pair) }
}

/// Replace (or clear, with null) the listener of an authenticated chat.
///
/// Held messages are replayed to the new listener before returning; a
/// callback failure stops the replay and fails the call with `CallbackError`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_set_listener_auth(
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalAuthChat,
    listener: *const SignalFfiChatListenerStruct,
) -> *mut SignalFfiError {
    unsafe { set_listener(async_runtime, chat, listener) }
}

/// Whether an authenticated chat is connected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_is_connected_auth(
    out: *mut bool,
    chat: *const SignalAuthChat,
) -> *mut SignalFfiError {
    unsafe { is_connected(out, chat) }
}

// ---------------------------------------------------------------------------
// Unauthenticated chat
// ---------------------------------------------------------------------------

/// Create an unauthenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_new_unauth(
    out: *mut *mut SignalUnauthChat,
    manager: *const SignalConnectionManager,
) -> *mut SignalFfiError {
    catch(|| {
        let manager = unsafe { connection_manager(manager)? };
        let state = ChatState::new(manager, None);
        unsafe { write_out(out, Chat { state }) }
    })
}

/// Destroy an unauthenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_unauth_chat_destroy(
    chat: *mut SignalUnauthChat,
) -> *mut SignalFfiError {
    unsafe { destroy::<Chat, _>(chat) }
}

/// Connect an unauthenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_connect_unauth(
    promise: *mut SignalCPromiseFfiChatServiceDebugInfo,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalUnauthChat,
) -> *mut SignalFfiError {
    unsafe { run(promise, async_runtime, chat, ChatState::connect) }
}

/// Disconnect an unauthenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_disconnect_unauth(
    promise: *mut SignalCPromisebool,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalUnauthChat,
) -> *mut SignalFfiError {
    unsafe { run(promise, async_runtime, chat, ChatState::disconnect) }
}

/// Send a request over an unauthenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_unauth_send(
    promise: *mut SignalCPromise<SignalFfiChatResponse>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalUnauthChat,
    request: *const SignalHttpRequest,
    timeout_millis: u32,
) -> *mut SignalFfiError {
    unsafe { send(promise, async_runtime, chat, request, timeout_millis, |(r, _)| r) }
}

/// Send a request over an unauthenticated chat, also reporting debug info.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_unauth_send_and_debug(
    promise: *mut SignalCPromise<SignalFfiResponseAndDebugInfo>,
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalUnauthChat,
    request: *const SignalHttpRequest,
    timeout_millis: u32,
) -> *mut SignalFfiError {
    unsafe { send(promise, async_runtime, chat, request, timeout_millis, |pair| pair) }
}

/// Replace (or clear, with null) the listener of an unauthenticated chat.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_set_listener_unauth(
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalUnauthChat,
    listener: *const SignalFfiChatListenerStruct,
) -> *mut SignalFfiError {
    unsafe { set_listener(async_runtime, chat, listener) }
}

/// Whether an unauthenticated chat is connected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_chat_service_is_connected_unauth(
    out: *mut bool,
    chat: *const SignalUnauthChat,
) -> *mut SignalFfiError {
    unsafe { is_connected(out, chat) }
}
