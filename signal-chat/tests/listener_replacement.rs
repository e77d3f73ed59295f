#![allow(unsafe_code)]
//! Listener registrations driven by hand through a native layer that only
//! records what it was given.

use std::cell::RefCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use signal_chat::sys::{
    SIGNAL_CALLBACK_FAILED, SignalAuthChat, SignalErrorCodeNetworkProtocol, SignalFfiApi,
    SignalFfiChatListenerStruct, SignalFfiError, SignalTokioAsyncContext,
};
use signal_chat::{
    AuthenticatedChatService, ChatServiceListener, ConnectionEventsListener, Error,
    ListenerResult, NativeBytes, Net, ServerMessageAck,
};

thread_local! {
    static REGISTERED: RefCell<Vec<SignalFfiChatListenerStruct>> = const { RefCell::new(Vec::new()) };
}

unsafe extern "C" fn recording_set_listener(
    _async_runtime: *const SignalTokioAsyncContext,
    _chat: *const SignalAuthChat,
    listener: *const SignalFfiChatListenerStruct,
) -> *mut SignalFfiError {
    if let Some(listener) = unsafe { listener.as_ref() } {
        REGISTERED.with_borrow_mut(|registered| registered.push(*listener));
    }
    ptr::null_mut()
}

static RECORDING: SignalFfiApi = SignalFfiApi {
    chat_service_set_listener_auth: recording_set_listener,
    ..signal_chat_ffi::API
};

fn take_registrations() -> Vec<SignalFfiChatListenerStruct> {
    REGISTERED.with_borrow_mut(std::mem::take)
}

fn release(registration: &SignalFfiChatListenerStruct) {
    unsafe { (registration.destroy)(registration.ctx) };
}

#[derive(Default)]
struct Counter {
    queue_empty: AtomicUsize,
    interrupted: AtomicUsize,
    fail: bool,
}

impl ConnectionEventsListener<AuthenticatedChatService> for Counter {
    fn connection_interrupted(
        &self,
        _chat: &AuthenticatedChatService,
        _error: Option<Error>,
    ) -> ListenerResult {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ChatServiceListener for Counter {
    fn received_incoming_message(
        &self,
        _chat: &AuthenticatedChatService,
        _envelope: NativeBytes,
        _server_delivery_timestamp: u64,
        _ack: ServerMessageAck,
    ) -> ListenerResult {
        Ok(())
    }

    fn received_queue_empty(&self, _chat: &AuthenticatedChatService) -> ListenerResult {
        self.queue_empty.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("listener refused queue-empty".into());
        }
        Ok(())
    }
}

fn chat(net: &Net) -> AuthenticatedChatService {
    net.create_authenticated_chat_service("alice", "secret", false)
        .unwrap()
}

#[test]
fn superseded_listener_never_invoked() {
    let net = Net::builder().build(&RECORDING).unwrap();
    let chat = chat(&net);
    let a = Arc::new(Counter::default());
    let b = Arc::new(Counter::default());
    let a_dyn: Arc<dyn ChatServiceListener> = a.clone();
    let b_dyn: Arc<dyn ChatServiceListener> = b.clone();

    chat.set_listener(Some(&a_dyn)).unwrap();
    chat.set_listener(Some(&b_dyn)).unwrap();
    let [reg_a, reg_b] = <[_; 2]>::try_from(take_registrations()).unwrap();

    // A's late callbacks arrive after B took over.
    assert_eq!(unsafe { (reg_a.received_queue_empty)(reg_a.ctx) }, 0);
    let error = signal_chat_ffi::ffi_error(SignalErrorCodeNetworkProtocol, "late");
    assert_eq!(unsafe { (reg_a.connection_interrupted)(reg_a.ctx, error) }, 0);
    assert_eq!(a.queue_empty.load(Ordering::SeqCst), 0);
    assert_eq!(a.interrupted.load(Ordering::SeqCst), 0);

    assert_eq!(unsafe { (reg_b.received_queue_empty)(reg_b.ctx) }, 0);
    assert_eq!(b.queue_empty.load(Ordering::SeqCst), 1);

    release(&reg_a);
    release(&reg_b);
    assert_eq!(Arc::weak_count(&a), 0);
    assert_eq!(Arc::weak_count(&b), 0);
}

#[test]
fn cleared_listener_never_invoked() {
    let net = Net::builder().build(&RECORDING).unwrap();
    let chat = chat(&net);
    let a = Arc::new(Counter::default());
    let a_dyn: Arc<dyn ChatServiceListener> = a.clone();

    chat.set_listener(Some(&a_dyn)).unwrap();
    chat.set_listener(None).unwrap();
    let [reg_a] = <[_; 1]>::try_from(take_registrations()).unwrap();

    assert_eq!(unsafe { (reg_a.connection_interrupted)(reg_a.ctx, ptr::null_mut()) }, 0);
    assert_eq!(a.interrupted.load(Ordering::SeqCst), 0);
    release(&reg_a);
}

#[test]
fn callbacks_after_connection_dropped_are_ignored() {
    let net = Net::builder().build(&RECORDING).unwrap();
    let chat = chat(&net);
    let a = Arc::new(Counter::default());
    let a_dyn: Arc<dyn ChatServiceListener> = a.clone();
    chat.set_listener(Some(&a_dyn)).unwrap();
    drop(chat);

    let [reg_a] = <[_; 1]>::try_from(take_registrations()).unwrap();
    assert_eq!(unsafe { (reg_a.received_queue_empty)(reg_a.ctx) }, 0);
    assert_eq!(a.queue_empty.load(Ordering::SeqCst), 0);
    release(&reg_a);
}

#[test]
fn listener_failure_reported_to_native_layer() {
    let net = Net::builder().build(&RECORDING).unwrap();
    let chat = chat(&net);
    let failing = Arc::new(Counter {
        fail: true,
        ..Counter::default()
    });
    let failing_dyn: Arc<dyn ChatServiceListener> = failing.clone();
    chat.set_listener(Some(&failing_dyn)).unwrap();

    let [reg] = <[_; 1]>::try_from(take_registrations()).unwrap();
    // No native call is in progress, so the error is only logged.
    assert_eq!(
        unsafe { (reg.received_queue_empty)(reg.ctx) },
        SIGNAL_CALLBACK_FAILED
    );
    assert_eq!(failing.queue_empty.load(Ordering::SeqCst), 1);
    release(&reg);
}
