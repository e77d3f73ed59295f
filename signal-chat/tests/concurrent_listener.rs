#![allow(unsafe_code)]
//! Concurrent listener registration against a native layer that stalls the
//! first registration it sees.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use signal_chat::sys::{
    SignalAuthChat, SignalFfiApi, SignalFfiChatListenerStruct, SignalFfiError,
    SignalTokioAsyncContext,
};
use signal_chat::{
    AuthenticatedChatService, ChatServiceListener, ConnectionEventsListener, Error,
    ListenerResult, NativeBytes, Net, ServerMessageAck,
};

static FIRST_ENTERED: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn stalling_set_listener(
    async_runtime: *const SignalTokioAsyncContext,
    chat: *const SignalAuthChat,
    listener: *const SignalFfiChatListenerStruct,
) -> *mut SignalFfiError {
    if !FIRST_ENTERED.swap(true, Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(300));
    }
    unsafe { signal_chat_ffi::signal_chat_service_set_listener_auth(async_runtime, chat, listener) }
}

static STALLING: SignalFfiApi = SignalFfiApi {
    chat_service_set_listener_auth: stalling_set_listener,
    ..signal_chat_ffi::API
};

#[derive(Default)]
struct Counter {
    interrupted: AtomicUsize,
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
        Ok(())
    }
}

fn register(
    chat: &AuthenticatedChatService,
    listener: &Arc<Counter>,
) -> thread::JoinHandle<signal_chat::Result<()>> {
    let chat = chat.clone();
    let listener: Arc<dyn ChatServiceListener> = Arc::clone(listener) as _;
    thread::spawn(move || chat.set_listener(Some(&listener)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn later_set_listener_wins_when_earlier_native_call_stalls() {
    let net = Net::builder().user_agent("test-agent").build(&STALLING).unwrap();
    let chat = net
        .create_authenticated_chat_service("carol", "secret", false)
        .unwrap();
    let first = Arc::new(Counter::default());
    let second = Arc::new(Counter::default());

    let earlier = register(&chat, &first);
    while !FIRST_ENTERED.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    let later = register(&chat, &second);
    earlier.join().unwrap().unwrap();
    later.join().unwrap().unwrap();

    chat.connect().await.unwrap();
    chat.disconnect().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while second.interrupted.load(Ordering::SeqCst) == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "the listener registered last never saw the interruption"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(second.interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(first.interrupted.load(Ordering::SeqCst), 0);
}
