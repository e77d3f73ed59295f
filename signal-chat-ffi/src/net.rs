//! Connection manager: the in-memory server shared by chats of one environment.

use std::collections::{HashMap, VecDeque};
use std::ffi::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use signal_chat_sys::{SignalConnectionManager, SignalFfiError};

use crate::chat::{ChatState, Envelope};
use crate::ffi::{FfiResult, c_str_to_string, catch, destroy, ref_from, write_out};

/// Opaque connection manager handle.
#[derive(Debug)]
pub struct ConnectionManager {
    pub(crate) environment: u8,
    pub(crate) user_agent: String,
    pub(crate) server: Arc<Server>,
}

/// Routes envelopes between chats and holds mail for users that are offline.
#[derive(Debug, Default)]
pub(crate) struct Server {
    chats: Mutex<Vec<Weak<ChatState>>>,
    mailboxes: Mutex<HashMap<String, VecDeque<Envelope>>>,
    clock: AtomicU64,
}

impl Server {
    pub(crate) fn register(&self, chat: &Arc<ChatState>) {
        let mut chats = self.chats.lock().unwrap_or_else(PoisonError::into_inner);
        chats.retain(|c| c.strong_count() > 0);
        chats.push(Arc::downgrade(chat));
    }

    fn live_chats(&self) -> Vec<Arc<ChatState>> {
        self.chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Monotonic server delivery timestamp.
    pub(crate) fn next_timestamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Deliver `body` to every connected chat of `recipient`, or hold it.
    pub(crate) fn route(&self, recipient: &str, body: Vec<u8>) {
        let envelope = Envelope {
            body,
            timestamp: self.next_timestamp(),
        };
        let targets: Vec<_> = self
            .live_chats()
            .into_iter()
            .filter(|chat| chat.username() == Some(recipient) && chat.is_connected())
            .collect();
        if targets.is_empty() {
            tracing::debug!(recipient, "recipient offline, holding message");
            self.mailboxes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(recipient.to_owned())
                .or_default()
                .push_back(envelope);
            return;
        }
        for chat in targets {
            chat.deliver(envelope.clone());
        }
    }

    /// Take every held message for `recipient`.
    pub(crate) fn drain_mailbox(&self, recipient: &str) -> VecDeque<Envelope> {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(recipient)
            .unwrap_or_default()
    }

    fn on_network_change(&self) {
        for chat in self.live_chats() {
            chat.network_changed();
        }
    }
}

pub(crate) unsafe fn connection_manager<'a>(
    ptr: *const SignalConnectionManager,
) -> FfiResult<&'a ConnectionManager> {
    unsafe { ref_from(ptr.cast::<ConnectionManager>(), "connection manager") }
}

/// Create a connection manager.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_connection_manager_new(
    out: *mut *mut SignalConnectionManager,
    environment: u8,
    user_agent: *const c_char,
) -> *mut SignalFfiError {
    catch(|| {
        let user_agent = unsafe { c_str_to_string(user_agent, "user_agent")? };
        tracing::debug!(environment, %user_agent, "connection manager created");
        unsafe {
            write_out(
                out,
                ConnectionManager {
                    environment,
                    user_agent,
                    server: Arc::default(),
                },
            )
        }
    })
}

/// Destroy a connection manager. Chats created from it keep working.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_connection_manager_destroy(
    manager: *mut SignalConnectionManager,
) -> *mut SignalFfiError {
    unsafe { destroy::<ConnectionManager, _>(manager) }
}

/// Interrupt and re-establish every connected chat of this manager.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn signal_connection_manager_on_network_change(
    manager: *const SignalConnectionManager,
) -> *mut SignalFfiError {
    catch(|| {
        let manager = unsafe { connection_manager(manager)? };
        tracing::debug!("network change");
        manager.server.on_network_change();
        Ok(())
    })
}
