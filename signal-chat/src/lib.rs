#![doc = include_str!("../README.md")]
#![allow(unsafe_code)]

pub mod chat;
pub mod error;
pub mod net;
pub mod service_id;
pub mod types;

mod async_context;
mod callback;
mod ffi;

// Re-export core public API at crate root.
pub use chat::{
    AuthenticatedChatService, ChatConnection, ChatServiceListener, ConnectionEventsListener,
    ListenerResult, ServerMessageAck, UnauthenticatedChatService,
};
pub use error::{BoxError, Error, Result};
pub use ffi::{HandleLease, NativeBytes, NativeHandle, NativeHandleOwner};
pub use net::{Net, NetBuilder, init_logger};
pub use service_id::ServiceId;
pub use types::{ChatRequest, ChatResponse, DebugInfo, Environment, IpType};

/// Raw C ABI.
pub use signal_chat_sys as sys;
