#![allow(unsafe_code)]
//! Entry point: native runtime, connection manager, and chat factories.

use std::ptr;
use std::sync::Arc;

use signal_chat_sys::{SignalAuthChat, SignalConnectionManager, SignalFfiApi, SignalUnauthChat};

use crate::async_context::TokioAsyncContext;
use crate::chat::{AuthenticatedChatService, ChatConnection, UnauthenticatedChatService};
use crate::error::{self, Result};
use crate::ffi::{NativeHandleOwner, invoke_fn_returning_native_handle, to_c_string};
use crate::types::Environment;

/// Initialize the native library's tracing logger.
///
/// `level` is an env-filter directive such as `"debug"`; `None` selects the
/// native default. Only the first call installs a logger.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`](crate::Error::InvalidArgument) if
/// `level` contains a NUL byte or the native layer rejects it.
pub fn init_logger(api: &'static SignalFfiApi, level: Option<&str>) -> Result<()> {
    let c = level.map(to_c_string).transpose()?;
    let rc = unsafe { (api.init_logger)(c.as_ref().map_or(ptr::null(), |s| s.as_ptr())) };
    error::check(api, rc)
}

/// One native runtime plus one connection manager.
///
/// Chat connections are created here and keep both alive.
#[derive(Debug)]
pub struct Net {
    pub(crate) async_context: Arc<TokioAsyncContext>,
    pub(crate) connection_manager: NativeHandleOwner<SignalConnectionManager>,
}

impl Net {
    /// Create a new [`NetBuilder`].
    #[must_use]
    pub fn builder() -> NetBuilder {
        NetBuilder::default()
    }

    pub(crate) fn api(&self) -> &'static SignalFfiApi {
        self.connection_manager.api()
    }

    /// Create an authenticated connection. Not connected yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`](crate::Error::InvalidArgument) if a
    /// credential contains a NUL byte.
    pub fn create_authenticated_chat_service(
        &self,
        username: &str,
        password: &str,
        receive_stories: bool,
    ) -> Result<AuthenticatedChatService> {
        let api = self.api();
        let username = to_c_string(username)?;
        let password = to_c_string(password)?;
        let handle = self.connection_manager.with_native_handle(|manager| {
            invoke_fn_returning_native_handle::<SignalAuthChat>(api, |out| unsafe {
                (api.chat_service_new_auth)(
                    out,
                    manager,
                    username.as_ptr(),
                    password.as_ptr(),
                    receive_stories,
                )
            })
        })?;
        tracing::debug!(receive_stories, "authenticated chat service created");
        Ok(ChatConnection::from_parts(handle, self))
    }

    /// Create an unauthenticated connection. Not connected yet.
    ///
    /// # Errors
    ///
    /// Returns the native error if the handle cannot be created.
    pub fn create_unauthenticated_chat_service(&self) -> Result<UnauthenticatedChatService> {
        let api = self.api();
        let handle = self.connection_manager.with_native_handle(|manager| {
            invoke_fn_returning_native_handle::<SignalUnauthChat>(api, |out| unsafe {
                (api.chat_service_new_unauth)(out, manager)
            })
        })?;
        tracing::debug!("unauthenticated chat service created");
        Ok(ChatConnection::from_parts(handle, self))
    }

    /// Tell the native layer the network changed.
    ///
    /// Open connections are interrupted and re-established by native code;
    /// listeners see `connection_interrupted` with an error.
    ///
    /// # Errors
    ///
    /// Returns the native error.
    pub fn on_network_change(&self) -> Result<()> {
        let api = self.api();
        let rc = self.connection_manager.with_native_handle(|manager| unsafe {
            (api.connection_manager_on_network_change)(manager)
        });
        error::check(api, rc)
    }
}

/// Builder for constructing a [`Net`].
#[derive(Debug, Clone, Default)]
pub struct NetBuilder {
    environment: Environment,
    user_agent: Option<String>,
}

impl NetBuilder {
    /// Set the server environment (default: [`Environment::Staging`]).
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the user agent reported to the server.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Create the native runtime and connection manager.
    ///
    /// # Errors
    ///
    /// Fails if the user agent contains a NUL byte or either native object
    /// cannot be created.
    pub fn build(self, api: &'static SignalFfiApi) -> Result<Net> {
        let user_agent = self.user_agent.unwrap_or_else(|| {
            format!("signal-chat-rust/{}", env!("CARGO_PKG_VERSION"))
        });
        let c_user_agent = to_c_string(&user_agent)?;
        let async_context = Arc::new(TokioAsyncContext::new(api)?);
        let environment = self.environment.to_ffi();
        let connection_manager = invoke_fn_returning_native_handle(api, |out| unsafe {
            (api.connection_manager_new)(out, environment, c_user_agent.as_ptr())
        })?;
        tracing::debug!(environment = ?self.environment, %user_agent, "net created");
        Ok(Net {
            async_context,
            connection_manager,
        })
    }
}
