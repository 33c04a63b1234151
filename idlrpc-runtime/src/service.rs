//! Service capability set implemented by generated stubs.

use crate::error::ServiceError;
use crate::transport::Transport;
use bytes::Bytes;
use futures::future::BoxFuture;
use idlrpc_protocol::GlobalIndex;
use std::any::Any;
use std::sync::{Arc, Weak};

/// A service implementation registered with the runtime.
///
/// Method bodies receive opaque argument bytes and return opaque result
/// bytes; (de)serialization belongs to the generated code.
pub trait Service: Send + Sync + 'static {
    fn uuid(&self) -> u64;

    fn name(&self) -> &str;

    /// Human-readable method name, used in logs.
    fn signature(&self, method_id: u32) -> &str;

    /// Number of workers serving this service. 0 selects the configured default.
    fn concurrency(&self) -> usize {
        1
    }

    fn is_one_way(&self, _method_id: u32) -> bool {
        false
    }

    fn call(
        &self,
        ctx: CallContext,
        method_id: u32,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<Bytes, ServiceError>>;

    /// Runs once at registration. Returning false aborts the registration.
    fn on_after_fork(&self, _ctx: &ServiceContext) -> bool {
        true
    }

    /// Runs once after the workers have stopped.
    fn on_before_destroy(&self) -> bool {
        true
    }

    /// Runs on every [`Runtime::tick`](crate::Runtime::tick).
    fn on_tick(&self) -> bool {
        true
    }
}

/// Context handed to [`Service::on_after_fork`].
#[derive(Clone, Default)]
pub struct ServiceContext {
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl ServiceContext {
    pub fn new(user_data: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self { user_data }
    }

    /// Returns the user data attached to the runtime, if it has type `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref::<T>()
    }
}

/// Describes the inbound call a method body is serving.
#[derive(Clone)]
pub struct CallContext {
    /// Process-wide sequence number of the inbound call.
    pub sequence: u64,
    pub service_uuid: u64,
    pub call_id: u32,
    pub method_id: u32,
    /// Zero for a direct call.
    pub global_index: GlobalIndex,
    pub one_way: bool,
    pub(crate) transport: Weak<dyn Transport>,
}

impl CallContext {
    /// Transport the call arrived on, if it is still alive.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.upgrade()
    }

    pub fn is_relayed(&self) -> bool {
        self.global_index != 0
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("sequence", &self.sequence)
            .field("service_uuid", &self.service_uuid)
            .field("call_id", &self.call_id)
            .field("method_id", &self.method_id)
            .field("global_index", &self.global_index)
            .field("one_way", &self.one_way)
            .finish()
    }
}

/// Panic payload carrying diagnostics for the service-error reply.
///
/// A method body may `std::panic::panic_any(ServicePanic::new(..))` to send
/// specific bytes back to the caller.
#[derive(Debug, Clone)]
pub struct ServicePanic {
    pub payload: Bytes,
}

impl ServicePanic {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Extracts reply diagnostics from a caught panic.
pub(crate) fn panic_diagnostics(panic: &(dyn Any + Send)) -> Bytes {
    if let Some(p) = panic.downcast_ref::<ServicePanic>() {
        p.payload.clone()
    } else if let Some(&msg) = panic.downcast_ref::<&'static str>() {
        Bytes::from_static(msg.as_bytes())
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        Bytes::from(msg.clone())
    } else {
        Bytes::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn test_user_data_downcast() {
        let ctx = ServiceContext::new(Some(Arc::new(42u32)));
        assert_eq!(ctx.user_data::<u32>(), Some(&42));
        assert!(ctx.user_data::<String>().is_none());

        let empty = ServiceContext::default();
        assert!(empty.user_data::<u32>().is_none());
    }

    #[test]
    fn test_panic_diagnostics() {
        let caught = panic::catch_unwind(|| panic::panic_any(ServicePanic::new("bad state")))
            .unwrap_err();
        assert_eq!(&panic_diagnostics(caught.as_ref())[..], b"bad state");

        let caught = panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(&panic_diagnostics(caught.as_ref())[..], b"plain");

        let caught = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(&panic_diagnostics(caught.as_ref())[..], b"formatted 7");

        let caught = panic::catch_unwind(|| panic::panic_any(5u8)).unwrap_err();
        assert!(panic_diagnostics(caught.as_ref()).is_empty());
    }
}
