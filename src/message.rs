//! Message type tags used for routing
//!
//! Every decoded value carries a stable type tag. Routing looks the tag up in
//! a table built once at startup and downcasts to the concrete type, so no
//! reflection is involved.

use bytes::Bytes;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A message type that can be routed to a handler
///
/// ```
/// use krimson::Message;
///
/// #[derive(Debug)]
/// struct OrderPlaced {
///     id: u64,
/// }
///
/// impl Message for OrderPlaced {
///     const MESSAGE_TYPE: &'static str = "shop.OrderPlaced";
/// }
/// ```
pub trait Message: Any + Send + Sync + Debug {
    /// Stable, fully-qualified type tag
    const MESSAGE_TYPE: &'static str;
}

/// Object-safe view of a [`Message`]
pub trait DynMessage: Any + Send + Sync + Debug {
    /// Type tag of the concrete message
    fn message_type(&self) -> &str;

    /// Borrow as `Any` for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Convert into `Arc<dyn Any>` for owned downcasting
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Message> DynMessage for T {
    fn message_type(&self) -> &str {
        T::MESSAGE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Value whose type tag is not known to the codec
///
/// Such records are never routable and take the skip path.
#[derive(Debug, Clone)]
pub struct UnknownMessage {
    /// Type tag found on the record, if any
    pub message_type: Option<String>,
    /// Raw payload
    pub payload: Option<Bytes>,
}

impl DynMessage for UnknownMessage {
    fn message_type(&self) -> &str {
        self.message_type.as_deref().unwrap_or("")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Downcast a shared message to its concrete type
pub fn downcast_arc<T: Message>(value: Arc<dyn DynMessage>) -> Option<Arc<T>> {
    value.into_any_arc().downcast::<T>().ok()
}
