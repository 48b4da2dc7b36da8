use std::any::Any;
use std::sync::Arc;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> Arc<str> {
    if let Some(s) = panic.downcast_ref::<&str>() {
        Arc::from(*s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        Arc::from(s.as_str())
    } else {
        Arc::from("unknown payload")
    }
}
