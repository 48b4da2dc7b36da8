//! Ordering and barrier primitives the task graph is built on.
//!
//! * [`StateQueue`] orders a changing series of futures so consumers observe
//!   them in submission order, regardless of completion order.
//! * [`ActivityBag`] tracks pending work and tells when all of it has
//!   settled, including work that arrives while waiting.

mod activity_bag;
mod state_queue;

pub use crate::engine::activity_bag::ActivityBag;
pub use crate::engine::state_queue::{Ordered, StateQueue};
