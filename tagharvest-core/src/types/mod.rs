//! Value types shared by the scheduler, the session adapters, and the
//! output writers.

pub mod ids;
pub mod notification;
pub mod value;

pub use ids::*;
pub use notification::*;
pub use value::*;
