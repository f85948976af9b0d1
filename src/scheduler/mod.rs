pub mod cadence;
pub mod recurring;

pub use cadence::{Cadence, CadenceError};
pub use recurring::{ScheduledJob, Scheduler, SYSTEM_OWNER};
