pub mod availability;
pub mod reservations;
pub mod sweeper;

pub use availability::{Availability, AvailabilityCache, MemoryAvailabilityCache, RedisAvailabilityCache};
pub use reservations::{ReleaseOutcome, ReservationLedger};
pub use sweeper::{ExpirySweeper, SweepReport};
