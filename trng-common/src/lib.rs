//! Shared core for the entropyd daemons.
//!
//! Everything that more than one process needs lives here: the bounded
//! drop-oldest block queue, the Fortuna generator, the online quality
//! monitors, the circuit breaker used by the seeding jobs, and the
//! environment-variable config helpers.

pub mod breaker;
pub mod envcfg;
pub mod fortuna;
pub mod quality;
pub mod queue;

pub use breaker::CircuitBreaker;
pub use fortuna::{Fortuna, FortunaError};
pub use quality::{QualityMonitor, QualityReport};
pub use queue::{BoundedQueue, QueueStats, RandomBlock};
