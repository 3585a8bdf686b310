//! Worker threads and their lifecycle.
//!
//! A [`WorkerManager`] spawns workers, runs their initializers, and tracks
//! each one through a [`WorkerRecord`].

pub mod manager;
pub mod panic_handler;
pub mod record;
pub mod reservation;
pub mod state;

pub use manager::{SpawnOptions, WorkerContext, WorkerManager};
pub use panic_handler::{PanicHandler, PanicStrategy};
pub use record::{WorkerId, WorkerRecord};
pub use reservation::Reservation;
pub use state::WorkerState;
