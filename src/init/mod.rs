//! Worker initialization.
//!
//! Initializers are zero-argument callables that run, in priority order,
//! inside a freshly spawned worker before its body starts.

pub mod function;
pub mod policy;
pub mod registry;

pub use function::{downcast, FunctionInstance, InitValue};
pub use policy::{DuplicatePolicy, Resolution};
pub use registry::{InitScope, InitializerEntry, InitializerRegistry, DEFAULT_PRIORITY};
