//! Top-level facade over the Ember emulator workspace.
//!
//! Most users want [`ember_machine::Machine`]; the individual component
//! crates are re-exported here so downstream tools can depend on a single
//! package.

pub use ember_machine as machine;
pub use ember_storage as storage;
