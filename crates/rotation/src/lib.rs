//! Account rotation for the session pool
//!
//! Owns the process-wide rotation state: the active account index, the
//! usage and failure counters, and the exclusive busy lock that
//! guarantees at most one concurrent account switch.

mod switcher;

pub use switcher::{BusyGuard, SwitchOutcome, Switcher, SwitcherConfig};
