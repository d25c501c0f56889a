//! keycap capture daemon
//!
//! Grabs keyboards, matches every key press against a loaded mapping table
//! and replaces matched presses with synthesized key, mouse and delay chains.

pub mod device;
pub mod engine;
pub mod executor;
pub mod hook;
pub mod injector;
pub mod ipc;
pub mod keymap;
pub mod matcher;
pub mod modifiers;

pub use engine::{CaptureEngine, CaptureMessage, CaptureStatus, EngineOptions, EngineState};
pub use hook::{HookBackend, HookDecision, Origin, RawEvent};
pub use injector::{InjectError, Injector, OutputSink, VirtualDevice};
