//! Global input hooks
//!
//! A hook backend delivers every input event to a synchronous callback before
//! anything else sees it. The callback decides whether the event passes
//! through or is suppressed; it must not block.
//!
//! Two backends exist: [`grab::EvdevHook`] grabs physical keyboards and
//! re-emits pass-through events on the virtual device, and
//! [`loopback::Loopback`] is an in-process stand-in that feeds injected events
//! back through the hook the way an OS-level hook would.

pub mod grab;
pub mod loopback;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use evdev::InputEvent;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::injector::Injector;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A physical device
    Hardware,
    /// Our own injected output
    Synthetic,
}

/// An event as seen by the hook callback.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent {
    pub event: InputEvent,
    pub origin: Origin,
}

impl RawEvent {
    pub fn hardware(event: InputEvent) -> Self {
        Self {
            event,
            origin: Origin::Hardware,
        }
    }

    pub fn synthetic(event: InputEvent) -> Self {
        Self {
            event,
            origin: Origin::Synthetic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    PassThrough,
    Suppress,
}

pub type HookCallback = Arc<dyn Fn(&RawEvent) -> HookDecision + Send + Sync>;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("no keyboard devices to capture")]
    NoDevices,

    #[error("failed to grab {}: {source}", path.display())]
    Grab {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("hook refused: {0}")]
    Refused(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs a hook. Installing spawns the reader tasks onto the current runtime.
pub trait HookBackend: Send {
    fn install(&mut self, callback: HookCallback, injector: Injector)
        -> Result<HookSession, HookError>;
}

/// First fault recorded by a reader task.
#[derive(Debug, Clone, Default)]
pub struct FaultSlot {
    fault: Arc<Mutex<Option<String>>>,
}

impl FaultSlot {
    pub fn record(&self, message: impl Into<String>) {
        let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if fault.is_none() {
            *fault = Some(message.into());
        }
    }

    pub fn get(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// An installed hook. Dropping it aborts the readers; [`uninstall`](Self::uninstall)
/// also waits for them.
pub struct HookSession {
    readers: Vec<JoinHandle<()>>,
    fault: FaultSlot,
}

impl HookSession {
    pub fn new(readers: Vec<JoinHandle<()>>, fault: FaultSlot) -> Self {
        Self { readers, fault }
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.get()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Stop every reader and wait until they have exited.
    pub async fn uninstall(mut self) {
        let readers = std::mem::take(&mut self.readers);
        for reader in &readers {
            reader.abort();
        }
        for reader in readers {
            if let Err(e) = reader.await {
                if e.is_panic() {
                    tracing::warn!("Hook reader panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for HookSession {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
