//! evdev hook: exclusive grab of physical keyboards
//!
//! Each selected keyboard is grabbed (EVIOCGRAB) so no other reader sees its
//! events. A reader task per device passes each input event to the hook callback
//! and re-emits pass-through events on the virtual device. Our own virtual
//! device is never grabbed, so injected output does not come back through
//! the hook.

use std::path::PathBuf;

use evdev::{Device, EventType};

use super::{FaultSlot, HookBackend, HookCallback, HookDecision, HookError, HookSession, RawEvent};
use crate::device::{is_keyboard, open_devices, should_capture};
use crate::injector::{InjectError, Injector};

/// Hook backend that grabs physical keyboards through evdev.
pub struct EvdevHook {
    allow_list: Vec<String>,
    own_name: String,
}

impl EvdevHook {
    /// `allow_list` selects keyboards by name (empty = all); `own_name` is the
    /// virtual device name to skip.
    pub fn new(allow_list: Vec<String>, own_name: impl Into<String>) -> Self {
        Self {
            allow_list,
            own_name: own_name.into(),
        }
    }

    fn select_keyboards(&self) -> Result<Vec<(PathBuf, Device)>, HookError> {
        let devices = open_devices().map_err(|e| HookError::Refused(e.to_string()))?;

        Ok(devices
            .into_iter()
            .filter(|(path, device)| {
                let name = device.name().unwrap_or("Unknown");
                let selected = is_keyboard(device) && should_capture(name, &self.allow_list, &self.own_name);
                if selected {
                    tracing::debug!("Selected keyboard '{}' at {}", name, path.display());
                }
                selected
            })
            .collect())
    }
}

impl HookBackend for EvdevHook {
    fn install(
        &mut self,
        callback: HookCallback,
        injector: Injector,
    ) -> Result<HookSession, HookError> {
        let keyboards = self.select_keyboards()?;
        if keyboards.is_empty() {
            return Err(HookError::NoDevices);
        }

        // Grab everything first so a failure leaves nothing grabbed
        let mut grabbed: Vec<(PathBuf, Device)> = Vec::with_capacity(keyboards.len());
        for (path, mut device) in keyboards {
            if let Err(source) = device.grab() {
                for (_, device) in grabbed.iter_mut() {
                    let _ = device.ungrab();
                }
                return Err(HookError::Grab { path, source });
            }
            grabbed.push((path, device));
        }

        let mut streams = Vec::with_capacity(grabbed.len());
        for (path, device) in grabbed {
            let name = device.name().unwrap_or("Unknown").to_string();
            let stream = device
                .into_event_stream()
                .map_err(|source| HookError::Grab { path: path.clone(), source })?;
            tracing::info!("Capturing '{}' at {}", name, path.display());
            streams.push((name, stream));
        }

        let fault = FaultSlot::default();
        let readers = streams
            .into_iter()
            .map(|(name, stream)| {
                let callback = callback.clone();
                let injector = injector.clone();
                let fault = fault.clone();
                tokio::spawn(run_reader(stream, name, callback, injector, fault))
            })
            .collect();

        Ok(HookSession::new(readers, fault))
    }
}

async fn run_reader(
    mut stream: evdev::EventStream,
    name: String,
    callback: HookCallback,
    injector: Injector,
    fault: FaultSlot,
) {
    // Pass-through events of the current frame, flushed at SYN_REPORT
    let mut frame = Vec::new();

    loop {
        let event = match stream.next_event().await {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Stopped reading '{}': {}", name, e);
                fault.record(format!("device '{}' stopped: {}", name, e));
                return;
            }
        };

        if event.event_type() == EventType::SYNCHRONIZATION {
            if frame.is_empty() {
                continue;
            }
            // The virtual device writes its own SYN_REPORT
            match injector.emit(&frame).await {
                Ok(()) => {}
                Err(InjectError::Closed) => {
                    tracing::debug!("Dropped pass-through frame from '{}' while disarmed", name);
                }
                Err(e) => {
                    tracing::warn!("Failed to forward events from '{}': {}", name, e);
                    fault.record(format!("forwarding from '{}' failed: {}", name, e));
                    return;
                }
            }
            frame.clear();
            continue;
        }

        if callback(&RawEvent::hardware(event)) == HookDecision::PassThrough {
            frame.push(event);
        }
    }
}
