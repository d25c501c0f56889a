//! Output injection through a virtual device
//!
//! Every synthesized event and every forwarded pass-through event goes through
//! one [`Injector`]. The injector wraps the output sink in a gate: while the
//! gate is disarmed nothing is emitted, and disarming takes the same lock as
//! emitting, so once [`Injector::disarm`] returns no further event can reach
//! the sink.
//!
//! The gate also tracks which keys are down on the sink. Disarming releases
//! them first, so neither forwarded nor synthesized keys stay stuck down on
//! the virtual device once capture stops.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use evdev::{
    uinput::VirtualDeviceBuilder, AttributeSet, EventType, InputEvent, Key, RelativeAxisType,
};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Destination for injected events.
///
/// Each `emit` call is one input frame; implementations terminate it with a
/// sync report.
pub trait OutputSink: Send {
    fn emit(&mut self, events: &[InputEvent]) -> std::io::Result<()>;
}

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("failed to write to the virtual device: {0}")]
    Device(#[from] std::io::Error),

    #[error("injector is disarmed")]
    Closed,
}

/// A uinput virtual device for injecting keyboard and mouse button events
pub struct VirtualDevice {
    device: evdev::uinput::VirtualDevice,
}

impl VirtualDevice {
    /// Create the virtual device.
    ///
    /// It advertises every standard key, the five mouse buttons and relative
    /// pointer axes, so button clicks are accepted as mouse input.
    ///
    /// # Errors
    ///
    /// Returns an error if the virtual device cannot be created (e.g., insufficient
    /// permissions to access /dev/uinput).
    pub fn new(name: &str) -> Result<Self> {
        let mut keys = AttributeSet::<Key>::new();

        for code in 0..256u16 {
            keys.insert(Key::new(code));
        }
        for button in [
            Key::BTN_LEFT,
            Key::BTN_RIGHT,
            Key::BTN_MIDDLE,
            Key::BTN_SIDE,
            Key::BTN_EXTRA,
        ] {
            keys.insert(button);
        }

        let mut axes = AttributeSet::<RelativeAxisType>::new();
        axes.insert(RelativeAxisType::REL_X);
        axes.insert(RelativeAxisType::REL_Y);

        let device = VirtualDeviceBuilder::new()?
            .name(name)
            .with_keys(&keys)?
            .with_relative_axes(&axes)?
            .build()?;

        tracing::info!("Created virtual device '{}'", name);

        Ok(Self { device })
    }
}

impl OutputSink for VirtualDevice {
    fn emit(&mut self, events: &[InputEvent]) -> std::io::Result<()> {
        // uinput appends the SYN_REPORT
        self.device.emit(events)
    }
}

struct Gate {
    sink: Box<dyn OutputSink>,
    armed: bool,
    /// Key and button codes currently pressed on the sink
    down: BTreeSet<u16>,
}

impl Gate {
    fn track(&mut self, events: &[InputEvent]) {
        for event in events.iter().filter(|e| e.event_type() == EventType::KEY) {
            match event.value() {
                0 => {
                    self.down.remove(&event.code());
                }
                1 => {
                    self.down.insert(event.code());
                }
                _ => {}
            }
        }
    }

    /// Release every tracked key, one frame each. Returns how many were released.
    fn release_down(&mut self) -> usize {
        let down = std::mem::take(&mut self.down);
        if !self.armed {
            return 0;
        }

        let mut released = 0;
        for code in down {
            let release = InputEvent::new(EventType::KEY, code, 0);
            if let Err(e) = self.sink.emit(&[release]) {
                tracing::warn!("Failed to release key {}: {}", code, e);
                break;
            }
            released += 1;
        }
        released
    }
}

/// Shared, gated handle to the output sink. Cheap to clone.
#[derive(Clone)]
pub struct Injector {
    gate: Arc<Mutex<Gate>>,
}

impl Injector {
    /// Wrap a sink. The injector starts disarmed.
    pub fn new(sink: impl OutputSink + 'static) -> Self {
        Self {
            gate: Arc::new(Mutex::new(Gate {
                sink: Box::new(sink),
                armed: false,
                down: BTreeSet::new(),
            })),
        }
    }

    pub async fn arm(&self) {
        self.gate.lock().await.armed = true;
    }

    /// Release keys still down on the sink, then close the gate. Emissions
    /// started before this call have completed when it returns.
    ///
    /// Returns how many keys were released.
    pub async fn disarm(&self) -> usize {
        let mut gate = self.gate.lock().await;
        let released = gate.release_down();
        gate.armed = false;
        released
    }

    pub async fn is_armed(&self) -> bool {
        self.gate.lock().await.armed
    }

    /// Hold the sink for several frames that must not interleave with others.
    pub async fn lock(&self) -> InjectorGuard<'_> {
        InjectorGuard {
            gate: self.gate.lock().await,
        }
    }

    /// Emit a single frame.
    pub async fn emit(&self, events: &[InputEvent]) -> Result<(), InjectError> {
        self.lock().await.emit(events)
    }
}

/// Exclusive access to the sink, obtained from [`Injector::lock`].
pub struct InjectorGuard<'a> {
    gate: MutexGuard<'a, Gate>,
}

impl InjectorGuard<'_> {
    pub fn is_armed(&self) -> bool {
        self.gate.armed
    }

    pub fn emit(&mut self, events: &[InputEvent]) -> Result<(), InjectError> {
        if !self.gate.armed {
            return Err(InjectError::Closed);
        }
        if events.is_empty() {
            return Ok(());
        }
        self.gate.sink.emit(events)?;
        self.gate.track(events);
        Ok(())
    }
}

/// Key event with the given value (0 release, 1 press).
pub fn key_event(key: Key, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY, key.code(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<StdMutex<Vec<Vec<(u16, i32)>>>>,
    }

    impl OutputSink for RecordingSink {
        fn emit(&mut self, events: &[InputEvent]) -> std::io::Result<()> {
            self.frames
                .lock()
                .unwrap()
                .push(events.iter().map(|e| (e.code(), e.value())).collect());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_starts_disarmed() {
        let sink = RecordingSink::default();
        let injector = Injector::new(sink.clone());

        assert!(!injector.is_armed().await);
        let result = injector.emit(&[key_event(Key::KEY_A, 1)]).await;
        assert!(matches!(result, Err(InjectError::Closed)));
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emit_when_armed() {
        let sink = RecordingSink::default();
        let injector = Injector::new(sink.clone());
        injector.arm().await;

        injector
            .emit(&[key_event(Key::KEY_A, 1), key_event(Key::KEY_A, 0)])
            .await
            .unwrap();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![(Key::KEY_A.code(), 1), (Key::KEY_A.code(), 0)]);
    }

    #[tokio::test]
    async fn test_disarm_blocks_later_emits() {
        let sink = RecordingSink::default();
        let injector = Injector::new(sink.clone());
        injector.arm().await;
        injector.emit(&[key_event(Key::KEY_B, 1)]).await.unwrap();

        injector.disarm().await;
        assert!(injector.emit(&[key_event(Key::KEY_B, 0)]).await.is_err());
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_holds_frames_together() {
        let sink = RecordingSink::default();
        let injector = Injector::new(sink.clone());
        injector.arm().await;

        {
            let mut guard = injector.lock().await;
            guard.emit(&[key_event(Key::KEY_C, 1)]).unwrap();
            guard.emit(&[key_event(Key::KEY_C, 0)]).unwrap();
            // Empty frames are skipped
            guard.emit(&[]).unwrap();
        }

        assert_eq!(sink.frames.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disarm_releases_keys_left_down() {
        let sink = RecordingSink::default();
        let injector = Injector::new(sink.clone());
        injector.arm().await;

        // A forwarded Ctrl press whose release never arrives
        injector.emit(&[key_event(Key::KEY_LEFTCTRL, 1)]).await.unwrap();
        injector
            .emit(&[key_event(Key::KEY_B, 1), key_event(Key::KEY_B, 0)])
            .await
            .unwrap();
        injector.emit(&[key_event(Key::BTN_LEFT, 1)]).await.unwrap();
        injector.emit(&[key_event(Key::KEY_LEFTCTRL, 2)]).await.unwrap();

        assert_eq!(injector.disarm().await, 2);

        let frames = sink.frames.lock().unwrap();
        assert_eq!(
            frames[frames.len() - 2..],
            [
                vec![(Key::KEY_LEFTCTRL.code(), 0)],
                vec![(Key::BTN_LEFT.code(), 0)],
            ]
        );
    }

    #[tokio::test]
    async fn test_disarm_with_nothing_down() {
        let sink = RecordingSink::default();
        let injector = Injector::new(sink.clone());
        injector.arm().await;
        injector.emit(&[key_event(Key::KEY_A, 1)]).await.unwrap();
        injector.emit(&[key_event(Key::KEY_A, 0)]).await.unwrap();

        assert_eq!(injector.disarm().await, 0);
        assert_eq!(injector.disarm().await, 0);
        assert_eq!(sink.frames.lock().unwrap().len(), 2);
    }
}
