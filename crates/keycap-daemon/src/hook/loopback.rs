//! In-process hook backend
//!
//! Stands in for an OS that runs every event, injected ones included, through
//! the installed hook before delivering it to applications. Hardware events
//! are fed in with [`Loopback::inject`]; events written to a [`LoopbackSink`]
//! re-enter the hook tagged [`Origin::Synthetic`]. Whatever the hook lets
//! through is recorded as "downstream" with its arrival time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use evdev::{EventType, InputEvent, Key};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::{
    FaultSlot, HookBackend, HookCallback, HookDecision, HookError, HookSession, Origin, RawEvent,
};
use crate::injector::{Injector, OutputSink};

/// An event that made it past the hook.
#[derive(Debug, Clone, Copy)]
pub struct Delivered {
    pub at: Instant,
    pub event: InputEvent,
    pub origin: Origin,
}

#[derive(Default)]
struct Shared {
    hook: Option<mpsc::UnboundedSender<RawEvent>>,
    fault: Option<FaultSlot>,
    downstream: Vec<Delivered>,
    refuse_install: bool,
}

/// Loopback "OS". Clones share state.
#[derive(Clone, Default)]
pub struct Loopback {
    shared: Arc<Mutex<Shared>>,
    delivered: Arc<Notify>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next installs fail, as if the OS refused the hook.
    pub fn refuse_install(&self, refuse: bool) {
        self.shared().refuse_install = refuse;
    }

    pub fn is_hooked(&self) -> bool {
        self.shared()
            .hook
            .as_ref()
            .is_some_and(|hook| !hook.is_closed())
    }

    /// Output sink whose events loop back through the hook.
    pub fn sink(&self) -> LoopbackSink {
        LoopbackSink {
            loopback: self.clone(),
        }
    }

    /// Feed a hardware event.
    pub fn inject(&self, event: InputEvent) {
        self.route(RawEvent::hardware(event));
    }

    pub fn press(&self, key: Key) {
        self.inject(InputEvent::new(EventType::KEY, key.code(), 1));
    }

    pub fn repeat(&self, key: Key) {
        self.inject(InputEvent::new(EventType::KEY, key.code(), 2));
    }

    pub fn release(&self, key: Key) {
        self.inject(InputEvent::new(EventType::KEY, key.code(), 0));
    }

    pub fn tap(&self, key: Key) {
        self.press(key);
        self.release(key);
    }

    /// Simulate the device disappearing: the reader stops and records a fault.
    pub fn unplug(&self) {
        let mut shared = self.shared();
        if let Some(fault) = shared.fault.take() {
            fault.record("loopback device unplugged");
        }
        shared.hook = None;
    }

    pub fn downstream(&self) -> Vec<Delivered> {
        self.shared().downstream.clone()
    }

    /// `(code, value)` of every key event delivered so far.
    pub fn key_events(&self) -> Vec<(u16, i32)> {
        self.downstream()
            .iter()
            .filter(|d| d.event.event_type() == EventType::KEY)
            .map(|d| (d.event.code(), d.event.value()))
            .collect()
    }

    pub fn clear_downstream(&self) {
        self.shared().downstream.clear();
    }

    /// Wait until `done` holds for the delivered events, or `timeout` passes.
    /// Returns the final value of `done`.
    pub async fn wait_for<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&[Delivered]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.delivered.notified();
            if done(&self.downstream()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done(&self.downstream());
            }
        }
    }

    fn route(&self, raw: RawEvent) {
        let undelivered = {
            let shared = self.shared();
            match &shared.hook {
                Some(hook) => hook.send(raw).err().map(|e| e.0),
                None => Some(raw),
            }
        };
        if let Some(raw) = undelivered {
            self.deliver(raw);
        }
    }

    fn deliver(&self, raw: RawEvent) {
        self.shared().downstream.push(Delivered {
            at: Instant::now(),
            event: raw.event,
            origin: raw.origin,
        });
        self.delivered.notify_waiters();
    }
}

impl HookBackend for Loopback {
    fn install(
        &mut self,
        callback: HookCallback,
        _injector: Injector,
    ) -> Result<HookSession, HookError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawEvent>();
        let fault = FaultSlot::default();
        {
            let mut shared = self.shared();
            if shared.refuse_install {
                return Err(HookError::Refused("install refused".to_string()));
            }
            if shared.hook.as_ref().is_some_and(|hook| !hook.is_closed()) {
                return Err(HookError::Refused("a hook is already installed".to_string()));
            }
            shared.hook = Some(tx);
            shared.fault = Some(fault.clone());
        }

        let loopback = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                if callback(&raw) == HookDecision::PassThrough {
                    loopback.deliver(raw);
                }
            }
        });

        Ok(HookSession::new(vec![reader], fault))
    }
}

/// Output sink of a [`Loopback`].
pub struct LoopbackSink {
    loopback: Loopback,
}

impl OutputSink for LoopbackSink {
    fn emit(&mut self, events: &[InputEvent]) -> std::io::Result<()> {
        for event in events {
            self.loopback.route(RawEvent::synthetic(*event));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_callback(suppress: Key) -> HookCallback {
        Arc::new(move |raw: &RawEvent| {
            if raw.event.code() == suppress.code() && raw.origin == Origin::Hardware {
                HookDecision::Suppress
            } else {
                HookDecision::PassThrough
            }
        })
    }

    #[tokio::test]
    async fn test_unhooked_events_go_downstream() {
        let loopback = Loopback::new();
        loopback.tap(Key::KEY_A);
        assert_eq!(
            loopback.key_events(),
            vec![(Key::KEY_A.code(), 1), (Key::KEY_A.code(), 0)]
        );
    }

    #[tokio::test]
    async fn test_hook_filters_hardware_events() {
        let mut loopback = Loopback::new();
        let injector = Injector::new(loopback.sink());
        let session = loopback
            .install(counting_callback(Key::KEY_Q), injector)
            .unwrap();
        assert!(loopback.is_hooked());

        loopback.tap(Key::KEY_Q);
        loopback.tap(Key::KEY_W);

        assert!(
            loopback
                .wait_for(Duration::from_secs(1), |d| d.len() == 2)
                .await
        );
        assert_eq!(
            loopback.key_events(),
            vec![(Key::KEY_W.code(), 1), (Key::KEY_W.code(), 0)]
        );

        session.uninstall().await;
        assert!(!loopback.is_hooked());
    }

    #[tokio::test]
    async fn test_sink_output_reenters_hook_as_synthetic() {
        let mut loopback = Loopback::new();
        let injector = Injector::new(loopback.sink());
        injector.arm().await;
        let _session = loopback
            .install(counting_callback(Key::KEY_Q), injector.clone())
            .unwrap();

        injector
            .emit(&[InputEvent::new(EventType::KEY, Key::KEY_Q.code(), 1)])
            .await
            .unwrap();

        assert!(
            loopback
                .wait_for(Duration::from_secs(1), |d| d.len() == 1)
                .await
        );
        assert_eq!(loopback.downstream()[0].origin, Origin::Synthetic);
    }

    #[tokio::test]
    async fn test_refused_and_double_install() {
        let mut loopback = Loopback::new();
        let injector = Injector::new(loopback.sink());

        loopback.refuse_install(true);
        assert!(loopback
            .install(counting_callback(Key::KEY_Q), injector.clone())
            .is_err());

        loopback.refuse_install(false);
        let _session = loopback
            .install(counting_callback(Key::KEY_Q), injector.clone())
            .unwrap();
        assert!(loopback
            .install(counting_callback(Key::KEY_Q), injector)
            .is_err());
    }

    #[tokio::test]
    async fn test_unplug_records_fault() {
        let mut loopback = Loopback::new();
        let injector = Injector::new(loopback.sink());
        let session = loopback
            .install(counting_callback(Key::KEY_Q), injector)
            .unwrap();

        loopback.unplug();
        assert!(!loopback.is_hooked());
        assert!(session.fault().unwrap().contains("unplugged"));
    }
}
