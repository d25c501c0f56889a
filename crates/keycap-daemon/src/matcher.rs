//! Live event matching
//!
//! [`Matcher::on_event`] runs inside the hook callback for every raw event.
//! It only reads the shared table, updates a few atomics and sends matched
//! chains to the dispatcher over an unbounded channel, so it never blocks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use evdev::{EventType, Key};
use keycap_config::{IOPairDefinition, MappingTable, Signature};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::executor::ToggleState;
use crate::hook::{HookCallback, HookDecision, Origin, RawEvent};
use crate::keymap;
use crate::modifiers::{HeldModifiers, ModifierState};

/// Counters for status reporting.
#[derive(Debug, Default)]
pub struct CaptureStats {
    events_seen: AtomicU64,
    suppressed: AtomicU64,
    chains_fired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_seen: u64,
    pub suppressed: u64,
    pub chains_fired: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            chains_fired: self.chains_fired.load(Ordering::Relaxed),
        }
    }
}

/// A matched record waiting to run.
#[derive(Debug, Clone)]
pub struct ChainJob {
    pub pair: IOPairDefinition,
    /// Modifier keys physically held when the trigger was pressed
    pub held: HeldModifiers,
}

pub struct Matcher {
    table: Arc<MappingTable>,
    modifiers: ModifierState,
    /// Toggled outputs; their held modifiers count towards the signature
    toggles: ToggleState,
    /// Keys whose press was consumed; their repeats and release are consumed too
    swallowed: Mutex<HashSet<u16>>,
    jobs: mpsc::UnboundedSender<ChainJob>,
    stats: Arc<CaptureStats>,
}

impl Matcher {
    pub fn new(
        table: Arc<MappingTable>,
        modifiers: ModifierState,
        toggles: ToggleState,
        jobs: mpsc::UnboundedSender<ChainJob>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            table,
            modifiers,
            toggles,
            swallowed: Mutex::new(HashSet::new()),
            jobs,
            stats,
        }
    }

    /// Wrap the matcher as a hook callback.
    pub fn into_callback(self) -> HookCallback {
        let matcher = Arc::new(self);
        Arc::new(move |raw: &RawEvent| matcher.on_event(raw))
    }

    pub fn on_event(&self, raw: &RawEvent) -> HookDecision {
        // Our own output is never matched
        if raw.origin == Origin::Synthetic {
            return HookDecision::PassThrough;
        }

        self.stats.events_seen.fetch_add(1, Ordering::Relaxed);

        let event = &raw.event;
        if event.event_type() != EventType::KEY {
            return HookDecision::PassThrough;
        }

        let code = event.code();
        let value = event.value();

        if self.is_swallowed(code, value) {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            return HookDecision::Suppress;
        }

        let key = Key::new(code);
        if value == 1 {
            if let Some(pair) = self.lookup(key) {
                let job = ChainJob {
                    pair: pair.clone(),
                    held: self.modifiers.snapshot(),
                };
                tracing::debug!("Matched {} -> {}", pair.describe_input(), pair.describe_outputs());

                self.swallowed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(code);
                self.stats.suppressed.fetch_add(1, Ordering::Relaxed);

                if self.jobs.send(job).is_err() {
                    tracing::warn!("Chain dispatcher is gone, dropping {}", pair.describe_input());
                } else {
                    self.stats.chains_fired.fetch_add(1, Ordering::Relaxed);
                }
                return HookDecision::Suppress;
            }
        }

        self.modifiers.update(key, value);
        HookDecision::PassThrough
    }

    /// Check the swallowed set; a release clears the mark.
    fn is_swallowed(&self, code: u16, value: i32) -> bool {
        let mut swallowed = self
            .swallowed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match value {
            0 => swallowed.remove(&code),
            _ => swallowed.contains(&code),
        }
    }

    /// Physical plus toggled modifiers first, then physical alone. For each,
    /// the sided code first, then the generic modifier code.
    fn lookup(&self, key: Key) -> Option<&IOPairDefinition> {
        let vk = keymap::from_key(key)?;
        let physical = self.modifiers.flags();
        let sticky = physical | self.toggles.held_flags();

        self.lookup_with(sticky, vk).or_else(|| {
            if sticky == physical {
                return None;
            }
            self.lookup_with(physical, vk)
        })
    }

    fn lookup_with(&self, modifiers: u8, vk: u8) -> Option<&IOPairDefinition> {
        self.table
            .lookup(&Signature::new(modifiers, vk))
            .or_else(|| {
                let generic = keymap::generic_modifier(vk)?;
                self.table.lookup(&Signature::new(modifiers, generic))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ToggleKey;
    use evdev::InputEvent;
    use keycap_config::{IODefinition, IOFlag, MouseButton};

    fn key(key: Key, value: i32) -> RawEvent {
        RawEvent::hardware(InputEvent::new(EventType::KEY, key.code(), value))
    }

    fn setup(pairs: Vec<IOPairDefinition>) -> (Matcher, mpsc::UnboundedReceiver<ChainJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let matcher = Matcher::new(
            Arc::new(MappingTable::from_pairs(pairs)),
            ModifierState::new(),
            ToggleState::new(),
            tx,
            Arc::new(CaptureStats::default()),
        );
        (matcher, rx)
    }

    fn a_to_click() -> IOPairDefinition {
        IOPairDefinition::new(IODefinition::key(0x41), IODefinition::mouse(MouseButton::Left))
    }

    #[test]
    fn test_unmapped_passes_through() {
        let (matcher, mut rx) = setup(vec![a_to_click()]);
        assert_eq!(matcher.on_event(&key(Key::KEY_B, 1)), HookDecision::PassThrough);
        assert_eq!(matcher.on_event(&key(Key::KEY_B, 0)), HookDecision::PassThrough);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_match_swallows_press_repeat_release() {
        let (matcher, mut rx) = setup(vec![a_to_click()]);

        assert_eq!(matcher.on_event(&key(Key::KEY_A, 1)), HookDecision::Suppress);
        assert_eq!(matcher.on_event(&key(Key::KEY_A, 2)), HookDecision::Suppress);
        assert_eq!(matcher.on_event(&key(Key::KEY_A, 0)), HookDecision::Suppress);

        // Repeats do not fire the chain again
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Mark cleared on release
        assert!(matcher.swallowed.lock().unwrap().is_empty());
        assert_eq!(matcher.stats.snapshot().chains_fired, 1);
        assert_eq!(matcher.stats.snapshot().suppressed, 3);
    }

    #[test]
    fn test_synthetic_events_are_not_matched() {
        let (matcher, mut rx) = setup(vec![a_to_click()]);
        let synthetic = RawEvent::synthetic(InputEvent::new(EventType::KEY, Key::KEY_A.code(), 1));

        assert_eq!(matcher.on_event(&synthetic), HookDecision::PassThrough);
        assert!(rx.try_recv().is_err());
        assert_eq!(matcher.stats.snapshot().events_seen, 0);
    }

    #[test]
    fn test_modifiers_form_signature() {
        let ctrl_a = IOPairDefinition::new(
            IODefinition::key(0x41).with_modifiers(IOFlag::Control.bit()),
            IODefinition::key(0x42),
        );
        let (matcher, mut rx) = setup(vec![ctrl_a]);

        // Plain A does not match Ctrl+A
        assert_eq!(matcher.on_event(&key(Key::KEY_A, 1)), HookDecision::PassThrough);
        matcher.on_event(&key(Key::KEY_A, 0));

        assert_eq!(
            matcher.on_event(&key(Key::KEY_RIGHTCTRL, 1)),
            HookDecision::PassThrough
        );
        assert_eq!(matcher.on_event(&key(Key::KEY_A, 1)), HookDecision::Suppress);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.held.flags(), IOFlag::Control.bit());
    }

    #[test]
    fn test_generic_modifier_record_matches_sided_key() {
        let shift_to_b = IOPairDefinition::new(IODefinition::key(0x10), IODefinition::key(0x42));
        let (matcher, mut rx) = setup(vec![shift_to_b]);

        assert_eq!(
            matcher.on_event(&key(Key::KEY_RIGHTSHIFT, 1)),
            HookDecision::Suppress
        );
        assert!(rx.try_recv().is_ok());

        // A swallowed modifier never enters the held state
        assert_eq!(matcher.modifiers.flags(), 0);
    }

    #[test]
    fn test_toggled_modifier_joins_signature() {
        let shift_b = IOPairDefinition::new(
            IODefinition::key(0x42).with_modifiers(IOFlag::Shift.bit()),
            IODefinition::key(0x58),
        );
        let caps = IOPairDefinition::new(
            IODefinition::key(0x14),
            IODefinition::key(0x10).toggled(),
        );
        let (matcher, mut rx) = setup(vec![shift_b, caps]);

        // Plain B while nothing is toggled
        assert_eq!(matcher.on_event(&key(Key::KEY_B, 1)), HookDecision::PassThrough);
        matcher.on_event(&key(Key::KEY_B, 0));

        matcher.toggles.flip(ToggleKey::Key(0x10), 0);
        assert_eq!(matcher.on_event(&key(Key::KEY_B, 1)), HookDecision::Suppress);
        let job = rx.try_recv().unwrap();
        assert_eq!(job.pair.outputs(), &[IODefinition::key(0x58)]);
        // Only physical keys are released around the chain
        assert!(job.held.is_empty());
        matcher.on_event(&key(Key::KEY_B, 0));

        // The toggle's own trigger still matches without the sticky Shift
        assert_eq!(
            matcher.on_event(&key(Key::KEY_CAPSLOCK, 1)),
            HookDecision::Suppress
        );
        let job = rx.try_recv().unwrap();
        assert_eq!(job.pair.input(), &IODefinition::key(0x14));
    }

    #[test]
    fn test_toggled_output_modifiers_join_signature() {
        let ctrl_b = IOPairDefinition::new(
            IODefinition::key(0x42).with_modifiers(IOFlag::Control.bit()),
            IODefinition::key(0x58),
        );
        let (matcher, mut rx) = setup(vec![ctrl_b]);

        // Ctrl held down alongside a toggled right click
        matcher
            .toggles
            .flip(ToggleKey::Mouse(MouseButton::Right), IOFlag::Control.bit());
        assert_eq!(matcher.on_event(&key(Key::KEY_B, 1)), HookDecision::Suppress);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_non_key_events_pass() {
        let (matcher, _rx) = setup(vec![a_to_click()]);
        let syn = RawEvent::hardware(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        assert_eq!(matcher.on_event(&syn), HookDecision::PassThrough);
    }

    #[test]
    fn test_closed_dispatcher_still_suppresses() {
        let (matcher, rx) = setup(vec![a_to_click()]);
        drop(rx);
        assert_eq!(matcher.on_event(&key(Key::KEY_A, 1)), HookDecision::Suppress);
        assert_eq!(matcher.stats.snapshot().chains_fired, 0);
    }
}
