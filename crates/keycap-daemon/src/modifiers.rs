//! Physically held modifier tracking
//!
//! Left and right variants are tracked separately so the exact keys can be
//! released and restored around an output chain, but they normalize to the
//! same Alt/Control/Shift flag when building a match signature.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use evdev::Key;
use keycap_config::IOFlag;

use crate::keymap;

/// A modifier key with its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifierKey {
    LeftCtrl,
    RightCtrl,
    LeftAlt,
    RightAlt,
    LeftShift,
    RightShift,
}

impl ModifierKey {
    /// Ctrl, Alt, Shift; the order synthesized modifiers are pressed in.
    pub const ALL: [ModifierKey; 6] = [
        ModifierKey::LeftCtrl,
        ModifierKey::RightCtrl,
        ModifierKey::LeftAlt,
        ModifierKey::RightAlt,
        ModifierKey::LeftShift,
        ModifierKey::RightShift,
    ];

    pub fn from_key(key: Key) -> Option<Self> {
        match key {
            Key::KEY_LEFTCTRL => Some(ModifierKey::LeftCtrl),
            Key::KEY_RIGHTCTRL => Some(ModifierKey::RightCtrl),
            Key::KEY_LEFTALT => Some(ModifierKey::LeftAlt),
            Key::KEY_RIGHTALT => Some(ModifierKey::RightAlt),
            Key::KEY_LEFTSHIFT => Some(ModifierKey::LeftShift),
            Key::KEY_RIGHTSHIFT => Some(ModifierKey::RightShift),
            _ => None,
        }
    }

    pub fn to_key(self) -> Key {
        match self {
            ModifierKey::LeftCtrl => Key::KEY_LEFTCTRL,
            ModifierKey::RightCtrl => Key::KEY_RIGHTCTRL,
            ModifierKey::LeftAlt => Key::KEY_LEFTALT,
            ModifierKey::RightAlt => Key::KEY_RIGHTALT,
            ModifierKey::LeftShift => Key::KEY_LEFTSHIFT,
            ModifierKey::RightShift => Key::KEY_RIGHTSHIFT,
        }
    }

    fn bit(self) -> u8 {
        match self {
            ModifierKey::LeftCtrl => 0x01,
            ModifierKey::RightCtrl => 0x02,
            ModifierKey::LeftAlt => 0x04,
            ModifierKey::RightAlt => 0x08,
            ModifierKey::LeftShift => 0x10,
            ModifierKey::RightShift => 0x20,
        }
    }

    /// The record flag this key satisfies.
    pub fn flag(self) -> IOFlag {
        match self {
            ModifierKey::LeftCtrl | ModifierKey::RightCtrl => IOFlag::Control,
            ModifierKey::LeftAlt | ModifierKey::RightAlt => IOFlag::Alt,
            ModifierKey::LeftShift | ModifierKey::RightShift => IOFlag::Shift,
        }
    }
}

/// Snapshot of held modifier keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldModifiers(u8);

impl HeldModifiers {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, key: ModifierKey) -> bool {
        self.0 & key.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Alt/Control/Shift record flags for the held keys.
    pub fn flags(&self) -> u8 {
        self.keys()
            .into_iter()
            .fold(0, |acc, key| acc | key.flag().bit())
    }

    /// Held keys in Ctrl, Alt, Shift order.
    pub fn keys(&self) -> Vec<ModifierKey> {
        ModifierKey::ALL
            .into_iter()
            .filter(|key| self.contains(*key))
            .collect()
    }

    pub fn intersect(&self, other: HeldModifiers) -> HeldModifiers {
        HeldModifiers(self.0 & other.0)
    }

    fn with(self, key: ModifierKey) -> Self {
        Self(self.0 | key.bit())
    }
}

impl FromIterator<ModifierKey> for HeldModifiers {
    fn from_iter<I: IntoIterator<Item = ModifierKey>>(iter: I) -> Self {
        iter.into_iter().fold(HeldModifiers::empty(), HeldModifiers::with)
    }
}

/// Live modifier state shared between the hook callback and chain tasks.
#[derive(Debug, Clone, Default)]
pub struct ModifierState {
    held: Arc<AtomicU8>,
}

impl ModifierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a key event. Returns `true` if the key was a modifier.
    ///
    /// Press (1) sets the key, release (0) clears it, repeat (2) changes nothing.
    pub fn update(&self, key: Key, value: i32) -> bool {
        let Some(modifier) = ModifierKey::from_key(key) else {
            return false;
        };
        match value {
            0 => {
                self.held.fetch_and(!modifier.bit(), Ordering::SeqCst);
            }
            1 => {
                self.held.fetch_or(modifier.bit(), Ordering::SeqCst);
            }
            _ => {}
        }
        true
    }

    pub fn snapshot(&self) -> HeldModifiers {
        HeldModifiers(self.held.load(Ordering::SeqCst))
    }

    /// Alt/Control/Shift record flags currently held.
    pub fn flags(&self) -> u8 {
        self.snapshot().flags()
    }

    pub fn clear(&self) {
        self.held.store(0, Ordering::SeqCst);
    }
}

/// Record flag of a modifier virtual-key code, generic or sided.
pub fn vk_flag(vk: u8) -> Option<IOFlag> {
    match keymap::generic_modifier(vk).unwrap_or(vk) {
        keycap_config::vk::VK_SHIFT => Some(IOFlag::Shift),
        keycap_config::vk::VK_CONTROL => Some(IOFlag::Control),
        keycap_config::vk::VK_MENU => Some(IOFlag::Alt),
        _ => None,
    }
}

/// Keys to press for the Alt/Control/Shift bits of `flags`, in Ctrl, Alt, Shift order.
pub fn modifier_keys(flags: u8) -> Vec<Key> {
    let mut keys = Vec::with_capacity(3);
    if flags & IOFlag::Control.bit() != 0 {
        keys.push(Key::KEY_LEFTCTRL);
    }
    if flags & IOFlag::Alt.bit() != 0 {
        keys.push(Key::KEY_LEFTALT);
    }
    if flags & IOFlag::Shift.bit() != 0 {
        keys.push(Key::KEY_LEFTSHIFT);
    }
    keys
}
