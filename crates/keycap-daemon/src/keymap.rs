//! Translation between virtual-key codes and evdev key codes
//!
//! Mapping tables speak virtual-key codes; the kernel speaks evdev codes.
//! Sided modifier codes come before the generic ones so a physical Left Shift
//! reads back as `LeftShift` (0xA0) while the generic `Shift` (0x10) still
//! injects as Left Shift.

use evdev::Key;
use keycap_config::MouseButton;

const KEYMAP: &[(u8, Key)] = &[
    (0x08, Key::KEY_BACKSPACE),
    (0x09, Key::KEY_TAB),
    (0x0C, Key::KEY_CLEAR),
    (0x0D, Key::KEY_ENTER),
    (0x13, Key::KEY_PAUSE),
    (0x14, Key::KEY_CAPSLOCK),
    (0x1B, Key::KEY_ESC),
    (0x20, Key::KEY_SPACE),
    (0x21, Key::KEY_PAGEUP),
    (0x22, Key::KEY_PAGEDOWN),
    (0x23, Key::KEY_END),
    (0x24, Key::KEY_HOME),
    (0x25, Key::KEY_LEFT),
    (0x26, Key::KEY_UP),
    (0x27, Key::KEY_RIGHT),
    (0x28, Key::KEY_DOWN),
    (0x2C, Key::KEY_SYSRQ),
    (0x2D, Key::KEY_INSERT),
    (0x2E, Key::KEY_DELETE),
    // Digits
    (0x30, Key::KEY_0),
    (0x31, Key::KEY_1),
    (0x32, Key::KEY_2),
    (0x33, Key::KEY_3),
    (0x34, Key::KEY_4),
    (0x35, Key::KEY_5),
    (0x36, Key::KEY_6),
    (0x37, Key::KEY_7),
    (0x38, Key::KEY_8),
    (0x39, Key::KEY_9),
    // Letters
    (0x41, Key::KEY_A),
    (0x42, Key::KEY_B),
    (0x43, Key::KEY_C),
    (0x44, Key::KEY_D),
    (0x45, Key::KEY_E),
    (0x46, Key::KEY_F),
    (0x47, Key::KEY_G),
    (0x48, Key::KEY_H),
    (0x49, Key::KEY_I),
    (0x4A, Key::KEY_J),
    (0x4B, Key::KEY_K),
    (0x4C, Key::KEY_L),
    (0x4D, Key::KEY_M),
    (0x4E, Key::KEY_N),
    (0x4F, Key::KEY_O),
    (0x50, Key::KEY_P),
    (0x51, Key::KEY_Q),
    (0x52, Key::KEY_R),
    (0x53, Key::KEY_S),
    (0x54, Key::KEY_T),
    (0x55, Key::KEY_U),
    (0x56, Key::KEY_V),
    (0x57, Key::KEY_W),
    (0x58, Key::KEY_X),
    (0x59, Key::KEY_Y),
    (0x5A, Key::KEY_Z),
    (0x5B, Key::KEY_LEFTMETA),
    (0x5C, Key::KEY_RIGHTMETA),
    (0x5D, Key::KEY_COMPOSE),
    // Numpad
    (0x60, Key::KEY_KP0),
    (0x61, Key::KEY_KP1),
    (0x62, Key::KEY_KP2),
    (0x63, Key::KEY_KP3),
    (0x64, Key::KEY_KP4),
    (0x65, Key::KEY_KP5),
    (0x66, Key::KEY_KP6),
    (0x67, Key::KEY_KP7),
    (0x68, Key::KEY_KP8),
    (0x69, Key::KEY_KP9),
    (0x6A, Key::KEY_KPASTERISK),
    (0x6B, Key::KEY_KPPLUS),
    (0x6D, Key::KEY_KPMINUS),
    (0x6E, Key::KEY_KPDOT),
    (0x6F, Key::KEY_KPSLASH),
    // Function keys
    (0x70, Key::KEY_F1),
    (0x71, Key::KEY_F2),
    (0x72, Key::KEY_F3),
    (0x73, Key::KEY_F4),
    (0x74, Key::KEY_F5),
    (0x75, Key::KEY_F6),
    (0x76, Key::KEY_F7),
    (0x77, Key::KEY_F8),
    (0x78, Key::KEY_F9),
    (0x79, Key::KEY_F10),
    (0x7A, Key::KEY_F11),
    (0x7B, Key::KEY_F12),
    (0x7C, Key::KEY_F13),
    (0x7D, Key::KEY_F14),
    (0x7E, Key::KEY_F15),
    (0x7F, Key::KEY_F16),
    (0x80, Key::KEY_F17),
    (0x81, Key::KEY_F18),
    (0x82, Key::KEY_F19),
    (0x83, Key::KEY_F20),
    (0x84, Key::KEY_F21),
    (0x85, Key::KEY_F22),
    (0x86, Key::KEY_F23),
    (0x87, Key::KEY_F24),
    (0x90, Key::KEY_NUMLOCK),
    (0x91, Key::KEY_SCROLLLOCK),
    // Sided modifiers, ahead of the generic codes below
    (0xA0, Key::KEY_LEFTSHIFT),
    (0xA1, Key::KEY_RIGHTSHIFT),
    (0xA2, Key::KEY_LEFTCTRL),
    (0xA3, Key::KEY_RIGHTCTRL),
    (0xA4, Key::KEY_LEFTALT),
    (0xA5, Key::KEY_RIGHTALT),
    (0x10, Key::KEY_LEFTSHIFT),
    (0x11, Key::KEY_LEFTCTRL),
    (0x12, Key::KEY_LEFTALT),
    // Media
    (0xAD, Key::KEY_MUTE),
    (0xAE, Key::KEY_VOLUMEDOWN),
    (0xAF, Key::KEY_VOLUMEUP),
    (0xB0, Key::KEY_NEXTSONG),
    (0xB1, Key::KEY_PREVIOUSSONG),
    (0xB2, Key::KEY_STOPCD),
    (0xB3, Key::KEY_PLAYPAUSE),
    // US layout punctuation
    (0xBA, Key::KEY_SEMICOLON),
    (0xBB, Key::KEY_EQUAL),
    (0xBC, Key::KEY_COMMA),
    (0xBD, Key::KEY_MINUS),
    (0xBE, Key::KEY_DOT),
    (0xBF, Key::KEY_SLASH),
    (0xC0, Key::KEY_GRAVE),
    (0xDB, Key::KEY_LEFTBRACE),
    (0xDC, Key::KEY_BACKSLASH),
    (0xDD, Key::KEY_RIGHTBRACE),
    (0xDE, Key::KEY_APOSTROPHE),
];

/// evdev key to inject for a virtual-key code.
pub fn to_key(vk: u8) -> Option<Key> {
    KEYMAP
        .iter()
        .find(|(code, _)| *code == vk)
        .map(|(_, key)| *key)
}

/// Virtual-key code of a physical key.
pub fn from_key(key: Key) -> Option<u8> {
    KEYMAP
        .iter()
        .find(|(_, k)| *k == key)
        .map(|(code, _)| *code)
}

/// Generic code for a sided modifier code, so `Shift` records also match `LeftShift`.
pub fn generic_modifier(vk: u8) -> Option<u8> {
    match vk {
        0xA0 | 0xA1 => Some(keycap_config::vk::VK_SHIFT),
        0xA2 | 0xA3 => Some(keycap_config::vk::VK_CONTROL),
        0xA4 | 0xA5 => Some(keycap_config::vk::VK_MENU),
        _ => None,
    }
}

/// evdev button code of a mouse button.
pub fn button_key(button: MouseButton) -> Key {
    match button {
        MouseButton::Left => Key::BTN_LEFT,
        MouseButton::Right => Key::BTN_RIGHT,
        MouseButton::Middle => Key::BTN_MIDDLE,
        MouseButton::X1 => Key::BTN_SIDE,
        MouseButton::X2 => Key::BTN_EXTRA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letters() {
        assert_eq!(to_key(0x41), Some(Key::KEY_A));
        assert_eq!(from_key(Key::KEY_Z), Some(0x5A));
    }

    #[test]
    fn test_modifiers_read_back_sided() {
        assert_eq!(from_key(Key::KEY_LEFTSHIFT), Some(0xA0));
        assert_eq!(from_key(Key::KEY_RIGHTCTRL), Some(0xA3));
        assert_eq!(to_key(0x10), Some(Key::KEY_LEFTSHIFT));
        assert_eq!(to_key(0x12), Some(Key::KEY_LEFTALT));
        assert_eq!(generic_modifier(0xA5), Some(0x12));
        assert_eq!(generic_modifier(0x41), None);
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(to_key(0xFF), None);
        assert_eq!(from_key(Key::KEY_PROG1), None);
    }

    #[test]
    fn test_every_named_code_injects() {
        // Every code with a display name has a key to inject
        for vk in 0..=255u8 {
            if keycap_config::vk::name(vk).is_some() {
                assert!(to_key(vk).is_some(), "0x{:02X} has a name but no evdev key", vk);
            }
        }
    }

    #[test]
    fn test_roundtrip_non_generic() {
        for (vk, key) in KEYMAP {
            if !matches!(*vk, 0x10..=0x12) {
                assert_eq!(from_key(*key), Some(*vk));
            }
        }
    }

    #[test]
    fn test_button_keys() {
        assert_eq!(button_key(MouseButton::Left), Key::BTN_LEFT);
        assert_eq!(button_key(MouseButton::X2), Key::BTN_EXTRA);
    }
}
