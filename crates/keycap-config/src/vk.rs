//! Virtual-key code names
//!
//! Mapping files store keys as Windows virtual-key codes (`0x41` is `A`), so
//! tables authored by existing tools load unchanged. This module gives those
//! codes human-readable names for display and authoring.

/// Generic Shift virtual-key code (either side).
pub const VK_SHIFT: u8 = 0x10;
/// Generic Control virtual-key code (either side).
pub const VK_CONTROL: u8 = 0x11;
/// Generic Alt virtual-key code (either side).
pub const VK_MENU: u8 = 0x12;

const VK_NAMES: [Option<&str>; 256] = {
    let mut t: [Option<&str>; 256] = [None; 256];

    t[0x08] = Some("Backspace");
    t[0x09] = Some("Tab");
    t[0x0C] = Some("Clear");
    t[0x0D] = Some("Enter");
    t[0x10] = Some("Shift");
    t[0x11] = Some("Ctrl");
    t[0x12] = Some("Alt");
    t[0x13] = Some("Pause");
    t[0x14] = Some("CapsLock");
    t[0x1B] = Some("Escape");
    t[0x20] = Some("Space");
    t[0x21] = Some("PageUp");
    t[0x22] = Some("PageDown");
    t[0x23] = Some("End");
    t[0x24] = Some("Home");
    t[0x25] = Some("Left");
    t[0x26] = Some("Up");
    t[0x27] = Some("Right");
    t[0x28] = Some("Down");
    t[0x2C] = Some("PrintScreen");
    t[0x2D] = Some("Insert");
    t[0x2E] = Some("Delete");

    // Digits
    t[0x30] = Some("0");
    t[0x31] = Some("1");
    t[0x32] = Some("2");
    t[0x33] = Some("3");
    t[0x34] = Some("4");
    t[0x35] = Some("5");
    t[0x36] = Some("6");
    t[0x37] = Some("7");
    t[0x38] = Some("8");
    t[0x39] = Some("9");

    // Letters
    t[0x41] = Some("A");
    t[0x42] = Some("B");
    t[0x43] = Some("C");
    t[0x44] = Some("D");
    t[0x45] = Some("E");
    t[0x46] = Some("F");
    t[0x47] = Some("G");
    t[0x48] = Some("H");
    t[0x49] = Some("I");
    t[0x4A] = Some("J");
    t[0x4B] = Some("K");
    t[0x4C] = Some("L");
    t[0x4D] = Some("M");
    t[0x4E] = Some("N");
    t[0x4F] = Some("O");
    t[0x50] = Some("P");
    t[0x51] = Some("Q");
    t[0x52] = Some("R");
    t[0x53] = Some("S");
    t[0x54] = Some("T");
    t[0x55] = Some("U");
    t[0x56] = Some("V");
    t[0x57] = Some("W");
    t[0x58] = Some("X");
    t[0x59] = Some("Y");
    t[0x5A] = Some("Z");

    t[0x5B] = Some("LeftWin");
    t[0x5C] = Some("RightWin");
    t[0x5D] = Some("Menu");

    // Numpad
    t[0x60] = Some("Numpad0");
    t[0x61] = Some("Numpad1");
    t[0x62] = Some("Numpad2");
    t[0x63] = Some("Numpad3");
    t[0x64] = Some("Numpad4");
    t[0x65] = Some("Numpad5");
    t[0x66] = Some("Numpad6");
    t[0x67] = Some("Numpad7");
    t[0x68] = Some("Numpad8");
    t[0x69] = Some("Numpad9");
    t[0x6A] = Some("NumpadMultiply");
    t[0x6B] = Some("NumpadAdd");
    t[0x6D] = Some("NumpadSubtract");
    t[0x6E] = Some("NumpadDecimal");
    t[0x6F] = Some("NumpadDivide");

    // Function keys F1-F24
    t[0x70] = Some("F1");
    t[0x71] = Some("F2");
    t[0x72] = Some("F3");
    t[0x73] = Some("F4");
    t[0x74] = Some("F5");
    t[0x75] = Some("F6");
    t[0x76] = Some("F7");
    t[0x77] = Some("F8");
    t[0x78] = Some("F9");
    t[0x79] = Some("F10");
    t[0x7A] = Some("F11");
    t[0x7B] = Some("F12");
    t[0x7C] = Some("F13");
    t[0x7D] = Some("F14");
    t[0x7E] = Some("F15");
    t[0x7F] = Some("F16");
    t[0x80] = Some("F17");
    t[0x81] = Some("F18");
    t[0x82] = Some("F19");
    t[0x83] = Some("F20");
    t[0x84] = Some("F21");
    t[0x85] = Some("F22");
    t[0x86] = Some("F23");
    t[0x87] = Some("F24");

    t[0x90] = Some("NumLock");
    t[0x91] = Some("ScrollLock");

    // Sided modifiers
    t[0xA0] = Some("LeftShift");
    t[0xA1] = Some("RightShift");
    t[0xA2] = Some("LeftCtrl");
    t[0xA3] = Some("RightCtrl");
    t[0xA4] = Some("LeftAlt");
    t[0xA5] = Some("RightAlt");

    // Media
    t[0xAD] = Some("VolumeMute");
    t[0xAE] = Some("VolumeDown");
    t[0xAF] = Some("VolumeUp");
    t[0xB0] = Some("MediaNext");
    t[0xB1] = Some("MediaPrevious");
    t[0xB2] = Some("MediaStop");
    t[0xB3] = Some("MediaPlayPause");

    // US layout punctuation
    t[0xBA] = Some("Semicolon");
    t[0xBB] = Some("Equals");
    t[0xBC] = Some("Comma");
    t[0xBD] = Some("Minus");
    t[0xBE] = Some("Period");
    t[0xBF] = Some("Slash");
    t[0xC0] = Some("Grave");
    t[0xDB] = Some("LeftBracket");
    t[0xDC] = Some("Backslash");
    t[0xDD] = Some("RightBracket");
    t[0xDE] = Some("Apostrophe");

    t
};

/// Canonical display name of a virtual-key code, if it has one.
pub fn name(vk: u8) -> Option<&'static str> {
    VK_NAMES[vk as usize]
}

/// Display label for a virtual-key code; unnamed codes render as `0xNN`.
pub fn label(vk: u8) -> String {
    match name(vk) {
        Some(name) => name.to_string(),
        None => format!("0x{:02X}", vk),
    }
}

/// Parse a key name (case-insensitive) or a `0xNN` literal into a virtual-key code.
pub fn parse(name: &str) -> Option<u8> {
    let trimmed = name.trim();
    let upper = trimmed.to_uppercase();

    let alias = match upper.as_str() {
        "ESC" => Some(0x1B),
        "RETURN" => Some(0x0D),
        "CONTROL" => Some(VK_CONTROL),
        "MENU" | "APPS" => Some(0x5D),
        "CAPS" | "CAPS_LOCK" => Some(0x14),
        "PGUP" => Some(0x21),
        "PGDN" | "PGDOWN" => Some(0x22),
        "INS" => Some(0x2D),
        "DEL" => Some(0x2E),
        "LWIN" | "SUPER" | "META" | "WIN" => Some(0x5B),
        "RWIN" => Some(0x5C),
        "LSHIFT" => Some(0xA0),
        "RSHIFT" => Some(0xA1),
        "LCTRL" => Some(0xA2),
        "RCTRL" => Some(0xA3),
        "LALT" => Some(0xA4),
        "RALT" => Some(0xA5),
        "EQUAL" | "=" => Some(0xBB),
        "-" => Some(0xBD),
        "DOT" | "." => Some(0xBE),
        "," => Some(0xBC),
        ";" => Some(0xBA),
        "/" => Some(0xBF),
        "`" => Some(0xC0),
        "[" => Some(0xDB),
        "\\" => Some(0xDC),
        "]" => Some(0xDD),
        "'" => Some(0xDE),
        _ => None,
    };
    if alias.is_some() {
        return alias;
    }

    if let Some(hex) = upper.strip_prefix("0X") {
        return u8::from_str_radix(hex, 16).ok();
    }

    VK_NAMES
        .iter()
        .position(|entry| entry.is_some_and(|n| n.eq_ignore_ascii_case(trimmed)))
        .map(|vk| vk as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letters_and_digits() {
        assert_eq!(name(0x41), Some("A"));
        assert_eq!(name(0x5A), Some("Z"));
        assert_eq!(name(0x30), Some("0"));
        assert_eq!(parse("a"), Some(0x41));
        assert_eq!(parse("7"), Some(0x37));
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(parse("Esc"), Some(0x1B));
        assert_eq!(parse("escape"), Some(0x1B));
        assert_eq!(parse("Control"), Some(VK_CONTROL));
        assert_eq!(parse("ctrl"), Some(VK_CONTROL));
        assert_eq!(parse("PgDn"), Some(0x22));
        assert_eq!(parse("["), Some(0xDB));
    }

    #[test]
    fn test_parse_hex_literal() {
        assert_eq!(parse("0x41"), Some(0x41));
        assert_eq!(parse("0XFF"), Some(0xFF));
        assert_eq!(parse("0x1FF"), None);
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(parse("NotAKey"), None);
        assert_eq!(parse(""), None);
        assert_eq!(name(0xFF), None);
        assert_eq!(label(0xFF), "0xFF");
    }

    #[test]
    fn test_every_name_parses_back() {
        for vk in 0..=255u8 {
            if let Some(n) = name(vk) {
                assert_eq!(parse(n), Some(vk), "name {} should parse to 0x{:02X}", n, vk);
            }
        }
    }
}
