//! Mapping record model and settings

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::{AppendError, FormatError};
use crate::vk;

/// Maximum number of outputs a single input may trigger.
pub const MAX_OUTPUTS: usize = 255;

/// Flag bits that act as Alt/Control/Shift modifiers.
pub const MODIFIER_MASK: u8 = 0x07;

/// Flag bits that select a non-key action. At most one may be set.
const ACTION_MASK: u8 = 0x38;

/// Bit 7 has no meaning and is rejected on decode.
const RESERVED_BIT: u8 = 0x80;

/// Individual bits of an [`IODefinition`]'s flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IOFlag {
    Shift,
    Control,
    Alt,
    DoNothing,
    MouseOut,
    Delay,
    Toggle,
}

impl IOFlag {
    pub const fn bit(self) -> u8 {
        match self {
            IOFlag::Shift => 0x01,
            IOFlag::Control => 0x02,
            IOFlag::Alt => 0x04,
            IOFlag::DoNothing => 0x08,
            IOFlag::MouseOut => 0x10,
            IOFlag::Delay => 0x20,
            IOFlag::Toggle => 0x40,
        }
    }
}

/// Mouse buttons addressable by a `MouseOut` definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    /// Back
    X1,
    /// Forward
    X2,
}

impl MouseButton {
    pub const ALL: [MouseButton; 5] = [
        MouseButton::Left,
        MouseButton::Right,
        MouseButton::Middle,
        MouseButton::X1,
        MouseButton::X2,
    ];

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(MouseButton::Left),
            2 => Some(MouseButton::Right),
            3 => Some(MouseButton::Middle),
            4 => Some(MouseButton::X1),
            5 => Some(MouseButton::X2),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Right => 2,
            MouseButton::Middle => 3,
            MouseButton::X1 => 4,
            MouseButton::X2 => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MouseButton::Left => "Left",
            MouseButton::Right => "Right",
            MouseButton::Middle => "Middle",
            MouseButton::X1 => "X1",
            MouseButton::X2 => "X2",
        }
    }

    /// Parse a button name, case-insensitive. `back`/`forward` alias X1/X2.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "left" => Some(MouseButton::Left),
            "right" => Some(MouseButton::Right),
            "middle" => Some(MouseButton::Middle),
            "x1" | "back" => Some(MouseButton::X1),
            "x2" | "forward" => Some(MouseButton::X2),
            _ => None,
        }
    }
}

/// What a definition does, decoded from its flags and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Key(u8),
    Mouse(MouseButton),
    Delay(u8),
    Nothing,
}

/// One input or output action: a flag byte plus a value byte.
///
/// The value is a virtual-key code, a mouse button identifier or a delay
/// magnitude depending on which action flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IODefinition {
    flags: u8,
    value: u8,
}

impl IODefinition {
    /// Build a definition from raw parts, rejecting invalid flag combinations.
    pub fn new(flags: u8, value: u8) -> Result<Self, FormatError> {
        validate(flags, value)?;
        Ok(Self { flags, value })
    }

    pub fn key(vk: u8) -> Self {
        Self { flags: 0, value: vk }
    }

    pub fn mouse(button: MouseButton) -> Self {
        Self {
            flags: IOFlag::MouseOut.bit(),
            value: button.value(),
        }
    }

    pub fn delay(amount: u8) -> Self {
        Self {
            flags: IOFlag::Delay.bit(),
            value: amount,
        }
    }

    pub fn nothing() -> Self {
        Self {
            flags: IOFlag::DoNothing.bit(),
            value: 0,
        }
    }

    /// Add Alt/Control/Shift bits. Bits outside the modifier mask are ignored.
    pub fn with_modifiers(mut self, modifiers: u8) -> Self {
        self.flags |= modifiers & MODIFIER_MASK;
        self
    }

    pub fn toggled(mut self) -> Self {
        self.flags |= IOFlag::Toggle.bit();
        self
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Replace the flag byte. The definition is left unchanged on error.
    pub fn set_flags(&mut self, flags: u8) -> Result<(), FormatError> {
        validate(flags, self.value)?;
        self.flags = flags;
        Ok(())
    }

    pub fn is_flagged_as(&self, flag: IOFlag) -> bool {
        self.flags & flag.bit() != 0
    }

    /// Alt/Control/Shift bits only.
    pub fn modifiers(&self) -> u8 {
        self.flags & MODIFIER_MASK
    }

    pub fn action(&self) -> ActionKind {
        if self.is_flagged_as(IOFlag::DoNothing) {
            ActionKind::Nothing
        } else if self.is_flagged_as(IOFlag::Delay) {
            ActionKind::Delay(self.value)
        } else if self.is_flagged_as(IOFlag::MouseOut) {
            // Validated at construction
            match MouseButton::from_value(self.value) {
                Some(button) => ActionKind::Mouse(button),
                None => ActionKind::Nothing,
            }
        } else {
            ActionKind::Key(self.value)
        }
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.flags, self.value]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        match bytes {
            [flags, value, ..] => Self::new(*flags, *value),
            _ => Err(FormatError::malformed(format!(
                "definition needs 2 bytes, got {}",
                bytes.len()
            ))),
        }
    }

    /// Human-readable label such as `Ctrl+Alt+A`, `Mouse Left` or `Delay 250`.
    ///
    /// Delays carry no unit here; see [`describe_with`](Self::describe_with).
    pub fn describe(&self) -> String {
        self.label(None)
    }

    /// Like [`describe`](Self::describe), with delays in `unit` (`Delay 250ms`).
    pub fn describe_with(&self, unit: DelayUnit) -> String {
        self.label(Some(unit))
    }

    fn label(&self, unit: Option<DelayUnit>) -> String {
        let body = match self.action() {
            ActionKind::Nothing => return "(no action)".to_string(),
            ActionKind::Delay(amount) => {
                let suffix = unit.map(DelayUnit::suffix).unwrap_or_default();
                return format!("Delay {}{}", amount, suffix);
            }
            ActionKind::Mouse(button) => {
                format!("{}Mouse {}", modifier_prefix(self.flags), button.name())
            }
            ActionKind::Key(code) => format!("{}{}", modifier_prefix(self.flags), vk::label(code)),
        };

        if self.is_flagged_as(IOFlag::Toggle) {
            format!("Toggle: {}", body)
        } else {
            body
        }
    }
}

impl fmt::Display for IODefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn validate(flags: u8, value: u8) -> Result<(), FormatError> {
    if flags & RESERVED_BIT != 0 {
        return Err(FormatError::malformed(format!(
            "reserved flag bit set in 0x{:02X}",
            flags
        )));
    }
    if (flags & ACTION_MASK).count_ones() > 1 {
        return Err(FormatError::malformed(format!(
            "more than one action kind in flags 0x{:02X}",
            flags
        )));
    }
    if flags & IOFlag::MouseOut.bit() != 0 && MouseButton::from_value(value).is_none() {
        return Err(FormatError::malformed(format!(
            "unknown mouse button {}",
            value
        )));
    }
    Ok(())
}

/// `Ctrl+Alt+Shift+` style prefix for the modifier bits of `flags`.
pub fn modifier_prefix(flags: u8) -> String {
    let mut prefix = String::new();
    if flags & IOFlag::Control.bit() != 0 {
        prefix.push_str("Ctrl+");
    }
    if flags & IOFlag::Alt.bit() != 0 {
        prefix.push_str("Alt+");
    }
    if flags & IOFlag::Shift.bit() != 0 {
        prefix.push_str("Shift+");
    }
    prefix
}

/// One input bound to an ordered chain of 1 to 255 outputs.
///
/// Equality and hashing cover the whole record, input and every output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IOPairDefinition {
    input: IODefinition,
    outputs: Vec<IODefinition>,
}

impl IOPairDefinition {
    pub fn new(input: IODefinition, first_output: IODefinition) -> Self {
        Self {
            input,
            outputs: vec![first_output],
        }
    }

    pub fn input(&self) -> &IODefinition {
        &self.input
    }

    pub fn outputs(&self) -> &[IODefinition] {
        &self.outputs
    }

    /// Append to the chain. At [`MAX_OUTPUTS`] the pair is left unchanged.
    pub fn append_output(&mut self, output: IODefinition) -> Result<(), AppendError> {
        if self.outputs.len() >= MAX_OUTPUTS {
            return Err(AppendError::MaxOutputsExceeded { max: MAX_OUTPUTS });
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Wire form: `input ++ [count] ++ outputs`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.outputs.len() * 2);
        bytes.extend_from_slice(&self.input.encode());
        // len is capped at MAX_OUTPUTS by append_output
        bytes.push(self.outputs.len() as u8);
        for output in &self.outputs {
            bytes.extend_from_slice(&output.encode());
        }
        bytes
    }

    /// Decode exactly one record. End of stream before the record is an error.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, FormatError> {
        Self::decode_next(reader)?.ok_or(FormatError::TruncatedRecord { needed: 3 })
    }

    /// Decode the next record, or `Ok(None)` on a clean end of stream.
    pub fn decode_next<R: Read>(reader: &mut R) -> Result<Option<Self>, FormatError> {
        let mut header = [0u8; 3];
        let got = fill(reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < header.len() {
            return Err(FormatError::TruncatedRecord {
                needed: header.len() - got,
            });
        }

        let input = IODefinition::decode(&header[..2])?;
        let count = header[2] as usize;
        if count == 0 {
            return Err(FormatError::malformed("output count is zero"));
        }

        let mut body = vec![0u8; count * 2];
        let got = fill(reader, &mut body)?;
        if got < body.len() {
            return Err(FormatError::TruncatedRecord {
                needed: body.len() - got,
            });
        }

        let outputs = body
            .chunks_exact(2)
            .map(IODefinition::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self { input, outputs }))
    }

    pub fn describe_input(&self) -> String {
        self.input.describe()
    }

    pub fn describe_outputs(&self) -> String {
        self.outputs
            .iter()
            .map(IODefinition::describe)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn describe_outputs_with(&self, unit: DelayUnit) -> String {
        self.outputs
            .iter()
            .map(|output| output.describe_with(unit))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for IOPairDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.describe_input(), self.describe_outputs())
    }
}

/// Read until `buf` is full or the stream ends, returning the byte count.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FormatError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FormatError::Io(e)),
        }
    }
    Ok(filled)
}

// Settings

/// Root settings structure
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub global: GlobalSettings,
    pub capture: CaptureSettings,
}

/// Global settings
#[derive(Debug, Clone)]
pub struct GlobalSettings {
    pub log_level: LogLevel,
    pub delay_unit: DelayUnit,
    /// Name given to the uinput device; also used to skip it while grabbing
    pub virtual_device_name: String,
    /// Control socket override
    pub socket_path: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            delay_unit: DelayUnit::Milliseconds,
            virtual_device_name: "keycap".to_string(),
            socket_path: None,
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Default)]
pub struct CaptureSettings {
    /// Device names to grab. Empty means every keyboard.
    pub devices: Vec<String>,
    /// Mapping file to start capturing at daemon startup
    pub autostart: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive usable with `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Unit applied to `Delay` output values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DelayUnit {
    #[default]
    Milliseconds,
    /// Legacy tables that count delays in whole seconds
    Seconds,
}

impl DelayUnit {
    pub fn duration(self, amount: u8) -> Duration {
        match self {
            DelayUnit::Milliseconds => Duration::from_millis(amount as u64),
            DelayUnit::Seconds => Duration::from_secs(amount as u64),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            DelayUnit::Milliseconds => "ms",
            DelayUnit::Seconds => "s",
        }
    }
}

impl std::str::FromStr for DelayUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ms" | "millis" | "milliseconds" => Ok(Self::Milliseconds),
            "s" | "secs" | "seconds" => Ok(Self::Seconds),
            _ => Err(format!("Unknown delay unit: {}", s)),
        }
    }
}
