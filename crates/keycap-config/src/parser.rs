//! KDL parsing for the settings file and mapping source files

use std::path::Path;

use crate::error::ConfigError;
use crate::model::*;
use crate::table::MappingTable;
use crate::vk;

fn span_of(offset: usize, len: usize) -> miette::SourceSpan {
    miette::SourceSpan::from((offset, len))
}

/// Span of a node's name
fn node_span(node: &kdl::KdlNode) -> miette::SourceSpan {
    let span = node.name().span();
    span_of(span.offset(), span.len())
}

/// Span of a single entry (argument or property)
fn entry_span(entry: &kdl::KdlEntry) -> miette::SourceSpan {
    let span = entry.span();
    span_of(span.offset(), span.len())
}

fn parse_document(content: &str) -> Result<kdl::KdlDocument, ConfigError> {
    content.parse().map_err(|e: kdl::KdlError| {
        // kdl carries its own miette version; rebuild the span for ours
        let span = span_of(e.span.offset(), e.span.len());
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })
}

fn first_string(node: &kdl::KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

fn expand_path(raw: &str) -> std::path::PathBuf {
    shellexpand::tilde(raw).into_owned().into()
}

/// Default location of the settings file
pub fn default_settings_path() -> std::path::PathBuf {
    expand_path("~/.config/keycap/settings.kdl")
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_settings_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            Ok(Settings::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse settings from a string
pub fn parse_settings_str(content: &str) -> Result<Settings, ConfigError> {
    let doc = parse_document(content)?;
    let mut settings = Settings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => {
                settings.global = parse_global(node)?;
            }
            "capture" => {
                settings.capture = parse_capture(node)?;
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(settings)
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalSettings, ConfigError> {
    let mut global = GlobalSettings::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let value = first_string(child);
            match (child.name().value(), value) {
                ("log-level", Some(val)) => {
                    global.log_level = val
                        .parse()
                        .map_err(|message| ConfigError::Invalid { message })?;
                }
                ("delay-unit", Some(val)) => {
                    global.delay_unit = val
                        .parse()
                        .map_err(|message| ConfigError::Invalid { message })?;
                }
                ("virtual-device-name", Some(val)) => {
                    if val.is_empty() {
                        return Err(ConfigError::Invalid {
                            message: "virtual-device-name must not be empty".to_string(),
                        });
                    }
                    global.virtual_device_name = val.to_string();
                }
                ("socket-path", Some(val)) => {
                    global.socket_path = Some(expand_path(val));
                }
                (name, None)
                    if matches!(
                        name,
                        "log-level" | "delay-unit" | "virtual-device-name" | "socket-path"
                    ) =>
                {
                    return Err(ConfigError::Invalid {
                        message: format!("global option '{}' expects a string value", name),
                    });
                }
                (name, _) => {
                    tracing::warn!("Unknown global option: {}", name);
                }
            }
        }
    }

    Ok(global)
}

fn parse_capture(node: &kdl::KdlNode) -> Result<CaptureSettings, ConfigError> {
    let mut capture = CaptureSettings::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "device" => match first_string(child) {
                    Some(name) => capture.devices.push(name.to_string()),
                    None => {
                        return Err(ConfigError::Invalid {
                            message: "capture device expects a device name".to_string(),
                        });
                    }
                },
                "autostart" => match first_string(child) {
                    Some(path) => capture.autostart = Some(expand_path(path)),
                    None => {
                        return Err(ConfigError::Invalid {
                            message: "autostart expects a mapping file path".to_string(),
                        });
                    }
                },
                name => {
                    tracing::warn!("Unknown capture option: {}", name);
                }
            }
        }
    }

    Ok(capture)
}

/// Parse a mapping source file into a table
pub fn parse_keymap_source(path: &Path) -> Result<MappingTable, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_keymap_str(&content)
}

/// Parse mapping source from a string.
///
/// ```kdl
/// map "Ctrl+A" {
///     key "B"
///     delay 100
///     mouse "left"
///     key "Shift+C" toggle=true
///     nothing
/// }
/// ```
pub fn parse_keymap_str(content: &str) -> Result<MappingTable, ConfigError> {
    let mut table = MappingTable::new();

    for (pair, span) in parse_map_nodes(content)? {
        if let Err(e) = table.push(pair) {
            return Err(invalid_mapping(content, span, e.to_string()));
        }
    }

    if table.is_empty() {
        return Err(ConfigError::Invalid {
            message: "no mappings defined".to_string(),
        });
    }

    Ok(table)
}

/// Parse mapping source without the duplicate-record rule, returning the
/// number of records.
pub(crate) fn check_keymap_str(content: &str) -> Result<usize, ConfigError> {
    Ok(parse_map_nodes(content)?.len())
}

/// Every `map` node in document order, with the span of its name.
fn parse_map_nodes(
    content: &str,
) -> Result<Vec<(IOPairDefinition, miette::SourceSpan)>, ConfigError> {
    let doc = parse_document(content)?;
    let mut pairs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "map" => pairs.push((parse_map(node, content)?, node_span(node))),
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(pairs)
}

fn invalid_mapping(src: &str, span: miette::SourceSpan, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidMapping {
        message: message.into(),
        src: src.to_string(),
        span,
    }
}

fn parse_map(node: &kdl::KdlNode, source: &str) -> Result<IOPairDefinition, ConfigError> {
    let trigger_entry = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| invalid_mapping(source, node_span(node), "map needs a trigger key"))?;
    let trigger = trigger_entry
        .value()
        .as_string()
        .ok_or_else(|| invalid_mapping(source, entry_span(trigger_entry), "trigger must be a string"))?;

    let (modifiers, code) = parse_combo(trigger, source, entry_span(trigger_entry))?;
    let input = IODefinition::key(code).with_modifiers(modifiers);

    let children = node
        .children()
        .map(|c| c.nodes())
        .unwrap_or_default();

    let mut outputs = children.iter().map(|child| parse_output(child, source));
    let first = match outputs.next() {
        Some(first) => first?,
        None => {
            return Err(invalid_mapping(
                source,
                node_span(node),
                format!("mapping for '{}' has no outputs", trigger),
            ));
        }
    };

    let mut pair = IOPairDefinition::new(input, first);
    for (output, child) in outputs.zip(children.iter().skip(1)) {
        pair.append_output(output?)
            .map_err(|e| invalid_mapping(source, node_span(child), e.to_string()))?;
    }

    Ok(pair)
}

fn parse_output(node: &kdl::KdlNode, source: &str) -> Result<IODefinition, ConfigError> {
    let toggle = match node.get("toggle") {
        Some(entry) => entry.value().as_bool().ok_or_else(|| {
            invalid_mapping(source, entry_span(entry), "toggle must be true or false")
        })?,
        None => false,
    };

    let argument = node.entries().iter().find(|e| e.name().is_none());

    let output = match node.name().value() {
        "key" => {
            let (entry, text) = string_argument(node, argument, source)?;
            let (modifiers, code) = parse_combo(text, source, entry_span(entry))?;
            IODefinition::key(code).with_modifiers(modifiers)
        }
        "mouse" => {
            let (entry, text) = string_argument(node, argument, source)?;
            let span = entry_span(entry);
            let (modifier_names, button_name) = split_combo(text);
            let modifiers = parse_modifiers(&modifier_names, source, span)?;
            let button = MouseButton::from_name(button_name).ok_or_else(|| {
                invalid_mapping(
                    source,
                    span,
                    format!("unknown mouse button '{}' (left, right, middle, x1, x2)", button_name),
                )
            })?;
            IODefinition::mouse(button).with_modifiers(modifiers)
        }
        "delay" => {
            let entry = argument.ok_or_else(|| {
                invalid_mapping(source, node_span(node), "delay needs an amount")
            })?;
            let amount = entry
                .value()
                .as_i64()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| {
                    invalid_mapping(source, entry_span(entry), "delay must be between 0 and 255")
                })?;
            IODefinition::delay(amount)
        }
        "nothing" => IODefinition::nothing(),
        other => {
            return Err(invalid_mapping(
                source,
                node_span(node),
                format!("unknown output '{}' (key, mouse, delay, nothing)", other),
            ));
        }
    };

    if !toggle {
        return Ok(output);
    }
    match output.action() {
        ActionKind::Key(_) | ActionKind::Mouse(_) => Ok(output.toggled()),
        _ => Err(invalid_mapping(
            source,
            node_span(node),
            "toggle only applies to key and mouse outputs",
        )),
    }
}

fn string_argument<'a>(
    node: &kdl::KdlNode,
    argument: Option<&'a kdl::KdlEntry>,
    source: &str,
) -> Result<(&'a kdl::KdlEntry, &'a str), ConfigError> {
    let entry = argument.ok_or_else(|| {
        invalid_mapping(
            source,
            node_span(node),
            format!("{} needs a string argument", node.name().value()),
        )
    })?;
    let text = entry.value().as_string().ok_or_else(|| {
        invalid_mapping(source, entry_span(entry), "expected a string")
    })?;
    Ok((entry, text))
}

/// Split `Ctrl+Alt+A` into its modifier names and final key. `Ctrl++` ends in `+`.
fn split_combo(text: &str) -> (Vec<&str>, &str) {
    if let Some(rest) = text.strip_suffix("++") {
        let modifiers = rest.split('+').map(str::trim).collect();
        return (modifiers, "+");
    }
    let mut parts: Vec<&str> = text.split('+').map(str::trim).collect();
    let key = parts.pop().unwrap_or_default();
    (parts, key)
}

fn parse_modifiers(
    names: &[&str],
    source: &str,
    span: miette::SourceSpan,
) -> Result<u8, ConfigError> {
    let mut modifiers = 0;
    for name in names {
        let flag = match name.to_lowercase().as_str() {
            "ctrl" | "control" => IOFlag::Control,
            "alt" => IOFlag::Alt,
            "shift" => IOFlag::Shift,
            _ => {
                return Err(invalid_mapping(
                    source,
                    span,
                    format!("unknown modifier '{}' (Ctrl, Alt, Shift)", name),
                ));
            }
        };
        modifiers |= flag.bit();
    }
    Ok(modifiers)
}

/// Parse `Ctrl+Shift+F5` into modifier bits and a virtual-key code.
fn parse_combo(
    text: &str,
    source: &str,
    span: miette::SourceSpan,
) -> Result<(u8, u8), ConfigError> {
    let (modifier_names, key) = split_combo(text);
    let modifiers = parse_modifiers(&modifier_names, source, span)?;
    let code = vk::parse(key).ok_or_else(|| ConfigError::UnknownKey {
        key: key.to_string(),
        src: source.to_string(),
        span,
    })?;
    Ok((modifiers, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Signature;
    use tempfile::TempDir;

    #[test]
    fn test_parse_settings() {
        let config = r#"
            global {
                log-level "debug"
                delay-unit "s"
                virtual-device-name "keycap test"
                socket-path "/tmp/keycap.sock"
            }
            capture {
                device "AT Translated Set 2 keyboard"
                device "Keychron K2"
                autostart "/etc/keycap/default.kfg"
            }
        "#;

        let settings = parse_settings_str(config).unwrap();
        assert_eq!(settings.global.log_level, LogLevel::Debug);
        assert_eq!(settings.global.delay_unit, DelayUnit::Seconds);
        assert_eq!(settings.global.virtual_device_name, "keycap test");
        assert_eq!(
            settings.global.socket_path.as_deref(),
            Some(Path::new("/tmp/keycap.sock"))
        );
        assert_eq!(settings.capture.devices.len(), 2);
        assert_eq!(
            settings.capture.autostart.as_deref(),
            Some(Path::new("/etc/keycap/default.kfg"))
        );
    }

    #[test]
    fn test_settings_defaults() {
        let settings = parse_settings_str("").unwrap();
        assert_eq!(settings.global.log_level, LogLevel::Info);
        assert_eq!(settings.global.delay_unit, DelayUnit::Milliseconds);
        assert_eq!(settings.global.virtual_device_name, "keycap");
        assert!(settings.capture.devices.is_empty());
        assert!(settings.capture.autostart.is_none());
    }

    #[test]
    fn test_missing_settings_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = load_settings(&temp_dir.path().join("settings.kdl")).unwrap();
        assert_eq!(settings.global.virtual_device_name, "keycap");
    }

    #[test]
    fn test_invalid_log_level() {
        let result = parse_settings_str(r#"global { log-level "loud"; }"#);
        match result {
            Err(ConfigError::Invalid { message }) => assert!(message.contains("loud")),
            other => panic!("Expected Invalid error, got: {:?}", other),
        }
    }

    #[test]
    fn test_tilde_expansion_in_autostart() {
        let settings = parse_settings_str(r#"capture { autostart "~/maps/default.kfg"; }"#).unwrap();
        let path_str = settings.capture.autostart.unwrap().to_string_lossy().into_owned();
        assert!(
            !path_str.starts_with('~'),
            "Tilde should be expanded, but got: {}",
            path_str
        );
        assert!(path_str.ends_with("/maps/default.kfg"));
    }

    #[test]
    fn test_parse_settings_syntax_error() {
        let result = parse_settings_str("global {");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_parse_keymap() {
        let source = r#"
            map "Ctrl+A" {
                key "B"
                delay 100
                mouse "left"
                key "Shift+C" toggle=true
                nothing
            }
            map "F5" { mouse "Ctrl+right"; }
        "#;

        let table = parse_keymap_str(source).unwrap();
        assert_eq!(table.len(), 2);

        let pair = table
            .lookup(&Signature::new(IOFlag::Control.bit(), 0x41))
            .unwrap();
        assert_eq!(
            pair.outputs(),
            &[
                IODefinition::key(0x42),
                IODefinition::delay(100),
                IODefinition::mouse(MouseButton::Left),
                IODefinition::key(0x43)
                    .with_modifiers(IOFlag::Shift.bit())
                    .toggled(),
                IODefinition::nothing(),
            ]
        );

        let pair = table.lookup(&Signature::new(0, 0x74)).unwrap();
        assert_eq!(pair.describe_outputs(), "Ctrl+Mouse Right");
    }

    #[test]
    fn test_unknown_key_reported() {
        let result = parse_keymap_str(r#"map "Ctrl+Blorp" { key "A"; }"#);
        match result {
            Err(ConfigError::UnknownKey { key, .. }) => assert_eq!(key, "Blorp"),
            other => panic!("Expected UnknownKey error, got: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_modifier_reported() {
        let result = parse_keymap_str(r#"map "Hyper+A" { key "B"; }"#);
        match result {
            Err(ConfigError::InvalidMapping { message, .. }) => assert!(message.contains("Hyper")),
            other => panic!("Expected InvalidMapping error, got: {:?}", other),
        }
    }

    #[test]
    fn test_delay_out_of_range() {
        let result = parse_keymap_str(r#"map "A" { delay 256; }"#);
        assert!(matches!(result, Err(ConfigError::InvalidMapping { .. })));
        let result = parse_keymap_str(r#"map "A" { delay -1; }"#);
        assert!(matches!(result, Err(ConfigError::InvalidMapping { .. })));
    }

    #[test]
    fn test_map_without_outputs() {
        let result = parse_keymap_str(r#"map "A" { }"#);
        match result {
            Err(ConfigError::InvalidMapping { message, .. }) => {
                assert!(message.contains("no outputs"))
            }
            other => panic!("Expected InvalidMapping error, got: {:?}", other),
        }
    }

    #[test]
    fn test_toggle_on_delay_rejected() {
        let result = parse_keymap_str(r#"map "A" { delay 10 toggle=true; }"#);
        assert!(matches!(result, Err(ConfigError::InvalidMapping { .. })));
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let source = r#"
            map "A" { key "B"; }
            map "A" { key "B"; }
        "#;
        assert!(matches!(
            parse_keymap_str(source),
            Err(ConfigError::InvalidMapping { .. })
        ));
    }

    #[test]
    fn test_too_many_outputs() {
        let body = "delay 1\n".repeat(MAX_OUTPUTS + 1);
        let source = format!("map \"A\" {{\n{}}}", body);
        match parse_keymap_str(&source) {
            Err(ConfigError::InvalidMapping { message, .. }) => {
                assert!(message.contains("at most 255"))
            }
            other => panic!("Expected InvalidMapping error, got: {:?}", other),
        }
    }

    #[test]
    fn test_empty_keymap_rejected() {
        assert!(matches!(
            parse_keymap_str("// nothing here"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_split_combo_plus_key() {
        assert_eq!(split_combo("Ctrl++"), (vec!["Ctrl"], "+"));
        assert_eq!(split_combo("A"), (vec![], "A"));
        assert_eq!(split_combo("Ctrl + Alt + A"), (vec!["Ctrl", "Alt"], "A"));
    }
}
