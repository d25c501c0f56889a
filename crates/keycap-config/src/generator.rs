//! Render mapping tables back to KDL mapping source

use std::fmt::Write as _;
use std::path::Path;

use crate::error::ConfigError;
use crate::model::{modifier_prefix, ActionKind, IODefinition, IOFlag, MODIFIER_MASK};
use crate::parser::check_keymap_str;
use crate::table::MappingTable;
use crate::vk;

fn render_output(output: &IODefinition) -> String {
    let toggle = if output.is_flagged_as(IOFlag::Toggle) {
        " toggle=true"
    } else {
        ""
    };

    match output.action() {
        ActionKind::Key(code) => format!(
            "key \"{}{}\"{}",
            modifier_prefix(output.flags()),
            vk::label(code),
            toggle
        ),
        ActionKind::Mouse(button) => format!(
            "mouse \"{}{}\"{}",
            modifier_prefix(output.flags()),
            button.name().to_lowercase(),
            toggle
        ),
        ActionKind::Delay(amount) => format!("delay {}", amount),
        ActionKind::Nothing => "nothing".to_string(),
    }
}

/// Render a table as mapping source.
///
/// Only the modifier bits and key of an input are representable; other input
/// flags are dropped with a comment noting the original byte.
pub fn render_keymap_source(table: &MappingTable, source_path: Option<&Path>) -> String {
    let mut output = String::new();

    output.push_str("// Generated by keycap decompile\n");
    if let Some(path) = source_path {
        let _ = writeln!(output, "// Source: {}", path.display());
    }

    for (i, pair) in table.iter().enumerate() {
        let input = pair.input();
        output.push('\n');
        if let Some(first) = table.pairs()[..i].iter().position(|p| p == pair) {
            let _ = writeln!(
                output,
                "// identical to record #{}; remove before compiling",
                first + 1
            );
        }
        if input.flags() & !MODIFIER_MASK != 0 {
            let _ = writeln!(
                output,
                "// input flags 0x{:02X} reduced to modifiers",
                input.flags()
            );
        }
        let _ = writeln!(
            output,
            "map \"{}{}\" {{",
            modifier_prefix(input.flags()),
            vk::label(input.value())
        );
        for out in pair.outputs() {
            let _ = writeln!(output, "    {}", render_output(out));
        }
        output.push_str("}\n");
    }

    output
}

/// Check that rendered mapping source parses back.
///
/// Repeated identical records are allowed here; a `.kfg` file may hold them.
pub fn validate_rendered(content: &str) -> Result<(), ConfigError> {
    check_keymap_str(content).map_err(|e| ConfigError::Invalid {
        message: format!("Rendered mapping source does not parse back: {}", e),
    })?;
    Ok(())
}

/// Write rendered mapping source to `path`, replacing it atomically.
pub fn write_keymap_source(
    table: &MappingTable,
    source_path: Option<&Path>,
    path: &Path,
) -> Result<(), ConfigError> {
    let content = render_keymap_source(table, source_path);
    validate_rendered(&content)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("kdl.tmp");
    if let Err(e) = std::fs::write(&temp_path, &content) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    tracing::info!("Wrote mapping source to {}", path.display());
    Ok(())
}
