//! keycap CLI
//!
//! Authoring, inspection and control tool for keycap.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use keycap_config::{DelayUnit, IOPairDefinition, MappingTable, Settings};
use keycap_daemon::ipc::{default_socket_path, send_request, IpcRequest, IpcResponse};
use miette::IntoDiagnostic;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "keycap")]
#[command(about = "Keyboard capture and remapping tool")]
#[command(version)]
struct Cli {
    /// Path to settings file (daemon socket and delay unit)
    #[arg(short, long)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a mapping file (.kfg or .kdl source) and report problems
    Check { file: String },

    /// Print every record of a mapping file
    Dump {
        file: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Compile KDL mapping source to a .kfg file
    Compile {
        source: String,

        /// Output path (defaults to the source path with a .kfg extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Render a .kfg file as KDL mapping source
    Decompile {
        file: String,

        /// Output path (prints to stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List available input devices
    Devices,

    /// Tell the daemon to start capturing with a mapping file
    Start { file: String },

    /// Tell the daemon to stop capturing
    Stop,

    /// Show current daemon status
    Status,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => cmd_check(cli.settings.as_deref(), &expand(&file)),
        Commands::Dump { file, json } => cmd_dump(cli.settings.as_deref(), &expand(&file), json),
        Commands::Compile { source, output } => cmd_compile(&expand(&source), output),
        Commands::Decompile { file, output } => cmd_decompile(&expand(&file), output),
        Commands::Devices => cmd_devices(),
        Commands::Start { file } => cmd_start(cli.settings.as_deref(), &expand(&file)),
        Commands::Stop => cmd_stop(cli.settings.as_deref()),
        Commands::Status => cmd_status(cli.settings.as_deref()),
    }
}

fn expand(path: &str) -> PathBuf {
    shellexpand::tilde(path).into_owned().into()
}

fn is_source(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "kdl")
}

/// Load a binary table, or compile it from source when the file is `.kdl`.
fn load_table(path: &Path) -> miette::Result<MappingTable> {
    if is_source(path) {
        Ok(keycap_config::parse_keymap_source(path)?)
    } else {
        MappingTable::load(path).into_diagnostic()
    }
}

fn cmd_check(settings: Option<&str>, path: &Path) -> miette::Result<()> {
    println!("Checking mapping file: {}", path.display());

    let unit = load_settings(settings)?.global.delay_unit;
    let table = load_table(path)?;
    println!("Mapping file is valid!");
    println!("  Mappings: {}", table.len());
    for pair in table.iter() {
        println!(
            "    - {} -> {}",
            pair.describe_input(),
            pair.describe_outputs_with(unit)
        );
    }

    let conflicts = table.conflicts();
    if !conflicts.is_empty() {
        println!();
        for (signature, indices) in &conflicts {
            let shadowed: Vec<String> = indices[1..].iter().map(|i| format!("#{}", i + 1)).collect();
            println!(
                "  warning: {} is bound by record #{}; {} never fire",
                signature,
                indices[0] + 1,
                shadowed.join(", ")
            );
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct DumpRecord {
    index: usize,
    input: String,
    outputs: Vec<String>,
    /// Encoded record bytes, hex
    raw: String,
}

fn dump_records(table: &MappingTable, unit: DelayUnit) -> Vec<DumpRecord> {
    table
        .iter()
        .enumerate()
        .map(|(index, pair): (usize, &IOPairDefinition)| DumpRecord {
            index: index + 1,
            input: pair.describe_input(),
            outputs: pair.outputs().iter().map(|o| o.describe_with(unit)).collect(),
            raw: pair
                .encode()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" "),
        })
        .collect()
}

fn cmd_dump(settings: Option<&str>, path: &Path, json: bool) -> miette::Result<()> {
    let unit = load_settings(settings)?.global.delay_unit;
    let table = load_table(path)?;
    let records = dump_records(&table, unit);

    if json {
        let content = serde_json::to_string_pretty(&records).into_diagnostic()?;
        println!("{}", content);
        return Ok(());
    }

    for record in &records {
        println!("#{:<3} {} -> {}", record.index, record.input, record.outputs.join(", "));
        println!("     [{}]", record.raw);
    }
    Ok(())
}

fn default_output(source: &Path) -> PathBuf {
    source.with_extension("kfg")
}

fn cmd_compile(source: &Path, output: Option<PathBuf>) -> miette::Result<()> {
    let table = keycap_config::parse_keymap_source(source)?;
    let output = output.unwrap_or_else(|| default_output(source));

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).into_diagnostic()?;
        }
    }
    table.save(&output).into_diagnostic()?;

    println!(
        "Compiled {} mapping(s) to {}",
        table.len(),
        output.display()
    );
    for (signature, _) in table.conflicts() {
        println!("  warning: {} is bound more than once; the first record wins", signature);
    }

    Ok(())
}

fn cmd_decompile(path: &Path, output: Option<PathBuf>) -> miette::Result<()> {
    let table = MappingTable::load(path).into_diagnostic()?;

    match output {
        Some(output) => {
            keycap_config::write_keymap_source(&table, Some(path), &output)?;
            println!("Wrote mapping source: {}", output.display());
        }
        None => {
            let content = keycap_config::render_keymap_source(&table, Some(path));
            keycap_config::validate_rendered(&content)?;
            print!("{}", content);
        }
    }

    Ok(())
}

fn cmd_devices() -> miette::Result<()> {
    println!("Available input devices:\n");

    let devices = keycap_daemon::device::enumerate_devices()
        .map_err(|e| miette::miette!("{:#}", e))?;

    for device in devices {
        let device_type = if device.is_keyboard { "keyboard" } else { "other" };
        println!("  {} [{}]", device.name, device_type);
        println!("    Path: {}", device.path.display());
        println!("    ID: {}", device.vendor_product());
        println!();
    }

    Ok(())
}

fn load_settings(settings: Option<&str>) -> miette::Result<Settings> {
    let settings_path = match settings {
        Some(path) => expand(path),
        None => keycap_config::default_settings_path(),
    };
    Ok(keycap_config::load_settings(&settings_path)?)
}

fn socket_path(settings: Option<&str>) -> miette::Result<PathBuf> {
    let settings = load_settings(settings)?;
    Ok(settings.global.socket_path.unwrap_or_else(default_socket_path))
}

fn request(settings: Option<&str>, request: IpcRequest) -> miette::Result<IpcResponse> {
    let socket = socket_path(settings)?;
    tracing::debug!("Sending {:?} to {}", request, socket.display());
    send_request(&socket, &request).map_err(|e| miette::miette!("{:#}", e))
}

fn cmd_start(settings: Option<&str>, file: &Path) -> miette::Result<()> {
    // The daemon resolves paths against its own working directory
    let path = std::fs::canonicalize(file).unwrap_or_else(|_| file.to_path_buf());

    match request(settings, IpcRequest::Capture { path: path.clone() })? {
        IpcResponse::Capture { result, code } if result.is_success() => {
            println!("Capturing with {} ({})", path.display(), code);
            Ok(())
        }
        IpcResponse::Capture { result, code } => {
            Err(miette::miette!("{} ({}): {}", result, code, path.display()))
        }
        IpcResponse::Error { message } => Err(miette::miette!("{}", message)),
        other => Err(miette::miette!("Unexpected response: {:?}", other)),
    }
}

fn cmd_stop(settings: Option<&str>) -> miette::Result<()> {
    match request(settings, IpcRequest::Shutdown)? {
        IpcResponse::Success { message } => {
            println!("{}", message.as_deref().unwrap_or("Capture stopped"));
            Ok(())
        }
        IpcResponse::Error { message } => Err(miette::miette!("{}", message)),
        other => Err(miette::miette!("Unexpected response: {:?}", other)),
    }
}

fn cmd_status(settings: Option<&str>) -> miette::Result<()> {
    let status = match request(settings, IpcRequest::Status)? {
        IpcResponse::Status { status } => status,
        IpcResponse::Error { message } => return Err(miette::miette!("{}", message)),
        other => return Err(miette::miette!("Unexpected response: {:?}", other)),
    };

    println!("State: {:?}", status.state);
    if let Some(path) = &status.path {
        println!("  Mapping file: {}", path.display());
        println!("  Mappings: {}", status.mappings);
        println!("  Events seen: {}", status.stats.events_seen);
        println!("  Suppressed: {}", status.stats.suppressed);
        println!("  Chains fired: {}", status.stats.chains_fired);
        println!("  Toggles on: {}", status.toggles_active);
    }
    if let Some(fault) = &status.fault {
        println!("  Fault: {}", fault);
    }

    Ok(())
}
