//! motorsense CLI
//!
//! Feature extraction, typing, drawing and voice predictions, a majority
//! vote across them, and activation mosaics from the command line, plus the
//! HTTP service when built with the `server` feature.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use motorsense::{
    config::Config,
    core::GenderEncoding,
    keystroke::{parse_log, Gender, KeystrokeEvent},
    pipeline::{CombinedInputs, DrawingKind, Models, Pipeline},
    usage::{create_shared_log_with_persistence, UsageLog},
    voice::VoiceInput,
    VERSION,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "motorsense")]
#[command(version = VERSION)]
#[command(about = "Typing features and drawing activation mosaics for motor-symptom screening", long_about = None)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the feature vector for a keystroke log
    Features {
        /// JSON array of keystroke records
        #[arg(long)]
        log: PathBuf,

        /// Male or Female
        #[arg(long)]
        gender: String,

        /// Override the configured gender encoding (label or indicator)
        #[arg(long)]
        encoding: Option<GenderEncoding>,

        /// Print CSV instead of JSON
        #[arg(long)]
        csv: bool,
    },

    /// Classify a keystroke log with the typing model
    PredictTyping {
        #[arg(long)]
        log: PathBuf,

        #[arg(long)]
        gender: String,
    },

    /// Classify a drawing with the spiral or wave network
    PredictImage {
        /// spiral or wave
        #[arg(long)]
        kind: DrawingKind,

        image: PathBuf,
    },

    /// Classify voice measurements (JSON object of the 21 measurements)
    PredictVoice { measurements: PathBuf },

    /// Run every supplied input through its model and take a majority vote
    PredictCombined {
        /// Keystroke log; needs --gender
        #[arg(long, requires = "gender")]
        log: Option<PathBuf>,

        #[arg(long)]
        gender: Option<String>,

        #[arg(long)]
        spiral: Option<PathBuf>,

        #[arg(long)]
        wave: Option<PathBuf>,

        /// Voice measurements JSON
        #[arg(long)]
        voice: Option<PathBuf>,
    },

    /// Render activation mosaics for a drawing
    Explain {
        image: PathBuf,

        /// Output directory for PNG mosaics and explanation.json
        #[arg(long, short, default_value = "explanation")]
        output: PathBuf,
    },

    /// Run the HTTP service
    #[cfg(feature = "server")]
    Serve {
        /// Port to bind on 127.0.0.1
        #[arg(long, default_value = "8000")]
        port: u16,
    },

    /// Show loaded models and usage counters
    Status,

    /// Show configuration
    Config {
        /// Write the current (or default) configuration to disk
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config {config_path:?}: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_level);

    match cli.command {
        Commands::Features {
            log,
            gender,
            encoding,
            csv,
        } => cmd_features(config, &log, &gender, encoding, csv),
        Commands::PredictTyping { log, gender } => cmd_predict_typing(config, &log, &gender),
        Commands::PredictImage { kind, image } => cmd_predict_image(config, kind, &image),
        Commands::PredictVoice { measurements } => cmd_predict_voice(config, &measurements),
        Commands::PredictCombined {
            log,
            gender,
            spiral,
            wave,
            voice,
        } => cmd_predict_combined(config, log, gender, spiral, wave, voice),
        Commands::Explain { image, output } => cmd_explain(config, &image, &output),
        #[cfg(feature = "server")]
        Commands::Serve { port } => cmd_serve(config, port),
        Commands::Status => cmd_status(config),
        Commands::Config { init } => cmd_config(config, &config_path, init),
    }
}

/// Log to stderr so command output on stdout stays machine-readable.
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

fn read_log(path: &Path) -> Vec<KeystrokeEvent> {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("could not read {path:?}: {e}")));
    parse_log(&content).unwrap_or_else(|e| fail(e))
}

fn read_bytes(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| fail(format!("could not read {path:?}: {e}")))
}

fn read_voice(path: &Path) -> VoiceInput {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(format!("could not read {path:?}: {e}")));
    VoiceInput::from_json(&content).unwrap_or_else(|e| fail(e))
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => fail(e),
    }
}

/// Pipeline whose usage counters persist under the data directory.
fn persistent_pipeline(config: Config) -> Pipeline {
    let usage = create_shared_log_with_persistence(config.usage_log_path());
    Pipeline::from_config(config).with_usage_log(usage)
}

fn save_usage(pipeline: &Pipeline) {
    if let Err(e) = pipeline.usage().save() {
        tracing::warn!(error = %e, "could not save usage log");
    }
}

fn cmd_features(
    mut config: Config,
    log: &Path,
    gender: &str,
    encoding: Option<GenderEncoding>,
    csv: bool,
) {
    if let Some(encoding) = encoding {
        config.gender_encoding = encoding;
    }
    let gender: Gender = gender.parse().unwrap_or_else(|e| fail(e));
    let log = read_log(log);

    let pipeline = Pipeline::new(config, Models::default());
    let vector = pipeline
        .features(&log, gender)
        .unwrap_or_else(|e| fail(format!("[{}] {e}", e.code())));
    if csv {
        match vector.to_csv() {
            Ok(text) => print!("{text}"),
            Err(e) => fail(e),
        }
    } else {
        print_json(&vector);
    }
}

fn cmd_predict_typing(config: Config, log: &Path, gender: &str) {
    let log = read_log(log);
    let pipeline = persistent_pipeline(config);
    let prediction = pipeline
        .predict_typing(&log, gender)
        .unwrap_or_else(|e| fail(format!("[{}] {e}", e.code())));
    save_usage(&pipeline);
    print_json(&prediction);
}

fn cmd_predict_image(config: Config, kind: DrawingKind, image: &Path) {
    let bytes = read_bytes(image);
    let pipeline = persistent_pipeline(config);
    let prediction = pipeline
        .predict_image(kind, &bytes)
        .unwrap_or_else(|e| fail(format!("[{}] {e}", e.code())));
    save_usage(&pipeline);
    print_json(&prediction);
}

fn cmd_predict_voice(config: Config, measurements: &Path) {
    let input = read_voice(measurements);
    let pipeline = persistent_pipeline(config);
    let prediction = pipeline
        .predict_voice(&input)
        .unwrap_or_else(|e| fail(format!("[{}] {e}", e.code())));
    save_usage(&pipeline);
    print_json(&prediction);
}

fn cmd_predict_combined(
    config: Config,
    log: Option<PathBuf>,
    gender: Option<String>,
    spiral: Option<PathBuf>,
    wave: Option<PathBuf>,
    voice: Option<PathBuf>,
) {
    let inputs = CombinedInputs {
        typing: log.map(|path| (read_log(&path), gender.unwrap_or_default())),
        spiral: spiral.as_deref().map(read_bytes),
        wave: wave.as_deref().map(read_bytes),
        voice: voice.as_deref().map(read_voice),
    };
    let pipeline = persistent_pipeline(config);
    let report = pipeline.predict_combined(&inputs);
    save_usage(&pipeline);
    print_json(&report);
}

fn write_data_url(url: &str, path: &Path) -> Result<(), String> {
    let payload = url
        .strip_prefix("data:image/png;base64,")
        .ok_or_else(|| "not a PNG data URL".to_string())?;
    let png = STANDARD.decode(payload).map_err(|e| e.to_string())?;
    std::fs::write(path, png).map_err(|e| e.to_string())
}

fn cmd_explain(config: Config, image: &Path, output: &Path) {
    let bytes = read_bytes(image);
    let pipeline = persistent_pipeline(config);
    let explanation = pipeline
        .explain(&bytes)
        .unwrap_or_else(|e| fail(format!("[{}] {e}", e.code())));
    save_usage(&pipeline);

    if let Err(e) = std::fs::create_dir_all(output) {
        fail(format!("could not create {output:?}: {e}"));
    }
    if let Err(e) = write_data_url(&explanation.preview, &output.join("preview.png")) {
        eprintln!("Warning: could not write preview: {e}");
    }

    println!("Activations from '{}' network:", explanation.source);
    for (index, layer) in explanation.layers.iter().enumerate() {
        match (&layer.mosaic, &layer.error) {
            (Some(url), _) => {
                let path = output.join(format!("{index:02}_{}.png", layer.name));
                match write_data_url(url, &path) {
                    Ok(()) => println!(
                        "  {} ({}, {}/{} channels) -> {:?}",
                        layer.name, layer.layer_type, layer.channels_shown, layer.channels, path
                    ),
                    Err(e) => eprintln!("  {}: could not write mosaic: {e}", layer.name),
                }
            }
            (None, error) => println!(
                "  {} ({}): skipped: {}",
                layer.name,
                layer.layer_type,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }

    let json_path = output.join("explanation.json");
    match serde_json::to_string_pretty(&explanation) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&json_path, json) {
                eprintln!("Error writing {json_path:?}: {e}");
            }
        }
        Err(e) => eprintln!("Error serializing explanation: {e}"),
    }
}

#[cfg(feature = "server")]
fn cmd_serve(config: Config, port: u16) {
    use motorsense::server::{run, ServerConfig, ServerState};

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| fail(e));
    let pipeline = persistent_pipeline(config);
    let state = ServerState::new(pipeline);
    let usage = std::sync::Arc::clone(state.pipeline().usage());

    let (addr, shutdown_tx) = runtime
        .block_on(run(ServerConfig::new(port), state))
        .unwrap_or_else(|e| fail(e));
    println!("motorsense v{VERSION} listening on http://{addr}");
    println!("Press Ctrl+C to stop");

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        fail(format!("could not set Ctrl+C handler: {e}"));
    }
    let _ = stop_rx.recv();

    let _ = shutdown_tx.send(());
    // let in-flight requests finish
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    if let Err(e) = usage.save() {
        eprintln!("Warning: Could not save usage log: {e}");
    }
    println!();
    println!("{}", usage.summary());
}

fn cmd_status(config: Config) {
    println!("motorsense v{VERSION}");
    println!();

    println!("Models:");
    let models = &config.models;
    for (name, path) in [
        ("typing", &models.typing),
        ("voice", &models.voice),
        ("spiral", &models.spiral),
        ("wave", &models.wave),
    ] {
        let state = if path.exists() { "found" } else { "missing" };
        println!("  {name}: {state} ({path:?})");
    }
    println!("  Explain candidates: {}", config.explain_candidates.join(", "));
    println!();

    let usage_path = config.usage_log_path();
    if usage_path.exists() {
        println!("{}", UsageLog::with_persistence(usage_path).summary());
    } else {
        println!("No usage recorded yet.");
    }
}

fn cmd_config(config: Config, path: &Path, init: bool) {
    if init {
        if let Err(e) = config.save_to(path) {
            fail(format!("could not save config: {e}"));
        }
        println!("Wrote {path:?}");
        return;
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    print_json(&config);
}
