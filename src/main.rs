//! Tile Delta Cache - replay and inspect tile delta streams.
//!
//! `replay` drives a headless engine with a recorded trace and prints a JSON
//! report; `inspect` rebuilds a single tile from its chunk files.

use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bytes::Bytes;
use tile_delta_cache::{
    config::{Cli, Command, InspectConfig, ReplayConfig},
    host::RenderEvents,
    protocol::{Payload, TileMessageKind},
    tile::{DeltaDecoder, RawDeltaChunk},
    PixelBounds, RecordingHost, TileEngine, TileStats, ViewState,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Replay(config) => run_replay(config).await,
        Command::Inspect(config) => run_inspect(config),
    }
}

// =============================================================================
// Replay Command
// =============================================================================

/// What a replay run produced.
#[derive(Debug, Serialize)]
struct ReplayReport {
    frames: usize,
    skipped_lines: usize,
    messages_sent: usize,
    events: RenderEvents,
    stats: TileStats,
}

async fn run_replay(config: ReplayConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let trace = match std::fs::read_to_string(&config.trace) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to read trace {}: {}", config.trace.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let engine_config = config.engine.to_engine_config();
    let host = RecordingHost::new(
        engine_config.tile_size as i32,
        config.doc_tiles_wide,
        config.doc_tiles_high,
    );
    let mut engine = TileEngine::new(host, engine_config);
    engine.set_view(ViewState {
        zoom: config.zoom,
        pixel_bounds: PixelBounds::from_origin_size(0, 0, config.view_width, config.view_height),
        doc_kind: config.doc_kind.into(),
        ..ViewState::default()
    });

    info!(
        "Replaying {} ({}x{} view, {}x{} tile document)",
        config.trace.display(),
        config.view_width,
        config.view_height,
        config.doc_tiles_wide,
        config.doc_tiles_high
    );
    engine.update();

    let mut frames = 0;
    let mut skipped_lines = 0;
    for (n, line) in trace.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_trace_line(line) {
            Ok(frame) => {
                engine.on_message(frame);
                engine.poll_worker();
                frames += 1;
            }
            Err(e) => {
                warn!("Line {}: {}", n + 1, e);
                skipped_lines += 1;
            }
        }
    }

    engine.wait_for_worker().await;
    engine.poll_timers(Instant::now());
    engine.flush_acknowledgements();
    debug!(frames, skipped_lines, "Replay finished");

    let report = ReplayReport {
        frames,
        skipped_lines,
        messages_sent: engine.host().sent.len(),
        events: engine.host().events,
        stats: engine.stats(),
    };
    let json = if config.pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    };
    match json {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize report: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// `<header>[\t<hex payload>]` to a raw frame.
fn parse_trace_line(line: &str) -> Result<Bytes, String> {
    let (header, payload) = line.split_once('\t').unwrap_or((line, ""));
    let payload = hex::decode(payload.trim()).map_err(|e| format!("bad hex payload: {}", e))?;

    let mut frame = Vec::with_capacity(header.len() + 1 + payload.len());
    frame.extend_from_slice(header.as_bytes());
    if !payload.is_empty() {
        frame.push(b'\n');
        frame.extend_from_slice(&payload);
    }
    Ok(Bytes::from(frame))
}

// =============================================================================
// Inspect Command
// =============================================================================

fn run_inspect(config: InspectConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let mut chunks = Vec::with_capacity(config.chunks.len());
    for (n, path) in config.chunks.iter().enumerate() {
        let kind = if n == 0 {
            TileMessageKind::Tile
        } else {
            TileMessageKind::Delta
        };
        match read_chunk(path, n as u64 + 1, kind) {
            Ok(Some(chunk)) => chunks.push(chunk),
            Ok(None) => debug!("{}: unchanged, skipped", path.display()),
            Err(e) => {
                error!("{}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    let decoder = DeltaDecoder::new(config.tile_size as usize).with_debug(config.debug_deltas);
    let pixels = match decoder.rehydrate(&chunks, None) {
        Ok(pixels) => pixels,
        Err(e) => {
            error!("Failed to rebuild tile: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let Some(image) = image::RgbaImage::from_raw(config.tile_size, config.tile_size, pixels) else {
        error!("Decoded tile does not match tile size {}", config.tile_size);
        return ExitCode::FAILURE;
    };
    if let Err(e) = image.save(&config.output) {
        error!("Failed to write {}: {}", config.output.display(), e);
        return ExitCode::FAILURE;
    }

    info!(
        "Wrote {} from {} chunk(s)",
        config.output.display(),
        chunks.len()
    );
    ExitCode::SUCCESS
}

/// Load one chunk file, classifying it by its marker byte.
fn read_chunk(path: &Path, id: u64, kind: TileMessageKind) -> Result<Option<RawDeltaChunk>, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let payload = Payload::classify(Bytes::from(bytes), kind);
    let is_keyframe = payload.is_keyframe();
    match payload.bytes() {
        Some(bytes) => Ok(Some(RawDeltaChunk::new(bytes.clone(), id, is_keyframe))),
        None if matches!(payload, Payload::Unchanged) => Ok(None),
        None => Err("empty chunk file".to_string()),
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tile_delta_cache=debug"
    } else {
        "tile_delta_cache=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
