//! Runs two simulated candidates through a stall, a heal and a switch.
//!
//! ```text
//! RUST_LOG=healer=debug cargo run --example simulate [config.toml]
//! ```
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use healer::surface::TimeRange;
use healer::{EngineConfig, EventSink, MemorySink, PlaybackSurface, SimulatedSurface, StreamEngine, TracingSink};

/// Records every event and also logs it.
struct Tee {
    memory: Arc<MemorySink>,
}

impl EventSink for Tee {
    fn record(&self, record: healer::DiagnosticRecord) {
        TracingSink.record(record.clone());
        self.memory.record(record);
    }
}

#[tokio::main(flavor = "current_thread", start_paused = true)]
async fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };

    let memory = Arc::new(MemorySink::new());
    let engine = StreamEngine::builder()
        .config(config)
        .sink(Arc::new(Tee {
            memory: memory.clone(),
        }))
        .build()?;

    // Primary feed has a hole at 5s and stops being fed at 12s.
    let primary = Arc::new(SimulatedSurface::playing("primary", 0.0, 5.0));
    primary.set_buffered(vec![TimeRange::new(0.0, 5.0), TimeRange::new(6.0, 12.0)]);
    let backup = Arc::new(SimulatedSurface::playing("backup", 0.0, 240.0));

    let primary_id = engine.monitor(primary.clone())?;
    let backup_id = engine.monitor(backup.clone())?;

    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for event in memory.events() {
        *counts.entry(event.name()).or_default() += 1;
    }
    println!("session {}", engine.session_id());
    println!(
        "primary={} at {:.1}s, backup={} at {:.1}s, active={:?}",
        primary_id,
        primary.current_time(),
        backup_id,
        backup.current_time(),
        engine.active()
    );
    println!("{}", serde_json::to_string_pretty(&counts)?);

    engine.shutdown();
    Ok(())
}
