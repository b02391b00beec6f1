//! Full play cycle against the simulated hardware backend.

use anyhow::{Context, anyhow};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

use crate::bridge::{Bridge, MainLoop};
use crate::config::Config;
use crate::hardware::sim::{SimHandle, simulated};
use crate::hardware::{Hardware, ServiceRef};
use crate::renderer::{Controller, RendererEvent, Source, TransportState, format_duration};

/// What the tuner is showing before the renderer takes over.
const LIVE_SERVICE: &str = "1:0:19:283D:3FB:1:C00000:0:0:0:";

/// Delay between a tune and the simulated `Start` notification.
const START_DELAY: Duration = Duration::from_millis(200);

/// Playback time simulated before the position is read.
const PLAYED: Duration = Duration::from_secs(1);

/// Options of the `simulate` command.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub uri: String,
    pub metadata: Option<PathBuf>,
    pub seek: Option<u64>,
    pub json: bool,
}

/// A renderer event and when it arrived.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub at_ms: u128,
    pub event: RendererEvent,
}

/// Outcome of a simulated play cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub source: Source,
    pub duration: Option<String>,
    pub position: Option<String>,
    /// Service handed back once the session closed
    pub restored: Option<String>,
    pub timeline: Vec<TimelineEntry>,
}

/// Run the simulation and print its report.
pub fn cmd_simulate(config: &Config, options: &SimulateOptions) -> anyhow::Result<()> {
    let report = simulate(config, options)?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Source:    {} ({}, {:?})",
        report.source.uri, report.source.mime_type, report.source.kind
    );
    if let Some(title) = &report.source.title {
        println!("Title:     {}", title);
    }
    println!("Duration:  {}", report.duration.as_deref().unwrap_or("-"));
    println!("Position:  {}", report.position.as_deref().unwrap_or("-"));
    println!("Restored:  {}", report.restored.as_deref().unwrap_or("-"));
    println!("Timeline:");
    for entry in &report.timeline {
        println!("  {:>6}ms  {:?}", entry.at_ms, entry.event);
    }
    Ok(())
}

/// Play `options.uri` on simulated hardware: play, optional seek, stop,
/// then wait for the idle watchdog to hand the tuner back.
pub fn simulate(config: &Config, options: &SimulateOptions) -> anyhow::Result<SimulationReport> {
    let metadata = options
        .metadata
        .as_ref()
        .map(|path| {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read metadata from {}", path.display()))
        })
        .transpose()?;
    let source = Source::resolve(&options.uri, metadata.as_deref())
        .with_context(|| format!("Cannot play {}", options.uri))?;

    let (main_loop, bridge) = MainLoop::new(&config.bridge);
    let context = main_loop
        .spawn()
        .context("Failed to start the main loop")?;

    let live: ServiceRef = LIVE_SERVICE.parse()?;
    let (hardware, sim) = simulated(Some(live));
    sim.set_auto_show(true);

    let result = drive(config, options, &bridge, hardware, &sim, source, metadata);

    bridge.shutdown();
    context
        .join()
        .map_err(|_| anyhow!("Main loop thread panicked"))?;
    result
}

fn drive(
    config: &Config,
    options: &SimulateOptions,
    bridge: &Bridge,
    hardware: Hardware,
    sim: &SimHandle,
    source: Source,
    metadata: Option<String>,
) -> anyhow::Result<SimulationReport> {
    let controller = Controller::new(bridge.clone(), hardware, &config.renderer)?;
    sim.connect(bridge.clone(), controller.event_feed(), START_DELAY);

    let events = controller.subscribe();
    let mut timeline = Timeline::new(events, config.bridge.blocking_timeout());

    info!(renderer = %controller.friendly_name(), uri = %options.uri, "Starting simulation");
    controller.set_source(&options.uri, metadata.as_deref());
    controller.play();
    timeline.wait_for(|e| *e == RendererEvent::StateChanged(TransportState::Playing))?;

    if let Some(secs) = options.seek {
        controller.seek(Duration::from_secs(secs))?;
    }
    sim.advance_position(PLAYED);
    let position = controller.current_position()?;
    let duration = controller.current_track_duration();

    controller.stop()?;
    timeline.extend_wait(config.renderer.idle_timeout());
    timeline.wait_for(|e| *e == RendererEvent::SessionClosed)?;

    Ok(SimulationReport {
        source,
        duration: duration.map(format_duration),
        position: position.map(format_duration),
        restored: sim.playing().map(|service| service.to_string()),
        timeline: timeline.entries,
    })
}

struct Timeline {
    events: Receiver<RendererEvent>,
    started: Instant,
    wait: Duration,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    fn new(events: Receiver<RendererEvent>, wait: Duration) -> Self {
        Self {
            events,
            started: Instant::now(),
            wait,
            entries: Vec::new(),
        }
    }

    fn extend_wait(&mut self, by: Duration) {
        self.wait += by;
    }

    /// Record events until one matches `done`.
    fn wait_for(&mut self, done: impl Fn(&RendererEvent) -> bool) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self
                .events
                .recv_timeout(remaining)
                .map_err(|_| anyhow!("Renderer did not respond within {:?}", self.wait))?;
            let finished = done(&event);
            self.entries.push(TimelineEntry {
                at_ms: self.started.elapsed().as_millis(),
                event,
            });
            if finished {
                return Ok(());
            }
        }
    }
}
