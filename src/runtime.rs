// Acquisition and batch analysis entry points
//
// Acquisition: the sequencer queues its timeline on the link, the classifier
// drains the link on this task, encoder samples go through a bounded queue to
// a zenoh publisher task. Ctrl-C clears the running flag; the rig is always
// idled and the (possibly partial) run is saved.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::{Acquisition, PacketClassifier, SampleSink};
use crate::config::{
    GEAR_RATIO, SAMPLE_QUEUE_DEPTH, SIM_DEGREES_PER_NEWTON_METER, SIM_SAMPLE_PERIOD, SIM_SPIN_RATE,
    TOPIC_SAMPLES, WARMUP_DELAY,
};
use crate::error::CalibrationError;
use crate::link::Link;
use crate::link::sim::{RigModel, SimulatedRig};
use crate::lookup::BrakeLookup;
use crate::messages::Packet;
use crate::pipeline::{CalibrationPipeline, CalibrationResult, PipelineConfig};
use crate::run::{BrakeKind, ExperimentRun, Geometry};
use crate::sequencer::{CommandSequencer, SequenceParams};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What to run and where to put it
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub brake_kind: BrakeKind,
    pub geometry: Geometry,
    pub params: SequenceParams,
    pub output_dir: PathBuf,
    /// Forward encoder samples to zenoh
    pub publish: bool,
    pub warmup: f64,
}

impl AcquireOptions {
    pub fn new(brake_kind: BrakeKind, geometry: Geometry, params: SequenceParams, output_dir: PathBuf) -> Self {
        Self {
            brake_kind,
            geometry,
            params,
            output_dir,
            publish: true,
            warmup: WARMUP_DELAY,
        }
    }
}

/// Rig stand-in for dry runs without hardware
pub fn dry_run_rig(lookup: BrakeLookup) -> SimulatedRig {
    let model = RigModel {
        lookup,
        degrees_per_newton_meter: SIM_DEGREES_PER_NEWTON_METER,
        gear_ratio: GEAR_RATIO,
        spin_rate: SIM_SPIN_RATE,
        encoder_offsets: [0.0, 0.0],
        backlash_deg: 0.0,
    };
    SimulatedRig::new(model, SIM_SAMPLE_PERIOD)
}

/// Run one experiment on `link` and save it under `options.output_dir`
pub async fn acquire<L: Link + ?Sized>(link: &mut L, options: &AcquireOptions) -> Result<(Acquisition, PathBuf), BoxError> {
    let sequencer = CommandSequencer::new(options.params)?;
    let run = ExperimentRun::new(options.brake_kind, options.geometry, &options.params);
    info!(
        "Starting {} experiment on {}: {} cycles, about {:.0}s",
        options.brake_kind.file_name(),
        run.geometry.key(),
        sequencer.expected_cycles(),
        sequencer.duration()
    );

    let (sink, publisher) = if options.publish {
        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE_DEPTH);
        (Some(tx), Some(spawn_sample_publisher(rx).await?))
    } else {
        (None, None)
    };

    let running = Arc::new(AtomicBool::new(true));
    let ctrl_c = spawn_ctrl_c_watch(running.clone());

    let acquisition = if let (Some(tx), Some(publisher)) = (sink, publisher) {
        let acquisition = collect(link, &sequencer, run, tx, options.warmup, &running).await;
        // Sender dropped with the classifier; the publisher drains and exits
        if let Err(e) = publisher.await {
            warn!("Sample publisher task failed: {}", e);
        }
        acquisition
    } else {
        collect(link, &sequencer, run, (), options.warmup, &running).await
    };
    ctrl_c.abort();

    info!(
        "Acquisition ended ({:?}) after {} of {} cycles",
        acquisition.summary.termination,
        acquisition.summary.completed_cycles,
        sequencer.expected_cycles()
    );
    let path = acquisition.run.save(&options.output_dir)?;
    Ok((acquisition, path))
}

async fn collect<L: Link + ?Sized, S: SampleSink>(
    link: &mut L,
    sequencer: &CommandSequencer,
    run: ExperimentRun,
    sink: S,
    warmup: f64,
    running: &AtomicBool,
) -> Acquisition {
    sequencer.schedule(link);
    let classifier = PacketClassifier::new(run, sink, warmup);
    let acquisition = classifier.run_loop(link, running).await;
    // Idle the rig whatever ended the loop
    link.stop();
    acquisition
}

fn spawn_ctrl_c_watch(running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping acquisition");
            running.store(false, Ordering::SeqCst);
        }
    })
}

/// Forward queued samples to zenoh as JSON until the queue closes
async fn spawn_sample_publisher(mut rx: mpsc::Receiver<Packet>) -> Result<JoinHandle<()>, BoxError> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_SAMPLES).await?;
    info!("Publishing samples to: {}", TOPIC_SAMPLES);

    Ok(tokio::spawn(async move {
        let mut forwarded = 0usize;
        while let Some(sample) = rx.recv().await {
            let json = match serde_json::to_string(&sample) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode sample: {}", e);
                    continue;
                }
            };
            match publisher.put(json).await {
                Ok(()) => forwarded += 1,
                Err(e) => warn!("Failed to publish sample: {}", e),
            }
        }
        debug!("Sample publisher done, {} samples forwarded", forwarded);
        drop(publisher);
        drop(session);
    }))
}

/// Analyze each run file, loading lookup tables once per brake kind
///
/// Failures carry the offending path; one bad file does not stop the rest.
pub fn analyze_files(
    paths: &[PathBuf],
    tables_dir: &Path,
    config: PipelineConfig,
) -> Vec<(PathBuf, Result<CalibrationResult, CalibrationError>)> {
    let mut lookups: Vec<(BrakeKind, BrakeLookup)> = Vec::new();

    paths
        .iter()
        .map(|path| {
            let result = analyze_one(path, tables_dir, config, &mut lookups).map_err(|e| e.in_run(path));
            if let Err(e) = &result {
                warn!("Analysis failed: {}", e);
            }
            (path.clone(), result)
        })
        .collect()
}

fn analyze_one(
    path: &Path,
    tables_dir: &Path,
    config: PipelineConfig,
    lookups: &mut Vec<(BrakeKind, BrakeLookup)>,
) -> Result<CalibrationResult, CalibrationError> {
    let run = ExperimentRun::load(path)?;
    let index = match lookups.iter().position(|(kind, _)| *kind == run.brake_kind) {
        Some(index) => index,
        None => {
            lookups.push((run.brake_kind, BrakeLookup::load_or_build(tables_dir, run.brake_kind)?));
            lookups.len() - 1
        }
    };
    CalibrationPipeline::new(config, &lookups[index].1).run(&run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Termination;
    use crate::config;

    fn short_params() -> SequenceParams {
        SequenceParams {
            commanded_motor_speed: 255,
            command_interval: 8,
            time_interval: 0.5,
            max_torque_command: 32,
            repeats: 1,
        }
    }

    #[tokio::test]
    async fn test_dry_run_acquisition_is_saved() {
        let dir = std::env::temp_dir().join(format!("brake_acquire_test_{}", std::process::id()));
        let lookup = BrakeLookup::build(BrakeKind::Small).unwrap();
        let mut rig = dry_run_rig(lookup);

        let mut options = AcquireOptions::new(BrakeKind::Small, config::default_geometry(), short_params(), dir.clone());
        options.publish = false;

        let (acquisition, path) = acquire(&mut rig, &options).await.unwrap();
        assert_eq!(acquisition.summary.termination, Termination::CycleLimit);
        assert_eq!(acquisition.summary.completed_cycles, 2);
        assert!(!rig.ok());

        let saved = ExperimentRun::load(&path).unwrap();
        assert_eq!(saved, acquisition.run);
        assert!(saved.encoder_samples.iter().all(|s| s.0 >= WARMUP_DELAY));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_analyze_reports_failing_paths() {
        let dir = std::env::temp_dir().join(format!("brake_analyze_test_{}", std::process::id()));
        let missing = dir.join("does_not_exist.json");

        let results = analyze_files(&[missing.clone()], &dir, PipelineConfig::default());
        assert_eq!(results.len(), 1);
        let (path, result) = &results[0];
        assert_eq!(path, &missing);
        match result {
            Err(CalibrationError::InRun { path, .. }) => assert_eq!(path, &missing),
            other => panic!("expected a path-tagged error, got {:?}", other),
        }
    }
}
