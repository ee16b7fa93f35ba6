// Ingestion loop: classify rig packets, log the run, count brake cycles
//
// Runs on the same task that owns the link. Every iteration polls the link
// once and then yields, so other tasks on the runtime (the sample publisher,
// the Ctrl-C watcher) keep running during acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{POLL_IDLE, SILENCE_WARNING};
use crate::link::Link;
use crate::messages::{Packet, PacketTag};
use crate::run::ExperimentRun;

/// Downstream consumer of accepted encoder samples
///
/// Publishing must never block acquisition; a sink that cannot take a sample
/// right now drops it and returns false.
pub trait SampleSink {
    fn publish(&mut self, sample: &Packet) -> bool;
}

impl SampleSink for mpsc::Sender<Packet> {
    fn publish(&mut self, sample: &Packet) -> bool {
        self.try_send(sample.clone()).is_ok()
    }
}

impl SampleSink for Vec<Packet> {
    fn publish(&mut self, sample: &Packet) -> bool {
        self.push(sample.clone());
        true
    }
}

/// Discards every sample
impl SampleSink for () {
    fn publish(&mut self, _sample: &Packet) -> bool {
        true
    }
}

/// Whether the loop should keep reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Why acquisition stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    CycleLimit,
    LinkClosed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSummary {
    pub packets: usize,
    pub encoder_samples: usize,
    pub unknown_packets: usize,
    pub completed_cycles: u32,
    /// Stream time between the first and last packet (s)
    pub elapsed: f64,
    /// Logged encoder samples per second of stream time
    pub sample_rate: f64,
    pub dropped_samples: usize,
    pub termination: Termination,
}

/// A finished acquisition, ready to persist
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub run: ExperimentRun,
    pub summary: AcquisitionSummary,
}

pub struct PacketClassifier<S: SampleSink> {
    run: ExperimentRun,
    sink: S,
    warmup: f64,
    target_cycles: u32,
    reference_latched: bool,
    prev_brake: u8,
    completed_cycles: u32,
    packets: usize,
    unknown_packets: usize,
    dropped_samples: usize,
    first_timestamp: Option<f64>,
    last_timestamp: f64,
}

impl<S: SampleSink> PacketClassifier<S> {
    /// Classifier that stops after two directions of `run.repeats` cycles
    pub fn new(run: ExperimentRun, sink: S, warmup: f64) -> Self {
        let target_cycles = 2 * run.repeats;
        Self {
            run,
            sink,
            warmup,
            target_cycles,
            reference_latched: false,
            prev_brake: 0,
            completed_cycles: 0,
            packets: 0,
            unknown_packets: 0,
            dropped_samples: 0,
            first_timestamp: None,
            last_timestamp: 0.0,
        }
    }

    pub fn completed_cycles(&self) -> u32 {
        self.completed_cycles
    }

    pub fn run(&self) -> &ExperimentRun {
        &self.run
    }

    /// Route one packet into the run log
    pub fn classify(&mut self, packet: Packet) -> Flow {
        self.packets += 1;
        self.first_timestamp.get_or_insert(packet.timestamp);
        self.last_timestamp = packet.timestamp;

        match (packet.tag, packet.payload.as_slice()) {
            (PacketTag::Encoder, &[enc1, enc2, ..]) => {
                self.on_encoder(&packet, enc1, enc2);
                Flow::Continue
            }
            (PacketTag::BrakeAck, &[value, ..]) => self.on_brake(packet.timestamp, value),
            (PacketTag::MotorAck, &[value, ..]) => {
                let speed = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                debug!("Motor speed '{}' processed", speed);
                self.run.record_motor_command(packet.timestamp, speed);
                Flow::Continue
            }
            _ => {
                self.unknown_packets += 1;
                warn!("Unclassified packet at {:.3}s: {:?}", packet.timestamp, packet);
                Flow::Continue
            }
        }
    }

    fn on_encoder(&mut self, packet: &Packet, enc1: f64, enc2: f64) {
        if !self.reference_latched {
            // Sensors settle during the first seconds of the stream
            if packet.timestamp >= self.warmup {
                info!(
                    "Encoder reference latched at {:.3}s: ({}, {})",
                    packet.timestamp, enc1, enc2
                );
                self.run.record_encoder_start(packet.timestamp, enc1, enc2);
                self.reference_latched = true;
            }
            return;
        }

        self.run.record_encoders(packet.timestamp, enc1, enc2);
        if !self.sink.publish(packet) {
            self.dropped_samples += 1;
            debug!("Sample queue full, dropped sample at {:.3}s", packet.timestamp);
        }
    }

    fn on_brake(&mut self, timestamp: f64, value: f64) -> Flow {
        let brake = value.round().clamp(0.0, 255.0) as u8;
        debug!("Torque value '{}' processed", brake);
        self.run.record_torque_command(timestamp, brake);

        if brake == self.prev_brake {
            return Flow::Continue;
        }
        self.prev_brake = brake;
        if brake != 0 {
            return Flow::Continue;
        }

        self.completed_cycles += 1;
        info!("Cycle {} of {} complete", self.completed_cycles, self.target_cycles);
        if self.completed_cycles >= self.target_cycles {
            info!("Experiment done");
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    /// Drain the link until the cycle limit, a link failure, or cancellation
    pub async fn run_loop<L: Link + ?Sized>(mut self, link: &mut L, running: &AtomicBool) -> Acquisition {
        info!("Cycle 1 of {}", self.target_cycles);
        let mut last_data = Instant::now();
        let mut silence_warned = false;

        let termination = loop {
            if !running.load(Ordering::SeqCst) {
                info!("Acquisition cancelled");
                break Termination::Cancelled;
            }
            if !link.ok() {
                info!("Link closed");
                break Termination::LinkClosed;
            }

            match link.read() {
                Ok(Some(packet)) => {
                    last_data = Instant::now();
                    silence_warned = false;
                    if self.classify(packet) == Flow::Done {
                        break Termination::CycleLimit;
                    }
                    tokio::task::yield_now().await;
                }
                Ok(None) => {
                    if !silence_warned && last_data.elapsed() > SILENCE_WARNING {
                        warn!("No packets found!");
                        silence_warned = true;
                    }
                    tokio::time::sleep(POLL_IDLE).await;
                }
                Err(e) => {
                    warn!("Link failed, ending acquisition: {}", e);
                    break Termination::LinkClosed;
                }
            }
        };

        self.finish(termination)
    }

    /// Close out the run and compute stream statistics
    pub fn finish(self, termination: Termination) -> Acquisition {
        let elapsed = self
            .first_timestamp
            .map(|first| self.last_timestamp - first)
            .unwrap_or_default();
        let encoder_samples = self.run.encoder_samples.len();
        let sample_rate = if elapsed > 0.0 {
            encoder_samples as f64 / elapsed
        } else {
            0.0
        };

        info!(
            "Average encoder sample rate: {:.2} Hz ({} samples over {:.1}s)",
            sample_rate, encoder_samples, elapsed
        );
        if self.dropped_samples > 0 {
            warn!("{} samples dropped by a slow consumer", self.dropped_samples);
        }

        Acquisition {
            summary: AcquisitionSummary {
                packets: self.packets,
                encoder_samples,
                unknown_packets: self.unknown_packets,
                completed_cycles: self.completed_cycles,
                elapsed,
                sample_rate,
                dropped_samples: self.dropped_samples,
                termination,
            },
            run: self.run,
        }
    }
}
