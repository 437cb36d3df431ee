//! Staged pipeline: frame source -> channelizer -> delay compensation ->
//! correlator -> emitter -> sink.
//!
//! Frames are processed strictly in sequence-number order. Finished
//! artifacts cross to a dedicated sink thread over a bounded hand-off
//! queue; the configured policy decides whether a slow sink blocks
//! production or sheds artifacts with a reported overrun.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Config, SinkPolicy, SourceMode};
use crate::delay::DelayCompensator;
use crate::errors::{FxError, FxResult};
use crate::fengine::Channelizer;
use crate::geom::{self, ArrayGeometry};
use crate::output::{Sink, VisibilityArtifact};
use crate::source::{FrameSource, ReplaySource, SyntheticSource};
use crate::xengine::{Baseline, XEngine};

/// Finished artifacts buffered between emitter and sink before
/// back-pressure (or shedding) kicks in.
const EMIT_QUEUE_DEPTH: usize = 4;

/// Cooperative cancellation flag, checked once per frame. A cancelled run
/// finishes its in-flight frame and discards any partial integration
/// without flushing it.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-run accounting so an operator can reconcile data loss exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub frames: u64,
    pub slices: u64,
    pub integrations_emitted: u64,
    pub chunks_dropped: u64,
    pub desyncs: u64,
    pub overruns: u64,
    pub sink_failures: u64,
}

/// Build the frame source described by the configuration. The external feed
/// variant is driven programmatically and cannot be built from config alone.
pub fn source_from_config(
    cfg: &Config,
    geometry: &ArrayGeometry,
) -> FxResult<Box<dyn FrameSource>> {
    match cfg.mode {
        SourceMode::Synthetic => {
            let directions: Vec<[f64; 3]> = cfg
                .source_angles_deg
                .iter()
                .map(|deg| geom::direction_from_azimuth(deg.to_radians()))
                .collect();
            Ok(Box::new(SyntheticSource::new(
                geometry,
                cfg.sample_rate,
                cfg.frame_len,
                &directions,
                cfg.tone_freq,
                cfg.snr_db,
                cfg.duration,
                cfg.realtime,
                cfg.seed,
            )))
        }
        SourceMode::Replay => {
            let path = cfg
                .input_file
                .as_ref()
                .ok_or_else(|| FxError::config("replay mode requires an input file"))?;
            Ok(Box::new(ReplaySource::open(
                std::path::Path::new(path),
                cfg.n_ants,
                cfg.frame_len,
            )?))
        }
        SourceMode::Feed => Err(FxError::config(
            "feed mode takes an externally constructed FeedSource",
        )),
    }
}

pub struct Pipeline {
    cfg: Config,
    channelizer: Channelizer,
    compensator: DelayCompensator,
    xengine: XEngine,
    baselines: Arc<Vec<Baseline>>,
    channel_freqs: Arc<Vec<f64>>,
}

impl Pipeline {
    pub fn new(cfg: &Config) -> FxResult<Self> {
        cfg.validate()?;
        let geometry = ArrayGeometry::from_config(cfg)?;
        let channelizer = Channelizer::new(cfg)?;
        let channel_freqs = Arc::new(cfg.channel_freqs());
        let mut compensator =
            DelayCompensator::new(geometry, channel_freqs.as_ref().clone());
        if let Some(direction) = cfg.phase_center {
            compensator.set_phase_center(direction)?;
        }
        let xengine = XEngine::new(cfg)?;
        let baselines = Arc::new(xengine.baselines().to_vec());
        Ok(Self {
            cfg: cfg.clone(),
            channelizer,
            compensator,
            xengine,
            baselines,
            channel_freqs,
        })
    }

    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    /// Drive the source to exhaustion (or cancellation), delivering finished
    /// integrations to the sink in strictly increasing index order.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sink: Box<dyn Sink>,
        cancel: &CancelToken,
    ) -> FxResult<RunReport> {
        let (tx, rx) = mpsc::sync_channel::<VisibilityArtifact>(EMIT_QUEUE_DEPTH);
        let sink_failures = Arc::new(AtomicU64::new(0));
        let halt = Arc::new(AtomicBool::new(false));
        let halt_on_sink_error = self.cfg.halt_on_sink_error;

        // --- Sink consumer thread ---
        let sink_thread = {
            let sink_failures = Arc::clone(&sink_failures);
            let halt = Arc::clone(&halt);
            thread::spawn(move || -> FxResult<()> {
                let mut sink = sink;
                let mut first_error = None;
                for artifact in rx {
                    let index = artifact.index;
                    if let Err(e) = sink.deliver(artifact) {
                        tracing::error!(integration = index, error = %e, "sink failed");
                        sink_failures.fetch_add(1, Ordering::Relaxed);
                        if halt_on_sink_error {
                            halt.store(true, Ordering::Relaxed);
                            first_error = Some(match e {
                                e @ FxError::Sink { .. } => e,
                                other => FxError::Sink {
                                    index,
                                    reason: other.to_string(),
                                },
                            });
                            break;
                        }
                    }
                }
                sink.finish()?;
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
        };

        let mut report = RunReport::default();
        let mut expected_seq: Option<u64> = None;
        let mut next_index: u64 = 0;
        let mut window_seq_first: Option<u64> = None;

        'run: loop {
            if cancel.is_cancelled() {
                let pending = self.xengine.slices_accumulated();
                if pending > 0 {
                    tracing::info!(
                        slices = pending,
                        "cancelled; discarding partial integration"
                    );
                }
                self.xengine.discard();
                break;
            }
            if halt.load(Ordering::Relaxed) {
                break;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(FxError::SourceDesync { expected, got }) => {
                    report.desyncs += 1;
                    let discarded = self.xengine.slices_accumulated();
                    self.xengine.discard();
                    window_seq_first = None;
                    expected_seq = None;
                    tracing::warn!(
                        expected,
                        got,
                        discarded_slices = discarded,
                        "source desynchronised; partial integration discarded"
                    );
                    continue;
                }
                Err(FxError::Processing { seq, reason }) => {
                    report.chunks_dropped += 1;
                    tracing::warn!(seq, %reason, "dropping malformed chunk");
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Ordering check for sources that do not police their own
            // sequence numbers.
            if let Some(expected) = expected_seq {
                if frame.seq != expected {
                    report.desyncs += 1;
                    let discarded = self.xengine.slices_accumulated();
                    self.xengine.discard();
                    window_seq_first = None;
                    tracing::warn!(
                        expected,
                        got = frame.seq,
                        discarded_slices = discarded,
                        "sequence gap; partial integration discarded"
                    );
                }
            }
            expected_seq = Some(frame.seq + 1);
            let frame_seq = frame.seq;
            report.frames += 1;

            let mut spectrum = match self.channelizer.process(frame) {
                Ok(spectrum) => spectrum,
                Err(FxError::Processing { seq, reason }) => {
                    report.chunks_dropped += 1;
                    tracing::warn!(seq, %reason, "channelizer rejected chunk");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = self.compensator.apply(&mut spectrum) {
                report.chunks_dropped += 1;
                tracing::warn!(seq = frame_seq, error = %e, "delay compensation rejected chunk");
                continue;
            }

            for spec_idx in 0..spectrum.n_spectra() {
                if window_seq_first.is_none() {
                    window_seq_first = Some(frame_seq);
                }
                let products = match self.xengine.correlate(&spectrum, spec_idx) {
                    Ok(products) => products,
                    Err(FxError::Processing { seq, reason }) => {
                        report.chunks_dropped += 1;
                        tracing::warn!(seq, %reason, "correlator rejected chunk");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                self.xengine.accumulate(frame_seq, &products)?;
                report.slices += 1;

                if !self.xengine.is_ready() {
                    continue;
                }
                let Some(flushed) = self.xengine.flush() else {
                    continue;
                };
                let artifact = VisibilityArtifact {
                    index: next_index,
                    timestamp_unix_s: unix_now(),
                    n_slices: flushed.n_slices,
                    seq_first: window_seq_first.take().unwrap_or(frame_seq),
                    seq_last: frame_seq,
                    baselines: Arc::clone(&self.baselines),
                    channel_freqs: Arc::clone(&self.channel_freqs),
                    matrix: flushed.matrix,
                };
                next_index += 1;

                match self.cfg.sink_policy {
                    SinkPolicy::Block => {
                        if tx.send(artifact).is_err() {
                            // Sink thread is gone; its result explains why.
                            break 'run;
                        }
                        report.integrations_emitted += 1;
                    }
                    SinkPolicy::Drop => match tx.try_send(artifact) {
                        Ok(()) => report.integrations_emitted += 1,
                        Err(TrySendError::Full(lost)) => {
                            report.overruns += 1;
                            tracing::warn!(
                                integration = lost.index,
                                "output queue full; artifact dropped"
                            );
                        }
                        Err(TrySendError::Disconnected(_)) => break 'run,
                    },
                }

                if let Some(max) = self.cfg.max_integrations {
                    if next_index >= max {
                        break 'run;
                    }
                }
            }
        }

        drop(tx);
        let sink_result = sink_thread
            .join()
            .map_err(|_| FxError::Sink {
                index: next_index,
                reason: "sink thread panicked".into(),
            })?;
        report.sink_failures = sink_failures.load(Ordering::Relaxed);

        if self.xengine.slices_accumulated() > 0 {
            // Partial integrations are never emitted, end of stream included.
            tracing::info!(
                slices = self.xengine.slices_accumulated(),
                "discarding trailing partial integration"
            );
            self.xengine.discard();
        }

        match sink_result {
            Err(e) if halt_on_sink_error => Err(e),
            Err(e) => {
                tracing::error!(error = %e, "sink reported failures");
                Ok(report)
            }
            Ok(()) => Ok(report),
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
