//! Frame sources: where time-domain sample windows come from.
//!
//! Every variant exposes the same capability, "deliver the next frame or
//! signal end of stream", behind the [`FrameSource`] trait. The synthetic
//! and replay variants are deterministic and re-seekable; an external feed
//! is consumed once and owns sequence-gap detection.

use std::io::{Read, Seek, SeekFrom};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use num_complex::Complex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::errors::{FxError, FxResult};
use crate::geom::ArrayGeometry;

/// A contiguous, gap-free block of complex samples for all antennas.
/// Ownership moves downstream; no stage holds a frame after handing it on.
#[derive(Clone, Debug)]
pub struct SignalFrame {
    pub seq: u64,
    /// `samples[ant][t]`, one row per antenna, all rows the same length.
    pub samples: Vec<Vec<Complex<f64>>>,
}

impl SignalFrame {
    pub fn n_ants(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, |row| row.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait FrameSource {
    /// Deliver the next frame, or `Ok(None)` once the stream is exhausted.
    fn next_frame(&mut self) -> FxResult<Option<SignalFrame>>;

    /// Whether [`FrameSource::restart`] rewinds to the first frame.
    fn restartable(&self) -> bool {
        false
    }

    fn restart(&mut self) -> FxResult<()> {
        Err(FxError::config("this frame source is not restartable"))
    }
}

/// Tone-plus-noise simulation for an antenna array.
///
/// Each configured source direction contributes a unit-amplitude complex
/// tone, arriving at antenna a with the true geometric delay
/// `(b_a . s) / C`. Noise power is calibrated against the mean signal power
/// for the requested SNR in dB; a non-finite SNR disables noise entirely.
pub struct SyntheticSource {
    n_ants: usize,
    sample_rate: f64,
    frame_len: usize,
    tone_freq: f64,
    snr_db: f64,
    seed: u64,
    realtime: bool,
    /// Per source direction, the unreferenced arrival delay of each antenna.
    source_delays: Vec<Vec<f64>>,
    total_frames: Option<u64>,
    rng: StdRng,
    seq: u64,
    sample_counter: u64,
}

impl SyntheticSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        geometry: &ArrayGeometry,
        sample_rate: f64,
        frame_len: usize,
        directions: &[[f64; 3]],
        tone_freq: f64,
        snr_db: f64,
        duration: Option<f64>,
        realtime: bool,
        seed: u64,
    ) -> Self {
        let source_delays = directions
            .iter()
            .map(|&dir| geometry.raw_delays_toward(dir))
            .collect();
        let total_frames =
            duration.map(|secs| ((secs * sample_rate) / frame_len as f64).floor() as u64);
        Self {
            n_ants: geometry.n_ants(),
            sample_rate,
            frame_len,
            tone_freq,
            snr_db,
            seed,
            realtime,
            source_delays,
            total_frames,
            rng: StdRng::seed_from_u64(seed),
            seq: 0,
            sample_counter: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> FxResult<Option<SignalFrame>> {
        if let Some(total) = self.total_frames {
            if self.seq >= total {
                return Ok(None);
            }
        }

        let mut samples =
            vec![vec![Complex::new(0.0, 0.0); self.frame_len]; self.n_ants];
        let omega = 2.0 * std::f64::consts::PI * self.tone_freq;
        for delays in &self.source_delays {
            for (ant, row) in samples.iter_mut().enumerate() {
                let tau = delays[ant];
                for (k, value) in row.iter_mut().enumerate() {
                    let t = (self.sample_counter + k as u64) as f64 / self.sample_rate;
                    *value += Complex::from_polar(1.0, omega * (t - tau));
                }
            }
        }

        if self.snr_db.is_finite() && !self.source_delays.is_empty() {
            let snr_linear = 10f64.powf(self.snr_db / 10.0);
            let mut power = 0.0;
            for row in &samples {
                for value in row {
                    power += value.norm_sqr();
                }
            }
            power /= (self.n_ants * self.frame_len) as f64;
            // Split the noise power evenly between the two components.
            let sigma = (power / snr_linear / 2.0).sqrt();
            if sigma > 0.0 {
                let normal = Normal::new(0.0, sigma)
                    .map_err(|e| FxError::config(format!("bad noise sigma: {e}")))?;
                for row in &mut samples {
                    for value in row.iter_mut() {
                        value.re += normal.sample(&mut self.rng);
                        value.im += normal.sample(&mut self.rng);
                    }
                }
            }
        }

        let frame = SignalFrame {
            seq: self.seq,
            samples,
        };
        self.seq += 1;
        self.sample_counter += self.frame_len as u64;

        // Pacing happens after generation so it can never touch the data.
        if self.realtime {
            let frame_secs = self.frame_len as f64 / self.sample_rate;
            std::thread::sleep(Duration::from_secs_f64(frame_secs));
        }

        Ok(Some(frame))
    }

    fn restartable(&self) -> bool {
        true
    }

    fn restart(&mut self) -> FxResult<()> {
        self.rng = StdRng::seed_from_u64(self.seed);
        self.seq = 0;
        self.sample_counter = 0;
        Ok(())
    }
}

/// Replays raw interleaved complex f32 little-endian samples, one (re, im)
/// pair per antenna per time step, sliced into fixed-length frames.
/// A trailing partial frame is truncated, never zero-padded.
pub struct ReplaySource<R: Read + Seek> {
    reader: R,
    n_ants: usize,
    frame_len: usize,
    start_pos: u64,
    seq: u64,
    exhausted: bool,
}

impl ReplaySource<std::io::BufReader<std::fs::File>> {
    pub fn open(path: &std::path::Path, n_ants: usize, frame_len: usize) -> FxResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), n_ants, frame_len)
    }
}

impl<R: Read + Seek> ReplaySource<R> {
    pub fn from_reader(mut reader: R, n_ants: usize, frame_len: usize) -> FxResult<Self> {
        let start_pos = reader.stream_position()?;
        Ok(Self {
            reader,
            n_ants,
            frame_len,
            start_pos,
            seq: 0,
            exhausted: false,
        })
    }

    fn frame_bytes(&self) -> usize {
        self.frame_len * self.n_ants * 8
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl<R: Read + Seek> FrameSource for ReplaySource<R> {
    fn next_frame(&mut self) -> FxResult<Option<SignalFrame>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut raw = vec![0u8; self.frame_bytes()];
        let filled = read_full(&mut self.reader, &mut raw)?;
        if filled < raw.len() {
            self.exhausted = true;
            if filled > 0 {
                tracing::debug!(
                    bytes = filled,
                    "truncating trailing partial frame in replay stream"
                );
            }
            return Ok(None);
        }

        let mut samples =
            vec![vec![Complex::new(0.0, 0.0); self.frame_len]; self.n_ants];
        let mut offset = 0;
        for t in 0..self.frame_len {
            for row in samples.iter_mut() {
                let re = f32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap());
                let im = f32::from_le_bytes(raw[offset + 4..offset + 8].try_into().unwrap());
                row[t] = Complex::new(re as f64, im as f64);
                offset += 8;
            }
        }

        let frame = SignalFrame {
            seq: self.seq,
            samples,
        };
        self.seq += 1;
        Ok(Some(frame))
    }

    fn restartable(&self) -> bool {
        true
    }

    fn restart(&mut self) -> FxResult<()> {
        self.reader.seek(SeekFrom::Start(self.start_pos))?;
        self.seq = 0;
        self.exhausted = false;
        Ok(())
    }
}

/// One decoded block from an external collaborator.
#[derive(Clone, Debug)]
pub struct FeedBlock {
    pub seq: u64,
    pub samples: Vec<Vec<Complex<f64>>>,
}

/// Adapter over an externally decoded feed. The collaborator slices the wire
/// stream into fixed-length blocks and supplies sequence numbers; this side
/// only verifies shape and monotonicity. Any gap or reversal raises a
/// desynchronisation error, and the offending block is delivered on the
/// following call so processing resumes from it.
pub struct FeedSource {
    receiver: Receiver<FeedBlock>,
    n_ants: usize,
    frame_len: usize,
    expected: Option<u64>,
    pending: Option<SignalFrame>,
}

impl FeedSource {
    pub fn new(receiver: Receiver<FeedBlock>, n_ants: usize, frame_len: usize) -> Self {
        Self {
            receiver,
            n_ants,
            frame_len,
            expected: None,
            pending: None,
        }
    }
}

impl FrameSource for FeedSource {
    fn next_frame(&mut self) -> FxResult<Option<SignalFrame>> {
        if let Some(frame) = self.pending.take() {
            self.expected = Some(frame.seq + 1);
            return Ok(Some(frame));
        }

        let block = match self.receiver.recv() {
            Ok(block) => block,
            // Sender gone: the feed has ended.
            Err(_) => return Ok(None),
        };

        if block.samples.len() != self.n_ants
            || block.samples.iter().any(|row| row.len() != self.frame_len)
        {
            return Err(FxError::processing(
                block.seq,
                format!(
                    "feed block shape mismatch: expected {} x {}",
                    self.n_ants, self.frame_len
                ),
            ));
        }

        let frame = SignalFrame {
            seq: block.seq,
            samples: block.samples,
        };
        match self.expected {
            Some(expected) if frame.seq != expected => {
                let got = frame.seq;
                self.pending = Some(frame);
                Err(FxError::SourceDesync { expected, got })
            }
            _ => {
                self.expected = Some(frame.seq + 1);
                Ok(Some(frame))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    fn test_geometry() -> ArrayGeometry {
        ArrayGeometry::circular(3, 10.0)
    }

    #[test]
    fn synthetic_frames_are_deterministic_for_a_seed() {
        let geom = test_geometry();
        let dirs = [[1.0, 0.0, 0.0]];
        let mut a = SyntheticSource::new(&geom, 64.0, 32, &dirs, 8.0, 20.0, Some(1.0), false, 7);
        let mut b = SyntheticSource::new(&geom, 64.0, 32, &dirs, 8.0, 20.0, Some(1.0), false, 7);
        let fa = a.next_frame().unwrap().unwrap();
        let fb = b.next_frame().unwrap().unwrap();
        assert_eq!(fa.seq, 0);
        assert_eq!(fa.samples, fb.samples);
    }

    #[test]
    fn synthetic_restart_replays_the_same_stream() {
        let geom = test_geometry();
        let dirs = [[0.0, 1.0, 0.0]];
        let mut src = SyntheticSource::new(&geom, 64.0, 32, &dirs, 8.0, 10.0, Some(1.0), false, 3);
        let first = src.next_frame().unwrap().unwrap();
        assert!(src.restartable());
        src.restart().unwrap();
        let again = src.next_frame().unwrap().unwrap();
        assert_eq!(first.samples, again.samples);
    }

    #[test]
    fn realtime_pacing_does_not_change_frame_content() {
        let geom = test_geometry();
        let dirs = [[1.0, 0.0, 0.0]];
        // 2 frames of 8 samples at 8 kHz: the paced run sleeps 1 ms per
        // frame and must still be sample-identical to the unpaced run.
        let mut paced =
            SyntheticSource::new(&geom, 8000.0, 8, &dirs, 100.0, 20.0, Some(0.002), true, 11);
        let mut unpaced =
            SyntheticSource::new(&geom, 8000.0, 8, &dirs, 100.0, 20.0, Some(0.002), false, 11);
        loop {
            match (paced.next_frame().unwrap(), unpaced.next_frame().unwrap()) {
                (Some(a), Some(b)) => {
                    assert_eq!(a.seq, b.seq);
                    assert_eq!(a.samples, b.samples);
                }
                (None, None) => break,
                _ => panic!("paced and unpaced streams ended at different frames"),
            }
        }
    }

    #[test]
    fn synthetic_duration_bounds_the_stream() {
        let geom = test_geometry();
        // 2.0 s at 64 Hz with 32-sample frames = 4 frames.
        let mut src = SyntheticSource::new(
            &geom,
            64.0,
            32,
            &[[1.0, 0.0, 0.0]],
            8.0,
            f64::INFINITY,
            Some(2.0),
            false,
            0,
        );
        let mut count = 0;
        while let Some(frame) = src.next_frame().unwrap() {
            assert_eq!(frame.seq, count);
            count += 1;
        }
        assert_eq!(count, 4);
    }

    fn encode_interleaved(n_ants: usize, values: &[Complex<f64>]) -> Vec<u8> {
        // values laid out time-major: t0 ant0, t0 ant1, ...
        assert_eq!(values.len() % n_ants, 0);
        let mut raw = Vec::new();
        for v in values {
            raw.extend_from_slice(&(v.re as f32).to_le_bytes());
            raw.extend_from_slice(&(v.im as f32).to_le_bytes());
        }
        raw
    }

    #[test]
    fn replay_slices_frames_and_truncates_the_remainder() {
        // 2 antennas, frame_len 4: one full frame plus 2 trailing steps.
        let mut values = Vec::new();
        for t in 0..6 {
            for a in 0..2 {
                values.push(Complex::new(t as f64, a as f64));
            }
        }
        let raw = encode_interleaved(2, &values);
        let mut src = ReplaySource::from_reader(Cursor::new(raw), 2, 4).unwrap();

        let frame = src.next_frame().unwrap().unwrap();
        assert_eq!(frame.seq, 0);
        assert_eq!(frame.n_ants(), 2);
        assert_eq!(frame.samples[0][3], Complex::new(3.0, 0.0));
        assert_eq!(frame.samples[1][3], Complex::new(3.0, 1.0));

        // The 2-step remainder is dropped, not padded.
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn replay_restart_rewinds_to_the_first_frame() {
        let values: Vec<Complex<f64>> =
            (0..8).map(|t| Complex::new(t as f64, 0.0)).collect();
        let raw = encode_interleaved(1, &values);
        let mut src = ReplaySource::from_reader(Cursor::new(raw), 1, 4).unwrap();
        let first = src.next_frame().unwrap().unwrap();
        src.next_frame().unwrap().unwrap();
        assert!(src.next_frame().unwrap().is_none());
        src.restart().unwrap();
        let again = src.next_frame().unwrap().unwrap();
        assert_eq!(first.samples, again.samples);
    }

    #[test]
    fn feed_gap_raises_desync_then_resumes_on_the_gapped_frame() {
        let (tx, rx) = mpsc::channel();
        let block = |seq| FeedBlock {
            seq,
            samples: vec![vec![Complex::new(1.0, 0.0); 4]; 2],
        };
        tx.send(block(0)).unwrap();
        tx.send(block(1)).unwrap();
        tx.send(block(5)).unwrap();
        tx.send(block(6)).unwrap();
        drop(tx);

        let mut src = FeedSource::new(rx, 2, 4);
        assert_eq!(src.next_frame().unwrap().unwrap().seq, 0);
        assert_eq!(src.next_frame().unwrap().unwrap().seq, 1);
        match src.next_frame() {
            Err(FxError::SourceDesync { expected, got }) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 5);
            }
            other => panic!("expected desync, got {other:?}"),
        }
        // The gapped frame is not lost.
        assert_eq!(src.next_frame().unwrap().unwrap().seq, 5);
        assert_eq!(src.next_frame().unwrap().unwrap().seq, 6);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn feed_rejects_malformed_blocks() {
        let (tx, rx) = mpsc::channel();
        tx.send(FeedBlock {
            seq: 0,
            samples: vec![vec![Complex::new(0.0, 0.0); 3]; 2],
        })
        .unwrap();
        drop(tx);
        let mut src = FeedSource::new(rx, 2, 4);
        assert!(matches!(
            src.next_frame(),
            Err(FxError::Processing { seq: 0, .. })
        ));
    }

    #[test]
    fn feed_is_not_restartable() {
        let (_tx, rx) = mpsc::channel::<FeedBlock>();
        let mut src = FeedSource::new(rx, 2, 4);
        assert!(!src.restartable());
        assert!(src.restart().is_err());
    }
}
