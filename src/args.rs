use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, SinkPolicy, SourceMode, WindowKind};
use crate::errors::{FxError, FxResult};

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Software FX correlator for small antenna arrays",
    long_about = None,
    after_help = "Examples:\n  fxcorr --ants 4 --channels 256 --tone-freq 100 --duration 10 --out run.fxvi\n  fxcorr --mode replay --input capture.bin --ants 4 --channels 512 --out run.fxvi\n  fxcorr --inspect run.fxvi\n"
)]
pub struct Args {
    /// Number of antennas in the array
    #[arg(long, default_value_t = 4)]
    pub ants: usize,

    /// Radius of the default circular layout (metres)
    #[arg(long, default_value_t = 10.0)]
    pub radius: f64,

    /// JSON file with explicit antenna positions: [[x,y,z], ...] (metres)
    #[arg(long)]
    pub positions: Option<PathBuf>,

    /// Sample rate of each antenna stream (Hz)
    #[arg(long, default_value_t = 1024.0)]
    pub sample_rate: f64,

    /// Sky frequency of channel zero (Hz)
    #[arg(long, default_value_t = 0.0)]
    pub center_freq: f64,

    /// Channels per spectrum (FFT length)
    #[arg(long, default_value_t = 256)]
    pub channels: usize,

    /// Window applied before each FFT
    #[arg(long, value_enum, default_value_t = WindowKind::Hanning)]
    pub window: WindowKind,

    /// Requantisation depth in bits (0 disables)
    #[arg(long, default_value_t = 0)]
    pub quantize_bits: u32,

    /// Fractional overlap between successive FFT slices, in [0, 0.5]
    #[arg(long, default_value_t = 0.0)]
    pub overlap: f64,

    /// Integration time per visibility artifact (seconds)
    #[arg(long, default_value_t = 1.0)]
    pub integration_time: f64,

    /// Samples per frame handed to the channelizer
    #[arg(long, default_value_t = 4096)]
    pub frame_len: usize,

    /// Where frames come from
    #[arg(long, value_enum, default_value_t = SourceMode::Synthetic)]
    pub mode: SourceMode,

    /// Raw capture to replay (interleaved complex f32, per antenna)
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Azimuths of synthetic point sources (degrees, comma separated)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub source_angles: String,

    /// Frequency of the synthetic tone (Hz)
    #[arg(long, default_value_t = 100.0)]
    pub tone_freq: f64,

    /// Per-antenna SNR of the synthetic tone (dB); "inf" disables noise
    #[arg(long, default_value_t = 20.0, allow_hyphen_values = true)]
    pub snr_db: f64,

    /// Stop the synthetic source after this many seconds of signal
    #[arg(long)]
    pub duration: Option<f64>,

    /// Pace the synthetic source at the nominal sample rate
    #[arg(long, default_value_t = false)]
    pub realtime: bool,

    /// Seed for the synthetic noise generator
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Phase-tracking direction "x,y,z" (unnormalised is fine)
    #[arg(long, allow_hyphen_values = true)]
    pub phase_center: Option<String>,

    /// Stop after emitting this many integrations
    #[arg(long)]
    pub max_integrations: Option<u64>,

    /// What to do when the sink cannot keep up
    #[arg(long, value_enum, default_value_t = SinkPolicy::Block)]
    pub sink_policy: SinkPolicy,

    /// Treat the first sink failure as fatal
    #[arg(long, default_value_t = false)]
    pub halt_on_sink_error: bool,

    /// Visibility output file
    #[arg(long, default_value = "fxcorr.fxvi")]
    pub out: PathBuf,

    /// Print a summary of an existing output file and exit
    #[arg(long)]
    pub inspect: Option<PathBuf>,
}

fn parse_f64_list(text: &str, what: &str) -> FxResult<Vec<f64>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| FxError::config(format!("{what}: cannot parse `{s}` as a number")))
        })
        .collect()
}

fn parse_vec3(text: &str, what: &str) -> FxResult<[f64; 3]> {
    let parts = parse_f64_list(text, what)?;
    match parts.as_slice() {
        &[x, y, z] => Ok([x, y, z]),
        other => Err(FxError::config(format!(
            "{what}: expected three components, got {}",
            other.len()
        ))),
    }
}

impl Args {
    /// Resolve the command line into a validated pipeline configuration.
    pub fn to_config(&self) -> FxResult<Config> {
        let ant_positions = match &self.positions {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Some(serde_json::from_str::<Vec<[f64; 3]>>(&text)?)
            }
            None => None,
        };
        let phase_center = self
            .phase_center
            .as_deref()
            .map(|s| parse_vec3(s, "--phase-center"))
            .transpose()?;
        let cfg = Config {
            n_ants: self.ants,
            ant_positions,
            ant_radius: self.radius,
            sample_rate: self.sample_rate,
            center_freq: self.center_freq,
            n_channels: self.channels,
            window: self.window,
            quantize_bits: self.quantize_bits,
            overlap: self.overlap,
            integration_time: self.integration_time,
            mode: self.mode,
            frame_len: self.frame_len,
            input_file: self.input.as_ref().map(|p| p.display().to_string()),
            source_angles_deg: parse_f64_list(&self.source_angles, "--source-angles")?,
            tone_freq: self.tone_freq,
            snr_db: self.snr_db,
            duration: self.duration,
            realtime: self.realtime,
            seed: self.seed,
            phase_center,
            max_integrations: self.max_integrations,
            sink_policy: self.sink_policy,
            halt_on_sink_error: self.halt_on_sink_error,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_a_valid_config() {
        let args = Args::parse_from(["fxcorr"]);
        let cfg = args.to_config().unwrap();
        assert_eq!(cfg.n_ants, 4);
        assert_eq!(cfg.n_channels, 256);
        assert_eq!(cfg.spectra_per_integration(), 4);
    }

    #[test]
    fn source_angles_accept_a_comma_list() {
        let args = Args::parse_from(["fxcorr", "--source-angles", "0, 45,-30"]);
        let cfg = args.to_config().unwrap();
        assert_eq!(cfg.source_angles_deg, vec![0.0, 45.0, -30.0]);
    }

    #[test]
    fn phase_center_requires_three_components() {
        let args = Args::parse_from(["fxcorr", "--phase-center", "1,0"]);
        assert!(matches!(args.to_config(), Err(FxError::Config(_))));
    }

    #[test]
    fn replay_without_input_is_a_config_error() {
        let args = Args::parse_from(["fxcorr", "--mode", "replay"]);
        assert!(matches!(args.to_config(), Err(FxError::Config(_))));
    }
}
