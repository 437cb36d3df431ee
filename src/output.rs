//! Visibility artifact container: a self-describing binary file with a
//! key-value attribute section and numeric-array sections.
//!
//! Layout, all integers and floats little-endian:
//!
//! ```text
//! file header (32 bytes):
//!   0..4   magic "FXVI"
//!   4..8   u32 format version (currently 1)
//!   8..12  u32 n_baselines
//!   12..16 u32 n_channels
//!   16..20 u32 attribute-section length in bytes
//!   20..24 u32 sector count (patched by finalize)
//!   24..32 reserved, zero
//! attribute section: JSON object (configuration snapshot, baseline-order
//!   description, explicit baseline pair list)
//! channel axis: n_channels f64 centre frequencies, DC first
//! sectors, one per completed integration (48-byte header + matrix):
//!   u64 integration index, f64 unix timestamp, u64 slice count,
//!   u64 first frame seq, u64 last frame seq, 8 reserved bytes,
//!   then n_baselines * n_channels (f32 re, f32 im) pairs, row-major in
//!   the canonical baseline order.
//! ```

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::{FxError, FxResult};
use crate::xengine::Baseline;

const MAGIC: [u8; 4] = *b"FXVI";
const FORMAT_VERSION: u32 = 1;
const FILE_HEADER_SIZE: usize = 32;
const SECTOR_HEADER_SIZE: usize = 48;
const SECTOR_COUNT_OFFSET: u64 = 20;

// Decode-side sanity bounds. Header counts are untrusted until checked
// against these, so a corrupt file fails cleanly instead of driving a
// huge allocation.
const MAX_DECODE_CHANNELS: usize = 1 << 20;
const MAX_DECODE_BASELINES: usize = 1 << 20;
const MAX_DECODE_MATRIX_CELLS: usize = 1 << 28;
const MAX_DECODE_ATTR_BYTES: usize = 1 << 24;

/// Wording embedded in every file so a decoder needs no out-of-band
/// knowledge of the matrix row order.
pub const BASELINE_ORDER_DOC: &str =
    "row b of each sector matrix is baseline (i, j), i <= j, enumerated i = 0..n_ants and j = i..n_ants";

/// One finalized integration window. Immutable once constructed; the
/// emitter hands it to the sink by value.
#[derive(Clone, Debug)]
pub struct VisibilityArtifact {
    pub index: u64,
    pub timestamp_unix_s: f64,
    pub n_slices: u64,
    pub seq_first: u64,
    pub seq_last: u64,
    pub baselines: Arc<Vec<Baseline>>,
    pub channel_freqs: Arc<Vec<f64>>,
    /// Row-major `(baseline, channel)` averaged visibilities.
    pub matrix: Vec<Complex<f64>>,
}

/// Key-value attribute section, JSON-encoded in the container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileAttributes {
    pub container: String,
    pub baseline_order: String,
    pub baselines: Vec<Baseline>,
    pub config: Config,
}

/// Destination for finished artifacts. External collaborator boundary: the
/// pipeline only requires delivery to either succeed or report why not.
pub trait Sink: Send {
    fn deliver(&mut self, artifact: VisibilityArtifact) -> FxResult<()>;

    /// Called once after the last artifact.
    fn finish(&mut self) -> FxResult<()> {
        Ok(())
    }
}

pub struct ArtifactWriter<W: Write + Seek> {
    inner: W,
    n_baselines: usize,
    n_channels: usize,
    sectors: u32,
}

impl<W: Write + Seek> ArtifactWriter<W> {
    pub fn new(mut inner: W, cfg: &Config, baselines: &[Baseline]) -> FxResult<Self> {
        let attributes = FileAttributes {
            container: "fxcorr visibility container".to_string(),
            baseline_order: BASELINE_ORDER_DOC.to_string(),
            baselines: baselines.to_vec(),
            config: cfg.clone(),
        };
        let attr_bytes = serde_json::to_vec(&attributes)?;

        let mut header = [0u8; FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(baselines.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(cfg.n_channels as u32).to_le_bytes());
        header[16..20].copy_from_slice(&(attr_bytes.len() as u32).to_le_bytes());
        // sector count stays zero until finalize.
        inner.write_all(&header)?;
        inner.write_all(&attr_bytes)?;
        for freq in cfg.channel_freqs() {
            inner.write_all(&freq.to_le_bytes())?;
        }

        Ok(Self {
            inner,
            n_baselines: baselines.len(),
            n_channels: cfg.n_channels,
            sectors: 0,
        })
    }

    pub fn write_artifact(&mut self, artifact: &VisibilityArtifact) -> FxResult<()> {
        if artifact.matrix.len() != self.n_baselines * self.n_channels {
            return Err(FxError::Sink {
                index: artifact.index,
                reason: format!(
                    "matrix of {} cells for {} baselines x {} channels",
                    artifact.matrix.len(),
                    self.n_baselines,
                    self.n_channels
                ),
            });
        }

        let mut header = [0u8; SECTOR_HEADER_SIZE];
        header[0..8].copy_from_slice(&artifact.index.to_le_bytes());
        header[8..16].copy_from_slice(&artifact.timestamp_unix_s.to_le_bytes());
        header[16..24].copy_from_slice(&artifact.n_slices.to_le_bytes());
        header[24..32].copy_from_slice(&artifact.seq_first.to_le_bytes());
        header[32..40].copy_from_slice(&artifact.seq_last.to_le_bytes());
        self.inner.write_all(&header)?;
        for v in &artifact.matrix {
            self.inner.write_all(&(v.re as f32).to_le_bytes())?;
            self.inner.write_all(&(v.im as f32).to_le_bytes())?;
        }
        self.sectors += 1;
        Ok(())
    }

    /// Patch the sector count and return the underlying writer.
    pub fn finalize(mut self) -> FxResult<W> {
        self.inner.flush()?;
        self.inner.seek(SeekFrom::Start(SECTOR_COUNT_OFFSET))?;
        self.inner.write_all(&self.sectors.to_le_bytes())?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// One decoded sector.
#[derive(Clone, Debug)]
pub struct SectorRecord {
    pub index: u64,
    pub timestamp_unix_s: f64,
    pub n_slices: u64,
    pub seq_first: u64,
    pub seq_last: u64,
    pub matrix: Vec<Complex<f64>>,
}

/// A fully decoded artifact container.
#[derive(Clone, Debug)]
pub struct ArtifactFile {
    pub attributes: FileAttributes,
    pub channel_freqs: Vec<f64>,
    pub sectors: Vec<SectorRecord>,
}

fn read_exact_array<const N: usize, R: Read>(reader: &mut R) -> FxResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

impl ArtifactFile {
    pub fn read<R: Read>(reader: &mut R) -> FxResult<Self> {
        let header: [u8; FILE_HEADER_SIZE] = read_exact_array(reader)?;
        if header[0..4] != MAGIC {
            return Err(FxError::Malformed("bad magic".into()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(FxError::Malformed(format!(
                "unsupported format version {version}"
            )));
        }
        let n_baselines = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let n_channels = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;
        let attr_len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
        let sector_count = u32::from_le_bytes(header[20..24].try_into().unwrap());

        if n_baselines == 0 || n_baselines > MAX_DECODE_BASELINES {
            return Err(FxError::Malformed(format!(
                "implausible baseline count {n_baselines}"
            )));
        }
        if n_channels == 0 || n_channels > MAX_DECODE_CHANNELS {
            return Err(FxError::Malformed(format!(
                "implausible channel count {n_channels}"
            )));
        }
        let matrix_cells = n_baselines
            .checked_mul(n_channels)
            .filter(|&cells| cells <= MAX_DECODE_MATRIX_CELLS)
            .ok_or_else(|| {
                FxError::Malformed(format!(
                    "implausible matrix shape {n_baselines} x {n_channels}"
                ))
            })?;
        if attr_len > MAX_DECODE_ATTR_BYTES {
            return Err(FxError::Malformed(format!(
                "implausible attribute section of {attr_len} bytes"
            )));
        }

        let mut attr_bytes = vec![0u8; attr_len];
        reader.read_exact(&mut attr_bytes)?;
        let attributes: FileAttributes = serde_json::from_slice(&attr_bytes)?;
        if attributes.baselines.len() != n_baselines {
            return Err(FxError::Malformed(
                "attribute baseline list disagrees with header".into(),
            ));
        }

        let mut channel_freqs = Vec::with_capacity(n_channels);
        for _ in 0..n_channels {
            let raw: [u8; 8] = read_exact_array(reader)?;
            channel_freqs.push(f64::from_le_bytes(raw));
        }

        // Sector count is still untrusted; a truncated stream surfaces as
        // an I/O error on the first short read rather than an allocation.
        let mut sectors = Vec::with_capacity((sector_count as usize).min(4096));
        for _ in 0..sector_count {
            let sh: [u8; SECTOR_HEADER_SIZE] = read_exact_array(reader)?;
            let mut matrix = Vec::with_capacity(matrix_cells);
            for _ in 0..matrix_cells {
                let re: [u8; 4] = read_exact_array(reader)?;
                let im: [u8; 4] = read_exact_array(reader)?;
                matrix.push(Complex::new(
                    f32::from_le_bytes(re) as f64,
                    f32::from_le_bytes(im) as f64,
                ));
            }
            sectors.push(SectorRecord {
                index: u64::from_le_bytes(sh[0..8].try_into().unwrap()),
                timestamp_unix_s: f64::from_le_bytes(sh[8..16].try_into().unwrap()),
                n_slices: u64::from_le_bytes(sh[16..24].try_into().unwrap()),
                seq_first: u64::from_le_bytes(sh[24..32].try_into().unwrap()),
                seq_last: u64::from_le_bytes(sh[32..40].try_into().unwrap()),
                matrix,
            });
        }

        Ok(Self {
            attributes,
            channel_freqs,
            sectors,
        })
    }

    pub fn open(path: &Path) -> FxResult<Self> {
        let mut file = std::io::BufReader::new(File::open(path)?);
        Self::read(&mut file)
    }
}

/// Print a human-readable summary of an artifact file.
pub fn inspect(path: &Path) -> FxResult<()> {
    let decoded = ArtifactFile::open(path)?;
    let cfg = &decoded.attributes.config;
    println!("{}", path.display());
    println!("  container:    {}", decoded.attributes.container);
    println!(
        "  array:        {} antennas, {} baselines",
        cfg.n_ants,
        decoded.attributes.baselines.len()
    );
    println!(
        "  channels:     {} x {:.3} Hz",
        decoded.channel_freqs.len(),
        cfg.frequency_resolution()
    );
    println!("  order:        {}", decoded.attributes.baseline_order);
    println!("  integrations: {}", decoded.sectors.len());
    for sector in &decoded.sectors {
        let first = sector.matrix.first().copied().unwrap_or_default();
        println!(
            "    [{}] t={:.3} slices={} frames {}..{} vis[0,0]={:.4}{:+.4}j",
            sector.index,
            sector.timestamp_unix_s,
            sector.n_slices,
            sector.seq_first,
            sector.seq_last,
            first.re,
            first.im
        );
    }
    Ok(())
}

/// File-backed sink writing one container per run.
pub struct FileSink {
    path: PathBuf,
    writer: Option<ArtifactWriter<BufWriter<File>>>,
}

impl FileSink {
    pub fn create(path: &Path, cfg: &Config, baselines: &[Baseline]) -> FxResult<Self> {
        let file = File::create(path)?;
        let writer = ArtifactWriter::new(BufWriter::new(file), cfg, baselines)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }
}

impl Sink for FileSink {
    fn deliver(&mut self, artifact: VisibilityArtifact) -> FxResult<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_artifact(&artifact),
            None => Err(FxError::Sink {
                index: artifact.index,
                reason: "sink already finished".into(),
            }),
        }
    }

    fn finish(&mut self) -> FxResult<()> {
        if let Some(writer) = self.writer.take() {
            let mut file = writer.finalize()?;
            file.flush()?;
            tracing::debug!(path = %self.path.display(), "visibility container finalized");
        }
        Ok(())
    }
}
