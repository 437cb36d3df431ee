mod args;
mod config;
mod delay;
mod errors;
mod fengine;
mod geom;
mod output;
mod pipeline;
mod source;
mod xengine;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::args::Args;
use crate::errors::FxResult;
use crate::geom::ArrayGeometry;
use crate::output::FileSink;
use crate::pipeline::{source_from_config, CancelToken, Pipeline};

fn main() -> FxResult<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(path) = &args.inspect {
        return output::inspect(path);
    }

    let cfg = args.to_config()?;
    let geometry = ArrayGeometry::from_config(&cfg)?;

    println!("[fxcorr settings]");
    println!("  ants:        {} (radius {:.1} m)", cfg.n_ants, cfg.ant_radius);
    println!(
        "  sampling:    {:.0} Hz, frame {} samples",
        cfg.sample_rate, cfg.frame_len
    );
    println!(
        "  channels:    {} ({:?} window, overlap {:.2}, {:.3} Hz/ch)",
        cfg.n_channels,
        cfg.window,
        cfg.overlap,
        cfg.frequency_resolution()
    );
    if cfg.quantize_bits > 0 {
        println!("  quantize:    {} bit", cfg.quantize_bits);
    }
    println!(
        "  integration: {:.3} s ({} spectra), baselines {}",
        cfg.integration_time,
        cfg.spectra_per_integration(),
        cfg.n_ants * (cfg.n_ants + 1) / 2
    );
    println!("  mode:        {:?}", cfg.mode);
    println!("  output:      {}", args.out.display());

    let mut pipeline = Pipeline::new(&cfg)?;
    let mut source = source_from_config(&cfg, &geometry)?;
    let sink = FileSink::create(&args.out, &cfg, pipeline.baselines())?;

    let report = pipeline.run(source.as_mut(), Box::new(sink), &CancelToken::new())?;

    println!("[fxcorr run]");
    println!("  frames:       {}", report.frames);
    println!("  slices:       {}", report.slices);
    println!("  integrations: {}", report.integrations_emitted);
    if report.desyncs > 0 {
        println!("  desyncs:      {}", report.desyncs);
    }
    if report.chunks_dropped > 0 {
        println!("  dropped:      {}", report.chunks_dropped);
    }
    if report.overruns > 0 {
        println!("  overruns:     {}", report.overruns);
    }
    if report.sink_failures > 0 {
        println!("  sink errors:  {}", report.sink_failures);
    }
    Ok(())
}
