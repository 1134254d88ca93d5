use anyhow::{Context, Result};

use clap::Parser;
use restyle::{
    classify::ModelReference,
    device::CandleProbe,
    orchestrator::apply_style,
    progress::ConsoleProgress,
    request::GenerationRequest,
    trans::CandleBackend,
    utils::output_filename,
    Args,
};

fn run(args: Args) -> Result<()> {
    let config = args.runtime_config();
    let model = ModelReference::classify(config.resolve_model(&args.model)?);
    let image = image::open(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;
    let request = GenerationRequest {
        image,
        model,
        params: args.params(),
    };

    let mut backend = CandleBackend::new(&config)?;
    let probe = CandleProbe::default();
    let result = apply_style(
        &mut backend,
        &request,
        &config,
        &probe,
        &mut ConsoleProgress::new(),
    )?;

    println!("Device: {} ({})", result.target, result.device_reason);
    for message in &result.messages {
        println!("{message}");
    }
    anyhow::ensure!(!result.variants.is_empty(), "no image was generated");
    for variant in &result.variants {
        let filename = output_filename(&args.final_image, variant.index + 1, args.num_samples);
        variant
            .image
            .save(&filename)
            .with_context(|| format!("writing {filename}"))?;
        match variant.seed {
            Some(seed) => println!("Saved {filename} (seed {seed})"),
            None => println!("Saved {filename}"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = args.check()?;
    run(args)
}
