use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use candle_core::Device;
use image::{DynamicImage, Rgb, RgbImage};
use restyle::classify::{ModelKind, ModelReference};
use restyle::config::RuntimeConfig;
use restyle::device::{AcceleratorInfo, AcceleratorProbe, ExecutionTarget};
use restyle::lora::MergeStrategy;
use restyle::orchestrator::{
    apply_style, Backend, ModelSource, Pipeline, PipelineError, Placement,
};
use restyle::progress::Progress;
use restyle::request::{GenerationParams, GenerationRequest, VariantPlan};
use restyle::schedulers::Sampler;
use restyle::Error;

type Log = Rc<RefCell<Vec<String>>>;

struct FakeProbe {
    available: bool,
}

impl AcceleratorProbe for FakeProbe {
    fn available(&self) -> bool {
        self.available
    }

    fn open(&self) -> anyhow::Result<Device> {
        Ok(Device::Cpu)
    }

    fn info(&self) -> AcceleratorInfo {
        AcceleratorInfo {
            name: "fake-gpu".to_string(),
            total_memory_gb: Some(24.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum AdapterBehaviour {
    Applies,
    OnlyLenient,
    Fails,
}

struct FakeBackend {
    log: Log,
    accelerator_load_error: bool,
    load_error: bool,
    adapter: AdapterBehaviour,
    failing_variants: Vec<usize>,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            log: Rc::default(),
            accelerator_load_error: false,
            load_error: false,
            adapter: AdapterBehaviour::Applies,
            failing_variants: Vec::new(),
        }
    }

    fn events(&self) -> Vec<String> {
        self.log.borrow().clone()
    }
}

struct FakePipeline {
    log: Log,
    adapter: AdapterBehaviour,
    failing_variants: Vec<usize>,
}

impl Drop for FakePipeline {
    fn drop(&mut self) {
        self.log.borrow_mut().push("drop".to_string());
    }
}

impl Pipeline for FakePipeline {
    fn attach_adapter(
        &mut self,
        _path: &Path,
        strategy: MergeStrategy,
        _scale: f64,
    ) -> Result<usize, PipelineError> {
        self.log.borrow_mut().push(format!("adapter {strategy:?}"));
        match (self.adapter, strategy) {
            (AdapterBehaviour::Applies, _) => Ok(12),
            (AdapterBehaviour::OnlyLenient, MergeStrategy::Lenient) => Ok(3),
            _ => Err(PipelineError::Other("layer mismatch".to_string())),
        }
    }

    fn set_sampler(&mut self, sampler: Sampler) {
        self.log.borrow_mut().push(format!("sampler {sampler}"));
    }

    fn generate(
        &mut self,
        image: &DynamicImage,
        plan: &VariantPlan,
        params: &GenerationParams,
        on_step: &mut dyn FnMut(usize, usize),
    ) -> Result<DynamicImage, PipelineError> {
        self.log.borrow_mut().push(format!("generate {}", plan.index));
        if self.failing_variants.contains(&plan.index) {
            return Err(PipelineError::Other("nan latents".to_string()));
        }
        let total = params.steps - params.start_step();
        for step in 1..=total {
            on_step(step, total);
        }
        let shade = (plan.noise_seed % 256) as u8;
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            image.width(),
            image.height(),
            Rgb([shade, 0, 0]),
        )))
    }
}

impl Backend for FakeBackend {
    type Pipeline = FakePipeline;

    fn load(
        &mut self,
        source: &ModelSource,
        placement: &Placement,
        _clip_skip: usize,
    ) -> Result<FakePipeline, PipelineError> {
        self.log
            .borrow_mut()
            .push(format!("load {source:?} on {}", placement.target));
        if self.load_error {
            return Err(PipelineError::Other("missing unet".to_string()));
        }
        if self.accelerator_load_error && placement.target == ExecutionTarget::Accelerated {
            return Err(PipelineError::Accelerator("CUDA out of memory".to_string()));
        }
        Ok(FakePipeline {
            log: self.log.clone(),
            adapter: self.adapter,
            failing_variants: self.failing_variants.clone(),
        })
    }

    fn release(&mut self, placement: &Placement) {
        self.log
            .borrow_mut()
            .push(format!("release {}", placement.target));
    }
}

#[derive(Default)]
struct Recorder {
    fractions: Vec<f64>,
}

impl Progress for Recorder {
    fn report(&mut self, fraction: f64, _message: Option<&str>) {
        self.fractions.push(fraction);
    }
}

fn request(kind: ModelKind, params: GenerationParams) -> GenerationRequest {
    GenerationRequest {
        image: DynamicImage::new_rgb8(64, 32),
        model: ModelReference {
            path: PathBuf::from("style.safetensors"),
            kind,
        },
        params,
    }
}

fn run(
    backend: &mut FakeBackend,
    request: &GenerationRequest,
    config: &RuntimeConfig,
) -> restyle::Result<restyle::request::GenerationResult> {
    apply_style(
        backend,
        request,
        config,
        &FakeProbe { available: true },
        &mut Recorder::default(),
    )
}

#[test]
fn lora_request_loads_the_base_model_and_merges_strictly() -> anyhow::Result<()> {
    let mut backend = FakeBackend::new();
    let req = request(ModelKind::LoraAdapter, GenerationParams::default());
    let result = run(&mut backend, &req, &RuntimeConfig::default())?;

    assert_eq!(result.variants.len(), 1);
    assert!(result.messages.is_empty(), "{:?}", result.messages);
    assert_eq!(result.target, ExecutionTarget::Accelerated);
    assert_eq!(
        backend.events(),
        [
            "release accelerated",
            "load Base on accelerated",
            "adapter Strict",
            "sampler dpm-solver-multistep",
            "generate 0",
            "drop",
            "release accelerated",
        ]
    );
    Ok(())
}

#[test]
fn accelerator_load_error_retries_once_on_cpu() -> anyhow::Result<()> {
    let mut backend = FakeBackend {
        accelerator_load_error: true,
        ..FakeBackend::new()
    };
    let req = request(
        ModelKind::FullCheckpoint,
        GenerationParams {
            sampler: Sampler::EulerDiscrete,
            ..Default::default()
        },
    );
    let result = run(&mut backend, &req, &RuntimeConfig::default())?;

    assert_eq!(result.target, ExecutionTarget::GeneralPurpose);
    assert_eq!(result.variants.len(), 1);
    assert_eq!(result.messages.len(), 1);
    assert!(result.messages[0].contains("CUDA out of memory"));
    let loads: Vec<_> = backend
        .events()
        .into_iter()
        .filter(|event| event.starts_with("load"))
        .collect();
    assert_eq!(
        loads,
        [
            "load Checkpoint(\"style.safetensors\") on accelerated",
            "load Checkpoint(\"style.safetensors\") on cpu",
        ]
    );
    Ok(())
}

#[test]
fn forced_cpu_never_touches_the_accelerator() -> anyhow::Result<()> {
    let mut backend = FakeBackend::new();
    let config = RuntimeConfig {
        force_cpu: true,
        ..Default::default()
    };
    let req = request(ModelKind::FullCheckpoint, GenerationParams::default());
    let result = run(&mut backend, &req, &config)?;
    assert_eq!(result.target, ExecutionTarget::GeneralPurpose);
    assert!(backend
        .events()
        .iter()
        .all(|event| !event.contains("accelerated")));
    Ok(())
}

#[test]
fn load_failures_are_fatal_and_still_release() {
    let mut backend = FakeBackend {
        load_error: true,
        ..FakeBackend::new()
    };
    let checkpoint = request(ModelKind::FullCheckpoint, GenerationParams::default());
    match run(&mut backend, &checkpoint, &RuntimeConfig::default()) {
        Err(Error::CheckpointLoad { path, reason }) => {
            assert_eq!(path, PathBuf::from("style.safetensors"));
            assert!(reason.contains("missing unet"));
        }
        other => panic!("unexpected {:?}", other.map(|r| r.variants.len())),
    }
    assert_eq!(backend.events().last().map(String::as_str), Some("release accelerated"));

    let lora = request(ModelKind::LoraAdapter, GenerationParams::default());
    assert!(matches!(
        run(&mut backend, &lora, &RuntimeConfig::default()),
        Err(Error::BaseModelLoad { .. })
    ));
}

#[test]
fn unknown_models_and_bad_params_fail_before_loading() {
    let mut backend = FakeBackend::new();
    let unknown = request(ModelKind::Unknown, GenerationParams::default());
    assert!(matches!(
        run(&mut backend, &unknown, &RuntimeConfig::default()),
        Err(Error::UnsupportedModel(_))
    ));
    let invalid = request(
        ModelKind::LoraAdapter,
        GenerationParams {
            strength: 0.,
            ..Default::default()
        },
    );
    assert!(matches!(
        run(&mut backend, &invalid, &RuntimeConfig::default()),
        Err(Error::InvalidParameter(_))
    ));
    assert!(backend.events().is_empty());
}

#[test]
fn adapter_falls_back_to_lenient_then_to_nothing() -> anyhow::Result<()> {
    let mut partial = FakeBackend {
        adapter: AdapterBehaviour::OnlyLenient,
        ..FakeBackend::new()
    };
    let req = request(ModelKind::LoraAdapter, GenerationParams::default());
    let result = run(&mut partial, &req, &RuntimeConfig::default())?;
    assert_eq!(result.variants.len(), 1);
    assert!(result.messages[0].contains("partially (3 layers)"));

    let mut failing = FakeBackend {
        adapter: AdapterBehaviour::Fails,
        ..FakeBackend::new()
    };
    let result = run(&mut failing, &req, &RuntimeConfig::default())?;
    assert_eq!(result.variants.len(), 1);
    assert!(result.messages[0].contains("continuing without it"));
    let attempts = failing
        .events()
        .iter()
        .filter(|event| event.starts_with("adapter"))
        .count();
    assert_eq!(attempts, 2);
    Ok(())
}

#[test]
fn failed_variants_are_skipped() -> anyhow::Result<()> {
    let mut backend = FakeBackend {
        failing_variants: vec![1],
        ..FakeBackend::new()
    };
    let req = request(
        ModelKind::FullCheckpoint,
        GenerationParams {
            num_images: 3,
            ..Default::default()
        },
    );
    let result = run(&mut backend, &req, &RuntimeConfig::default())?;
    let indices: Vec<_> = result.variants.iter().map(|v| v.index).collect();
    assert_eq!(indices, [0, 2]);
    assert_eq!(result.messages, ["Variant 2 failed: nan latents"]);
    Ok(())
}

#[test]
fn all_variants_failing_gives_an_empty_result() -> anyhow::Result<()> {
    let mut backend = FakeBackend {
        failing_variants: vec![0, 1],
        ..FakeBackend::new()
    };
    let req = request(
        ModelKind::FullCheckpoint,
        GenerationParams {
            num_images: 2,
            upscale_factor: 2,
            ..Default::default()
        },
    );
    let result = run(&mut backend, &req, &RuntimeConfig::default())?;
    assert!(result.variants.is_empty());
    assert_eq!(result.messages.len(), 3);
    assert_eq!(backend.events().last().map(String::as_str), Some("release accelerated"));
    Ok(())
}

#[test]
fn upscaling_multiplies_the_output_size() -> anyhow::Result<()> {
    let mut backend = FakeBackend::new();
    let req = request(
        ModelKind::FullCheckpoint,
        GenerationParams {
            upscale_factor: 2,
            ..Default::default()
        },
    );
    let result = run(&mut backend, &req, &RuntimeConfig::default())?;
    let image = &result.variants[0].image;
    assert_eq!((image.width(), image.height()), (128, 64));
    Ok(())
}

#[test]
fn fixed_seed_is_reproducible() -> anyhow::Result<()> {
    let params = GenerationParams {
        num_images: 3,
        seed: Some(42),
        variance_seed: Some(7),
        ..Default::default()
    };
    let req = request(ModelKind::FullCheckpoint, params);
    let first = run(&mut FakeBackend::new(), &req, &RuntimeConfig::default())?;
    let second = run(&mut FakeBackend::new(), &req, &RuntimeConfig::default())?;

    let seeds: Vec<_> = first.variants.iter().map(|v| v.seed).collect();
    assert_eq!(seeds, [Some(42), Some(49), Some(56)]);
    for (a, b) in first.variants.iter().zip(&second.variants) {
        assert_eq!(a.seed, b.seed);
        assert_eq!(a.image.as_bytes(), b.image.as_bytes());
    }
    Ok(())
}

#[test]
fn progress_is_monotonic_and_completes() -> anyhow::Result<()> {
    let mut backend = FakeBackend::new();
    let req = request(
        ModelKind::LoraAdapter,
        GenerationParams {
            num_images: 2,
            upscale_factor: 2,
            ..Default::default()
        },
    );
    let mut progress = Recorder::default();
    apply_style(
        &mut backend,
        &req,
        &RuntimeConfig::default(),
        &FakeProbe { available: false },
        &mut progress,
    )?;
    let fractions = progress.fractions;
    assert!(fractions.windows(2).all(|w| w[0] <= w[1] + 1e-9), "{fractions:?}");
    assert_eq!(fractions.first(), Some(&0.05));
    assert_eq!(fractions.last(), Some(&1.0));
    assert!(fractions.contains(&0.4) && fractions.contains(&0.85));
    Ok(())
}

#[test]
fn upscaling_reports_each_image_from_its_index() -> anyhow::Result<()> {
    let req = request(
        ModelKind::FullCheckpoint,
        GenerationParams {
            num_images: 2,
            upscale_factor: 2,
            ..Default::default()
        },
    );
    let mut progress = Recorder::default();
    apply_style(
        &mut FakeBackend::new(),
        &req,
        &RuntimeConfig::default(),
        &FakeProbe { available: true },
        &mut progress,
    )?;
    let fractions = &progress.fractions;
    let tail = &fractions[fractions.len() - 5..];
    let expected = [0.85, 0.9, 0.9, 0.925, 1.0];
    assert!(
        tail.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-9),
        "{fractions:?}"
    );
    Ok(())
}
