//! Execution device selection with a CPU fallback.
use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::config::{OffloadMode, RuntimeConfig};
use crate::utils::truncate;

/// Accelerators below this capacity are not worth the trouble.
pub const MIN_ACCELERATOR_MEMORY_GB: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Accelerated,
    GeneralPurpose,
}

impl ExecutionTarget {
    /// Half precision on accelerators, full precision on the CPU.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Accelerated => DType::F16,
            Self::GeneralPurpose => DType::F32,
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerated => f.write_str("accelerated"),
            Self::GeneralPurpose => f.write_str("cpu"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: Device,
    pub target: ExecutionTarget,
    pub reason: String,
    pub accelerator_memory_gb: Option<f64>,
    /// An accelerator exists but was rejected.
    pub degraded: bool,
}

impl DeviceSelection {
    fn cpu(reason: impl Into<String>, degraded: bool) -> Self {
        Self {
            device: Device::Cpu,
            target: ExecutionTarget::GeneralPurpose,
            reason: reason.into(),
            accelerator_memory_gb: None,
            degraded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceleratorInfo {
    pub name: String,
    pub total_memory_gb: Option<f64>,
}

/// Source of accelerator facts, split out so device selection can be tested
/// without hardware.
pub trait AcceleratorProbe {
    fn available(&self) -> bool;

    /// Opens the device and runs a trial computation on it.
    fn open(&self) -> Result<Device>;

    fn info(&self) -> AcceleratorInfo;
}

/// Probes the accelerator candle was built for.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleProbe {
    pub ordinal: usize,
}

impl AcceleratorProbe for CandleProbe {
    fn available(&self) -> bool {
        candle_core::utils::cuda_is_available() || candle_core::utils::metal_is_available()
    }

    fn open(&self) -> Result<Device> {
        let device = if candle_core::utils::cuda_is_available() {
            Device::new_cuda(self.ordinal)?
        } else {
            Device::new_metal(self.ordinal)?
        };
        let probe = Tensor::ones((8, 8), DType::F32, &device)?;
        let sum = probe.matmul(&probe)?.sum_all()?.to_scalar::<f32>()?;
        anyhow::ensure!(sum == 512.0, "trial computation returned {sum}");
        Ok(device)
    }

    fn info(&self) -> AcceleratorInfo {
        if candle_core::utils::cuda_is_available() {
            nvidia_smi_info(self.ordinal).unwrap_or_else(|err| {
                debug!("nvidia-smi query failed: {err:#}");
                AcceleratorInfo {
                    name: format!("cuda:{}", self.ordinal),
                    total_memory_gb: None,
                }
            })
        } else {
            AcceleratorInfo {
                name: "metal".to_string(),
                total_memory_gb: None,
            }
        }
    }
}

fn nvidia_smi_info(ordinal: usize) -> Result<AcceleratorInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .context("running nvidia-smi")?;
    anyhow::ensure!(output.status.success(), "nvidia-smi exited with {}", output.status);
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout), ordinal)
        .context("no matching gpu in nvidia-smi output")
}

/// Parses `index, name, memory.total [MiB]` lines.
fn parse_nvidia_smi(stdout: &str, ordinal: usize) -> Option<AcceleratorInfo> {
    stdout.lines().find_map(|line| {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 || parts[0].parse::<usize>().ok()? != ordinal {
            return None;
        }
        let total_mb = parts[2].parse::<f64>().ok()?;
        Some(AcceleratorInfo {
            name: parts[1].to_string(),
            total_memory_gb: Some(total_mb / 1024.0),
        })
    })
}

/// Picks the execution device. Never returns an accelerated target when
/// `force_cpu` is set.
pub fn select_device(force_cpu: bool, probe: &dyn AcceleratorProbe) -> DeviceSelection {
    if force_cpu {
        return DeviceSelection::cpu("CPU forced by configuration", false);
    }
    if !probe.available() {
        return DeviceSelection::cpu("no accelerator available", false);
    }
    let device = match probe.open() {
        Ok(device) => device,
        Err(err) => {
            let err = format!("{err:#}");
            warn!("accelerator failed its trial computation: {err}");
            return DeviceSelection::cpu(
                format!("accelerator error, using CPU: {}", truncate(&err, 80)),
                true,
            );
        }
    };
    let info = probe.info();
    match info.total_memory_gb {
        Some(gb) if gb < MIN_ACCELERATOR_MEMORY_GB => DeviceSelection::cpu(
            format!("{} has only {gb:.1} GB, using CPU", info.name),
            true,
        ),
        memory => {
            let reason = match memory {
                Some(gb) => format!("{} ({gb:.1} GB)", info.name),
                None => info.name.clone(),
            };
            info!("selected accelerator {reason}");
            DeviceSelection {
                device,
                target: ExecutionTarget::Accelerated,
                reason,
                accelerator_memory_gb: memory,
                degraded: false,
            }
        }
    }
}

/// Memory saving switches applied when building a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    pub attention_slicing: bool,
    pub cpu_offload: bool,
}

impl MemoryPlan {
    pub fn new(config: &RuntimeConfig, selection: &DeviceSelection) -> Self {
        Self::for_target(config, selection.target, selection.accelerator_memory_gb)
    }

    pub fn for_target(
        config: &RuntimeConfig,
        target: ExecutionTarget,
        accelerator_memory_gb: Option<f64>,
    ) -> Self {
        let cpu_offload = match config.cpu_offload {
            OffloadMode::On => true,
            OffloadMode::Off => false,
            OffloadMode::Auto => {
                target == ExecutionTarget::GeneralPurpose
                    || accelerator_memory_gb.is_some_and(|gb| gb < config.max_memory_gb)
            }
        };
        Self {
            attention_slicing: config.attention_slicing,
            cpu_offload,
        }
    }
}

/// Waits for pending work on the device so that dropped buffers go back to
/// the allocator.
pub fn release(device: &Device) {
    if let Err(err) = device.synchronize() {
        warn!("failed to synchronize {device:?}: {err}");
    }
}
