//! Rewrites safetensors files into the layout candle-transformers builds from.
//!
//! Tensors are streamed from a memory-mapped source. Untouched tensors are
//! written straight from the mapping, only replaced tensors are materialized.
use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, View};
use tracing::{debug, info};

use crate::model::StableDiffusionVersion;

const UNET_PREFIX: &str = "model.diffusion_model.";
const VAE_PREFIX: &str = "first_stage_model.";
const CLIP_PREFIXES: [&str; 2] = [
    "cond_stage_model.transformer.",
    "conditioner.embedders.0.transformer.",
];

/// Resnets per UNet down block, the up blocks hold one more.
const LAYERS_PER_BLOCK: usize = 2;
const VAE_BLOCKS: usize = 4;

/// A tensor to be written out.
pub enum Entry<'a> {
    Mapped(TensorView<'a>),
    /// Same bytes, different shape.
    Reshaped(TensorView<'a>, Vec<usize>),
    Owned {
        dtype: Dtype,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    },
    Zeroed {
        dtype: Dtype,
        shape: Vec<usize>,
    },
}

impl Entry<'_> {
    /// Materializes a candle tensor.
    pub fn from_tensor(tensor: &Tensor) -> Result<Entry<'static>> {
        let flat = tensor.flatten_all()?.to_device(&Device::Cpu)?;
        let (dtype, bytes) = match tensor.dtype() {
            DType::F32 => (
                Dtype::F32,
                flat.to_vec1::<f32>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            DType::F16 => (
                Dtype::F16,
                flat.to_vec1::<half::f16>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            DType::BF16 => (
                Dtype::BF16,
                flat.to_vec1::<half::bf16>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
            dtype => anyhow::bail!("cannot serialize tensors of type {dtype:?}"),
        };
        Ok(Entry::Owned {
            dtype,
            shape: tensor.dims().to_vec(),
            bytes,
        })
    }
}

impl View for Entry<'_> {
    fn dtype(&self) -> Dtype {
        match self {
            Self::Mapped(view) | Self::Reshaped(view, _) => view.dtype(),
            Self::Owned { dtype, .. } | Self::Zeroed { dtype, .. } => *dtype,
        }
    }

    fn shape(&self) -> &[usize] {
        match self {
            Self::Mapped(view) => view.shape(),
            Self::Reshaped(_, shape) | Self::Owned { shape, .. } | Self::Zeroed { shape, .. } => {
                shape
            }
        }
    }

    fn data(&self) -> Cow<[u8]> {
        match self {
            Self::Mapped(view) | Self::Reshaped(view, _) => Cow::Borrowed(view.data()),
            Self::Owned { bytes, .. } => Cow::Borrowed(bytes),
            Self::Zeroed { .. } => Cow::Owned(vec![0; self.data_len()]),
        }
    }

    fn data_len(&self) -> usize {
        match self {
            Self::Mapped(view) | Self::Reshaped(view, _) => view.data().len(),
            Self::Owned { bytes, .. } => bytes.len(),
            Self::Zeroed { dtype, shape } => shape.iter().product::<usize>() * dtype.size(),
        }
    }
}

pub fn write(entries: Vec<(String, Entry<'_>)>, path: &Path) -> Result<()> {
    debug!(tensors = entries.len(), path = %path.display(), "writing safetensors");
    safetensors::serialize_to_file(entries, &None, path)
        .with_context(|| format!("writing {}", path.display()))
}

/// Guesses the model family of a single-file checkpoint from its tensor names.
pub fn detect_family<'a>(names: impl IntoIterator<Item = &'a str>) -> StableDiffusionVersion {
    let mut family = StableDiffusionVersion::V1_5;
    for name in names {
        if name.starts_with("conditioner.embedders") {
            return StableDiffusionVersion::Xl;
        }
        if name.starts_with("cond_stage_model.model") {
            family = StableDiffusionVersion::V2_1;
        }
    }
    family
}

/// Component files split out of a single-file checkpoint. Missing components
/// have to come from the family's reference weights.
#[derive(Debug, Clone)]
pub struct ConvertedCheckpoint {
    pub version: StableDiffusionVersion,
    pub unet: PathBuf,
    pub vae: Option<PathBuf>,
    pub clip: Option<PathBuf>,
}

/// Splits an LDM-layout checkpoint into diffusers-layout component files
/// under `out_dir`.
pub fn convert_checkpoint(path: &Path, out_dir: &Path) -> Result<ConvertedCheckpoint> {
    let st = unsafe { MmapedSafetensors::new(path) }
        .with_context(|| format!("opening checkpoint {}", path.display()))?;
    let tensors = st.tensors();
    let version = detect_family(tensors.iter().map(|(name, _)| name.as_str()));
    info!(?version, "converting checkpoint {}", path.display());

    let (mut unet, mut vae, mut clip) = (Vec::new(), Vec::new(), Vec::new());
    let mut ignored = 0usize;
    for (name, view) in tensors {
        if let Some(key) = name.strip_prefix(UNET_PREFIX) {
            match unet_key(key) {
                Some(key) => unet.push((key, Entry::Mapped(view))),
                None => ignored += 1,
            }
        } else if let Some(key) = name.strip_prefix(VAE_PREFIX) {
            match vae_key(key) {
                Some(key) if key.contains(".attentions.") && view.shape().len() == 4 => {
                    let shape = view.shape()[..2].to_vec();
                    vae.push((key, Entry::Reshaped(view, shape)))
                }
                Some(key) => vae.push((key, Entry::Mapped(view))),
                None => ignored += 1,
            }
        } else if let Some(key) = clip_key(&name) {
            clip.push((key, Entry::Mapped(view)));
        } else {
            ignored += 1;
        }
    }
    debug!(
        unet = unet.len(),
        vae = vae.len(),
        clip = clip.len(),
        ignored,
        "checkpoint tensors sorted"
    );
    anyhow::ensure!(
        !unet.is_empty(),
        "{} holds no UNet weights",
        path.display()
    );

    let unet_path = out_dir.join("unet.safetensors");
    write(unet, &unet_path)?;
    let vae_path = if vae.is_empty() {
        None
    } else {
        let vae_path = out_dir.join("vae.safetensors");
        write(vae, &vae_path)?;
        Some(vae_path)
    };
    let clip_path = if clip.is_empty() {
        None
    } else {
        let clip_path = out_dir.join("clip.safetensors");
        write(clip, &clip_path)?;
        Some(clip_path)
    };
    Ok(ConvertedCheckpoint {
        version,
        unet: unet_path,
        vae: vae_path,
        clip: clip_path,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Resnet,
    Other,
}

const RESNET_RENAMES: [(&str, &str); 6] = [
    ("in_layers.0", "norm1"),
    ("in_layers.2", "conv1"),
    ("emb_layers.1", "time_emb_proj"),
    ("out_layers.0", "norm2"),
    ("out_layers.3", "conv2"),
    ("skip_connection", "conv_shortcut"),
];

/// Renames the inside of an LDM resnet. `sep` is `.` for tensor names and `_`
/// for kohya adapter names.
fn rename_resnet_param(rest: &str, sep: char) -> Option<String> {
    RESNET_RENAMES.iter().find_map(|(ldm, diffusers)| {
        let ldm = ldm.replace('.', &sep.to_string());
        let tail = rest.strip_prefix(ldm.as_str())?;
        (tail.is_empty() || tail.starts_with(sep)).then(|| format!("{diffusers}{tail}"))
    })
}

/// Maps an LDM UNet block address to its diffusers prefix. Returns the prefix,
/// the kind of block, and how many segments of `parts` were consumed.
fn unet_block(parts: &[&str]) -> Option<(String, Part, usize)> {
    let num = |i: usize| parts.get(i)?.parse::<usize>().ok();
    match parts {
        ["time_embed", "0", ..] => Some(("time_embedding.linear_1".into(), Part::Other, 2)),
        ["time_embed", "2", ..] => Some(("time_embedding.linear_2".into(), Part::Other, 2)),
        ["label_emb", "0", "0", ..] => Some(("add_embedding.linear_1".into(), Part::Other, 3)),
        ["label_emb", "0", "2", ..] => Some(("add_embedding.linear_2".into(), Part::Other, 3)),
        ["input_blocks", "0", "0", ..] => Some(("conv_in".into(), Part::Other, 3)),
        ["out", "0", ..] => Some(("conv_norm_out".into(), Part::Other, 2)),
        ["out", "2", ..] => Some(("conv_out".into(), Part::Other, 2)),
        ["input_blocks", ..] => {
            let (i, j) = (num(1)?.checked_sub(1)?, num(2)?);
            let (block, layer) = (i / (LAYERS_PER_BLOCK + 1), i % (LAYERS_PER_BLOCK + 1));
            if layer == LAYERS_PER_BLOCK {
                (parts.get(3) == Some(&"op")).then(|| {
                    (format!("down_blocks.{block}.downsamplers.0.conv"), Part::Other, 4)
                })
            } else {
                match j {
                    0 => Some((format!("down_blocks.{block}.resnets.{layer}"), Part::Resnet, 3)),
                    1 => Some((format!("down_blocks.{block}.attentions.{layer}"), Part::Other, 3)),
                    _ => None,
                }
            }
        }
        ["middle_block", ..] => match num(1)? {
            0 => Some(("mid_block.resnets.0".into(), Part::Resnet, 2)),
            1 => Some(("mid_block.attentions.0".into(), Part::Other, 2)),
            2 => Some(("mid_block.resnets.1".into(), Part::Resnet, 2)),
            _ => None,
        },
        ["output_blocks", ..] => {
            let (i, j) = (num(1)?, num(2)?);
            let (block, layer) = (i / (LAYERS_PER_BLOCK + 1), i % (LAYERS_PER_BLOCK + 1));
            if parts.get(3) == Some(&"conv") && j > 0 {
                return Some((format!("up_blocks.{block}.upsamplers.0.conv"), Part::Other, 4));
            }
            match j {
                0 => Some((format!("up_blocks.{block}.resnets.{layer}"), Part::Resnet, 3)),
                1 => Some((format!("up_blocks.{block}.attentions.{layer}"), Part::Other, 3)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Maps an LDM UNet tensor name, without its `model.diffusion_model.` prefix,
/// to the diffusers name.
pub fn unet_key(key: &str) -> Option<String> {
    let parts: Vec<&str> = key.split('.').collect();
    let (prefix, part, consumed) = unet_block(&parts)?;
    let rest = parts.get(consumed..)?.join(".");
    let rest = match part {
        Part::Resnet => rename_resnet_param(&rest, '.')?,
        Part::Other => rest,
    };
    if rest.is_empty() {
        Some(prefix)
    } else {
        Some(format!("{prefix}.{rest}"))
    }
}

/// Maps a kohya adapter name written against the LDM layout, such as
/// `input_blocks_4_1_transformer_blocks_0_attn1_to_q`, to the kohya name of the
/// same layer in the diffusers layout.
pub fn ldm_kohya_name(base: &str) -> Option<String> {
    let (block, numbers) = [("input_blocks", 2), ("middle_block", 1), ("output_blocks", 2)]
        .into_iter()
        .find(|(block, _)| {
            base.strip_prefix(*block)
                .is_some_and(|tail| tail.starts_with('_'))
        })?;
    let mut tokens = base[block.len() + 1..].splitn(numbers + 1, '_');
    let mut parts = vec![block];
    for _ in 0..numbers {
        parts.push(tokens.next()?);
    }
    let rest = tokens.next().unwrap_or("");
    let first = rest.split('_').next().unwrap_or("");
    let address = parts.len();
    parts.push(first);

    let (prefix, part, consumed) = unet_block(&parts)?;
    let rest = if consumed > address { "" } else { rest };
    let rest = match part {
        Part::Resnet => rename_resnet_param(rest, '_')?,
        Part::Other => rest.to_string(),
    };
    let prefix = prefix.replace('.', "_");
    if rest.is_empty() {
        Some(prefix)
    } else {
        Some(format!("{prefix}_{rest}"))
    }
}

/// Maps an LDM VAE tensor name, without its `first_stage_model.` prefix, to
/// the diffusers name.
pub fn vae_key(key: &str) -> Option<String> {
    let parts: Vec<&str> = key.split('.').collect();
    let (side, rest) = parts.split_first()?;
    match *side {
        "quant_conv" | "post_quant_conv" => return Some(key.to_string()),
        "encoder" | "decoder" => {}
        _ => return None,
    }
    let up_block = |i: &str| (VAE_BLOCKS - 1).checked_sub(i.parse::<usize>().ok()?);
    let mapped = match rest {
        ["conv_in" | "conv_out", ..] => rest.join("."),
        ["norm_out", tail @ ..] => format!("conv_norm_out.{}", tail.join(".")),
        ["down", i, "block", j, tail @ ..] => {
            format!("down_blocks.{i}.resnets.{j}.{}", vae_resnet_tail(tail))
        }
        ["down", i, "downsample", "conv", tail @ ..] => {
            format!("down_blocks.{i}.downsamplers.0.conv.{}", tail.join("."))
        }
        ["up", i, "block", j, tail @ ..] => format!(
            "up_blocks.{}.resnets.{j}.{}",
            up_block(*i)?,
            vae_resnet_tail(tail)
        ),
        ["up", i, "upsample", "conv", tail @ ..] => format!(
            "up_blocks.{}.upsamplers.0.conv.{}",
            up_block(*i)?,
            tail.join(".")
        ),
        ["mid", "block_1", tail @ ..] => format!("mid_block.resnets.0.{}", vae_resnet_tail(tail)),
        ["mid", "block_2", tail @ ..] => format!("mid_block.resnets.1.{}", vae_resnet_tail(tail)),
        ["mid", "attn_1", layer, tail @ ..] => {
            let layer = match *layer {
                "norm" => "group_norm",
                "q" => "query",
                "k" => "key",
                "v" => "value",
                "proj_out" => "proj_attn",
                _ => return None,
            };
            format!("mid_block.attentions.0.{layer}.{}", tail.join("."))
        }
        _ => return None,
    };
    Some(format!("{side}.{mapped}"))
}

fn vae_resnet_tail(tail: &[&str]) -> String {
    match tail {
        ["nin_shortcut", rest @ ..] => format!("conv_shortcut.{}", rest.join(".")),
        _ => tail.join("."),
    }
}

/// Maps a checkpoint text-encoder tensor name to the transformers layout.
pub fn clip_key(name: &str) -> Option<String> {
    let key = CLIP_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))?;
    if key.starts_with("text_model.") {
        Some(key.to_string())
    } else {
        Some(format!("text_model.{key}"))
    }
}

fn clip_layer_index(name: &str) -> Option<usize> {
    name.strip_prefix("text_model.encoder.layers.")?
        .split('.')
        .next()?
        .parse()
        .ok()
}

/// Writes a copy of a CLIP text encoder whose last `clip_skip - 1` layers are
/// identities: their attention output and second MLP projections are zeroed.
/// Returns the number of encoder layers.
pub fn skip_clip_layers(src: &Path, dst: &Path, clip_skip: usize) -> Result<usize> {
    let st = unsafe { MmapedSafetensors::new(src) }
        .with_context(|| format!("opening text encoder {}", src.display()))?;
    let tensors = st.tensors();
    let layers = tensors
        .iter()
        .filter_map(|(name, _)| clip_layer_index(name))
        .max()
        .map_or(0, |last| last + 1);
    anyhow::ensure!(
        clip_skip >= 1 && clip_skip <= layers,
        "clip skip {clip_skip} leaves no layer of {layers}"
    );
    let first_skipped = layers + 1 - clip_skip;

    let entries = tensors
        .into_iter()
        .map(|(name, view)| {
            let skipped = clip_layer_index(&name).is_some_and(|layer| layer >= first_skipped)
                && (name.contains(".self_attn.out_proj.") || name.contains(".mlp.fc2."));
            let entry = if skipped {
                Entry::Zeroed {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                }
            } else {
                Entry::Mapped(view)
            };
            (name, entry)
        })
        .collect();
    write(entries, dst)?;
    debug!(layers, clip_skip, "text encoder layers skipped");
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn unet_names() {
        let cases = [
            ("time_embed.0.weight", "time_embedding.linear_1.weight"),
            ("label_emb.0.2.bias", "add_embedding.linear_2.bias"),
            ("input_blocks.0.0.weight", "conv_in.weight"),
            (
                "input_blocks.1.0.in_layers.2.weight",
                "down_blocks.0.resnets.0.conv1.weight",
            ),
            (
                "input_blocks.2.1.transformer_blocks.0.attn1.to_q.weight",
                "down_blocks.0.attentions.1.transformer_blocks.0.attn1.to_q.weight",
            ),
            ("input_blocks.3.0.op.bias", "down_blocks.0.downsamplers.0.conv.bias"),
            (
                "input_blocks.4.0.skip_connection.weight",
                "down_blocks.1.resnets.0.conv_shortcut.weight",
            ),
            (
                "middle_block.2.emb_layers.1.weight",
                "mid_block.resnets.1.time_emb_proj.weight",
            ),
            (
                "middle_block.1.proj_in.weight",
                "mid_block.attentions.0.proj_in.weight",
            ),
            (
                "output_blocks.5.0.out_layers.3.weight",
                "up_blocks.1.resnets.2.conv2.weight",
            ),
            ("output_blocks.2.1.conv.weight", "up_blocks.0.upsamplers.0.conv.weight"),
            ("output_blocks.5.2.conv.bias", "up_blocks.1.upsamplers.0.conv.bias"),
            (
                "output_blocks.4.1.norm.weight",
                "up_blocks.1.attentions.1.norm.weight",
            ),
            ("out.0.weight", "conv_norm_out.weight"),
            ("out.2.bias", "conv_out.bias"),
        ];
        for (ldm, diffusers) in cases {
            assert_eq!(unet_key(ldm).as_deref(), Some(diffusers), "{ldm}");
        }
        assert_eq!(unet_key("something.else"), None);
    }

    #[test]
    fn kohya_ldm_names() {
        assert_eq!(
            ldm_kohya_name("input_blocks_4_1_transformer_blocks_0_attn1_to_q").as_deref(),
            Some("down_blocks_1_attentions_0_transformer_blocks_0_attn1_to_q")
        );
        assert_eq!(
            ldm_kohya_name("output_blocks_0_0_in_layers_2").as_deref(),
            Some("up_blocks_0_resnets_0_conv1")
        );
        assert_eq!(
            ldm_kohya_name("input_blocks_3_0_op").as_deref(),
            Some("down_blocks_0_downsamplers_0_conv")
        );
        assert_eq!(
            ldm_kohya_name("middle_block_1_proj_out").as_deref(),
            Some("mid_block_attentions_0_proj_out")
        );
        assert_eq!(ldm_kohya_name("down_blocks_0_attentions_0_proj_in"), None);
    }

    #[test]
    fn vae_names() {
        let cases = [
            ("encoder.conv_in.weight", "encoder.conv_in.weight"),
            (
                "encoder.down.1.block.0.nin_shortcut.bias",
                "encoder.down_blocks.1.resnets.0.conv_shortcut.bias",
            ),
            (
                "encoder.down.0.downsample.conv.weight",
                "encoder.down_blocks.0.downsamplers.0.conv.weight",
            ),
            (
                "decoder.up.3.block.2.norm1.weight",
                "decoder.up_blocks.0.resnets.2.norm1.weight",
            ),
            (
                "decoder.up.1.upsample.conv.bias",
                "decoder.up_blocks.2.upsamplers.0.conv.bias",
            ),
            (
                "decoder.mid.attn_1.proj_out.weight",
                "decoder.mid_block.attentions.0.proj_attn.weight",
            ),
            ("decoder.norm_out.bias", "decoder.conv_norm_out.bias"),
            ("post_quant_conv.weight", "post_quant_conv.weight"),
        ];
        for (ldm, diffusers) in cases {
            assert_eq!(vae_key(ldm).as_deref(), Some(diffusers), "{ldm}");
        }
        assert_eq!(vae_key("decoder.up.7.block.0.conv1.weight"), None);
    }

    #[test]
    fn clip_names_and_families() {
        assert_eq!(
            clip_key("cond_stage_model.transformer.text_model.final_layer_norm.weight")
                .as_deref(),
            Some("text_model.final_layer_norm.weight")
        );
        assert_eq!(
            clip_key("cond_stage_model.transformer.embeddings.position_ids").as_deref(),
            Some("text_model.embeddings.position_ids")
        );
        assert_eq!(clip_key("conditioner.embedders.1.model.ln_final.weight"), None);

        assert_eq!(
            detect_family(["model.diffusion_model.out.2.weight"]),
            StableDiffusionVersion::V1_5
        );
        assert_eq!(
            detect_family(["cond_stage_model.model.ln_final.weight"]),
            StableDiffusionVersion::V2_1
        );
        assert_eq!(
            detect_family(["model.diffusion_model.out.2.weight", "conditioner.embedders.0.x"]),
            StableDiffusionVersion::Xl
        );
    }

    fn zeros(shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::zeros(shape, DType::F32, &Device::Cpu)?)
    }

    #[test]
    fn checkpoint_conversion_splits_components() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("ckpt.safetensors");
        let tensors: HashMap<String, Tensor> = [
            ("model.diffusion_model.input_blocks.0.0.weight", zeros(&[4, 4, 3, 3])?),
            ("model.diffusion_model.out.2.bias", zeros(&[4])?),
            ("first_stage_model.decoder.mid.attn_1.q.weight", zeros(&[8, 8, 1, 1])?),
            (
                "cond_stage_model.transformer.text_model.final_layer_norm.weight",
                zeros(&[8])?,
            ),
            ("model_ema.decay", zeros(&[1])?),
        ]
        .into_iter()
        .map(|(name, tensor)| (name.to_string(), tensor))
        .collect();
        candle_core::safetensors::save(&tensors, &src)?;

        let out = tempfile::tempdir()?;
        let converted = convert_checkpoint(&src, out.path())?;
        assert_eq!(converted.version, StableDiffusionVersion::V1_5);

        let unet = candle_core::safetensors::load(&converted.unet, &Device::Cpu)?;
        assert!(unet.contains_key("conv_in.weight"));
        assert!(unet.contains_key("conv_out.bias"));

        let vae_path = converted.vae.context("vae missing")?;
        let vae = candle_core::safetensors::load(vae_path, &Device::Cpu)?;
        let query = &vae["decoder.mid_block.attentions.0.query.weight"];
        assert_eq!(query.dims(), &[8, 8]);

        let clip_path = converted.clip.context("clip missing")?;
        let clip = candle_core::safetensors::load(clip_path, &Device::Cpu)?;
        assert!(clip.contains_key("text_model.final_layer_norm.weight"));
        Ok(())
    }

    #[test]
    fn checkpoint_without_unet_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("vae_only.safetensors");
        let tensors = HashMap::from([(
            "first_stage_model.encoder.conv_in.weight".to_string(),
            zeros(&[4])?,
        )]);
        candle_core::safetensors::save(&tensors, &src)?;
        assert!(convert_checkpoint(&src, dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn clip_skip_zeroes_trailing_layers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("clip.safetensors");
        let mut tensors = HashMap::new();
        for layer in 0..3 {
            for param in ["self_attn.out_proj", "mlp.fc2", "mlp.fc1"] {
                for kind in ["weight", "bias"] {
                    tensors.insert(
                        format!("text_model.encoder.layers.{layer}.{param}.{kind}"),
                        Tensor::ones(2, DType::F32, &Device::Cpu)?,
                    );
                }
            }
        }
        candle_core::safetensors::save(&tensors, &src)?;

        let dst = dir.path().join("skipped.safetensors");
        assert_eq!(skip_clip_layers(&src, &dst, 2)?, 3);
        let skipped = candle_core::safetensors::load(&dst, &Device::Cpu)?;
        let sum = |name: &str| -> Result<f32> { Ok(skipped[name].sum_all()?.to_scalar()?) };
        assert_eq!(sum("text_model.encoder.layers.2.mlp.fc2.weight")?, 0.);
        assert_eq!(sum("text_model.encoder.layers.2.self_attn.out_proj.bias")?, 0.);
        assert_eq!(sum("text_model.encoder.layers.2.mlp.fc1.weight")?, 2.);
        assert_eq!(sum("text_model.encoder.layers.1.mlp.fc2.weight")?, 2.);

        assert!(skip_clip_layers(&src, &dst, 3).is_ok());
        assert!(skip_clip_layers(&src, &dst, 4).is_err());
        Ok(())
    }
}
