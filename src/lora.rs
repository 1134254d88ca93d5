//! LoRA (Low-Rank Adaptation) adapters.
//!
//! Adapters are merged into a copy of the UNet weights before the UNet is
//! built: W' = W + scale * (alpha / rank) * (up @ down).
//!
//! Kohya, diffusers and PEFT tensor names are understood. Text encoder layers
//! are not merged.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::classify::weights_file;
use crate::weights::{self, ldm_kohya_name, Entry};

/// How unmatched adapter layers are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Every UNet layer of the adapter has to apply.
    Strict,
    /// Layers that do not apply are skipped, at least one has to apply.
    Lenient,
}

/// Individual LoRA weight pair for a single layer
#[derive(Debug)]
pub struct LoraWeight {
    /// Down projection matrix (A) - reduces dimensionality [rank, in_features]
    pub lora_down: Tensor,
    /// Up projection matrix (B) - restores dimensionality [out_features, rank]
    pub lora_up: Tensor,
    /// Alpha scaling factor (defaults to rank if not specified)
    pub alpha: f32,
    pub rank: usize,
}

#[derive(Debug)]
pub struct LoraAdapter {
    /// UNet weight pairs keyed by normalized layer name.
    pub weights: BTreeMap<String, LoraWeight>,
    /// Text encoder pairs found in the file, these are not merged.
    pub text_encoder_pairs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Down,
    Up,
}

const DOWN_SUFFIXES: [&str; 3] = [".lora_down.weight", ".lora.down.weight", ".lora_A.weight"];
const UP_SUFFIXES: [&str; 3] = [".lora_up.weight", ".lora.up.weight", ".lora_B.weight"];

/// Splits a tensor name into the layer it adapts and the role of the tensor.
fn split_lora_key(key: &str) -> Option<(&str, Role)> {
    DOWN_SUFFIXES
        .iter()
        .find_map(|suffix| key.strip_suffix(suffix).map(|base| (base, Role::Down)))
        .or_else(|| {
            UP_SUFFIXES
                .iter()
                .find_map(|suffix| key.strip_suffix(suffix).map(|base| (base, Role::Up)))
        })
}

/// Removes the wrapping prefixes PEFT and diffusers put around UNet layer names.
pub fn normalize_lora_key(base: &str) -> String {
    let base = base.strip_prefix("base_model.model.").unwrap_or(base);
    let base = base.strip_prefix("unet.").unwrap_or(base);
    base.to_string()
}

fn is_text_encoder(layer: &str) -> bool {
    layer.starts_with("lora_te") || layer.starts_with("text_encoder")
}

impl LoraAdapter {
    /// Loads an adapter file, or the weights file of an adapter directory.
    pub fn load(path: &Path) -> Result<Self> {
        let path = weights_file(path);
        info!(path = %path.display(), "loading LoRA adapter");
        let tensors = unsafe { MmapedSafetensors::new(&path) }
            .with_context(|| format!("failed to parse safetensors: {}", path.display()))?;

        let mut alpha_values: HashMap<String, f32> = HashMap::new();
        let mut down_tensors: HashMap<String, Tensor> = HashMap::new();
        let mut up_tensors: HashMap<String, Tensor> = HashMap::new();
        let mut unknown = 0usize;

        for (key, _) in tensors.tensors() {
            if let Some(base) = key.strip_suffix(".alpha") {
                let alpha = tensors
                    .load(&key, &Device::Cpu)?
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                match alpha.first() {
                    Some(alpha) => {
                        alpha_values.insert(normalize_lora_key(base), *alpha);
                    }
                    None => warn!(key = %key, "empty alpha tensor"),
                }
            } else if let Some((base, role)) = split_lora_key(&key) {
                let tensor = tensors.load(&key, &Device::Cpu)?.to_dtype(DType::F32)?;
                let layer = normalize_lora_key(base);
                match role {
                    Role::Down => down_tensors.insert(layer, tensor),
                    Role::Up => up_tensors.insert(layer, tensor),
                };
            } else {
                unknown += 1;
            }
        }
        if unknown > 0 {
            debug!(unknown, "ignored tensors that are not LoRA pairs");
        }

        let mut weights = BTreeMap::new();
        let mut text_encoder_pairs = 0;
        for (layer_name, lora_down) in down_tensors {
            let Some(lora_up) = up_tensors.remove(&layer_name) else {
                warn!(layer = %layer_name, "LoRA down tensor without matching up tensor");
                continue;
            };
            if is_text_encoder(&layer_name) {
                text_encoder_pairs += 1;
                continue;
            }
            let rank = lora_down.dims().first().copied().unwrap_or(0);
            anyhow::ensure!(rank > 0, "LoRA layer {layer_name} has rank 0");
            let alpha = alpha_values
                .get(&layer_name)
                .copied()
                .unwrap_or(rank as f32);
            weights.insert(
                layer_name,
                LoraWeight {
                    lora_down,
                    lora_up,
                    alpha,
                    rank,
                },
            );
        }
        for layer_name in up_tensors.keys() {
            warn!(layer = %layer_name, "LoRA up tensor without matching down tensor");
        }
        if text_encoder_pairs > 0 {
            info!(text_encoder_pairs, "text encoder layers of the adapter are not applied");
        }

        info!(weight_pairs = weights.len(), "LoRA adapter loaded");
        Ok(Self {
            weights,
            text_encoder_pairs,
        })
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }
}

/// Finds the UNet tensor an adapter layer applies to.
pub struct UnetIndex {
    keys: HashSet<String>,
    /// Kohya style layer names, `lora_unet_` prefix removed.
    kohya: HashMap<String, String>,
}

impl UnetIndex {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let keys: HashSet<String> = keys.into_iter().collect();
        let kohya = keys
            .iter()
            .filter_map(|key| {
                let stem = key.strip_suffix(".weight")?;
                Some((stem.replace('.', "_"), key.clone()))
            })
            .collect();
        Self { keys, kohya }
    }

    /// Returns the weight tensor name for an adapter layer.
    pub fn resolve(&self, layer: &str) -> Option<String> {
        if let Some(kohya) = layer.strip_prefix("lora_unet_") {
            return self.kohya.get(kohya).cloned().or_else(|| {
                let translated = ldm_kohya_name(kohya)?;
                self.kohya.get(&translated).cloned()
            });
        }
        let key = format!("{layer}.weight");
        self.keys.contains(&key).then_some(key)
    }
}

/// Outcome of merging an adapter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: usize,
    pub skipped: Vec<String>,
}

fn merge_weight(base: &Tensor, weight: &LoraWeight, scale: f64) -> Result<Tensor> {
    let up = weight.lora_up.flatten_from(1)?;
    let down = weight.lora_down.flatten_from(1)?;
    let delta = up.matmul(&down)?;
    anyhow::ensure!(
        delta.elem_count() == base.elem_count() && delta.dims()[0] == base.dims()[0],
        "adapter shape {:?} does not fit weight shape {:?}",
        delta.dims(),
        base.dims()
    );
    let factor = scale * weight.alpha as f64 / weight.rank as f64;
    let merged = (base.to_dtype(DType::F32)? + (delta.reshape(base.shape())? * factor)?)?;
    Ok(merged.to_dtype(base.dtype())?)
}

/// Writes the UNet weights at `base` with the adapter merged in to `dst`.
/// Nothing is written when the merge fails.
pub fn merge_into(
    adapter: &LoraAdapter,
    base: &Path,
    dst: &Path,
    strategy: MergeStrategy,
    scale: f64,
) -> Result<MergeReport> {
    anyhow::ensure!(
        !adapter.weights.is_empty(),
        "the adapter holds no UNet layers"
    );
    let st = unsafe { MmapedSafetensors::new(base) }
        .with_context(|| format!("opening UNet weights {}", base.display()))?;
    let tensors = st.tensors();
    let index = UnetIndex::new(tensors.iter().map(|(name, _)| name.clone()));

    let mut report = MergeReport::default();
    let mut targets: HashMap<String, (&str, &LoraWeight)> = HashMap::new();
    for (layer, weight) in adapter.weights.iter() {
        match index.resolve(layer) {
            Some(target) => {
                targets.insert(target, (layer.as_str(), weight));
            }
            None if strategy == MergeStrategy::Strict => {
                anyhow::bail!("no UNet layer matches adapter layer {layer}")
            }
            None => {
                warn!(layer = %layer, "skipping adapter layer without a UNet match");
                report.skipped.push(layer.clone());
            }
        }
    }

    let mut entries = Vec::with_capacity(tensors.len());
    for (name, view) in tensors {
        let Some((layer, weight)) = targets.get(&name) else {
            entries.push((name, Entry::Mapped(view)));
            continue;
        };
        let original = st.load(&name, &Device::Cpu)?;
        match merge_weight(&original, weight, scale) {
            Ok(merged) => {
                entries.push((name, Entry::from_tensor(&merged)?));
                report.applied += 1;
            }
            Err(err) if strategy == MergeStrategy::Lenient => {
                warn!(layer = %layer, "skipping adapter layer: {err:#}");
                report.skipped.push(layer.to_string());
                entries.push((name, Entry::Mapped(view)));
            }
            Err(err) => return Err(err.context(format!("merging adapter layer {layer}"))),
        }
    }
    anyhow::ensure!(
        report.applied > 0,
        "none of the {} adapter layers apply to this UNet",
        adapter.weight_count()
    );

    weights::write(entries, dst)?;
    info!(
        applied = report.applied,
        skipped = report.skipped.len(),
        "LoRA merged"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::ones(shape, DType::F32, &Device::Cpu)?)
    }

    fn save(path: &Path, tensors: Vec<(&str, Tensor)>) -> Result<()> {
        let tensors: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(name, tensor)| (name.to_string(), tensor))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    fn unet(dir: &Path) -> Result<std::path::PathBuf> {
        let path = dir.join("unet.safetensors");
        save(
            &path,
            vec![
                ("down_blocks.0.attentions.0.proj_in.weight", ones(&[4, 4])?),
                ("down_blocks.0.attentions.0.proj_in.bias", ones(&[4])?),
                ("conv_in.weight", ones(&[4, 4, 3, 3])?),
            ],
        )?;
        Ok(path)
    }

    #[test]
    fn key_splitting() {
        assert_eq!(
            split_lora_key("lora_unet_mid_block_attentions_0_proj_in.lora_down.weight"),
            Some(("lora_unet_mid_block_attentions_0_proj_in", Role::Down))
        );
        assert_eq!(
            split_lora_key("unet.mid_block.attentions.0.proj_in.lora.up.weight"),
            Some(("unet.mid_block.attentions.0.proj_in", Role::Up))
        );
        assert_eq!(split_lora_key("conv_in.weight"), None);
        assert_eq!(
            normalize_lora_key("base_model.model.mid_block.attentions.0.proj_in"),
            "mid_block.attentions.0.proj_in"
        );
    }

    #[test]
    fn index_resolves_all_naming_schemes() {
        let index = UnetIndex::new([
            "down_blocks.0.attentions.0.proj_in.weight".to_string(),
            "down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_out.0.weight".to_string(),
        ]);
        let expected = Some("down_blocks.0.attentions.0.proj_in.weight".to_string());
        assert_eq!(index.resolve("lora_unet_down_blocks_0_attentions_0_proj_in"), expected);
        assert_eq!(index.resolve("lora_unet_input_blocks_1_1_proj_in"), expected);
        assert_eq!(index.resolve("down_blocks.0.attentions.0.proj_in"), expected);
        assert_eq!(
            index.resolve("lora_unet_input_blocks_4_1_transformer_blocks_0_attn1_to_out_0"),
            Some("down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_out.0.weight".to_string())
        );
        assert_eq!(index.resolve("lora_unet_up_blocks_3_attentions_0_proj_in"), None);
    }

    #[test]
    fn merge_applies_scaled_delta() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = unet(dir.path())?;
        let adapter_path = dir.path().join("adapter.safetensors");
        save(
            &adapter_path,
            vec![
                ("lora_unet_down_blocks_0_attentions_0_proj_in.lora_down.weight", ones(&[2, 4])?),
                ("lora_unet_down_blocks_0_attentions_0_proj_in.lora_up.weight", ones(&[4, 2])?),
                (
                    "lora_unet_down_blocks_0_attentions_0_proj_in.alpha",
                    Tensor::new(1f32, &Device::Cpu)?,
                ),
                ("lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_down.weight", ones(&[2, 4])?),
                ("lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_up.weight", ones(&[4, 2])?),
            ],
        )?;
        let adapter = LoraAdapter::load(&adapter_path)?;
        assert_eq!(adapter.weight_count(), 1);
        assert_eq!(adapter.text_encoder_pairs, 1);

        let merged = dir.path().join("merged.safetensors");
        let report = merge_into(&adapter, &base, &merged, MergeStrategy::Strict, 1.0)?;
        assert_eq!(report.applied, 1);
        let tensors = candle_core::safetensors::load(&merged, &Device::Cpu)?;
        // 1 + (1 / 2) * 2
        let values = tensors["down_blocks.0.attentions.0.proj_in.weight"]
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (v - 2.0).abs() < 1e-6));
        let bias = tensors["down_blocks.0.attentions.0.proj_in.bias"].sum_all()?;
        assert_eq!(bias.to_scalar::<f32>()?, 4.0);
        Ok(())
    }

    #[test]
    fn strict_and_lenient_merges() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = unet(dir.path())?;
        let adapter_path = dir.path().join("adapter.safetensors");
        save(
            &adapter_path,
            vec![
                ("unet.down_blocks.0.attentions.0.proj_in.lora_A.weight", ones(&[2, 4])?),
                ("unet.down_blocks.0.attentions.0.proj_in.lora_B.weight", ones(&[4, 2])?),
                ("unet.up_blocks.9.attentions.0.proj_in.lora_A.weight", ones(&[2, 4])?),
                ("unet.up_blocks.9.attentions.0.proj_in.lora_B.weight", ones(&[4, 2])?),
                ("unet.conv_in.lora_A.weight", ones(&[2, 3])?),
                ("unet.conv_in.lora_B.weight", ones(&[4, 2])?),
            ],
        )?;
        let adapter = LoraAdapter::load(&adapter_path)?;
        let merged = dir.path().join("merged.safetensors");

        assert!(merge_into(&adapter, &base, &merged, MergeStrategy::Strict, 1.0).is_err());
        assert!(!merged.exists());

        let report = merge_into(&adapter, &base, &merged, MergeStrategy::Lenient, 0.5)?;
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(merged.exists());
        Ok(())
    }

    #[test]
    fn nothing_applicable_fails_even_when_lenient() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = unet(dir.path())?;
        let adapter_path = dir.path().join("adapter.safetensors");
        save(
            &adapter_path,
            vec![
                ("lora_unet_foo.lora_down.weight", ones(&[2, 4])?),
                ("lora_unet_foo.lora_up.weight", ones(&[4, 2])?),
            ],
        )?;
        let adapter = LoraAdapter::load(&adapter_path)?;
        let merged = dir.path().join("merged.safetensors");
        assert!(merge_into(&adapter, &base, &merged, MergeStrategy::Lenient, 1.0).is_err());
        Ok(())
    }
}
