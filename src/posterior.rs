//! Autoencoder posterior of the source image, sampled from a seeded
//! [`NoiseSource`] so that img2img latents are reproducible on every device.
use candle_core::{Result, Shape, Tensor};
use candle_nn::{conv2d, group_norm, ops, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig,
};

use crate::request::VariantPlan;
use crate::schedulers::NoiseSource;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    pub norm_num_groups: usize,
    pub latent_channels: usize,
}

/// Shared by the 1.5, 2.1 and XL autoencoders.
impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            norm_num_groups: 32,
            latent_channels: 4,
        }
    }
}

/// Encoder half of the autoencoder plus its `quant_conv`.
#[derive(Debug)]
pub struct PosteriorEncoder {
    conv_in: Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    quant_conv: Conv2d,
}

impl PosteriorEncoder {
    /// `vb` points at the root of an autoencoder weights file.
    pub fn new(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        let channels = &config.block_out_channels;
        let (first, last) = match (channels.first(), channels.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => candle_core::bail!("the encoder needs at least one block"),
        };
        let encoder = vb.pp("encoder");
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(3, first, 3, padded, encoder.pp("conv_in"))?;

        let mut down_blocks = Vec::with_capacity(channels.len());
        let mut in_channels = first;
        for (index, &out_channels) in channels.iter().enumerate() {
            let block = DownEncoderBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: 1e-6,
                resnet_groups: config.norm_num_groups,
                add_downsample: index + 1 < channels.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            down_blocks.push(DownEncoderBlock2D::new(
                encoder.pp("down_blocks").pp(index),
                in_channels,
                out_channels,
                block,
            )?);
            in_channels = out_channels;
        }

        let mid = UNetMidBlock2DConfig {
            resnet_eps: 1e-6,
            output_scale_factor: 1.,
            attn_num_head_channels: None,
            resnet_groups: Some(config.norm_num_groups),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(encoder.pp("mid_block"), last, None, mid)?;
        let conv_norm_out =
            group_norm(config.norm_num_groups, last, 1e-6, encoder.pp("conv_norm_out"))?;
        let moments = 2 * config.latent_channels;
        let conv_out = conv2d(last, moments, 3, padded, encoder.pp("conv_out"))?;
        let quant_conv = conv2d(moments, moments, 1, Default::default(), vb.pp("quant_conv"))?;
        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
        })
    }

    /// Encodes an image in `[-1, 1]` with shape `(b, 3, h, w)`.
    pub fn encode(&self, xs: &Tensor) -> Result<Posterior> {
        let mut xs = xs.apply(&self.conv_in)?;
        for block in &self.down_blocks {
            xs = xs.apply(block)?;
        }
        let xs = self
            .mid_block
            .forward(&xs, None)?
            .apply(&self.conv_norm_out)?;
        let moments = ops::silu(&xs)?
            .apply(&self.conv_out)?
            .apply(&self.quant_conv)?;
        let latent_channels = moments.dim(1)? / 2;
        let mean = moments.narrow(1, 0, latent_channels)?;
        let logvar = moments.narrow(1, latent_channels, latent_channels)?;
        let std = (logvar * 0.5)?.exp()?;
        Ok(Posterior { mean, std })
    }

    /// Encodes `image` and draws everything random for one variant from its
    /// plan: the initial noise first, then the latent sample. Returns the
    /// unscaled latents, the noise and the source the sampler continues from.
    pub fn seeded_latents(
        &self,
        image: &Tensor,
        plan: &VariantPlan,
    ) -> Result<(Tensor, Tensor, NoiseSource)> {
        let posterior = self.encode(image)?;
        let (noise, mut source) = plan.initial_noise(posterior.shape(), image.device())?;
        let latents = posterior.sample(&mut source)?;
        Ok((latents, noise, source))
    }
}

/// Diagonal Gaussian over the latents.
#[derive(Debug, Clone)]
pub struct Posterior {
    mean: Tensor,
    std: Tensor,
}

impl Posterior {
    pub fn shape(&self) -> Shape {
        self.mean.shape().clone()
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn sample(&self, source: &mut NoiseSource) -> Result<Tensor> {
        let noise = source.randn_like(&self.mean)?;
        self.std.mul(&noise)?.add(&self.mean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{plan_variants, GenerationParams};
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> Result<PosteriorEncoder> {
        let config = EncoderConfig {
            block_out_channels: vec![32, 32],
            layers_per_block: 1,
            norm_num_groups: 32,
            latent_channels: 4,
        };
        PosteriorEncoder::new(VarBuilder::zeros(DType::F32, &Device::Cpu), &config)
    }

    fn plan(seed: u64) -> VariantPlan {
        let params = GenerationParams {
            seed: Some(seed),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        plan_variants(&params, &mut rng).remove(0)
    }

    fn values(tensor: &Tensor) -> Result<Vec<f32>> {
        tensor.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn latents_are_downsampled_per_block() -> Result<()> {
        let image = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        let posterior = tiny()?.encode(&image)?;
        assert_eq!(posterior.shape().dims(), &[1, 4, 8, 8]);
        assert!(values(posterior.mean())?.iter().all(|v| *v == 0.));
        Ok(())
    }

    #[test]
    fn same_plan_gives_identical_latents() -> Result<()> {
        let encoder = tiny()?;
        let image = Tensor::ones((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        let (first, first_noise, _) = encoder.seeded_latents(&image, &plan(42))?;
        let (second, second_noise, _) = encoder.seeded_latents(&image, &plan(42))?;
        assert_eq!(values(&first)?, values(&second)?);
        assert_eq!(values(&first_noise)?, values(&second_noise)?);

        let (other, _, _) = encoder.seeded_latents(&image, &plan(43))?;
        assert_ne!(values(&first)?, values(&other)?);
        Ok(())
    }

    #[test]
    fn sample_follows_the_initial_noise_in_the_stream() -> Result<()> {
        // Zero weights give a standard normal posterior, so the sample is the
        // second draw of the variant's source.
        let image = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu)?;
        let plan = plan(7);
        let (latents, noise, mut source) = tiny()?.seeded_latents(&image, &plan)?;

        let mut expected = NoiseSource::new(plan.noise_seed);
        let initial = expected.randn((1, 4, 8, 8), &Device::Cpu)?;
        let sample = expected.randn((1, 4, 8, 8), &Device::Cpu)?;
        assert_eq!(values(&noise)?, values(&initial)?);
        assert_eq!(values(&latents)?, values(&sample)?);

        let next = source.randn((1, 4, 8, 8), &Device::Cpu)?;
        let after = expected.randn((1, 4, 8, 8), &Device::Cpu)?;
        assert_eq!(values(&next)?, values(&after)?);
        Ok(())
    }
}
