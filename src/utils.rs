use anyhow::Result;
use candle_core::{DType, Device, Error, IndexOp, Tensor};
use image::{DynamicImage, ImageBuffer};

/// Converts a decoded image with shape (1, 3, height, width) and values in
/// [-1, 1] to an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let img = ((img / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
    let img = (img.to_dtype(DType::F32)?.clamp(0f32, 1.)? * 255.)?
        .to_dtype(DType::U8)?
        .i(0)?;
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        return Err(Error::Msg(format!(
            "expected an image of shape (3, height, width), got {channel} channels"
        ))
        .into());
    }
    let pixels = img.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let image: ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        match ImageBuffer::from_raw(width as u32, height as u32, pixels) {
            Some(image) => image,
            None => return Err(Error::Msg("error converting image".to_string()).into()),
        };
    Ok(DynamicImage::ImageRgb8(image))
}

/// Prepares a source image for the autoencoder: cropped to a multiple of 32
/// on both sides and scaled to [-1, 1]. Returns a (1, 3, height, width) tensor.
pub fn image_to_tensor(img: &DynamicImage) -> Result<Tensor> {
    let (height, width) = (img.height() as usize, img.width() as usize);
    let height = height - height % 32;
    let width = width - width % 32;
    anyhow::ensure!(
        height > 0 && width > 0,
        "image is too small, {}x{} after cropping to multiples of 32",
        width,
        height
    );
    let img = img.resize_to_fill(
        width as u32,
        height as u32,
        image::imageops::FilterType::CatmullRom,
    );
    let img = img.to_rgb8().into_raw();
    let img = Tensor::from_vec(img, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(img)
}

pub fn output_filename(basename: &str, sample_idx: usize, num_samples: usize) -> String {
    if num_samples <= 1 {
        return basename.to_string();
    }
    match basename.rsplit_once('.') {
        None => format!("{basename}.{sample_idx}.png"),
        Some((filename_no_extension, extension)) => {
            format!("{filename_no_extension}.{sample_idx}.{extension}")
        }
    }
}

/// Shortens a message to at most `max` characters.
pub fn truncate(msg: &str, max: usize) -> String {
    match msg.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &msg[..idx]),
        None => msg.to_string(),
    }
}
