//! # 解码、缩放与编码流水线模块
//!
//! ## 设计思路
//!
//! 将“字节 → 位图 → 缩放 → 字节”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 猜测格式并读取 header 尺寸
//! 2. 按像素/内存上限快速拒绝
//! 3. 完整解码为 RGBA
//! 4. 缩放优先走 `fast_image_resize`，失败回退 `image::imageops::resize`
//! 5. 画布按输出格式编码

use fast_image_resize as fr;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

use super::card::{Bitmap, RawImageData};
use super::{CardError, CompositeConfig, CompositeError, OutputFormat, ResizeProfile};

/// 将原始字节解码为 RGBA 位图。
pub(crate) fn decode_raster(raw: RawImageData, config: &CompositeConfig) -> Result<Bitmap, CardError> {
    let (header_width, header_height) = inspect_dimensions_from_memory(&raw.bytes)?;
    validate_pixel_limits(config, header_width, header_height)?;
    validate_decoded_memory_limits(config, header_width, header_height)?;

    let decoded = image::load_from_memory(&raw.bytes)
        .map_err(|e| CardError::Decode(format!("图片解码失败：{}", e)))?;

    let (width, height) = decoded.dimensions();
    validate_pixel_limits(config, width, height)?;

    log::debug!(
        "✅ 图片解码成功 - 来源: {} 尺寸: {}x{}",
        raw.source_hint,
        width,
        height
    );

    Ok(decoded.to_rgba8())
}

/// 仅通过内存中的图片头信息读取宽高。
fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), CardError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CardError::Decode(format!("无法识别图片格式：{}", e)))?;

    if reader.format().is_none() {
        return Err(CardError::Decode("无法识别图片格式".to_string()));
    }

    reader
        .into_dimensions()
        .map_err(|e| CardError::Decode(format!("无法读取图片尺寸：{}", e)))
}

fn validate_pixel_limits(config: &CompositeConfig, width: u32, height: u32) -> Result<(), CardError> {
    let pixels = (width as u64) * (height as u64);

    if pixels > config.max_decoded_pixels {
        return Err(CardError::ResourceLimit(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, config.max_decoded_pixels
        )));
    }

    Ok(())
}

fn validate_decoded_memory_limits(
    config: &CompositeConfig,
    width: u32,
    height: u32,
) -> Result<(), CardError> {
    let estimated = (width as u64)
        .checked_mul(height as u64)
        .and_then(|pixels| pixels.checked_mul(4))
        .ok_or_else(|| CardError::ResourceLimit("图片解码内存估算溢出".to_string()))?;

    if estimated > config.max_decoded_bytes {
        return Err(CardError::ResourceLimit(format!(
            "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
            estimated as f64 / 1024.0 / 1024.0,
            config.max_decoded_bytes as f64 / 1024.0 / 1024.0
        )));
    }

    Ok(())
}

/// 将位图缩放到精确尺寸。
///
/// 目标尺寸与原尺寸一致时直接返回原图。
pub(crate) fn resize_bitmap(
    bitmap: Bitmap,
    target_width: u32,
    target_height: u32,
    profile: ResizeProfile,
) -> Bitmap {
    if bitmap.dimensions() == (target_width, target_height) {
        return bitmap;
    }

    match resize_with_fast_image_resize(&bitmap, target_width, target_height, profile) {
        Ok(resized) => resized,
        Err(err) => {
            log::warn!("⚠️ fast_image_resize 缩放失败，回退 image::imageops::resize：{}", err);
            image::imageops::resize(&bitmap, target_width, target_height, to_image_filter(profile))
        }
    }
}

fn resize_with_fast_image_resize(
    bitmap: &Bitmap,
    target_width: u32,
    target_height: u32,
    profile: ResizeProfile,
) -> Result<Bitmap, CardError> {
    let (src_width, src_height) = bitmap.dimensions();

    let src_image = fr::images::Image::from_vec_u8(
        src_width,
        src_height,
        bitmap.as_raw().clone(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| CardError::Decode(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(to_fast_alg(profile));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| CardError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

    Bitmap::from_raw(target_width, target_height, dst_image.into_vec())
        .ok_or_else(|| CardError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))
}

fn to_fast_alg(profile: ResizeProfile) -> fr::ResizeAlg {
    match profile {
        ResizeProfile::Speed => fr::ResizeAlg::Nearest,
        ResizeProfile::Balanced => fr::ResizeAlg::Convolution(fr::FilterType::Bilinear),
        ResizeProfile::Quality => fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom),
    }
}

fn to_image_filter(profile: ResizeProfile) -> FilterType {
    match profile {
        ResizeProfile::Speed => FilterType::Nearest,
        ResizeProfile::Balanced => FilterType::Triangle,
        ResizeProfile::Quality => FilterType::CatmullRom,
    }
}

/// 将最终画布编码为输出字节。
///
/// JPEG 不支持透明通道，编码前先转换为 RGB。
pub(crate) fn encode_canvas(canvas: Bitmap, format: OutputFormat) -> Result<Vec<u8>, CompositeError> {
    let Some(image_format) = format.image_format() else {
        return Err(CompositeError::Encode(format!(
            "{} 不是位图格式，无法编码画布",
            format.extension()
        )));
    };

    let image = match format {
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8()),
        _ => DynamicImage::ImageRgba8(canvas),
    };

    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, image_format)
        .map_err(|e| CompositeError::Encode(format!("画布编码失败：{}", e)))?;

    Ok(cursor.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgba};

    pub(crate) fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let r = (x % 255) as u8;
            let g = (y % 255) as u8;
            let b = ((x + y) % 255) as u8;
            Rgba([r, g, b, 255])
        });

        let dyn_img = DynamicImage::ImageRgba8(img);
        let mut cursor = Cursor::new(Vec::new());
        dyn_img
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("failed to encode test image");
        cursor.into_inner()
    }

    fn raw(bytes: Vec<u8>) -> RawImageData {
        RawImageData {
            bytes,
            source_hint: "test",
        }
    }

    #[test]
    fn decode_raster_keeps_dimensions() {
        let bitmap = decode_raster(raw(create_png_bytes(320, 200)), &CompositeConfig::default())
            .expect("decode should succeed");

        assert_eq!(bitmap.dimensions(), (320, 200));
    }

    #[test]
    fn decode_raster_rejects_garbage() {
        let result = decode_raster(raw(b"definitely not an image".to_vec()), &CompositeConfig::default());
        assert!(matches!(result, Err(CardError::Decode(_))));
    }

    #[test]
    fn decode_raster_rejects_truncated_png() {
        let mut bytes = create_png_bytes(64, 64);
        bytes.truncate(bytes.len() / 2);

        let result = decode_raster(raw(bytes), &CompositeConfig::default());
        assert!(matches!(result, Err(CardError::Decode(_))));
    }

    #[test]
    fn decode_raster_rejects_too_many_pixels() {
        let config = CompositeConfig {
            max_decoded_pixels: 10_000,
            ..CompositeConfig::default()
        };

        let result = decode_raster(raw(create_png_bytes(200, 200)), &config);
        assert!(matches!(result, Err(CardError::ResourceLimit(_))));
    }

    #[test]
    fn decode_raster_rejects_memory_estimate_over_limit() {
        let config = CompositeConfig {
            max_decoded_bytes: 1024,
            ..CompositeConfig::default()
        };

        let result = decode_raster(raw(create_png_bytes(32, 32)), &config);
        assert!(matches!(result, Err(CardError::ResourceLimit(_))));
    }

    #[test]
    fn resize_bitmap_hits_exact_target_for_every_profile() {
        for profile in [ResizeProfile::Speed, ResizeProfile::Balanced, ResizeProfile::Quality] {
            let bitmap = Bitmap::from_pixel(400, 300, Rgba([10, 20, 30, 255]));
            let resized = resize_bitmap(bitmap, 101, 77, profile);
            assert_eq!(resized.dimensions(), (101, 77));
        }
    }

    #[test]
    fn nearest_resize_preserves_solid_color() {
        let bitmap = Bitmap::from_pixel(50, 50, Rgba([200, 100, 50, 255]));
        let resized = resize_bitmap(bitmap, 120, 120, ResizeProfile::Speed);

        assert!(resized.pixels().all(|p| *p == Rgba([200, 100, 50, 255])));
    }

    #[test]
    fn encode_canvas_png_roundtrip_keeps_dimensions() {
        let canvas = Bitmap::from_pixel(1132, 758, Rgba([255, 255, 255, 255]));
        let bytes = encode_canvas(canvas, OutputFormat::Png).expect("encode should succeed");

        let decoded = image::load_from_memory(&bytes).expect("encoded png should decode");
        assert_eq!(decoded.dimensions(), (1132, 758));
    }

    #[test]
    fn encode_canvas_jpeg_produces_jpeg_signature() {
        let canvas = Bitmap::from_pixel(64, 32, Rgba([0, 0, 0, 255]));
        let bytes = encode_canvas(canvas, OutputFormat::Jpeg).expect("encode should succeed");

        assert_eq!(image::guess_format(&bytes).ok(), Some(ImageFormat::Jpeg));
    }

    #[test]
    fn encode_canvas_refuses_pdf() {
        let canvas = Bitmap::from_pixel(8, 8, Rgba([0, 0, 0, 255]));

        assert!(matches!(
            encode_canvas(canvas, OutputFormat::Pdf),
            Err(CompositeError::Encode(_))
        ));
    }
}
