//! Software colour-space conversion for indirect streams.

use crate::traits::{CameraError, Format, FormatConverter, FourCC, Result};

/// YUYV (4:2:2 packed) to RGB24 converter.
#[derive(Debug, Default, Clone, Copy)]
pub struct YuyvToRgbConverter;

impl FormatConverter for YuyvToRgbConverter {
    fn convert(
        &mut self,
        src_format: &Format,
        src: &[u8],
        dst_format: &Format,
        dst: &mut [u8],
    ) -> Result<()> {
        if src_format.fourcc != FourCC::YUYV || dst_format.fourcc != FourCC::RGB3 {
            return Err(CameraError::Config(format!(
                "unsupported conversion {} -> {}",
                src_format.fourcc, dst_format.fourcc
            )));
        }
        if src_format.width != dst_format.width || src_format.height != dst_format.height {
            return Err(CameraError::Config(format!(
                "scaling not supported: {}x{} -> {}x{}",
                src_format.width, src_format.height, dst_format.width, dst_format.height
            )));
        }

        let width = src_format.width as usize;
        let height = src_format.height as usize;
        let src_stride = (src_format.stride as usize).max(width * 2);
        let dst_stride = (dst_format.stride as usize).max(width * 3);
        if src.len() < src_stride * height || dst.len() < dst_stride * height {
            return Err(CameraError::Config(format!(
                "buffer too small: src {} dst {} for {width}x{height}",
                src.len(),
                dst.len()
            )));
        }

        for (src_row, dst_row) in src
            .chunks(src_stride)
            .zip(dst.chunks_mut(dst_stride))
            .take(height)
        {
            // YUYV format: [Y0 U Y1 V] repeats, each pair of pixels shares U and V
            for (pair, out) in src_row
                .chunks_exact(4)
                .zip(dst_row.chunks_exact_mut(6))
                .take(width / 2)
            {
                if let ([y0, u, y1, v], [r0, g0, b0, r1, g1, b1]) = (pair, out) {
                    (*r0, *g0, *b0) = yuv_to_rgb(*y0, *u, *v);
                    (*r1, *g1, *b1) = yuv_to_rgb(*y1, *u, *v);
                }
            }
        }
        Ok(())
    }
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
