//! Output and bookkeeping checks for captured frames.
//!
//! The pattern checks verify that delivered application buffers contain the
//! test pattern rendered by the simulated scalers (or by a virtual camera);
//! the sequence and table checks verify ordering guarantees of the pipeline.

use std::collections::HashSet;

use crate::bayer::{BayerBufManager, BAYER_BUFFERS};
use crate::convert::yuv_to_rgb;
use crate::request::{RequestManager, RequestStatus};
use crate::traits::{CameraError, CompletedFrame, Format, FourCC, Result};

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the simulated scaler's color bar pattern.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: i32 = 15;

/// RGB value of pixel `(x, y)` in a YUYV or RGB3 buffer laid out as `format`.
pub fn pixel_at(data: &[u8], format: &Format, x: u32, y: u32) -> Option<(u8, u8, u8)> {
    if x >= format.width || y >= format.height {
        return None;
    }
    let bpp = format.fourcc.bytes_per_pixel() as usize;
    let stride = (format.stride as usize).max(format.width as usize * bpp);
    let row = data.get(y as usize * stride..)?;

    match format.fourcc {
        FourCC::RGB3 => match row.get(x as usize * 3..x as usize * 3 + 3)? {
            [r, g, b] => Some((*r, *g, *b)),
            _ => None,
        },
        FourCC::YUYV => {
            // Each 4-byte group [Y0 U Y1 V] covers two pixels
            let pair = (x as usize / 2) * 4;
            match row.get(pair..pair + 4)? {
                [y0, u, y1, v] => {
                    let luma = if x % 2 == 0 { *y0 } else { *y1 };
                    Some(yuv_to_rgb(luma, *u, *v))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Checks 8 vertical stripes at their center positions, each within a
/// tolerance for YUV-to-RGB conversion inaccuracies.
///
/// # Errors
///
/// Returns `Validation` if a pixel cannot be read (buffer shorter than the
/// format, unsupported fourcc) or any bar doesn't match the expected color.
pub fn validate_color_bars(frame: &[u8], format: &Format) -> Result<()> {
    let bar_width = format.width / 8;
    let center_y = format.height / 2;

    for (bar_idx, expected_rgb) in SMPTE_COLOR_BARS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

        let actual_rgb = pixel_at(frame, format, sample_x, center_y).ok_or_else(|| {
            CameraError::Validation(format!(
                "no {} pixel at ({sample_x}, {center_y})",
                format.fourcc
            ))
        })?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(CameraError::Validation(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center line every 10 pixels and requires luminance to rise
/// monotonically (small rounding dips allowed) by at least 50 overall.
pub fn validate_gradient(frame: &[u8], format: &Format) -> Result<()> {
    let center_y = format.height / 2;
    let mut first_luminance: Option<f32> = None;
    let mut prev_luminance: Option<f32> = None;

    for x in (0..format.width).step_by(10) {
        let (r, g, b) = pixel_at(frame, format, x, center_y).ok_or_else(|| {
            CameraError::Validation(format!("no pixel at ({x}, {center_y})"))
        })?;

        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev_luminance {
            if luminance < prev - 1.0 {
                return Err(CameraError::Validation(format!(
                    "gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        first_luminance.get_or_insert(luminance);
        prev_luminance = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first_luminance, prev_luminance) {
        let change = last - first;
        if change < 50.0 {
            return Err(CameraError::Validation(format!(
                "insufficient luminance change for gradient: {change} (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that completed frames came back in submission order.
///
/// Frame counts must strictly increase. Gaps are allowed: a caller may
/// validate a subset of the frames it received.
///
/// # Errors
///
/// Returns `Validation` if the slice is empty or a frame count does not
/// exceed its predecessor.
pub fn validate_frame_sequence(frames: &[CompletedFrame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::Validation(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let prev_count = prev.result.frame_count;
            let curr_count = curr.result.frame_count;
            if curr_count <= prev_count {
                return Err(CameraError::Validation(format!(
                    "frame {} out of order: frame count {curr_count} after {prev_count}",
                    i + 1
                )));
            }
        }
    }

    Ok(())
}

/// Validates that sensor timestamps never go backwards across completed frames.
///
/// # Errors
///
/// Returns `Validation` if any frame lacks a timestamp or one is earlier than
/// its predecessor.
pub fn validate_timestamps(frames: &[CompletedFrame]) -> Result<()> {
    let mut prev = None;
    for frame in frames {
        let ts = frame.result.timestamp.ok_or_else(|| {
            CameraError::Validation(format!(
                "frame count {} completed without a timestamp",
                frame.result.frame_count
            ))
        })?;
        if let Some(prev) = prev.filter(|p| ts < *p) {
            return Err(CameraError::Validation(format!(
                "timestamp went backwards at frame count {}: {ts:?} < {prev:?}",
                frame.result.frame_count
            )));
        }
        prev = Some(ts);
    }
    Ok(())
}

/// Validates that every raw buffer is accounted for in exactly one state.
pub fn validate_bayer_counts(bayer: &BayerBufManager) -> Result<()> {
    let counts = bayer.counts();
    if counts.total() != BAYER_BUFFERS {
        return Err(CameraError::Validation(format!(
            "bayer buffers lost: {counts:?} sums to {}, expected {BAYER_BUFFERS}",
            counts.total()
        )));
    }
    Ok(())
}

/// Validates that no two in-hardware requests share a frame count.
pub fn validate_request_table(requests: &RequestManager) -> Result<()> {
    let mut seen = HashSet::new();
    for (status, frame_count) in requests.snapshot() {
        if status == RequestStatus::Requested && !seen.insert(frame_count) {
            return Err(CameraError::Validation(format!(
                "frame count {frame_count} bound to more than one requested slot"
            )));
        }
    }
    Ok(())
}

/// Check if two RGB colors match within a tolerance per channel.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: i32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    let r_diff = i32::from(ar).abs_diff(i32::from(er));
    let g_diff = i32::from(ag).abs_diff(i32::from(eg));
    let b_diff = i32::from(ab).abs_diff(i32::from(eb));

    #[allow(clippy::cast_sign_loss)]
    let tol = tolerance as u32;

    r_diff <= tol && g_diff <= tol && b_diff <= tol
}
