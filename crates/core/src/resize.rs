//! Pure-Rust RGB24 resampling shared by the batch assembler (face crop to
//! model size) and the compositor (synthesized crop back to box extent).

use serde::{Deserialize, Serialize};

/// Supported resampling filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    #[default]
    Bilinear,
    Nearest,
}

impl ResizeFilter {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "neighbor" | "nn" => Self::Nearest,
            _ => Self::Bilinear,
        }
    }
}

/// Resize 8-bit interleaved RGB data to `dst_w` x `dst_h`.
pub fn resize_rgb(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
    filter: ResizeFilter,
) -> Vec<u8> {
    debug_assert_eq!(src.len(), src_w * src_h * 3);
    match filter {
        ResizeFilter::Bilinear => bilinear(src, src_w, src_h, dst_w, dst_h),
        ResizeFilter::Nearest => nearest(src, src_w, src_h, dst_w, dst_h),
    }
}

fn nearest(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];

    for dy in 0..dst_h {
        let sy = (((dy as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize).min(src_h - 1);
        for dx in 0..dst_w {
            let sx = (((dx as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize).min(src_w - 1);
            let si = (sy * src_w + sx) * 3;
            let di = (dy * dst_w + dx) * 3;
            dst[di..di + 3].copy_from_slice(&src[si..si + 3]);
        }
    }

    dst
}

fn bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];
    let x_ratio = src_w as f64 / dst_w as f64;
    let y_ratio = src_h as f64 / dst_h as f64;

    for dy in 0..dst_h {
        // Pixel-center mapping keeps same-size resizes exact.
        let syf = (dy as f64 + 0.5) * y_ratio - 0.5;
        let sy0 = syf.floor().max(0.0) as usize;
        let sy1 = (sy0 + 1).min(src_h - 1);
        let wy = (syf - sy0 as f64).clamp(0.0, 1.0);

        for dx in 0..dst_w {
            let sxf = (dx as f64 + 0.5) * x_ratio - 0.5;
            let sx0 = sxf.floor().max(0.0) as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let wx = (sxf - sx0 as f64).clamp(0.0, 1.0);

            let di = (dy * dst_w + dx) * 3;
            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f64;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f64;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f64;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f64;

                let top = p00 + (p10 - p00) * wx;
                let bottom = p01 + (p11 - p01) * wx;
                let value = top + (bottom - top) * wy;
                dst[di + c] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
