//! Planar I420 rescaling with a selectable filter.

use super::{scale_filter, ScaleFilter};

/// Scale an I420 frame from `(sw, sh)` to `(dw, dh)` using the filter from
/// `YUV_SCALE_FILTER`. Destination dimensions must be even and ≥ 2; bad
/// dimensions or undersized planes leave the destination untouched.
#[allow(clippy::too_many_arguments)]
pub fn i420_scale(
    y_src: &[u8],
    u_src: &[u8],
    v_src: &[u8],
    sw: usize,
    sh: usize,
    y_dst: &mut [u8],
    u_dst: &mut [u8],
    v_dst: &mut [u8],
    dw: usize,
    dh: usize,
) {
    if sw < 2 || sh < 2 || dw < 2 || dh < 2 || sw % 2 != 0 || sh % 2 != 0 || dw % 2 != 0 || dh % 2 != 0 {
        return;
    }
    if y_src.len() < sw * sh
        || u_src.len() < (sw / 2) * (sh / 2)
        || v_src.len() < (sw / 2) * (sh / 2)
        || y_dst.len() < dw * dh
        || u_dst.len() < (dw / 2) * (dh / 2)
        || v_dst.len() < (dw / 2) * (dh / 2)
    {
        return;
    }
    let filter = scale_filter();
    scale_plane(y_src, sw, sh, y_dst, dw, dh, filter);
    scale_plane(u_src, sw / 2, sh / 2, u_dst, dw / 2, dh / 2, filter);
    scale_plane(v_src, sw / 2, sh / 2, v_dst, dw / 2, dh / 2, filter);
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize, filter: ScaleFilter) {
    if sw == dw && sh == dh {
        dst[..sw * sh].copy_from_slice(&src[..sw * sh]);
        return;
    }
    match filter {
        ScaleFilter::None => scale_nearest(src, sw, sh, dst, dw, dh),
        ScaleFilter::Linear => scale_linear(src, sw, sh, dst, dw, dh),
        ScaleFilter::Bilinear => scale_bilinear(src, sw, sh, dst, dw, dh),
        ScaleFilter::Box => scale_box(src, sw, sh, dst, dw, dh),
    }
}

fn scale_nearest(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            dst[y * dw + x] = src[sy * sw + sx];
        }
    }
}

/// 16.16 fixed-point source coordinate for a destination index.
fn fixed_coord(d: usize, dlen: usize, slen: usize) -> (usize, u32) {
    // Center-aligned mapping: s = (d + 0.5) * slen / dlen - 0.5
    let num = ((2 * d + 1) * slen * 32768) / dlen;
    let pos = num.saturating_sub(32768); // 16.16, clamped at the left edge
    let idx = (pos >> 16).min(slen - 1);
    let frac = (pos & 0xFFFF) as u32;
    (idx, frac)
}

/// Horizontal linear interpolation, nearest vertical.
fn scale_linear(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let sy = y * sh / dh;
        let row = &src[sy * sw..sy * sw + sw];
        for x in 0..dw {
            let (x0, fx) = fixed_coord(x, dw, sw);
            let x1 = (x0 + 1).min(sw - 1);
            let a = row[x0] as u32;
            let b = row[x1] as u32;
            dst[y * dw + x] = ((a * (65536 - fx) + b * fx + 32768) >> 16) as u8;
        }
    }
}

fn scale_bilinear(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let (y0, fy) = fixed_coord(y, dh, sh);
        let y1 = (y0 + 1).min(sh - 1);
        for x in 0..dw {
            let (x0, fx) = fixed_coord(x, dw, sw);
            let x1 = (x0 + 1).min(sw - 1);
            let p00 = src[y0 * sw + x0] as u64;
            let p01 = src[y0 * sw + x1] as u64;
            let p10 = src[y1 * sw + x0] as u64;
            let p11 = src[y1 * sw + x1] as u64;
            let fx = fx as u64;
            let fy = fy as u64;
            let top = p00 * (65536 - fx) + p01 * fx;
            let bot = p10 * (65536 - fx) + p11 * fx;
            let val = (top * (65536 - fy) + bot * fy + (1u64 << 31)) >> 32;
            dst[y * dw + x] = val.min(255) as u8;
        }
    }
}

/// Area average over the covering source rectangle; the usual choice for
/// downscaling.
fn scale_box(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let y0 = y * sh / dh;
        let y1 = (((y + 1) * sh + dh - 1) / dh).clamp(y0 + 1, sh);
        for x in 0..dw {
            let x0 = x * sw / dw;
            let x1 = (((x + 1) * sw + dw - 1) / dw).clamp(x0 + 1, sw);
            let mut sum = 0u32;
            for sy in y0..y1 {
                for sx in x0..x1 {
                    sum += src[sy * sw + sx] as u32;
                }
            }
            let n = ((y1 - y0) * (x1 - x0)) as u32;
            dst[y * dw + x] = ((sum + n / 2) / n) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src_val: u8, sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u8> {
        let y_src = vec![src_val; sw * sh];
        let u_src = vec![128u8; (sw / 2) * (sh / 2)];
        let v_src = vec![128u8; (sw / 2) * (sh / 2)];
        let mut y_dst = vec![0u8; dw * dh];
        let mut u_dst = vec![0u8; (dw / 2) * (dh / 2)];
        let mut v_dst = vec![0u8; (dw / 2) * (dh / 2)];
        i420_scale(&y_src, &u_src, &v_src, sw, sh, &mut y_dst, &mut u_dst, &mut v_dst, dw, dh);
        y_dst
    }

    #[test]
    fn test_uniform_plane_stays_uniform() {
        let out = run(77, 64, 32, 32, 16);
        assert!(out.iter().all(|&b| b == 77));
    }

    #[test]
    fn test_upscale_preserves_uniform() {
        let out = run(200, 16, 16, 64, 64);
        assert!(out.iter().all(|&b| b == 200));
    }

    #[test]
    fn test_odd_destination_is_rejected() {
        let y_src = vec![9u8; 16 * 16];
        let u_src = vec![9u8; 64];
        let v_src = vec![9u8; 64];
        let mut y_dst = vec![0u8; 15 * 16];
        let mut u_dst = vec![0u8; 64];
        let mut v_dst = vec![0u8; 64];
        i420_scale(&y_src, &u_src, &v_src, 16, 16, &mut y_dst, &mut u_dst, &mut v_dst, 15, 16);
        assert!(y_dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_box_downscale_averages() {
        // 4x4 checkerboard of 0/255 averaged down to 2x2 should land mid-range.
        let mut y_src = vec![0u8; 16];
        for (i, px) in y_src.iter_mut().enumerate() {
            if (i / 4 + i % 4) % 2 == 0 {
                *px = 255;
            }
        }
        let u_src = vec![128u8; 4];
        let v_src = vec![128u8; 4];
        let mut y_dst = vec![0u8; 4];
        let mut u_dst = vec![0u8; 1];
        let mut v_dst = vec![0u8; 1];
        i420_scale(&y_src, &u_src, &v_src, 4, 4, &mut y_dst, &mut u_dst, &mut v_dst, 2, 2);
        for &px in &y_dst {
            assert!((120..=136).contains(&px), "expected mid-range, got {}", px);
        }
    }
}
