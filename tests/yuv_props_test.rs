//! Property tests for the colour/scale kernels.

use crabcast::yuv;
use proptest::prelude::*;

fn planes(w: usize, h: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    (vec![0u8; w * h], vec![0u8; (w / 2) * (h / 2)], vec![0u8; (w / 2) * (h / 2)])
}

proptest! {
    /// BT.601 limited range: luma always lands in [16, 235] and chroma in
    /// [16, 240], whatever the input.
    #[test]
    fn prop_limited_range_output(b in 0u8..=255, g in 0u8..=255, r in 0u8..=255) {
        let (w, h) = (8usize, 8usize);
        let mut src = vec![0u8; w * h * 4];
        for px in src.chunks_exact_mut(4) {
            px.copy_from_slice(&[b, g, r, 255]);
        }
        let (mut y, mut u, mut v) = planes(w, h);
        yuv::bgra_to_i420(&src, w, h, &mut y, &mut u, &mut v);
        prop_assert!(y.iter().all(|&p| (16..=235).contains(&p)), "luma {} out of range", y[0]);
        prop_assert!(u.iter().all(|&p| (16..=240).contains(&p)));
        prop_assert!(v.iter().all(|&p| (16..=240).contains(&p)));
    }

    /// Uniform input produces uniform planes.
    #[test]
    fn prop_uniform_frame_uniform_planes(b in 0u8..=255, g in 0u8..=255, r in 0u8..=255) {
        let (w, h) = (16usize, 8usize);
        let mut src = vec![0u8; w * h * 4];
        for px in src.chunks_exact_mut(4) {
            px.copy_from_slice(&[b, g, r, 255]);
        }
        let (mut y, mut u, mut v) = planes(w, h);
        yuv::bgra_to_i420(&src, w, h, &mut y, &mut u, &mut v);
        prop_assert!(y.iter().all(|&p| p == y[0]));
        prop_assert!(u.iter().all(|&p| p == u[0]));
        prop_assert!(v.iter().all(|&p| p == v[0]));
    }

    /// Gray stays gray through the round trip, within quantisation.
    #[test]
    fn prop_gray_round_trip(level in 0u8..=255) {
        let (w, h) = (8usize, 8usize);
        let mut src = vec![0u8; w * h * 4];
        for px in src.chunks_exact_mut(4) {
            px.copy_from_slice(&[level, level, level, 255]);
        }
        let (mut y, mut u, mut v) = planes(w, h);
        yuv::bgra_to_i420(&src, w, h, &mut y, &mut u, &mut v);
        prop_assert_eq!(u[0], 128);
        prop_assert_eq!(v[0], 128);
        let mut out = vec![0u8; w * h * 4];
        yuv::i420_to_packed(&y, &u, &v, w, h, &mut out);
        for px in out.chunks_exact(4) {
            for c in &px[..3] {
                prop_assert!((*c as i32 - level as i32).abs() <= 2, "{} vs {}", c, level);
            }
        }
    }

    /// UYVY luma is a pure extraction: every Y byte reappears verbatim.
    #[test]
    fn prop_uyvy_luma_extraction(seed in 0u8..=255) {
        let (w, h) = (8usize, 4usize);
        let mut src = vec![0u8; w * h * 2];
        for (i, byte) in src.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        let (mut y, mut u, mut v) = planes(w, h);
        yuv::uyvy_to_i420(&src, w, h, &mut y, &mut u, &mut v);
        for row in 0..h {
            for x in 0..w {
                prop_assert_eq!(y[row * w + x], src[row * w * 2 + x * 2 + 1]);
            }
        }
    }

    /// Rescaling a uniform plane keeps it uniform for any even geometry.
    #[test]
    fn prop_scale_uniform(value in 0u8..=255, sw in 1usize..=16, sh in 1usize..=16, dw in 1usize..=16, dh in 1usize..=16) {
        let (sw, sh, dw, dh) = (sw * 2, sh * 2, dw * 2, dh * 2);
        let y_src = vec![value; sw * sh];
        let u_src = vec![128u8; (sw / 2) * (sh / 2)];
        let v_src = vec![128u8; (sw / 2) * (sh / 2)];
        let mut y_dst = vec![0u8; dw * dh];
        let mut u_dst = vec![0u8; (dw / 2) * (dh / 2)];
        let mut v_dst = vec![0u8; (dw / 2) * (dh / 2)];
        yuv::i420_scale(&y_src, &u_src, &v_src, sw, sh, &mut y_dst, &mut u_dst, &mut v_dst, dw, dh);
        prop_assert!(y_dst.iter().all(|&p| p == value));
        prop_assert!(u_dst.iter().all(|&p| p == 128));
    }
}
