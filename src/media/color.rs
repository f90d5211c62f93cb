//! Pixel format conversion and nearest-neighbour scaling.
//!
//! YUV is BT.601 limited range, which is what the H.264 encoder is fed and what the decoder
//! returns. Rows are processed in parallel with rayon.

use crate::foundation::core::PixelFormat;
use crate::foundation::error::{StreamError, StreamResult};
use crate::media::frame::RawFrame;
use rayon::prelude::*;

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

/// Read-only view used to sample a source picture as RGBA.
struct Sampler<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    format: PixelFormat,
}

impl Sampler<'_> {
    fn rgba(&self, x: usize, y: usize) -> [u8; 4] {
        match self.format {
            PixelFormat::Rgba8 => {
                let i = (y * self.width + x) * 4;
                [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
            }
            PixelFormat::Bgra8 => {
                let i = (y * self.width + x) * 4;
                [self.data[i + 2], self.data[i + 1], self.data[i], self.data[i + 3]]
            }
            PixelFormat::Yuv420p => {
                let cw = self.width.div_ceil(2);
                let ch = self.height.div_ceil(2);
                let luma = self.width * self.height;
                let ci = (y / 2) * cw + x / 2;
                let (r, g, b) = yuv_to_rgb(
                    self.data[y * self.width + x],
                    self.data[luma + ci],
                    self.data[luma + cw * ch + ci],
                );
                [r, g, b, 255]
            }
        }
    }
}

fn src_coord(d: usize, dst_len: usize, src_len: usize) -> usize {
    (d * src_len / dst_len).min(src_len - 1)
}

/// Convert and scale `src` into `dst`, whose width, height and format select the target. The
/// destination buffer is reused when it is already the right size. `pts` and `sequence` are
/// carried over.
pub fn convert_into(src: &RawFrame, dst: &mut RawFrame) -> StreamResult<()> {
    if src.data.len() != src.expected_len() {
        return Err(StreamError::validation(format!(
            "source frame has {} bytes, expected {}",
            src.data.len(),
            src.expected_len()
        )));
    }
    dst.format.validate_dims(dst.width, dst.height)?;
    dst.pts = src.pts;
    dst.sequence = src.sequence;
    dst.data.resize(dst.expected_len(), 0);

    if src.same_shape(dst.width, dst.height, dst.format) {
        dst.data.copy_from_slice(&src.data);
        return Ok(());
    }

    let sampler = Sampler {
        data: &src.data,
        width: src.width as usize,
        height: src.height as usize,
        format: src.format,
    };
    let (dw, dh) = (dst.width as usize, dst.height as usize);
    let (sw, sh) = (sampler.width, sampler.height);

    match dst.format {
        PixelFormat::Rgba8 | PixelFormat::Bgra8 => {
            let swap = dst.format == PixelFormat::Bgra8;
            dst.data
                .par_chunks_mut(dw * 4)
                .enumerate()
                .for_each(|(y, row)| {
                    let sy = src_coord(y, dh, sh);
                    for (x, px) in row.chunks_exact_mut(4).enumerate() {
                        let mut c = sampler.rgba(src_coord(x, dw, sw), sy);
                        if swap {
                            c.swap(0, 2);
                        }
                        px.copy_from_slice(&c);
                    }
                });
        }
        PixelFormat::Yuv420p => {
            let (cw, ch) = (dw.div_ceil(2), dh.div_ceil(2));
            let (luma, chroma) = dst.data.split_at_mut(dw * dh);
            let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);
            luma.par_chunks_mut(dw).enumerate().for_each(|(y, row)| {
                let sy = src_coord(y, dh, sh);
                for (x, out) in row.iter_mut().enumerate() {
                    let [r, g, b, _] = sampler.rgba(src_coord(x, dw, sw), sy);
                    *out = rgb_to_yuv(r, g, b).0;
                }
            });
            u_plane
                .par_chunks_mut(cw)
                .zip(v_plane.par_chunks_mut(cw))
                .enumerate()
                .for_each(|(cy, (urow, vrow))| {
                    for cx in 0..cw {
                        // average the 2x2 block the chroma sample covers
                        let (mut r, mut g, mut b, mut n) = (0u32, 0u32, 0u32, 0u32);
                        for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                            let (x, y) = (cx * 2 + ox, cy * 2 + oy);
                            if x < dw && y < dh {
                                let [pr, pg, pb, _] =
                                    sampler.rgba(src_coord(x, dw, sw), src_coord(y, dh, sh));
                                r += u32::from(pr);
                                g += u32::from(pg);
                                b += u32::from(pb);
                                n += 1;
                            }
                        }
                        let n = n.max(1);
                        let (_, u, v) = rgb_to_yuv((r / n) as u8, (g / n) as u8, (b / n) as u8);
                        urow[cx] = u;
                        vrow[cx] = v;
                    }
                });
        }
    }
    Ok(())
}

/// Allocating form of [`convert_into`].
pub fn convert(
    src: &RawFrame,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> StreamResult<RawFrame> {
    let mut dst = RawFrame::blank(width, height, format);
    convert_into(src, &mut dst)?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::core::Pts;

    fn solid_rgba(w: u32, h: u32, px: [u8; 4]) -> RawFrame {
        let data = px.repeat((w * h) as usize);
        RawFrame::new(w, h, PixelFormat::Rgba8, Pts(5), data).unwrap()
    }

    #[test]
    fn limited_range_endpoints() {
        assert_eq!(rgb_to_yuv(0, 0, 0), (16, 128, 128));
        assert_eq!(rgb_to_yuv(255, 255, 255), (235, 128, 128));
        assert_eq!(yuv_to_rgb(16, 128, 128), (0, 0, 0));
        assert_eq!(yuv_to_rgb(235, 128, 128), (255, 255, 255));
    }

    #[test]
    fn rgba_to_bgra_swaps_channels() {
        let src = solid_rgba(2, 2, [10, 20, 30, 40]);
        let out = convert(&src, PixelFormat::Bgra8, 2, 2).unwrap();
        assert_eq!(&out.data[..4], &[30, 20, 10, 40]);
        assert_eq!(out.pts, Pts(5));
    }

    #[test]
    fn yuv_round_trip_stays_close() {
        let src = solid_rgba(4, 4, [200, 100, 50, 255]);
        let yuv = convert(&src, PixelFormat::Yuv420p, 4, 4).unwrap();
        assert_eq!(yuv.data.len(), 24);
        let back = convert(&yuv, PixelFormat::Rgba8, 4, 4).unwrap();
        for (a, b) in back.data[..3].iter().zip([200u8, 100, 50]) {
            assert!(a.abs_diff(b) <= 3, "{a} vs {b}");
        }
    }

    #[test]
    fn nearest_scaling_picks_source_pixels() {
        let mut data = Vec::new();
        for v in [1u8, 2, 3, 4] {
            data.extend_from_slice(&[v, v, v, 255]);
        }
        let src = RawFrame::new(2, 2, PixelFormat::Rgba8, Pts(0), data).unwrap();
        let up = convert(&src, PixelFormat::Rgba8, 4, 4).unwrap();
        let px = |x: usize, y: usize| up.data[(y * 4 + x) * 4];
        assert_eq!([px(0, 0), px(1, 0), px(2, 0), px(3, 0)], [1, 1, 2, 2]);
        assert_eq!([px(0, 3), px(3, 3)], [3, 4]);
    }

    #[test]
    fn reuses_destination_buffer() {
        let src = solid_rgba(2, 2, [1, 2, 3, 4]);
        let mut dst = RawFrame::blank(2, 2, PixelFormat::Rgba8);
        let ptr = dst.data.as_ptr();
        convert_into(&src, &mut dst).unwrap();
        assert_eq!(dst.data.as_ptr(), ptr);
        assert_eq!(dst.data, src.data);
    }
}
