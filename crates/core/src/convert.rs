//! Raw frame reformatting into the encoders' common input layout.
//!
//! The distribution stage converts each producer frame once, before
//! fan-out, so every branch receives planar I420. RGB input uses BT.601
//! coefficients in 10-bit fixed point; chroma is averaged over each 2x2
//! block (partial blocks at odd edges average what is there).

use crate::error::{Result, SinkError};
use crate::media::PixelLayout;

/// Convert one tightly packed frame of `layout` into I420.
///
/// Fails with [`SinkError::UnsupportedFormat`] when `input` is not exactly
/// one frame of the given geometry.
pub fn to_i420(layout: PixelLayout, width: u32, height: u32, input: &[u8]) -> Result<Vec<u8>> {
    let expected = layout.frame_size(width, height);
    if input.len() != expected {
        return Err(SinkError::UnsupportedFormat(format!(
            "{layout} {width}x{height} frame has {} bytes, expected {expected}",
            input.len()
        )));
    }

    let planes = Planes::new(width as usize, height as usize);
    let mut out = vec![0u8; planes.total()];

    match layout {
        PixelLayout::I420 => out.copy_from_slice(input),
        PixelLayout::Yv12 => {
            // Y, V, U -> Y, U, V
            let (y, chroma) = input.split_at(planes.y);
            let (v, u) = chroma.split_at(planes.c);
            out[..planes.y].copy_from_slice(y);
            out[planes.y..planes.y + planes.c].copy_from_slice(u);
            out[planes.y + planes.c..].copy_from_slice(v);
        }
        PixelLayout::Nv12 | PixelLayout::Nv21 => {
            let (y, uv) = input.split_at(planes.y);
            out[..planes.y].copy_from_slice(y);
            let (u_off, v_off) = if layout == PixelLayout::Nv12 { (0, 1) } else { (1, 0) };
            for (i, pair) in uv.chunks_exact(2).enumerate() {
                out[planes.y + i] = pair[u_off];
                out[planes.y + planes.c + i] = pair[v_off];
            }
        }
        PixelLayout::Yuy2 | PixelLayout::Uyvy => packed_422(layout, &planes, input, &mut out),
        PixelLayout::Rgb => rgb_to_i420(&planes, input, 3, &mut out),
        PixelLayout::Rgba => rgb_to_i420(&planes, input, 4, &mut out),
    }

    Ok(out)
}

struct Planes {
    w: usize,
    h: usize,
    cw: usize,
    ch: usize,
    /// Luma plane size.
    y: usize,
    /// Size of each chroma plane.
    c: usize,
}

impl Planes {
    fn new(w: usize, h: usize) -> Self {
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        Self {
            w,
            h,
            cw,
            ch,
            y: w * h,
            c: cw * ch,
        }
    }

    fn total(&self) -> usize {
        self.y + 2 * self.c
    }
}

fn packed_422(layout: PixelLayout, p: &Planes, input: &[u8], out: &mut [u8]) {
    // Byte offsets of Y0, U, Y1, V inside each 4-byte macropixel.
    let (y0, u, y1, v) = match layout {
        PixelLayout::Yuy2 => (0, 1, 2, 3),
        _ => (1, 0, 3, 2),
    };
    let stride = 4 * p.cw;

    for row in 0..p.h {
        for col in 0..p.w {
            let mp = row * stride + (col / 2) * 4;
            let off = if col % 2 == 0 { y0 } else { y1 };
            out[row * p.w + col] = input[mp + off];
        }
    }

    for crow in 0..p.ch {
        let r0 = 2 * crow;
        let r1 = (r0 + 1).min(p.h - 1);
        for ccol in 0..p.cw {
            let a = r0 * stride + ccol * 4;
            let b = r1 * stride + ccol * 4;
            let idx = crow * p.cw + ccol;
            out[p.y + idx] = avg2(input[a + u], input[b + u]);
            out[p.y + p.c + idx] = avg2(input[a + v], input[b + v]);
        }
    }
}

fn rgb_to_i420(p: &Planes, input: &[u8], bpp: usize, out: &mut [u8]) {
    let pixel = |row: usize, col: usize| {
        let i = (row * p.w + col) * bpp;
        (input[i] as i32, input[i + 1] as i32, input[i + 2] as i32)
    };

    for row in 0..p.h {
        for col in 0..p.w {
            let (r, g, b) = pixel(row, col);
            out[row * p.w + col] = luma(r, g, b);
        }
    }

    for crow in 0..p.ch {
        for ccol in 0..p.cw {
            let mut u_sum = 0i32;
            let mut v_sum = 0i32;
            let mut n = 0i32;
            for row in (2 * crow)..(2 * crow + 2).min(p.h) {
                for col in (2 * ccol)..(2 * ccol + 2).min(p.w) {
                    let (r, g, b) = pixel(row, col);
                    let (u, v) = chroma(r, g, b);
                    u_sum += u;
                    v_sum += v;
                    n += 1;
                }
            }
            let idx = crow * p.cw + ccol;
            out[p.y + idx] = (u_sum / n) as u8;
            out[p.y + p.c + idx] = (v_sum / n) as u8;
        }
    }
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    ((306 * r + 601 * g + 117 * b) >> 10).clamp(0, 255) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (i32, i32) {
    let u = (((-173 * r - 339 * g + 512 * b) >> 10) + 128).clamp(0, 255);
    let v = (((512 * r - 429 * g - 83 * b) >> 10) + 128).clamp(0, 255);
    (u, v)
}

#[inline]
fn avg2(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}
