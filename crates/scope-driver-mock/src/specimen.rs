//! Synthetic specimen rendering for the simulated camera.
//!
//! A specimen is rendered once at full sharpness. Each frame is that image
//! blurred by an amount proportional to the distance between the focus
//! actuator and the specimen's focal plane. Blur is a separable box filter
//! interpolated between neighbouring integer radii, so the focus metrics fall
//! off smoothly and monotonically on both sides of best focus.

use scope_core::data::Frame;

/// Simple LCG for reproducible textures. Same constants as glibc.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff
}

/// What the camera is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecimenKind {
    /// Stained smear under transmitted light: mid-grey blocks of varying density.
    Brightfield,
    /// Sparse bright spots on a dark background.
    Fluorescent,
    /// Uniform field with no structure. No focus metric rises above zero.
    Blank,
}

/// A renderable specimen.
#[derive(Debug, Clone)]
pub struct Specimen {
    kind: SpecimenKind,
    width: usize,
    height: usize,
    sharp: Vec<f64>,
    /// Actuator position of the focal plane
    pub best_focus: f64,
    /// Blur radius in pixels per unit of actuator defocus
    pub blur_per_unit: f64,
}

impl Specimen {
    /// Render a specimen of `kind` with a deterministic texture.
    pub fn new(kind: SpecimenKind, width: u32, height: u32, seed: u64) -> Self {
        let width = width.max(1) as usize;
        let height = height.max(1) as usize;
        let sharp = match kind {
            SpecimenKind::Brightfield => render_blocks(width, height, seed),
            SpecimenKind::Fluorescent => render_spots(width, height, seed),
            SpecimenKind::Blank => vec![0.5; width * height],
        };
        Self {
            kind,
            width,
            height,
            sharp,
            best_focus: 0.5,
            blur_per_unit: 40.0,
        }
    }

    /// Specimen kind.
    pub fn kind(&self) -> SpecimenKind {
        self.kind
    }

    /// Move the focal plane.
    pub fn with_best_focus(mut self, best_focus: f64) -> Self {
        self.best_focus = best_focus;
        self
    }

    /// Frame as seen with the actuator at `focus_position`.
    pub fn frame_at(&self, focus_position: f64) -> Frame {
        let radius = (focus_position - self.best_focus).abs() * self.blur_per_unit;
        let lower = radius.floor();
        let t = radius - lower;
        let r0 = lower as usize;

        let a = box_blur(&self.sharp, self.width, self.height, r0);
        let pixels: Vec<f64> = if t > 1e-9 {
            let b = box_blur(&self.sharp, self.width, self.height, r0 + 1);
            a.iter().zip(&b).map(|(x, y)| x * (1.0 - t) + y * t).collect()
        } else {
            a
        };

        let data: Vec<u16> = pixels
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * f64::from(u16::MAX)).round() as u16)
            .collect();
        Frame::from_u16(self.width as u32, self.height as u32, &data)
    }
}

fn render_blocks(w: usize, h: usize, seed: u64) -> Vec<f64> {
    let block = (w.min(h) / 8).max(2);
    let mut out = vec![0.0; w * h];
    for y in 0..h {
        for x in 0..w {
            let cell = ((y / block) * 131 + (x / block)) as u64;
            let r = prng(seed ^ cell.wrapping_mul(2_654_435_761));
            out[y * w + x] = 0.25 + 0.5 * (r % 1000) as f64 / 1000.0;
        }
    }
    out
}

fn render_spots(w: usize, h: usize, seed: u64) -> Vec<f64> {
    let mut out = vec![0.05; w * h];
    let count = ((w * h) / 200).max(3);
    let mut state = seed.wrapping_add(1);
    for _ in 0..count {
        state = prng(state);
        let cx = (state as usize) % w;
        state = prng(state);
        let cy = (state as usize) % h;
        let r2 = 4i64;
        for dy in -2i64..=2 {
            for dx in -2i64..=2 {
                if dx * dx + dy * dy > r2 {
                    continue;
                }
                let x = cx as i64 + dx;
                let y = cy as i64 + dy;
                if x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h {
                    out[y as usize * w + x as usize] = 0.9;
                }
            }
        }
    }
    out
}

/// Separable box blur with clamped edges.
fn box_blur(src: &[f64], w: usize, h: usize, radius: usize) -> Vec<f64> {
    if radius == 0 {
        return src.to_vec();
    }
    let horizontal = blur_pass(src, w, h, radius, true);
    blur_pass(&horizontal, w, h, radius, false)
}

fn blur_pass(src: &[f64], w: usize, h: usize, radius: usize, horizontal: bool) -> Vec<f64> {
    let r = radius as i64;
    let norm = (2 * r + 1) as f64;
    let mut out = vec![0.0; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for k in -r..=r {
                let (sx, sy) = if horizontal {
                    ((x as i64 + k).clamp(0, w as i64 - 1) as usize, y)
                } else {
                    (x, (y as i64 + k).clamp(0, h as i64 - 1) as usize)
                };
                acc += src[sy * w + sx];
            }
            out[y * w + x] = acc / norm;
        }
    }
    out
}
