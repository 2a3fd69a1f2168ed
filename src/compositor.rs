//! Turns a grayscale slice plus sampled overlay slices into displayable pixels.
//!
//! A lone overlay without a blend colour is drawn through a split palette: the
//! lower 64 entries are gray, the upper 64 the overlay's colormap. Anything
//! else is blended in RGB.

use image::RgbImage;
use ndarray::{Array2, Array3};

use crate::overlay::{ColorRange, OverlayLayer};
use crate::view::layout::PixelRect;

/// Entries in each half of the split palette.
pub const SPLIT_LEVELS: usize = 64;

/// Added to overlay indices before truncation so the lowest overlay value
/// never lands on the last gray entry.
pub const SPLIT_OFFSET: f32 = 0.51;

/// Rows in a colorbar strip.
pub const COLORBAR_STEPS: usize = 64;

/// Width of one colorbar strip in pixels.
pub const COLORBAR_WIDTH_PX: f32 = 14.0;

/// Horizontal room taken by one colorbar, strip plus tick labels.
pub const COLORBAR_SLOT_PX: f32 = 56.0;

/// Grayscale mapping of the base slice.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GrayScale {
    range: ColorRange,
    brightness: f32,
    contrast: f32,
}

impl GrayScale {
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            range: ColorRange::new(min, max),
            brightness: 0.0,
            contrast: 1.0,
        }
    }

    /// `brightness` shifts the normalised level, `contrast` scales it about 0.5.
    pub fn with_adjustment(mut self, brightness: f32, contrast: f32) -> Self {
        self.brightness = if brightness.is_finite() { brightness } else { 0.0 };
        self.contrast = if contrast.is_finite() { contrast.max(0.0) } else { 1.0 };
        self
    }

    /// Range of the finite values across `slices`; `[0, 1]` when there are none.
    pub fn auto<'a>(slices: impl IntoIterator<Item = &'a Array2<f32>>) -> Self {
        let (min, max) = slices
            .into_iter()
            .flat_map(|s| s.iter())
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min.is_finite() {
            Self::new(min, max)
        } else {
            Self::new(0.0, 1.0)
        }
    }

    pub fn min(&self) -> f32 {
        self.range.min()
    }

    pub fn max(&self) -> f32 {
        self.range.max()
    }

    /// Level in `[0, 1]`. Missing data is black.
    pub fn level(&self, v: f32) -> f32 {
        if !v.is_finite() {
            return 0.0;
        }
        let g = self.range.normalise(v);
        ((g - 0.5) * self.contrast + 0.5 + self.brightness).clamp(0.0, 1.0)
    }
}

/// Pixels of one composited slice, row 0 at the top.
#[derive(Clone, Debug, PartialEq)]
pub enum SliceImage {
    Indexed {
        indices: Array2<u8>,
        palette: Vec<[f32; 3]>,
    },
    /// `(rows, cols, 3)`, channels in `[0, 1]`.
    Rgb(Array3<f32>),
}

impl SliceImage {
    /// Black image, at least one pixel.
    pub fn blank(width: usize, height: usize) -> Self {
        SliceImage::Rgb(Array3::zeros((height.max(1), width.max(1), 3)))
    }

    pub fn width(&self) -> usize {
        match self {
            SliceImage::Indexed { indices, .. } => indices.ncols(),
            SliceImage::Rgb(rgb) => rgb.dim().1,
        }
    }

    pub fn height(&self) -> usize {
        match self {
            SliceImage::Indexed { indices, .. } => indices.nrows(),
            SliceImage::Rgb(rgb) => rgb.dim().0,
        }
    }

    pub fn rgb_at(&self, row: usize, col: usize) -> [f32; 3] {
        match self {
            SliceImage::Indexed { indices, palette } => {
                let i = indices[[row, col]] as usize;
                palette.get(i).copied().unwrap_or([0.0; 3])
            }
            SliceImage::Rgb(rgb) => [rgb[[row, col, 0]], rgb[[row, col, 1]], rgb[[row, col, 2]]],
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            SliceImage::Indexed { palette, .. } => palette.iter().flatten().all(|c| c.is_finite()),
            SliceImage::Rgb(rgb) => rgb.iter().all(|c| c.is_finite()),
        }
    }

    /// Row-major RGB8 bytes.
    pub fn to_rgb8(&self) -> Vec<u8> {
        let (h, w) = (self.height(), self.width());
        let mut out = Vec::with_capacity(h * w * 3);
        for row in 0..h {
            for col in 0..w {
                for c in self.rgb_at(row, col) {
                    out.push((c.clamp(0.0, 1.0) * 255.0).round() as u8);
                }
            }
        }
        out
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        let (w, h) = (self.width() as u32, self.height() as u32);
        RgbImage::from_fn(w, h, |x, y| {
            let c = self.rgb_at(y as usize, x as usize);
            image::Rgb(c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
        })
    }
}

/// An overlay's values sampled on the same pixel grid as the base slice.
#[derive(Debug)]
pub struct LayerSlice<'a> {
    pub layer: &'a OverlayLayer,
    pub values: Array2<f32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompositeMode {
    Grayscale,
    Split,
    FullColour,
}

impl CompositeMode {
    pub fn for_layers<'a>(layers: impl IntoIterator<Item = &'a OverlayLayer>) -> Self {
        let layers: Vec<_> = layers.into_iter().collect();
        match layers.as_slice() {
            [] => CompositeMode::Grayscale,
            [only] if only.blend_colour().is_none() => CompositeMode::Split,
            _ => CompositeMode::FullColour,
        }
    }
}

/// Tick mark on a colorbar; `offset` runs from 0 at the top to 1 at the bottom.
#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    pub value: f32,
    pub label: String,
    pub offset: f32,
}

#[derive(Clone, Debug)]
pub struct Colorbar {
    pub layer: usize,
    pub rect: PixelRect,
    /// One column, max at the top.
    pub image: SliceImage,
    pub ticks: Vec<Tick>,
}

#[derive(Copy, Clone, Debug)]
pub struct OverlayCompositor {
    default_proportion: f32,
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl OverlayCompositor {
    pub fn new(default_proportion: f32) -> Self {
        Self {
            default_proportion: default_proportion.clamp(0.0, 1.0),
        }
    }

    pub fn composite(&self, base: &Array2<f32>, gray: &GrayScale, layers: &[LayerSlice]) -> SliceImage {
        if base.is_empty() {
            return SliceImage::blank(1, 1);
        }
        match CompositeMode::for_layers(layers.iter().map(|l| l.layer)) {
            CompositeMode::Grayscale => {
                let (h, w) = base.dim();
                let mut rgb = Array3::zeros((h, w, 3));
                for ((r, c), &v) in base.indexed_iter() {
                    let g = gray.level(v);
                    for ch in 0..3 {
                        rgb[[r, c, ch]] = g;
                    }
                }
                SliceImage::Rgb(rgb)
            }
            CompositeMode::Split => split(base, gray, &layers[0]),
            CompositeMode::FullColour => self.blend(base, gray, layers),
        }
    }

    fn blend(&self, base: &Array2<f32>, gray: &GrayScale, layers: &[LayerSlice]) -> SliceImage {
        let (h, w) = base.dim();
        let mut colour = Array3::<f32>::zeros((h, w, 3));
        let mut total = 0.0;

        for slice in layers {
            let layer = slice.layer;
            let range = layer.range();
            let prop = layer.proportion().unwrap_or(self.default_proportion);
            total += prop;
            for ((r, c), &v) in slice.values.indexed_iter() {
                // Non-finite values add no colour.
                if !v.is_finite() || r >= h || c >= w {
                    continue;
                }
                let t = range.normalise(v);
                let rgb = match layer.blend_colour() {
                    Some(tint) => tint.map(|ch| ch * t),
                    None => layer.colormap().at(t),
                };
                for ch in 0..3 {
                    colour[[r, c, ch]] += rgb[ch] * prop;
                }
            }
        }

        // One base weight for the whole slice.
        let base_weight = 1.0 - total;
        for ((r, c), &v) in base.indexed_iter() {
            let g = gray.level(v) * base_weight;
            for ch in 0..3 {
                colour[[r, c, ch]] = (colour[[r, c, ch]] + g).clamp(0.0, 1.0);
            }
        }
        SliceImage::Rgb(colour)
    }

    /// Colorbars for `layers`, laid out left to right starting just right of `beside`.
    pub fn colorbars(&self, layers: &[OverlayLayer], beside: PixelRect, margin: f32) -> Vec<Colorbar> {
        layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let range = layer.range();
                let mut strip = Array3::<f32>::zeros((COLORBAR_STEPS, 1, 3));
                for row in 0..COLORBAR_STEPS {
                    let t = 1.0 - row as f32 / (COLORBAR_STEPS - 1) as f32;
                    let rgb = match layer.blend_colour() {
                        Some(tint) => tint.map(|ch| ch * t),
                        None => layer.colormap().at(t),
                    };
                    for ch in 0..3 {
                        strip[[row, 0, ch]] = rgb[ch];
                    }
                }
                Colorbar {
                    layer: i,
                    rect: PixelRect::new(
                        beside.right() + margin + i as f32 * COLORBAR_SLOT_PX,
                        beside.y,
                        COLORBAR_WIDTH_PX,
                        beside.height,
                    ),
                    image: SliceImage::Rgb(strip),
                    ticks: ticks(range),
                }
            })
            .collect()
    }
}

fn split(base: &Array2<f32>, gray: &GrayScale, overlay: &LayerSlice) -> SliceImage {
    let levels = SPLIT_LEVELS as f32;
    let range = overlay.layer.range();
    let scale = levels / range.span();
    let mut indices = Array2::<u8>::zeros(base.dim());
    for ((r, c), &v) in base.indexed_iter() {
        let g = (gray.level(v) * levels).floor().clamp(0.0, levels - 1.0);
        indices[[r, c]] = g as u8;
    }
    for ((r, c), &t) in overlay.values.indexed_iter() {
        if !t.is_finite() || r >= indices.nrows() || c >= indices.ncols() {
            continue;
        }
        let i = (levels + SPLIT_OFFSET + (t - range.min()) * scale)
            .floor()
            .clamp(levels, 2.0 * levels - 1.0);
        indices[[r, c]] = i as u8;
    }
    SliceImage::Indexed {
        indices,
        palette: split_palette(overlay.layer),
    }
}

/// 64 gray entries followed by the layer's colormap squeezed to 64 entries.
pub fn split_palette(layer: &OverlayLayer) -> Vec<[f32; 3]> {
    let mut palette: Vec<[f32; 3]> = (0..SPLIT_LEVELS)
        .map(|i| {
            let g = i as f32 / (SPLIT_LEVELS - 1) as f32;
            [g, g, g]
        })
        .collect();
    palette.extend(layer.colormap().resample(SPLIT_LEVELS));
    palette
}

/// Ticks at `ceil(min)` and `floor(max)`, plus zero when the range spans both
/// signs. Falls back to the exact ends when no integer fits.
pub fn ticks(range: ColorRange) -> Vec<Tick> {
    let (min, max) = (range.min(), range.max());
    let span = range.span();
    let mut values = vec![min.ceil(), max.floor()];
    if range.spans_zero() {
        values.push(0.0);
    }
    values.retain(|v| *v >= min && *v <= max);
    if values.is_empty() {
        values = vec![min, max];
    }
    values.sort_by(|a, b| b.total_cmp(a));
    values.dedup();
    values
        .into_iter()
        .map(|value| Tick {
            value,
            label: if value.fract() == 0.0 {
                format!("{value:.0}")
            } else {
                format!("{value:.2}")
            },
            offset: ((max - value) / span).clamp(0.0, 1.0),
        })
        .collect()
}
