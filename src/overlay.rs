//! Coloured statistical layers drawn on top of an anatomical volume.

use log::warn;
use nalgebra::Matrix4;
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterLabeling, Sign};

/// Smallest colour-range span; a layer with `min == max` is scaled against this.
pub const RANGE_EPSILON: f32 = 1e-6;

/// An ordered table of RGB triples in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Colormap {
    name: String,
    entries: Vec<[f32; 3]>,
}

impl Colormap {
    pub fn from_entries(name: impl Into<String>, entries: Vec<[f32; 3]>) -> Self {
        let entries = if entries.is_empty() {
            vec![[1.0, 1.0, 1.0]]
        } else {
            entries
        };
        Self {
            name: name.into(),
            entries,
        }
    }

    fn from_fn(name: &str, n: usize, f: impl Fn(f32) -> [f32; 3]) -> Self {
        let n = n.max(2);
        let entries = (0..n).map(|i| f(i as f32 / (n - 1) as f32)).collect();
        Self::from_entries(name, entries)
    }

    pub fn gray(n: usize) -> Self {
        Self::from_fn("gray", n, |t| [t, t, t])
    }

    /// Black, red, yellow, white.
    pub fn hot(n: usize) -> Self {
        Self::from_fn("hot", n, |t| {
            [
                (t * 8.0 / 3.0).clamp(0.0, 1.0),
                ((t - 3.0 / 8.0) * 8.0 / 3.0).clamp(0.0, 1.0),
                ((t - 0.75) * 4.0).clamp(0.0, 1.0),
            ]
        })
    }

    /// Blue to green.
    pub fn winter(n: usize) -> Self {
        Self::from_fn("winter", n, |t| [0.0, t, 1.0 - t / 2.0])
    }

    pub fn jet(n: usize) -> Self {
        Self::from_fn("jet", n, |t| {
            let ch = |c: f32| (1.5 - (4.0 * t - c).abs()).clamp(0.0, 1.0);
            [ch(3.0), ch(2.0), ch(1.0)]
        })
    }

    pub fn reversed(mut self) -> Self {
        self.entries.reverse();
        self.name = format!("{}-reversed", self.name);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[[f32; 3]] {
        &self.entries
    }

    /// Colour at fraction `t` of the table, nearest entry.
    pub fn at(&self, t: f32) -> [f32; 3] {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let i = (t * (self.entries.len() - 1) as f32).round() as usize;
        self.entries[i.min(self.entries.len() - 1)]
    }

    /// The table stretched or squeezed to exactly `n` entries.
    pub fn resample(&self, n: usize) -> Vec<[f32; 3]> {
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![self.at(0.0)];
        }
        (0..n).map(|i| self.at(i as f32 / (n - 1) as f32)).collect()
    }
}

/// Built-in colormaps selectable by name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColormapKind {
    Gray,
    Hot,
    Winter,
    Jet,
}

impl ColormapKind {
    pub fn build(self, n: usize) -> Colormap {
        match self {
            ColormapKind::Gray => Colormap::gray(n),
            ColormapKind::Hot => Colormap::hot(n),
            ColormapKind::Winter => Colormap::winter(n),
            ColormapKind::Jet => Colormap::jet(n),
        }
    }
}

/// Value range a layer's colours are scaled against. `min <= max` always holds.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ColorRange {
    min: f32,
    max: f32,
}

impl ColorRange {
    pub fn new(a: f32, b: f32) -> Self {
        if a > b {
            warn!("colour range [{a}, {b}] given in reverse order; swapping");
            Self { min: b, max: a }
        } else {
            Self { min: a, max: b }
        }
    }

    /// Range of the finite values in `values`, `[0, 0]` when there are none.
    pub fn of_finite(values: &Array3<f32>) -> Self {
        let (min, max) = values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if min.is_finite() {
            Self { min, max }
        } else {
            Self { min: 0.0, max: 0.0 }
        }
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    /// `max - min`, clamped below by [`RANGE_EPSILON`].
    pub fn span(&self) -> f32 {
        (self.max - self.min).max(RANGE_EPSILON)
    }

    /// `v` mapped to `[0, 1]`; NaN stays NaN.
    pub fn normalise(&self, v: f32) -> f32 {
        ((v - self.min) / self.span()).clamp(0.0, 1.0)
    }

    pub fn spans_zero(&self) -> bool {
        self.min < 0.0 && self.max > 0.0
    }
}

/// Where a layer came from. Thresholding swaps out its own layers only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LayerSource {
    #[default]
    User,
    Threshold,
}

/// A coloured statistical overlay. Non-finite values mean "no data".
#[derive(Clone, Debug)]
pub struct OverlayLayer {
    name: String,
    values: Array3<f32>,
    affine: Matrix4<f64>,
    range: ColorRange,
    colormap: Colormap,
    blend_colour: Option<[f32; 3]>,
    proportion: Option<f32>,
    source: LayerSource,
}

impl OverlayLayer {
    /// Layer over `values` (voxel-to-world `affine`) scaled to its finite range
    /// and drawn with the hot colormap.
    pub fn new(name: impl Into<String>, values: Array3<f32>, affine: Matrix4<f64>) -> Self {
        let range = ColorRange::of_finite(&values);
        Self {
            name: name.into(),
            values,
            affine,
            range,
            colormap: Colormap::hot(64),
            blend_colour: None,
            proportion: None,
            source: LayerSource::User,
        }
    }

    /// Layer holding `stat` where `labeling` kept a cluster of `sign`, NaN
    /// elsewhere, drawn with `colormap`. `None` when that tail has no
    /// surviving voxel.
    pub fn from_labeling(
        stat: &Array3<f32>,
        affine: Matrix4<f64>,
        labeling: &ClusterLabeling,
        sign: Sign,
        colormap: Colormap,
    ) -> Option<Self> {
        let ids = labeling.id(sign);
        if ids.iter().all(|&id| id == 0) {
            return None;
        }
        let mut values = Array3::from_elem(stat.dim(), f32::NAN);
        Zip::from(&mut values)
            .and(stat)
            .and(ids)
            .for_each(|out, &v, &id| {
                if id != 0 {
                    *out = v;
                }
            });
        let name = match sign {
            Sign::Positive => "positive clusters",
            Sign::Negative => "negative clusters",
            Sign::Combined => "clusters",
        };
        Some(
            Self::new(name, values, affine)
                .with_colormap(colormap)
                .with_source(LayerSource::Threshold),
        )
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.range = ColorRange::new(min, max);
        self
    }

    pub fn with_colormap(mut self, colormap: Colormap) -> Self {
        self.colormap = colormap;
        self
    }

    /// Draw this layer as a single colour; forces full-colour compositing.
    pub fn with_blend_colour(mut self, rgb: [f32; 3]) -> Self {
        self.blend_colour = Some(rgb.map(|c| c.clamp(0.0, 1.0)));
        self
    }

    pub fn with_proportion(mut self, proportion: f32) -> Self {
        self.proportion = Some(proportion.clamp(0.0, 1.0));
        self
    }

    pub fn with_source(mut self, source: LayerSource) -> Self {
        self.source = source;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &Array3<f32> {
        &self.values
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    pub fn range(&self) -> ColorRange {
        self.range
    }

    pub fn colormap(&self) -> &Colormap {
        &self.colormap
    }

    pub fn blend_colour(&self) -> Option<[f32; 3]> {
        self.blend_colour
    }

    pub fn proportion(&self) -> Option<f32> {
        self.proportion
    }

    pub fn source(&self) -> LayerSource {
        self.source
    }
}
