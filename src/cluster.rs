//! Suprathreshold cluster labelling, split by tail.
//!
//! Each tail is labelled independently: voxels at or beyond the threshold are
//! grouped into connected components, components smaller than the extent are
//! discarded, and the survivors are numbered by descending size. Negative-tail
//! ids continue after the positive ones so the combined id array stays
//! unambiguous.

use std::collections::VecDeque;

use log::debug;
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::error::ViewerError;

/// Voxel neighbourhood used to decide whether two voxels touch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Connectivity {
    /// Shared faces only.
    Face6,
    /// Faces and edges.
    Edge18,
    /// Faces, edges and corners.
    Vertex26,
}

impl TryFrom<u8> for Connectivity {
    type Error = ViewerError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            6 => Ok(Self::Face6),
            18 => Ok(Self::Edge18),
            26 => Ok(Self::Vertex26),
            other => Err(ViewerError::Connectivity(other)),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(c: Connectivity) -> u8 {
        match c {
            Connectivity::Face6 => 6,
            Connectivity::Edge18 => 18,
            Connectivity::Vertex26 => 26,
        }
    }
}

impl Connectivity {
    /// Neighbour offsets; a face neighbour moves along one axis, an edge
    /// neighbour along two, a corner neighbour along three.
    pub fn offsets(self) -> Vec<[isize; 3]> {
        let max_axes = match self {
            Self::Face6 => 1,
            Self::Edge18 => 2,
            Self::Vertex26 => 3,
        };
        let mut out = Vec::with_capacity(26);
        for dx in -1isize..=1 {
            for dy in -1isize..=1 {
                for dz in -1isize..=1 {
                    let moved = (dx != 0) as usize + (dy != 0) as usize + (dz != 0) as usize;
                    if moved > 0 && moved <= max_axes {
                        out.push([dx, dy, dz]);
                    }
                }
            }
        }
        out
    }
}

/// Row of a [`ClusterLabeling`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Sign {
    Positive,
    Negative,
    Combined,
}

impl Sign {
    fn row(self) -> usize {
        match self {
            Sign::Positive => 0,
            Sign::Negative => 1,
            Sign::Combined => 2,
        }
    }
}

/// Which tails a threshold request keeps for display.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Positive,
    Negative,
    Both,
}

impl Direction {
    pub fn includes(self, sign: Sign) -> bool {
        matches!(
            (self, sign),
            (Direction::Both, _)
                | (Direction::Positive, Sign::Positive)
                | (Direction::Negative, Sign::Negative)
        )
    }
}

/// One surviving connected component.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSummary {
    pub id: u32,
    pub sign: Sign,
    pub size: usize,
    /// Most extreme value in the tail's direction, with its original sign.
    pub peak_value: f32,
    pub peak_voxel: [usize; 3],
    /// Mean voxel index of the component.
    pub centroid: [f64; 3],
}

/// Whether anything survived a threshold.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThresholdStatus {
    Survivors { positive: usize, negative: usize },
    NoSurvivors,
}

/// Per-voxel cluster sizes and ids for the positive, negative and combined rows.
#[derive(Clone, Debug)]
pub struct ClusterLabeling {
    sizes: [Array3<u32>; 3],
    ids: [Array3<u32>; 3],
    clusters: Vec<ClusterSummary>,
    threshold: f32,
    extent: usize,
}

impl ClusterLabeling {
    pub fn size(&self, sign: Sign) -> &Array3<u32> {
        &self.sizes[sign.row()]
    }

    pub fn id(&self, sign: Sign) -> &Array3<u32> {
        &self.ids[sign.row()]
    }

    /// All surviving clusters, positive tail first.
    pub fn clusters(&self) -> &[ClusterSummary] {
        &self.clusters
    }

    pub fn clusters_for(&self, sign: Sign) -> impl Iterator<Item = &ClusterSummary> {
        self.clusters
            .iter()
            .filter(move |c| sign == Sign::Combined || c.sign == sign)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn status(&self) -> ThresholdStatus {
        let positive = self.clusters_for(Sign::Positive).count();
        let negative = self.clusters_for(Sign::Negative).count();
        if positive + negative == 0 {
            ThresholdStatus::NoSurvivors
        } else {
            ThresholdStatus::Survivors { positive, negative }
        }
    }

    /// Cluster containing `voxel`, if any.
    pub fn cluster_at(&self, voxel: [usize; 3]) -> Option<&ClusterSummary> {
        let id = *self.ids[Sign::Combined.row()].get(voxel)?;
        (id != 0).then(|| self.clusters.iter().find(|c| c.id == id))?
    }
}

/// Connected-component thresholder.
#[derive(Copy, Clone, Debug)]
pub struct ClusterThresholder {
    connectivity: Connectivity,
}

impl Default for ClusterThresholder {
    fn default() -> Self {
        Self::new(Connectivity::Edge18)
    }
}

impl ClusterThresholder {
    pub fn new(connectivity: Connectivity) -> Self {
        Self { connectivity }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    /// Label both tails of `stat` at voxel threshold `u`, keeping components
    /// of at least `k` voxels.
    ///
    /// The positive tail is `v >= u` with `v > 0`; the negative tail is
    /// `-v >= u` with `v < 0`, so no voxel can fall in both even for `u <= 0`.
    /// Non-finite values never pass.
    pub fn run(&self, stat: &Array3<f32>, u: f32, k: usize) -> ClusterLabeling {
        let offsets = self.connectivity.offsets();

        let (pos_sizes, pos_ids, mut clusters) = label_tail(
            stat,
            |v| v > 0.0 && v >= u,
            Sign::Positive,
            k,
            1,
            &offsets,
        );
        let first_negative = clusters.len() as u32 + 1;
        let (neg_sizes, neg_ids, neg_clusters) = label_tail(
            stat,
            |v| v < 0.0 && -v >= u,
            Sign::Negative,
            k,
            first_negative,
            &offsets,
        );
        clusters.extend(neg_clusters);

        let combined_sizes = &pos_sizes + &neg_sizes;
        let combined_ids = &pos_ids + &neg_ids;

        debug!(
            "threshold u={u} k={k}: {} clusters ({:?}-connected)",
            clusters.len(),
            u8::from(self.connectivity)
        );

        ClusterLabeling {
            sizes: [pos_sizes, neg_sizes, combined_sizes],
            ids: [pos_ids, neg_ids, combined_ids],
            clusters,
            threshold: u,
            extent: k,
        }
    }
}

struct Component {
    voxels: Vec<[usize; 3]>,
    peak_value: f32,
    peak_voxel: [usize; 3],
}

/// Flood-fill the voxels selected by `marked` and keep components of at least
/// `k` voxels, numbered from `first_id` by descending size.
fn label_tail(
    stat: &Array3<f32>,
    marked: impl Fn(f32) -> bool,
    sign: Sign,
    k: usize,
    first_id: u32,
    offsets: &[[isize; 3]],
) -> (Array3<u32>, Array3<u32>, Vec<ClusterSummary>) {
    let dim = stat.dim();
    let shape = [dim.0, dim.1, dim.2];
    let mut mask = stat.mapv(|v| marked(v));
    let more_extreme = |a: f32, b: f32| match sign {
        Sign::Negative => a < b,
        _ => a > b,
    };

    let mut components = Vec::new();
    let mut queue = VecDeque::new();
    for seed in ndarray::indices(dim) {
        let seed = [seed.0, seed.1, seed.2];
        if !mask[seed] {
            continue;
        }
        mask[seed] = false;
        queue.push_back(seed);
        let mut comp = Component {
            voxels: Vec::new(),
            peak_value: stat[seed],
            peak_voxel: seed,
        };
        while let Some(p) = queue.pop_front() {
            let v = stat[p];
            if more_extreme(v, comp.peak_value) {
                comp.peak_value = v;
                comp.peak_voxel = p;
            }
            comp.voxels.push(p);
            for off in offsets {
                let Some(n) = neighbour(p, off, shape) else {
                    continue;
                };
                if mask[n] {
                    mask[n] = false;
                    queue.push_back(n);
                }
            }
        }
        components.push(comp);
    }

    // Stable: equal sizes keep scan order.
    components.retain(|c| c.voxels.len() >= k);
    components.sort_by(|a, b| b.voxels.len().cmp(&a.voxels.len()));

    let mut sizes = Array3::<u32>::zeros(dim);
    let mut ids = Array3::<u32>::zeros(dim);
    let mut summaries = Vec::with_capacity(components.len());
    for (i, comp) in components.into_iter().enumerate() {
        let id = first_id + i as u32;
        let size = comp.voxels.len();
        let mut sum = [0.0f64; 3];
        for &p in &comp.voxels {
            sizes[p] = size as u32;
            ids[p] = id;
            for a in 0..3 {
                sum[a] += p[a] as f64;
            }
        }
        summaries.push(ClusterSummary {
            id,
            sign,
            size,
            peak_value: comp.peak_value,
            peak_voxel: comp.peak_voxel,
            centroid: sum.map(|s| s / size as f64),
        });
    }
    (sizes, ids, summaries)
}

#[inline]
fn neighbour(p: [usize; 3], off: &[isize; 3], shape: [usize; 3]) -> Option<[usize; 3]> {
    let mut n = [0usize; 3];
    for a in 0..3 {
        let c = p[a].checked_add_signed(off[a])?;
        if c >= shape[a] {
            return None;
        }
        n[a] = c;
    }
    Some(n)
}

/// Count voxels per non-zero id.
pub fn id_histogram(ids: &Array3<u32>) -> std::collections::BTreeMap<u32, usize> {
    let mut counts = std::collections::BTreeMap::new();
    Zip::from(ids).for_each(|&id| {
        if id != 0 {
            *counts.entry(id).or_insert(0) += 1;
        }
    });
    counts
}
