//! Packing of the three slice panels into one display area.
//!
//! The coronal panel sits top-left above the transverse panel, both as wide as
//! the left column. The sagittal panel sits to the right and spans the full
//! column height. Every panel keeps the aspect ratio of its display-voxel
//! extent, so the overall area is shrunk to fit exactly rather than stretched.

use super::Plane;

/// Axis-aligned pixel rectangle, origin top-left, y down. Half-open.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    /// Area shared with `other`; zero when they only touch.
    pub fn overlap_area(&self, other: &PixelRect) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        w.max(0.0) * h.max(0.0)
    }
}

/// Where each panel goes and how large the whole area ends up.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PanelLayout {
    pub transverse: PixelRect,
    pub coronal: PixelRect,
    pub sagittal: PixelRect,
    /// Fitted size of the display area, including any reserved strip.
    pub size: [f32; 2],
}

impl PanelLayout {
    pub fn rect(&self, plane: Plane) -> PixelRect {
        match plane {
            Plane::Transverse => self.transverse,
            Plane::Coronal => self.coronal,
            Plane::Sagittal => self.sagittal,
        }
    }

    /// Panel under a point of the display area.
    pub fn hit(&self, px: f32, py: f32) -> Option<Plane> {
        Plane::ALL
            .into_iter()
            .find(|&p| self.rect(p).contains(px, py))
    }
}

/// Fit the three panels into `available` pixels.
///
/// `dims` is the bounding-box extent in display voxels along x, y, z.
/// `reserve_right` pixels are kept free to the right of the sagittal panel.
pub fn pack(dims: [f64; 3], available: [f32; 2], margin: f32, reserve_right: f32) -> PanelLayout {
    let [dx, dy, dz] = dims.map(|d| d.max(1.0) as f32);
    let margin = margin.max(0.0);
    let avail_w = (available[0] - reserve_right).max(1.0);
    let avail_h = available[1].max(1.0);

    // Left column width `w` gives scale s = w / dx, column height
    // h = s (dy + dz) + margin and sagittal width h * dy / dz.
    let width_bound = (avail_w - margin - margin * dy / dz) / (1.0 + (dy + dz) * dy / (dx * dz));
    let height_bound = (avail_h - margin) * dx / (dy + dz);
    let w = width_bound.min(height_bound).max(1.0);

    let s = w / dx;
    let coronal_h = s * dz;
    let transverse_h = s * dy;
    let column_h = coronal_h + margin + transverse_h;
    let sagittal_w = column_h * dy / dz;

    let coronal = PixelRect::new(0.0, 0.0, w, coronal_h);
    let transverse = PixelRect::new(0.0, coronal_h + margin, w, transverse_h);
    let sagittal = PixelRect::new(w + margin, 0.0, sagittal_w, column_h);

    PanelLayout {
        transverse,
        coronal,
        sagittal,
        size: [sagittal.right() + reserve_right, column_h],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_aspect(rect: PixelRect, across: f64, down: f64) {
        let got = rect.width as f64 / rect.height as f64;
        assert!((got - across / down).abs() < 1e-3, "{got} vs {}", across / down);
    }

    #[test]
    fn test_panels_keep_aspect_and_fit() {
        let dims = [64.0, 64.0, 60.0];
        let layout = pack(dims, [800.0, 600.0], 4.0, 0.0);
        assert_aspect(layout.transverse, 64.0, 64.0);
        assert_aspect(layout.coronal, 64.0, 60.0);
        assert_aspect(layout.sagittal, 64.0, 60.0);
        assert!(layout.size[0] <= 800.0 + 1e-2);
        assert!(layout.size[1] <= 600.0 + 1e-2);
        assert_eq!(layout.transverse.width, layout.coronal.width);
        assert!((layout.sagittal.height - layout.size[1]).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_dims_still_produce_panels() {
        let layout = pack([1.0, 1.0, 1.0], [0.0, 0.0], 0.0, 0.0);
        for plane in Plane::ALL {
            let r = layout.rect(plane);
            assert!(r.width > 0.0 && r.height > 0.0);
        }
    }

    #[test]
    fn test_hit_testing() {
        let layout = pack([10.0, 10.0, 10.0], [210.0, 110.0], 10.0, 0.0);
        assert_eq!(layout.hit(1.0, 1.0), Some(Plane::Coronal));
        assert_eq!(layout.hit(1.0, layout.transverse.y + 1.0), Some(Plane::Transverse));
        assert_eq!(layout.hit(layout.sagittal.x + 1.0, 1.0), Some(Plane::Sagittal));
        assert_eq!(layout.hit(layout.coronal.right() + 1.0, 1.0), None);
    }
}
