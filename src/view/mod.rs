//! One orthogonal triple view bound to a volume.
//!
//! A bound view owns three slice surfaces (transverse, coronal, sagittal).
//! Every redraw resamples the volume on the display grid through the plane's
//! slice-to-display matrix composed with the inverse of the volume's
//! voxel-to-display matrix.

pub mod layout;

use log::{debug, warn};
use nalgebra::{Matrix4, Point3, Vector3};
use ndarray::Array2;

use crate::compositor::{
    Colorbar, GrayScale, LayerSlice, OverlayCompositor, SliceImage, COLORBAR_SLOT_PX,
};
use crate::config::{Interpolation, ViewerConfig};
use crate::error::{Result, ViewerError};
use crate::session::VolumeId;
use crate::space::{BoundingBox, DisplaySpace};
use crate::volume::{apply, sample, IntensityWindow, Volume};

pub use layout::{pack, PanelLayout, PixelRect};

/// The three canonical slice orientations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Plane {
    Transverse,
    Coronal,
    Sagittal,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Transverse, Plane::Coronal, Plane::Sagittal];

    /// Display axis the plane is perpendicular to.
    pub fn depth_axis(self) -> usize {
        match self {
            Plane::Transverse => 2,
            Plane::Coronal => 1,
            Plane::Sagittal => 0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Plane::Transverse => "Transverse",
            Plane::Coronal => "Coronal",
            Plane::Sagittal => "Sagittal",
        }
    }

    /// Columns and rows of the slice image for `bb`.
    pub fn pixel_dims(self, bb: &BoundingBox) -> [usize; 2] {
        let [dx, dy, dz] = bb.dims();
        match self {
            Plane::Transverse => [dx, dy],
            Plane::Coronal => [dx, dz],
            Plane::Sagittal => [dy, dz],
        }
    }

    /// Maps slice coordinates `(u, v, 0)` to display coordinates at `depth`.
    /// `u` runs along image columns, `v` upwards along image rows. The
    /// sagittal plane shows anterior on the left.
    pub fn slice_to_display(self, bb: &BoundingBox, depth: f64) -> Matrix4<f64> {
        let (min, max) = (bb.min, bb.max);
        match self {
            Plane::Transverse => Matrix4::new(
                1.0, 0.0, 0.0, min.x, //
                0.0, 1.0, 0.0, min.y, //
                0.0, 0.0, 0.0, depth, //
                0.0, 0.0, 0.0, 1.0,
            ),
            Plane::Coronal => Matrix4::new(
                1.0, 0.0, 0.0, min.x, //
                0.0, 0.0, 0.0, depth, //
                0.0, 1.0, 0.0, min.z, //
                0.0, 0.0, 0.0, 1.0,
            ),
            Plane::Sagittal => Matrix4::new(
                0.0, 0.0, 0.0, depth, //
                -1.0, 0.0, 0.0, max.y, //
                0.0, 1.0, 0.0, min.z, //
                0.0, 0.0, 0.0, 1.0,
            ),
        }
    }

    /// Slice coordinates `(u, v)` of a display point.
    pub fn display_to_slice(self, bb: &BoundingBox, p: &Point3<f64>) -> (f64, f64) {
        match self {
            Plane::Transverse => (p.x - bb.min.x, p.y - bb.min.y),
            Plane::Coronal => (p.x - bb.min.x, p.z - bb.min.z),
            Plane::Sagittal => (bb.max.y - p.y, p.z - bb.min.z),
        }
    }
}

/// Lifecycle of a view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewState {
    Uninitialized,
    Bound,
    /// At least one redraw has completed; stays here on every later redraw.
    Rendering,
    Disposed,
}

/// How much of the display space a view shows.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Zoom {
    /// Union of every loaded volume.
    Full,
    /// `±mm` around the cursor.
    Extent(f64),
    /// Tightest box around the bound volume's non-zero voxels, or its
    /// overlays' data when it has any.
    NonzeroBox,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LineSegment {
    pub start: [f32; 2],
    pub end: [f32; 2],
}

/// Cursor projection onto a slice, in slice pixel coordinates.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Crosshair {
    pub horizontal: LineSegment,
    pub vertical: LineSegment,
}

impl Crosshair {
    fn at(col: f32, row: f32, width: usize, height: usize) -> Self {
        Self {
            horizontal: LineSegment {
                start: [0.0, row],
                end: [width as f32, row],
            },
            vertical: LineSegment {
                start: [col, 0.0],
                end: [col, height as f32],
            },
        }
    }

    fn scaled(&self, sx: f32, sy: f32) -> Self {
        let s = |p: [f32; 2]| [p[0] * sx, p[1] * sy];
        Self {
            horizontal: LineSegment {
                start: s(self.horizontal.start),
                end: s(self.horizontal.end),
            },
            vertical: LineSegment {
                start: s(self.vertical.start),
                end: s(self.vertical.end),
            },
        }
    }

    /// Intersection of the two lines.
    pub fn centre(&self) -> [f32; 2] {
        [self.vertical.start[0], self.horizontal.start[1]]
    }
}

/// Per-plane rendering state.
#[derive(Clone, Debug)]
pub struct SliceSurface {
    plane: Plane,
    rect: PixelRect,
    size: [usize; 2],
    slice_to_display: Matrix4<f64>,
    slice_to_voxel: Matrix4<f64>,
    image: Option<SliceImage>,
    crosshair: Crosshair,
}

impl SliceSurface {
    fn new(plane: Plane) -> Self {
        Self {
            plane,
            rect: PixelRect::default(),
            size: [1, 1],
            slice_to_display: Matrix4::identity(),
            slice_to_voxel: Matrix4::identity(),
            image: None,
            crosshair: Crosshair::default(),
        }
    }

    pub fn plane(&self) -> Plane {
        self.plane
    }

    /// Panel rectangle within the view's display area.
    pub fn rect(&self) -> PixelRect {
        self.rect
    }

    /// Slice image size in pixels, columns then rows.
    pub fn size(&self) -> [usize; 2] {
        self.size
    }

    pub fn slice_to_voxel(&self) -> &Matrix4<f64> {
        &self.slice_to_voxel
    }

    pub fn image(&self) -> Option<&SliceImage> {
        self.image.as_ref()
    }

    pub fn crosshair(&self) -> Crosshair {
        self.crosshair
    }

    /// Crosshair in panel pixels, relative to the panel's top-left corner.
    pub fn crosshair_in_panel(&self) -> Crosshair {
        let sx = self.rect.width / self.size[0] as f32;
        let sy = self.rect.height / self.size[1] as f32;
        self.crosshair.scaled(sx, sy)
    }
}

/// Resample `data` over a `width x height` slice whose `(u, v, 0)` coordinates
/// map to voxels through `slice_to_voxel`. Row 0 is the top (largest `v`).
pub fn sample_plane(
    data: &ndarray::Array3<f32>,
    slice_to_voxel: &Matrix4<f64>,
    width: usize,
    height: usize,
    interpolation: Interpolation,
) -> Array2<f32> {
    let origin = apply(slice_to_voxel, &Point3::origin());
    let du: Vector3<f64> = slice_to_voxel.fixed_view::<3, 1>(0, 0).into_owned();
    let dv: Vector3<f64> = slice_to_voxel.fixed_view::<3, 1>(0, 1).into_owned();
    Array2::from_shape_fn((height, width), |(row, col)| {
        let v = (height - 1 - row) as f64;
        let p = origin + du * col as f64 + dv * v;
        sample(data, &p, interpolation)
    })
}

#[derive(Debug)]
pub struct VolumeView {
    volume: VolumeId,
    state: ViewState,
    available: [f32; 2],
    area: [f32; 2],
    layout: Option<PanelLayout>,
    surfaces: [SliceSurface; 3],
    colorbars: Vec<Colorbar>,
    zoom: Zoom,
    brightness: f32,
    contrast: f32,
    interpolation: Interpolation,
    margin: f32,
    compositor: OverlayCompositor,
}

impl VolumeView {
    pub fn new(volume: VolumeId, config: &ViewerConfig) -> Self {
        Self {
            volume,
            state: ViewState::Uninitialized,
            available: [0.0; 2],
            area: [0.0; 2],
            layout: None,
            surfaces: Plane::ALL.map(SliceSurface::new),
            colorbars: Vec::new(),
            zoom: Zoom::Full,
            brightness: 0.0,
            contrast: 1.0,
            interpolation: config.interpolation,
            margin: config.panel_margin_px,
            compositor: OverlayCompositor::new(config.blend_proportion),
        }
    }

    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Space the view was last asked to fit into.
    pub fn available(&self) -> [f32; 2] {
        self.available
    }

    /// Display area as last fitted by [`Self::recompute_layout`].
    pub fn area(&self) -> [f32; 2] {
        self.area
    }

    pub fn layout(&self) -> Option<&PanelLayout> {
        self.layout.as_ref()
    }

    pub fn surfaces(&self) -> &[SliceSurface; 3] {
        &self.surfaces
    }

    pub fn surface(&self, plane: Plane) -> &SliceSurface {
        &self.surfaces[Self::slot(plane)]
    }

    pub fn colorbars(&self) -> &[Colorbar] {
        &self.colorbars
    }

    pub fn zoom(&self) -> Zoom {
        self.zoom
    }

    pub fn set_intensity(&mut self, brightness: f32, contrast: f32) {
        self.brightness = brightness;
        self.contrast = contrast;
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    fn slot(plane: Plane) -> usize {
        match plane {
            Plane::Transverse => 0,
            Plane::Coronal => 1,
            Plane::Sagittal => 2,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            ViewState::Disposed => Err(ViewerError::ViewDisposed),
            ViewState::Uninitialized => Err(ViewerError::NotBound),
            _ => Ok(()),
        }
    }

    /// Attach `volume` and fit the three panels into `area`.
    pub fn bind(&mut self, volume: &Volume, area: [f32; 2], space: &DisplaySpace) -> Result<()> {
        if self.state == ViewState::Disposed {
            return Err(ViewerError::ViewDisposed);
        }
        if !(area[0].is_finite() && area[1].is_finite() && area[0] > 0.0 && area[1] > 0.0) {
            return Err(ViewerError::DegenerateDisplayArea {
                width: area[0],
                height: area[1],
            });
        }
        space
            .voxel_to_display(volume)?
            .try_inverse()
            .ok_or(ViewerError::SingularAffine)?;

        self.surfaces = Plane::ALL.map(SliceSurface::new);
        self.state = ViewState::Bound;
        self.recompute_layout(area, space, volume.blobs().len())?;
        debug!("view bound to '{}'", volume.name());
        Ok(())
    }

    /// Lay the panels out inside `available` and shrink the display area to fit.
    pub fn recompute_layout(
        &mut self,
        available: [f32; 2],
        space: &DisplaySpace,
        overlay_count: usize,
    ) -> Result<PanelLayout> {
        self.ensure_live()?;
        let bb = space.bounding_box();
        if bb.is_empty() {
            warn!("laying out against an empty bounding box; using single-voxel panels");
        }
        let dims = bb.dims().map(|d| d as f64);
        let reserve = if overlay_count > 0 {
            self.margin + overlay_count as f32 * COLORBAR_SLOT_PX
        } else {
            0.0
        };
        let layout = pack(dims, available, self.margin, reserve);
        for surface in &mut self.surfaces {
            surface.rect = layout.rect(surface.plane);
        }
        self.available = available;
        self.area = layout.size;
        self.layout = Some(layout);
        Ok(layout)
    }

    /// Resample every plane at `cursor` (world mm), composite overlays and
    /// move the crosshairs.
    pub fn redraw(&mut self, volume: &Volume, space: &DisplaySpace, cursor: &Point3<f64>) -> Result<()> {
        self.ensure_live()?;
        let bb = space.bounding_box();
        if bb.is_empty() {
            warn!("empty bounding box; drawing blank slices");
            for surface in &mut self.surfaces {
                surface.size = [1, 1];
                surface.image = Some(SliceImage::blank(1, 1));
                surface.crosshair = Crosshair::at(0.5, 0.5, 1, 1);
            }
            self.state = ViewState::Rendering;
            return Ok(());
        }

        let display_to_voxel = space
            .voxel_to_display(volume)?
            .try_inverse()
            .ok_or(ViewerError::SingularAffine)?;
        let centre = space.world_to_display(cursor)?;

        let mut bases = Vec::with_capacity(3);
        for surface in &mut self.surfaces {
            let plane = surface.plane;
            let a = plane.depth_axis();
            let depth = bb.min[a] + (centre[a] - bb.min[a]).round();
            let [w, h] = plane.pixel_dims(&bb);
            let to_display = plane.slice_to_display(&bb, depth);
            let to_voxel = display_to_voxel * to_display;

            bases.push(sample_plane(volume.data(), &to_voxel, w, h, self.interpolation));

            let (u, v) = plane.display_to_slice(&bb, &centre);
            let col = u as f32 + 0.5;
            let row = (h as f64 - 1.0 - v) as f32 + 0.5;
            surface.size = [w, h];
            surface.slice_to_display = to_display;
            surface.slice_to_voxel = to_voxel;
            surface.crosshair = Crosshair::at(col, row, w, h);
        }

        let gray = match volume.window() {
            IntensityWindow::Auto => GrayScale::auto(bases.iter()),
            IntensityWindow::Explicit { min, max } => GrayScale::new(min, max),
        }
        .with_adjustment(self.brightness, self.contrast);

        // Per-layer display-to-voxel matrices; a layer that cannot be mapped is skipped.
        let mut layer_maps = Vec::with_capacity(volume.blobs().len());
        for layer in volume.blobs() {
            let inverse = space
                .affine_to_display(volume.premul(), layer.affine())
                .ok()
                .and_then(|m| m.try_inverse());
            match inverse {
                Some(m) => layer_maps.push((layer, m)),
                None => warn!("overlay '{}' has a singular affine; skipped", layer.name()),
            }
        }

        for (surface, base) in self.surfaces.iter_mut().zip(bases.iter()) {
            let [w, h] = surface.size;
            let slices: Vec<LayerSlice> = layer_maps
                .iter()
                .map(|(layer, to_voxel)| LayerSlice {
                    layer,
                    values: sample_plane(
                        layer.values(),
                        &(to_voxel * surface.slice_to_display),
                        w,
                        h,
                        self.interpolation,
                    ),
                })
                .collect();
            surface.image = Some(self.compositor.composite(base, &gray, &slices));
        }

        self.colorbars = match &self.layout {
            Some(layout) => self
                .compositor
                .colorbars(volume.blobs(), layout.sagittal, self.margin),
            None => Vec::new(),
        };
        self.state = ViewState::Rendering;
        Ok(())
    }

    /// Change the field of view, then re-layout and redraw.
    ///
    /// The bounding box lives in the shared display space, so other views
    /// need a re-layout afterwards as well.
    pub fn set_zoom<'a>(
        &mut self,
        zoom: Zoom,
        space: &mut DisplaySpace,
        volumes: impl IntoIterator<Item = &'a Volume>,
        bound: &Volume,
        cursor: &Point3<f64>,
    ) -> Result<BoundingBox> {
        self.ensure_live()?;
        let full = space.max_bounding_box(volumes)?;
        let bb = zoom_box(zoom, space, full, bound, cursor)?;
        space.set_bounding_box(bb);
        self.zoom = zoom;
        self.recompute_layout(self.available, space, bound.blobs().len())?;
        self.redraw(bound, space, cursor)?;
        Ok(bb)
    }

    /// Record a zoom applied to the shared display space by another view.
    pub(crate) fn follow_zoom(&mut self, zoom: Zoom) {
        self.zoom = zoom;
    }

    /// World position under a point of a panel, given relative to the panel's
    /// top-left corner. Uses the geometry of the last redraw.
    pub fn world_at(&self, plane: Plane, panel_pos: [f32; 2], space: &DisplaySpace) -> Option<Point3<f64>> {
        if self.state != ViewState::Rendering {
            return None;
        }
        let surface = self.surface(plane);
        let rect = surface.rect;
        if rect.width <= 0.0 || rect.height <= 0.0 {
            return None;
        }
        let [w, h] = surface.size;
        let col = (panel_pos[0] / rect.width * w as f32) as f64 - 0.5;
        let row = (panel_pos[1] / rect.height * h as f32) as f64 - 0.5;
        let slice = Point3::new(col, h as f64 - 1.0 - row, 0.0);
        let display = apply(&surface.slice_to_display, &slice);
        Some(space.display_to_world(&display))
    }

    /// Release rendering resources. Terminal.
    pub fn dispose(&mut self) {
        for surface in &mut self.surfaces {
            surface.image = None;
        }
        self.colorbars.clear();
        self.layout = None;
        self.state = ViewState::Disposed;
    }
}

/// Display-space box `zoom` selects, given the union box `full` and the
/// volume of the view that requested it.
pub(crate) fn zoom_box(
    zoom: Zoom,
    space: &DisplaySpace,
    full: BoundingBox,
    bound: &Volume,
    cursor: &Point3<f64>,
) -> Result<BoundingBox> {
    Ok(match zoom {
        Zoom::Full => full,
        Zoom::Extent(mm) => {
            let centre = space.world_to_display(cursor)?;
            let scale = space.scale();
            let half = Vector3::new(mm / scale.x, mm / scale.y, mm / scale.z).abs();
            BoundingBox::new(centre - half, centre + half)
        }
        Zoom::NonzeroBox => {
            let bb = nonzero_box(bound, space)?;
            if bb.is_empty() {
                debug!("no non-zero voxels; zooming to the full box");
                full
            } else {
                bb
            }
        }
    })
}

/// Display-space box around the finite non-zero voxels of `volume`, or of its
/// overlays when it has any.
fn nonzero_box(volume: &Volume, space: &DisplaySpace) -> Result<BoundingBox> {
    let mut bb = BoundingBox::empty();
    if volume.blobs().is_empty() {
        if let Some((lo, hi)) = voxel_extent(volume.data()) {
            bb = BoundingBox::of_voxel_range(&space.voxel_to_display(volume)?, lo, hi);
        }
    } else {
        for layer in volume.blobs() {
            if let Some((lo, hi)) = voxel_extent(layer.values()) {
                let m = space.affine_to_display(volume.premul(), layer.affine())?;
                bb = bb.union(&BoundingBox::of_voxel_range(&m, lo, hi));
            }
        }
    }
    Ok(bb)
}

fn voxel_extent(data: &ndarray::Array3<f32>) -> Option<([f64; 3], [f64; 3])> {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    let mut any = false;
    for ((x, y, z), &v) in data.indexed_iter() {
        if v.is_finite() && v != 0.0 {
            any = true;
            for (a, i) in [x, y, z].into_iter().enumerate() {
                lo[a] = lo[a].min(i as f64);
                hi[a] = hi[a].max(i as f64);
            }
        }
    }
    any.then_some((lo, hi))
}
