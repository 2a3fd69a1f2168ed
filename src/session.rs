//! One viewer session: the display space, the cursor, loaded volumes, bound
//! views and the current statistic threshold.
//!
//! Every mutating verb is available both as a method and as a [`Command`]
//! passed to [`ViewerSession::execute`].

use log::{debug, info, warn};
use nalgebra::Point3;

use crate::arena::{Arena, Key};
use crate::atlas::AtlasLookup;
use crate::cluster::{
    ClusterLabeling, ClusterSummary, ClusterThresholder, Direction, Sign, ThresholdStatus,
};
use crate::config::ViewerConfig;
use crate::error::{Result, ViewerError};
use crate::overlay::OverlayLayer;
use crate::readout::format_mm;
use crate::registry::{
    CursorListener, CursorRegistry, CursorUpdate, ListenerError, ListenerId, ListenerResult,
    RegistryLink, Settled,
};
use crate::space::{BoundingBox, DisplaySpace};
use crate::view::{zoom_box, Plane, ViewState, VolumeView, Zoom};
use crate::volume::{apply, Volume};

/// Table size of the colormaps given to threshold layers.
const COLORMAP_ENTRIES: usize = 64;

/// Handle of a loaded volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumeId(pub(crate) Key);

/// Handle of a bound view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewId(pub(crate) Key);

/// The statistic volume thresholds are computed from.
#[derive(Clone, Debug)]
pub struct StatisticMap {
    volume: Volume,
    degrees_of_freedom: Option<f64>,
    labeling: Option<ClusterLabeling>,
    direction: Direction,
}

impl StatisticMap {
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn degrees_of_freedom(&self) -> Option<f64> {
        self.degrees_of_freedom
    }

    pub fn labeling(&self) -> Option<&ClusterLabeling> {
        self.labeling.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Result of [`ViewerSession::set_threshold`].
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdReport {
    pub threshold: f32,
    pub extent: usize,
    pub direction: Direction,
    /// Survivors among the requested tails only.
    pub status: ThresholdStatus,
    pub clusters: Vec<ClusterSummary>,
}

/// What is under the cursor.
#[derive(Clone, Debug, PartialEq)]
pub struct CursorReport {
    pub position: Point3<f64>,
    pub text: String,
    /// Voxel of the statistic volume, or of the underlay when none is loaded.
    pub voxel: Option<[i64; 3]>,
    pub value: Option<f32>,
    pub cluster: Option<ClusterSummary>,
    pub region: Option<String>,
}

/// The verbs of the programmatic API.
#[derive(Clone, Debug)]
pub enum Command {
    Reposition(Point3<f64>),
    SetThreshold {
        threshold: f32,
        extent: usize,
        direction: Direction,
    },
    AddOverlay(OverlayLayer),
    RemoveOverlay(usize),
    SetZoom { view: ViewId, zoom: Zoom },
    /// Rebase onto a volume's grid, or back to world space with `None`.
    SetSpace(Option<VolumeId>),
    SetResolution(f64),
}

/// Settled state returned by [`ViewerSession::execute`].
#[derive(Clone, Debug)]
pub enum Outcome {
    Repositioned(Settled),
    Thresholded(ThresholdReport),
    OverlayAdded(usize),
    OverlayRemoved(OverlayLayer),
    Zoomed(BoundingBox),
    SpaceChanged(BoundingBox),
    Resolution(f64),
}

pub struct ViewerSession {
    config: ViewerConfig,
    space: DisplaySpace,
    registry: CursorRegistry,
    volumes: Arena<Volume>,
    views: Arena<VolumeView>,
    underlay: Option<VolumeId>,
    statistic: Option<StatisticMap>,
    thresholder: ClusterThresholder,
    atlas: Option<Box<dyn AtlasLookup>>,
    link: Option<RegistryLink>,
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("space", &self.space)
            .field("registry", &self.registry)
            .field("volumes", &self.volumes.len())
            .field("views", &self.views.len())
            .field("underlay", &self.underlay)
            .field("statistic", &self.statistic.is_some())
            .finish()
    }
}

impl Default for ViewerSession {
    fn default() -> Self {
        Self::new(ViewerConfig::default())
    }
}

impl ViewerSession {
    pub fn new(config: ViewerConfig) -> Self {
        Self {
            registry: CursorRegistry::with_options(config.snap_to_grid, config.max_relay_depth),
            thresholder: ClusterThresholder::new(config.connectivity),
            space: DisplaySpace::identity(),
            volumes: Arena::new(),
            views: Arena::new(),
            underlay: None,
            statistic: None,
            atlas: None,
            link: None,
            config,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn space(&self) -> &DisplaySpace {
        &self.space
    }

    pub fn registry(&self) -> &CursorRegistry {
        &self.registry
    }

    /// For registering extra listeners such as readouts.
    pub fn registry_mut(&mut self) -> &mut CursorRegistry {
        &mut self.registry
    }

    pub fn position(&self) -> Point3<f64> {
        self.registry.position()
    }

    pub fn underlay(&self) -> Option<VolumeId> {
        self.underlay
    }

    pub fn statistic(&self) -> Option<&StatisticMap> {
        self.statistic.as_ref()
    }

    /// Link to a leading session's registry when this session follows one.
    pub fn link(&self) -> Option<RegistryLink> {
        self.link
    }

    pub fn volume(&self, id: VolumeId) -> Result<&Volume> {
        self.volumes.get(id.0).ok_or(ViewerError::InvalidVolume(id))
    }

    pub fn volume_mut(&mut self, id: VolumeId) -> Result<&mut Volume> {
        self.volumes
            .get_mut(id.0)
            .ok_or(ViewerError::InvalidVolume(id))
    }

    pub fn volumes(&self) -> impl Iterator<Item = (VolumeId, &Volume)> {
        self.volumes.iter().map(|(k, v)| (VolumeId(k), v))
    }

    pub fn view(&self, id: ViewId) -> Result<&VolumeView> {
        self.views.get(id.0).ok_or(ViewerError::InvalidView(id))
    }

    pub fn view_mut(&mut self, id: ViewId) -> Result<&mut VolumeView> {
        self.views.get_mut(id.0).ok_or(ViewerError::InvalidView(id))
    }

    pub fn views(&self) -> impl Iterator<Item = (ViewId, &VolumeView)> {
        self.views.iter().map(|(k, v)| (ViewId(k), v))
    }

    pub fn set_atlas(&mut self, atlas: Box<dyn AtlasLookup>) {
        self.atlas = Some(atlas);
    }

    /// Load a volume into the shared display space. The first volume becomes
    /// the underlay.
    pub fn add_volume(&mut self, volume: Volume) -> Result<VolumeId> {
        info!("adding volume '{}' {:?}", volume.name(), volume.dims());
        let id = VolumeId(self.volumes.insert(volume));
        self.refit_space()?;
        if self.underlay.is_none() {
            self.set_underlay(id)?;
        } else {
            self.relayout_all();
            self.redraw_all();
        }
        Ok(id)
    }

    /// Make `id` the snap target and the volume overlays are drawn on.
    pub fn set_underlay(&mut self, id: VolumeId) -> Result<()> {
        let volume = self.volume(id)?;
        let grid = volume.premul() * volume.affine();
        let dims = volume.dims();
        let initial = if self.registry.is_initialised() {
            self.registry.position()
        } else {
            let centre = dims.map(|d| d.saturating_sub(1) as f64 / 2.0);
            apply(&grid, &Point3::new(centre[0], centre[1], centre[2]))
        };

        let previous = self.underlay.replace(id);
        if let Some(prev) = previous.filter(|&p| p != id) {
            if let Some(old) = self.volumes.get_mut(prev.0) {
                old.replace_threshold_blobs(Vec::new());
            }
        }

        self.registry.uninit();
        let settled = self.registry.init(grid, dims, initial)?;
        debug!("cursor reset to {:?} on new underlay", settled.position);
        self.apply_threshold_layers();
        self.relayout_all();
        self.redraw_all();
        Ok(())
    }

    /// Unload a volume. Views bound to it are disposed.
    pub fn remove_volume(&mut self, id: VolumeId) -> Result<Volume> {
        let volume = self
            .volumes
            .remove(id.0)
            .ok_or(ViewerError::InvalidVolume(id))?;
        let bound: Vec<Key> = self
            .views
            .iter()
            .filter(|(_, view)| view.volume() == id)
            .map(|(k, _)| k)
            .collect();
        for key in bound {
            if let Some(mut view) = self.views.remove(key) {
                view.dispose();
            }
        }

        self.refit_space()?;
        if self.underlay == Some(id) {
            self.underlay = None;
            self.registry.uninit();
            let next = self.volumes.keys().first().copied().map(VolumeId);
            if let Some(next) = next {
                self.set_underlay(next)?;
            }
        }
        self.relayout_all();
        self.redraw_all();
        info!("removed volume '{}'", volume.name());
        Ok(volume)
    }

    /// Bind a new view of `volume` into `area` pixels.
    pub fn bind_view(&mut self, volume: VolumeId, area: [f32; 2]) -> Result<ViewId> {
        let vol = self
            .volumes
            .get(volume.0)
            .ok_or(ViewerError::InvalidVolume(volume))?;
        let mut view = VolumeView::new(volume, &self.config);
        view.bind(vol, area, &self.space)?;
        if let Some((zoom, _)) = self.current_zoom() {
            view.follow_zoom(zoom);
        }
        if let Err(e) = view.redraw(vol, &self.space, &self.registry.position()) {
            warn!("initial redraw failed: {e}");
        }
        Ok(ViewId(self.views.insert(view)))
    }

    pub fn unbind_view(&mut self, id: ViewId) -> Result<()> {
        let mut view = self.views.remove(id.0).ok_or(ViewerError::InvalidView(id))?;
        view.dispose();
        Ok(())
    }

    /// Refit one view into a new available size and redraw it.
    pub fn relayout(&mut self, id: ViewId, available: [f32; 2]) -> Result<()> {
        let view = self.views.get_mut(id.0).ok_or(ViewerError::InvalidView(id))?;
        let volume = self
            .volumes
            .get(view.volume().0)
            .ok_or(ViewerError::InvalidVolume(view.volume()))?;
        view.recompute_layout(available, &self.space, volume.blobs().len())?;
        view.redraw(volume, &self.space, &self.registry.position())
    }

    /// Move the cursor to `p` (snapped) and redraw every view.
    pub fn reposition(&mut self, p: Point3<f64>) -> Result<Settled> {
        let settled = self.registry.set_coords(p, None)?;
        if settled.discrepancy > 0.0 {
            debug!("reposition snapped by {:.3} mm", settled.discrepancy);
        }
        self.redraw_all();
        Ok(settled)
    }

    /// Move the cursor on behalf of a registered listener; `p` is not snapped
    /// and the listener is not notified.
    pub fn reposition_from(&mut self, listener: ListenerId, p: Point3<f64>) -> Result<Settled> {
        let settled = self.registry.set_coords(p, Some(listener))?;
        self.redraw_all();
        Ok(settled)
    }

    /// Replace the statistic volume. Clears any previous threshold overlay.
    pub fn load_statistic(&mut self, volume: Volume, degrees_of_freedom: Option<f64>) {
        info!(
            "statistic '{}' loaded (df {:?})",
            volume.name(),
            degrees_of_freedom
        );
        self.statistic = Some(StatisticMap {
            volume,
            degrees_of_freedom,
            labeling: None,
            direction: Direction::default(),
        });
        self.apply_threshold_layers();
        self.relayout_all();
        self.redraw_all();
    }

    /// Threshold the statistic at `threshold` with minimum cluster size
    /// `extent`, and show the selected tails on the underlay.
    pub fn set_threshold(&mut self, threshold: f32, extent: usize, direction: Direction) -> Result<ThresholdReport> {
        let stat = self.statistic.as_mut().ok_or(ViewerError::NoStatistic)?;
        let labeling = self.thresholder.run(stat.volume.data(), threshold, extent);

        let clusters: Vec<ClusterSummary> = labeling
            .clusters()
            .iter()
            .filter(|c| direction.includes(c.sign))
            .cloned()
            .collect();
        let positive = clusters.iter().filter(|c| c.sign == Sign::Positive).count();
        let negative = clusters.len() - positive;
        let status = if clusters.is_empty() {
            ThresholdStatus::NoSurvivors
        } else {
            ThresholdStatus::Survivors { positive, negative }
        };
        match status {
            ThresholdStatus::NoSurvivors => {
                info!("nothing survives u={threshold} k={extent} ({direction:?})")
            }
            ThresholdStatus::Survivors { positive, negative } => {
                info!("u={threshold} k={extent}: {positive} positive, {negative} negative clusters")
            }
        }

        stat.labeling = Some(labeling);
        stat.direction = direction;
        if self.underlay.is_none() {
            warn!("no underlay; threshold overlay not shown");
        }
        self.apply_threshold_layers();
        self.relayout_all();
        self.redraw_all();

        Ok(ThresholdReport {
            threshold,
            extent,
            direction,
            status,
            clusters,
        })
    }

    /// Rebuild the underlay's threshold layers from the current labeling.
    fn apply_threshold_layers(&mut self) {
        let positive = self.config.positive_colormap.build(COLORMAP_ENTRIES);
        let negative = self.config.negative_colormap.build(COLORMAP_ENTRIES).reversed();
        let Some(underlay) = self.underlay.and_then(|id| self.volumes.get_mut(id.0)) else {
            return;
        };
        let layers: Vec<OverlayLayer> = match &self.statistic {
            Some(StatisticMap {
                volume,
                labeling: Some(labeling),
                direction,
                ..
            }) => [Sign::Positive, Sign::Negative]
                .into_iter()
                .filter(|&sign| direction.includes(sign))
                .filter_map(|sign| {
                    let colormap = match sign {
                        Sign::Negative => negative.clone(),
                        _ => positive.clone(),
                    };
                    OverlayLayer::from_labeling(
                        volume.data(),
                        *volume.affine(),
                        labeling,
                        sign,
                        colormap,
                    )
                })
                .collect(),
            _ => Vec::new(),
        };
        underlay.replace_threshold_blobs(layers);
    }

    /// Add a layer to the underlay. Returns its index.
    pub fn add_overlay(&mut self, layer: OverlayLayer) -> Result<usize> {
        let id = self.underlay.ok_or(ViewerError::NoUnderlay)?;
        let volume = self.volume_mut(id)?;
        debug!("overlay '{}' added to '{}'", layer.name(), volume.name());
        volume.add_blob(layer);
        let index = volume.blobs().len() - 1;
        self.relayout_all();
        self.redraw_all();
        Ok(index)
    }

    pub fn remove_overlay(&mut self, index: usize) -> Result<OverlayLayer> {
        let id = self.underlay.ok_or(ViewerError::NoUnderlay)?;
        let layer = self.volume_mut(id)?.remove_blob(index)?;
        self.relayout_all();
        self.redraw_all();
        Ok(layer)
    }

    /// Zoom through `view`; the other views follow the shared bounding box.
    pub fn set_zoom(&mut self, view: ViewId, zoom: Zoom) -> Result<BoundingBox> {
        let v = self.views.get_mut(view.0).ok_or(ViewerError::InvalidView(view))?;
        let bound = self
            .volumes
            .get(v.volume().0)
            .ok_or(ViewerError::InvalidVolume(v.volume()))?;
        let all = self.volumes.iter().map(|(_, vol)| vol);
        let bb = v.set_zoom(zoom, &mut self.space, all, bound, &self.registry.position())?;
        for (_, other) in self.views.iter_mut() {
            other.follow_zoom(zoom);
        }
        self.relayout_all();
        self.redraw_all();
        Ok(bb)
    }

    /// Rebase the display space onto `target`, or reset it to world space.
    pub fn set_space(&mut self, target: Option<VolumeId>) -> Result<BoundingBox> {
        match target {
            Some(id) => {
                let volume = self
                    .volumes
                    .get(id.0)
                    .ok_or(ViewerError::InvalidVolume(id))?;
                self.space.set_space(volume)?;
            }
            None => self.space.reset(self.volumes.iter().map(|(_, v)| v))?,
        }
        self.refit_space()?;
        self.relayout_all();
        self.redraw_all();
        Ok(self.space.bounding_box())
    }

    /// Change the target display resolution. Returns the voxel size used.
    pub fn set_resolution(&mut self, mm: f64) -> Result<f64> {
        self.config.resolution_mm = mm;
        let res = self.refit_space()?;
        self.relayout_all();
        self.redraw_all();
        Ok(res)
    }

    /// Zoom shared by the live views, with the volume of the view that set it.
    fn current_zoom(&self) -> Option<(Zoom, VolumeId)> {
        self.views
            .iter()
            .map(|(_, v)| v)
            .find(|v| v.state() != ViewState::Disposed && v.zoom() != Zoom::Full)
            .map(|v| (v.zoom(), v.volume()))
    }

    /// Recompute resolution and bounding box after the volume set or space
    /// changed, keeping the current zoom.
    fn refit_space(&mut self) -> Result<f64> {
        let volumes = || self.volumes.iter().map(|(_, v)| v);
        let res = self.space.resolution(self.config.resolution_mm, volumes());
        let full = self.space.max_bounding_box(volumes())?;
        let zoomed = self
            .current_zoom()
            .and_then(|(zoom, id)| Some((zoom, self.volumes.get(id.0)?)));
        let bb = match zoomed {
            Some((zoom, bound)) => {
                debug!("re-applying {zoom:?} after refit");
                zoom_box(zoom, &self.space, full, bound, &self.registry.position())?
            }
            None => full,
        };
        self.space.set_bounding_box(bb);
        Ok(res)
    }

    fn relayout_all(&mut self) {
        for (key, view) in self.views.iter_mut() {
            let Some(volume) = self.volumes.get(view.volume().0) else {
                warn!("view {key:?} is bound to an unloaded volume");
                continue;
            };
            if let Err(e) = view.recompute_layout(view.available(), &self.space, volume.blobs().len()) {
                warn!("layout of view {key:?} failed: {e}");
            }
        }
    }

    /// Redraw every view at the current cursor. Failures are logged per view.
    pub fn redraw_all(&mut self) {
        let cursor = self.registry.position();
        for (key, view) in self.views.iter_mut() {
            let Some(volume) = self.volumes.get(view.volume().0) else {
                warn!("view {key:?} is bound to an unloaded volume");
                continue;
            };
            if let Err(e) = view.redraw(volume, &self.space, &cursor) {
                warn!("redraw of view {key:?} failed: {e}");
            }
        }
    }

    /// World position under a panel point of `view`.
    pub fn world_at(&self, view: ViewId, plane: Plane, panel_pos: [f32; 2]) -> Result<Option<Point3<f64>>> {
        Ok(self.view(view)?.world_at(plane, panel_pos, &self.space))
    }

    /// Position, statistic value, cluster and atlas region under the cursor.
    pub fn describe_cursor(&self) -> CursorReport {
        let position = self.registry.position();
        let source = self
            .statistic
            .as_ref()
            .map(|s| &s.volume)
            .or_else(|| self.underlay.and_then(|id| self.volumes.get(id.0)));

        let voxel = source
            .and_then(|v| v.grid().ok())
            .map(|grid| grid.snap(&position).voxel);
        let value = match (source, voxel) {
            (Some(v), Some(vox)) => v.value_at(vox),
            _ => None,
        };
        let cluster = match (&self.statistic, voxel) {
            (Some(stat), Some(vox)) if vox.iter().all(|&i| i >= 0) => stat
                .labeling
                .as_ref()
                .and_then(|l| l.cluster_at(vox.map(|i| i as usize)))
                .cloned(),
            _ => None,
        };
        let region = self
            .atlas
            .as_ref()
            .and_then(|a| a.region_at(&position))
            .map(str::to_string);

        CursorReport {
            position,
            text: format_mm(&position),
            voxel,
            value,
            cluster,
            region,
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<Outcome> {
        debug!("execute {command:?}");
        match command {
            Command::Reposition(p) => self.reposition(p).map(Outcome::Repositioned),
            Command::SetThreshold {
                threshold,
                extent,
                direction,
            } => self
                .set_threshold(threshold, extent, direction)
                .map(Outcome::Thresholded),
            Command::AddOverlay(layer) => self.add_overlay(layer).map(Outcome::OverlayAdded),
            Command::RemoveOverlay(index) => self.remove_overlay(index).map(Outcome::OverlayRemoved),
            Command::SetZoom { view, zoom } => self.set_zoom(view, zoom).map(Outcome::Zoomed),
            Command::SetSpace(target) => self.set_space(target).map(Outcome::SpaceChanged),
            Command::SetResolution(mm) => self.set_resolution(mm).map(Outcome::Resolution),
        }
    }
}

/// A session following another session's cursor.
impl CursorListener for ViewerSession {
    fn update_cursor(&mut self, update: &CursorUpdate) -> ListenerResult {
        match self.registry.set_coords(update.position, None) {
            Ok(_) => {
                self.redraw_all();
                Ok(None)
            }
            Err(e) => Err(ListenerError::new(e.to_string())),
        }
    }

    fn attach(&mut self, link: RegistryLink) {
        self.link = Some(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readout::CoordinateReadout;
    use nalgebra::Matrix4;
    use ndarray::Array3;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn anatomy(dims: (usize, usize, usize)) -> Volume {
        let data = Array3::from_shape_fn(dims, |(x, y, z)| (x + y + z) as f32);
        Volume::with_voxel_size("T1", data, [1.0; 3], [0.0; 3]).unwrap()
    }

    #[test]
    fn test_first_volume_becomes_underlay() {
        let mut s = ViewerSession::default();
        let id = s.add_volume(anatomy((9, 9, 9))).unwrap();
        assert_eq!(s.underlay(), Some(id));
        assert!(s.registry().is_initialised());
        assert_eq!(s.position(), Point3::new(4.0, 4.0, 4.0));
    }

    #[test]
    fn test_stale_handles_are_errors() {
        let mut s = ViewerSession::default();
        let id = s.add_volume(anatomy((4, 4, 4))).unwrap();
        let view = s.bind_view(id, [300.0, 200.0]).unwrap();
        s.remove_volume(id).unwrap();
        assert!(matches!(s.volume(id), Err(ViewerError::InvalidVolume(_))));
        assert!(matches!(s.view(view), Err(ViewerError::InvalidView(_))));
        assert!(s.underlay().is_none());
        assert!(!s.registry().is_initialised());
        // A new volume in the same slot does not revive the old handle.
        let again = s.add_volume(anatomy((4, 4, 4))).unwrap();
        assert_ne!(again, id);
        assert!(s.volume(id).is_err());
    }

    #[test]
    fn test_threshold_without_statistic() {
        let mut s = ViewerSession::default();
        assert!(matches!(
            s.set_threshold(3.0, 5, Direction::Both),
            Err(ViewerError::NoStatistic)
        ));
        assert!(matches!(
            s.execute(Command::RemoveOverlay(0)),
            Err(ViewerError::NoUnderlay)
        ));
    }

    #[test]
    fn test_threshold_direction_selects_layers() {
        let mut s = ViewerSession::default();
        let id = s.add_volume(anatomy((8, 8, 8))).unwrap();
        let mut stat = Array3::<f32>::zeros((8, 8, 8));
        stat[[1, 1, 1]] = 4.0;
        stat[[6, 6, 6]] = -4.0;
        s.load_statistic(
            Volume::with_voxel_size("spmT", stat, [1.0; 3], [0.0; 3]).unwrap(),
            Some(20.0),
        );

        let report = s.set_threshold(3.0, 1, Direction::Negative).unwrap();
        assert_eq!(
            report.status,
            ThresholdStatus::Survivors {
                positive: 0,
                negative: 1
            }
        );
        assert_eq!(s.volume(id).unwrap().blobs().len(), 1);

        s.set_threshold(3.0, 1, Direction::Both).unwrap();
        let maps: Vec<_> = s
            .volume(id)
            .unwrap()
            .blobs()
            .iter()
            .map(|b| b.colormap().name().to_string())
            .collect();
        assert_eq!(maps, vec!["hot", "winter-reversed"]);

        // User layers survive re-thresholding.
        s.add_overlay(OverlayLayer::new("mask", Array3::zeros((8, 8, 8)), Matrix4::identity()))
            .unwrap();
        s.set_threshold(5.0, 1, Direction::Both).unwrap();
        let names: Vec<_> = s
            .volume(id)
            .unwrap()
            .blobs()
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, vec!["mask"]);
    }

    #[test]
    fn test_describe_cursor() {
        let mut s = ViewerSession::default();
        s.add_volume(anatomy((8, 8, 8))).unwrap();
        let mut stat = Array3::<f32>::zeros((8, 8, 8));
        stat[[2, 3, 4]] = 6.5;
        s.load_statistic(
            Volume::with_voxel_size("spmT", stat, [1.0; 3], [0.0; 3]).unwrap(),
            None,
        );
        s.set_threshold(3.0, 1, Direction::Positive).unwrap();
        s.reposition(Point3::new(2.2, 2.9, 4.0)).unwrap();
        let r = s.describe_cursor();
        assert_eq!(r.voxel, Some([2, 3, 4]));
        assert_eq!(r.value, Some(6.5));
        assert_eq!(r.cluster.map(|c| c.size), Some(1));
        assert_eq!(r.text, "2.0 3.0 4.0 mm");
        assert!(r.region.is_none());
    }

    #[test]
    fn test_views_follow_space_changes() {
        let mut s = ViewerSession::default();
        let id = s.add_volume(anatomy((11, 11, 11))).unwrap();
        let view = s.bind_view(id, [400.0, 300.0]).unwrap();
        assert_eq!(s.view(view).unwrap().state(), ViewState::Rendering);
        assert_eq!(
            s.view(view).unwrap().surface(Plane::Transverse).size(),
            [11, 11]
        );

        let res = s.set_resolution(2.0).unwrap();
        assert_eq!(res, 2.0);
        assert_eq!(
            s.view(view).unwrap().surface(Plane::Transverse).size(),
            [6, 6]
        );

        match s
            .execute(Command::SetZoom {
                view,
                zoom: Zoom::Extent(2.0),
            })
            .unwrap()
        {
            Outcome::Zoomed(bb) => assert!(!bb.is_empty()),
            other => panic!("unexpected outcome {other:?}"),
        }
        s.unbind_view(view).unwrap();
        assert!(s.view(view).is_err());
    }

    #[test]
    fn test_zoom_survives_adding_a_volume() {
        let mut s = ViewerSession::default();
        let id = s.add_volume(anatomy((11, 11, 11))).unwrap();
        let view = s.bind_view(id, [400.0, 300.0]).unwrap();
        s.set_zoom(view, Zoom::Extent(2.0)).unwrap();
        assert_eq!(s.space().bounding_box().dims(), [5, 5, 5]);

        let other = s.add_volume(anatomy((20, 20, 20))).unwrap();
        assert_eq!(s.view(view).unwrap().zoom(), Zoom::Extent(2.0));
        assert_eq!(s.space().bounding_box().dims(), [5, 5, 5]);
        assert_eq!(
            s.view(view).unwrap().surface(Plane::Transverse).size(),
            [5, 5]
        );

        // A view bound while zoomed reports the shared zoom.
        let second = s.bind_view(other, [400.0, 300.0]).unwrap();
        assert_eq!(s.view(second).unwrap().zoom(), Zoom::Extent(2.0));

        s.set_zoom(second, Zoom::Full).unwrap();
        assert_eq!(s.view(view).unwrap().zoom(), Zoom::Full);
        assert_eq!(s.space().bounding_box().dims(), [20, 20, 20]);
    }

    #[test]
    fn test_set_space_rebases_and_resets() {
        let mut s = ViewerSession::default();
        let data = Array3::from_elem((6, 5, 4), 1.0);
        let id = s
            .add_volume(Volume::with_voxel_size("epi", data, [2.0; 3], [10.0, 20.0, 30.0]).unwrap())
            .unwrap();
        let first = Point3::new(10.0, 20.0, 30.0);
        let last = Point3::new(20.0, 28.0, 36.0);
        let close = |a: Point3<f64>, b: Point3<f64>| (a - b).norm() < 1e-9;

        let bb = match s.execute(Command::SetSpace(Some(id))).unwrap() {
            Outcome::SpaceChanged(bb) => bb,
            other => panic!("unexpected outcome {other:?}"),
        };
        let to_world = *s.space().to_world();
        assert_eq!((to_world[(0, 3)], to_world[(1, 3)], to_world[(2, 3)]), (10.0, 20.0, 30.0));
        assert!(close(s.space().display_to_world(&bb.min), first));
        assert!(close(s.space().display_to_world(&bb.max), last));
        assert_eq!(bb.dims(), [6, 5, 4]);

        s.set_space(None).unwrap();
        let bb = s.space().bounding_box();
        let to_world = *s.space().to_world();
        assert_eq!((to_world[(0, 3)], to_world[(1, 3)], to_world[(2, 3)]), (0.0, 0.0, 0.0));
        assert!(close(s.space().display_to_world(&bb.min), first));
        assert!(close(s.space().display_to_world(&bb.max), last));

        s.remove_volume(id).unwrap();
        assert!(matches!(
            s.set_space(Some(id)),
            Err(ViewerError::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_remove_overlay_returns_layer() {
        let mut s = ViewerSession::default();
        let id = s.add_volume(anatomy((4, 4, 4))).unwrap();
        let blank = || Array3::<f32>::zeros((4, 4, 4));
        s.add_overlay(OverlayLayer::new("a", blank(), Matrix4::identity()))
            .unwrap();
        let index = s
            .add_overlay(OverlayLayer::new("b", blank(), Matrix4::identity()))
            .unwrap();
        assert_eq!(index, 1);

        match s.execute(Command::RemoveOverlay(0)).unwrap() {
            Outcome::OverlayRemoved(layer) => assert_eq!(layer.name(), "a"),
            other => panic!("unexpected outcome {other:?}"),
        }
        let names: Vec<_> = s
            .volume(id)
            .unwrap()
            .blobs()
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names, vec!["b"]);
        assert!(matches!(
            s.remove_overlay(3),
            Err(ViewerError::OverlayIndex { index: 3, len: 1 })
        ));
    }

    #[test]
    fn test_reposition_from_listener_is_not_snapped() {
        let mut s = ViewerSession::default();
        s.add_volume(anatomy((8, 8, 8))).unwrap();
        let readout = Rc::new(RefCell::new(CoordinateReadout::new()));
        let listener = s.registry_mut().cross_register(&readout);
        assert_eq!(readout.borrow().position(), Some(s.position()));

        let p = Point3::new(2.3, 1.7, 0.4);
        let settled = s.reposition_from(listener, p).unwrap();
        assert_eq!(settled.position, p);
        assert_eq!(settled.discrepancy, 0.0);
        assert_eq!(s.position(), p);
        // The caller is not told about its own move.
        assert_ne!(readout.borrow().position(), Some(p));

        let snapped = s.reposition(p).unwrap();
        assert_eq!(snapped.position, Point3::new(2.0, 2.0, 0.0));
        assert_eq!(readout.borrow().position(), Some(snapped.position));
    }

    #[test]
    fn test_linked_sessions_follow_leader() {
        let mut leader = ViewerSession::default();
        leader.add_volume(anatomy((10, 10, 10))).unwrap();
        let follower = Rc::new(RefCell::new(ViewerSession::default()));
        follower
            .borrow_mut()
            .add_volume(anatomy((10, 10, 10)))
            .unwrap();

        leader.registry_mut().cross_register(&follower);
        assert_eq!(
            follower.borrow().link().map(|l| l.registry),
            Some(leader.registry().id())
        );
        leader.reposition(Point3::new(7.0, 1.0, 2.0)).unwrap();
        assert_eq!(follower.borrow().position(), Point3::new(7.0, 1.0, 2.0));
    }
}
