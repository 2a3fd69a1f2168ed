mod common;

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::{Matrix4, Point3};
use ndarray::{Array2, Array3};
use nifti_ortho_viewer::compositor::{GrayScale, LayerSlice};
use nifti_ortho_viewer::{
    Command, CursorRegistry, Direction, DisplaySpace, OverlayCompositor, OverlayLayer, Outcome,
    Plane, Sign, ThresholdStatus, ViewerConfig, ViewerSession,
};

use common::{anatomy, block_statistic};

#[test]
fn block_survives_as_one_positive_cluster() {
    let mut session = ViewerSession::new(ViewerConfig::default());
    session
        .add_volume(anatomy((10, 10, 10), [2.0; 3]))
        .unwrap();
    session.load_statistic(block_statistic(5.0), Some(20.0));

    let outcome = session
        .execute(Command::SetThreshold {
            threshold: 2.0,
            extent: 5,
            direction: Direction::Both,
        })
        .unwrap();
    let Outcome::Thresholded(report) = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert_eq!(
        report.status,
        ThresholdStatus::Survivors {
            positive: 1,
            negative: 0
        }
    );
    assert_eq!(report.clusters.len(), 1);
    let cluster = &report.clusters[0];
    assert_eq!(cluster.sign, Sign::Positive);
    assert_eq!(cluster.size, 27);
    assert_eq!(cluster.centroid, [5.0, 5.0, 5.0]);

    let labeling = session.statistic().unwrap().labeling().unwrap();
    assert_eq!(labeling.size(Sign::Positive)[[5, 5, 5]], 27);
    assert_eq!(labeling.size(Sign::Negative).iter().filter(|&&s| s > 0).count(), 0);

    // Voxel (5,5,5) sits at the world origin.
    let target = block_statistic(5.0).voxel_to_world(&Point3::new(5.0, 5.0, 5.0));
    let Outcome::Repositioned(settled) = session.execute(Command::Reposition(target)).unwrap()
    else {
        panic!("expected a reposition");
    };
    assert_eq!(settled.position, target);
    assert_eq!(settled.discrepancy, 0.0);
    assert_eq!(session.position(), target);

    let cursor = session.describe_cursor();
    assert_eq!(cursor.voxel, Some([5, 5, 5]));
    assert_eq!(cursor.cluster.map(|c| c.size), Some(27));
}

#[test]
fn threshold_above_block_reports_no_survivors() {
    let mut session = ViewerSession::default();
    session
        .add_volume(anatomy((10, 10, 10), [2.0; 3]))
        .unwrap();
    session.load_statistic(block_statistic(5.0), None);

    let report = session.set_threshold(10.0, 0, Direction::Both).unwrap();
    assert_eq!(report.status, ThresholdStatus::NoSurvivors);
    assert!(report.clusters.is_empty());

    let labeling = session.statistic().unwrap().labeling().unwrap();
    for sign in [Sign::Positive, Sign::Negative, Sign::Combined] {
        assert!(labeling.size(sign).iter().all(|&s| s == 0));
        assert!(labeling.id(sign).iter().all(|&id| id == 0));
    }
    let underlay = session.underlay().unwrap();
    assert!(session.volume(underlay).unwrap().blobs().is_empty());
}

#[test]
fn panels_never_overlap() {
    let mut session = ViewerSession::default();
    let id = session
        .add_volume(anatomy((64, 64, 40), [2.0, 2.0, 3.0]))
        .unwrap();
    for area in [[900.0, 700.0], [400.0, 1200.0], [1600.0, 300.0]] {
        let view = session.bind_view(id, area).unwrap();
        let layout = *session.view(view).unwrap().layout().unwrap();
        let rects: Vec<_> = Plane::ALL.iter().map(|&p| layout.rect(p)).collect();
        for i in 0..3 {
            for j in (i + 1)..3 {
                assert_eq!(rects[i].overlap_area(&rects[j]), 0.0, "{area:?} {i} {j}");
            }
        }
        assert!((layout.transverse.width - layout.coronal.width).abs() < 1e-3);
        assert!(layout.size[0] <= area[0] + 1e-3 && layout.size[1] <= area[1] + 1e-3);
    }
}

#[test]
fn caller_is_not_notified_of_its_own_update() {
    let mut registry = CursorRegistry::new();
    registry
        .init(Matrix4::identity(), [10, 10, 10], Point3::new(0.0, 0.0, 0.0))
        .unwrap();

    let a = Rc::new(RefCell::new(0usize));
    let b = Rc::new(RefCell::new(0usize));
    let id_a = registry.add_listener(&a, |calls, _| {
        *calls += 1;
        Ok(None)
    });
    registry.add_listener(&b, |calls, _| {
        *calls += 1;
        Ok(None)
    });
    // Registration pushes the current position once.
    *a.borrow_mut() = 0;
    *b.borrow_mut() = 0;

    registry
        .set_coords(Point3::new(3.0, 4.0, 5.0), Some(id_a))
        .unwrap();
    assert_eq!(*a.borrow(), 0);
    assert_eq!(*b.borrow(), 1);
    assert_eq!(registry.position(), Point3::new(3.0, 4.0, 5.0));
}

#[test]
fn bounding_box_grows_with_volumes_and_shrinks_back() {
    let space = DisplaySpace::identity();
    let small = anatomy((8, 8, 8), [1.0; 3]);
    let large = anatomy((20, 30, 10), [2.0; 3]);

    let one = space.max_bounding_box([&small]).unwrap();
    let both = space.max_bounding_box([&small, &large]).unwrap();
    assert!(both.contains(&one, 1e-9));
    let back = space.max_bounding_box([&small]).unwrap();
    assert_eq!(back, one);
    assert!(space.max_bounding_box(std::iter::empty()).unwrap().is_empty());
}

#[test]
fn flat_overlay_range_composites_without_nan() {
    let compositor = OverlayCompositor::new(0.5);
    let base = Array2::from_shape_fn((6, 4), |(i, j)| (i * j) as f32);
    let gray = GrayScale::auto([&base]);
    let layer = OverlayLayer::new("flat", Array3::from_elem((6, 4, 1), 3.0), Matrix4::identity())
        .with_range(3.0, 3.0);
    let values = Array2::from_elem((6, 4), 3.0);
    let image = compositor.composite(&base, &gray, &[LayerSlice { layer: &layer, values }]);
    assert!(image.is_finite());
    assert_eq!((image.width(), image.height()), (4, 6));
}
