use nalgebra::Point3;

use crate::registry::{CursorListener, CursorUpdate, ListenerResult, RegistryLink};

/// Text readout that follows the cursor.
#[derive(Clone, Debug, Default)]
pub struct CoordinateReadout {
    position: Option<Point3<f64>>,
    text: String,
    link: Option<RegistryLink>,
}

impl CoordinateReadout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Option<Point3<f64>> {
        self.position
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn link(&self) -> Option<RegistryLink> {
        self.link
    }
}

/// `"x y z mm"` to one decimal place.
pub fn format_mm(p: &Point3<f64>) -> String {
    // Round first so values that round to zero lose their sign; -0.0 + 0.0 is 0.0.
    let tenth = |v: f64| (v * 10.0).round() / 10.0 + 0.0;
    format!("{:.1} {:.1} {:.1} mm", tenth(p.x), tenth(p.y), tenth(p.z))
}

impl CursorListener for CoordinateReadout {
    fn update_cursor(&mut self, update: &CursorUpdate) -> ListenerResult {
        self.position = Some(update.position);
        self.text = format_mm(&update.position);
        Ok(None)
    }

    fn attach(&mut self, link: RegistryLink) {
        self.link = Some(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CursorRegistry;
    use nalgebra::Matrix4;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_format_mm() {
        assert_eq!(format_mm(&Point3::new(-12.04, 4.46, 30.0)), "-12.0 4.5 30.0 mm");
        assert_eq!(format_mm(&Point3::new(-0.0, 0.0, 0.0)), "0.0 0.0 0.0 mm");
        assert_eq!(format_mm(&Point3::new(-0.04, -0.049, 0.04)), "0.0 0.0 0.0 mm");
        assert_eq!(format_mm(&Point3::new(-0.06, 0.0, 0.0)), "-0.1 0.0 0.0 mm");
    }

    #[test]
    fn test_readout_follows_registry() {
        let mut reg = CursorRegistry::new();
        reg.init(Matrix4::identity(), [8, 8, 8], Point3::new(1.0, 2.0, 3.0))
            .unwrap();
        let readout = Rc::new(RefCell::new(CoordinateReadout::new()));
        reg.cross_register(&readout);
        assert_eq!(readout.borrow().text(), "1.0 2.0 3.0 mm");
        assert_eq!(readout.borrow().link().map(|l| l.registry), Some(reg.id()));

        reg.set_coords(Point3::new(4.2, 0.0, 7.0), None).unwrap();
        assert_eq!(readout.borrow().text(), "4.0 0.0 7.0 mm");
    }
}
