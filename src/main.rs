use anyhow::Result;
use eframe::egui;
use log::warn;
use nifti_ortho_viewer::compositor::Colorbar;
use nifti_ortho_viewer::view::PixelRect;
use nifti_ortho_viewer::{
    loader, CoordinateReadout, Direction, Plane, SliceImage, ThresholdReport, ThresholdStatus,
    ViewId, ViewerConfig, ViewerSession, Volume, Zoom,
};
use std::cell::RefCell;
use std::rc::Rc;

#[cfg(target_arch = "wasm32")]
use js_sys::Uint8Array;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::closure::Closure;
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::{JsCast, JsValue};
#[cfg(target_arch = "wasm32")]
use web_sys::{Event, FileReader, HtmlCanvasElement, HtmlInputElement};

/// Which slot a loaded file goes into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LoadTarget {
    Underlay,
    Statistic,
}

struct OrthoViewer {
    session: ViewerSession,
    view: Option<ViewId>,
    readout: Rc<RefCell<CoordinateReadout>>,
    threshold: f32,
    extent: usize,
    direction: Direction,
    report: Option<ThresholdReport>,
    brightness: f32,
    contrast: f32,
    available: [f32; 2],
    error_msg: Option<String>,
}

impl OrthoViewer {
    fn new(config: ViewerConfig) -> Self {
        let threshold = config.default_threshold;
        let extent = config.default_extent;
        let mut session = ViewerSession::new(config);
        let readout = Rc::new(RefCell::new(CoordinateReadout::new()));
        session.registry_mut().cross_register(&readout);
        Self {
            session,
            view: None,
            readout,
            threshold,
            extent,
            direction: Direction::Both,
            report: None,
            brightness: 0.0,
            contrast: 1.0,
            available: [800.0, 600.0],
            error_msg: None,
        }
    }

    fn load_from_path(&mut self, path: &str, target: LoadTarget) {
        let result = loader::load_volume(path).map_err(anyhow::Error::from).and_then(|volume| {
            let df = loader::read_header_metadata(path)
                .ok()
                .and_then(|meta| meta.degrees_of_freedom);
            self.install(volume, target, df)
        });
        self.report_load(result);
    }

    #[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
    fn load_from_bytes(&mut self, name: &str, bytes: &[u8], target: LoadTarget) {
        let result = loader::load_volume_bytes(name, bytes)
            .map_err(anyhow::Error::from)
            .and_then(|volume| self.install(volume, target, None));
        self.report_load(result);
    }

    fn report_load(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.error_msg = None,
            Err(e) => self.error_msg = Some(format!("Failed to load: {e}")),
        }
    }

    fn install(&mut self, volume: Volume, target: LoadTarget, df: Option<f64>) -> Result<()> {
        match target {
            LoadTarget::Underlay => {
                if let Some(old) = self.session.underlay() {
                    self.session.remove_volume(old)?;
                }
                let id = self.session.add_volume(volume)?;
                self.view = Some(self.session.bind_view(id, self.available)?);
                self.apply_intensity();
            }
            LoadTarget::Statistic => {
                self.session.load_statistic(volume, df);
                self.apply_threshold();
            }
        }
        Ok(())
    }

    fn apply_threshold(&mut self) {
        match self
            .session
            .set_threshold(self.threshold, self.extent, self.direction)
        {
            Ok(report) => self.report = Some(report),
            Err(e) => self.error_msg = Some(e.to_string()),
        }
    }

    fn apply_intensity(&mut self) {
        if let Some(view) = self.view {
            if let Ok(v) = self.session.view_mut(view) {
                v.set_intensity(self.brightness, self.contrast);
            }
            self.session.redraw_all();
        }
    }

    fn zoom(&mut self, zoom: Zoom) {
        if let Some(view) = self.view {
            if let Err(e) = self.session.set_zoom(view, zoom) {
                self.error_msg = Some(e.to_string());
            }
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn pick_and_load(&mut self, target: LoadTarget) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("NIfTI", &["nii", "gz"])
            .pick_file()
        {
            self.load_from_path(&path.to_string_lossy(), target);
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn save_snapshot(&mut self) {
        let Some(view) = self.view.and_then(|v| self.session.view(v).ok()) else {
            return;
        };
        let Some(dir) = rfd::FileDialog::new().pick_folder() else {
            return;
        };
        for surface in view.surfaces() {
            let Some(image) = surface.image() else {
                continue;
            };
            let path = dir.join(format!("{}.png", surface.plane().label().to_lowercase()));
            if let Err(e) = image.to_rgb_image().save(&path) {
                self.error_msg = Some(format!("Failed to save {}: {e}", path.display()));
                return;
            }
            log::info!("saved {}", path.display());
        }
    }

    #[cfg(target_arch = "wasm32")]
    fn open_web_file_dialog(&mut self, ctx: &egui::Context, target: LoadTarget) -> Result<(), JsValue> {
        let window = web_sys::window().ok_or_else(|| JsValue::from_str("window not available"))?;
        let document = window
            .document()
            .ok_or_else(|| JsValue::from_str("document not available"))?;
        let input: HtmlInputElement = document
            .create_element("input")?
            .dyn_into()
            .map_err(|_| JsValue::from_str("not an input element"))?;
        input.set_type("file");
        input.set_accept(".nii,.nii.gz");

        let input_clone = input.clone();
        let ctx_clone = ctx.clone();
        let onload = Closure::wrap(Box::new(move |event: Event| {
            let Some(reader) = event
                .target()
                .and_then(|t| t.dyn_into::<FileReader>().ok())
            else {
                return;
            };
            if let Ok(result) = reader.result() {
                let array = Uint8Array::new(&result);
                let mut bytes = vec![0u8; array.length() as usize];
                array.copy_to(&mut bytes);
                set_pending_bytes(target, bytes);
                ctx_clone.request_repaint();
            }
        }) as Box<dyn FnMut(_)>);

        let reader = FileReader::new()?;
        reader.set_onloadend(Some(onload.as_ref().unchecked_ref()));
        onload.forget();

        let reader_clone = reader.clone();
        let onchange = Closure::wrap(Box::new(move |_event: Event| {
            if let Some(file) = input_clone.files().and_then(|files| files.get(0)) {
                let _ = reader_clone.read_as_array_buffer(&file);
            }
        }) as Box<dyn FnMut(_)>);
        input.set_onchange(Some(onchange.as_ref().unchecked_ref()));
        onchange.forget();

        input.click();
        Ok(())
    }

    fn open(&mut self, ctx: &egui::Context, target: LoadTarget) {
        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = ctx;
            self.pick_and_load(target);
        }
        #[cfg(target_arch = "wasm32")]
        if let Err(e) = self.open_web_file_dialog(ctx, target) {
            warn!("file dialog failed: {e:?}");
        }
    }

    fn slice_to_color_image(image: &SliceImage) -> egui::ColorImage {
        egui::ColorImage::from_rgb([image.width(), image.height()], &image.to_rgb8())
    }

    fn menu_bar(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) {
        egui::MenuBar::new().ui(ui, |ui| {
            ui.menu_button("File", |ui| {
                if ui.button("Load underlay…").clicked() {
                    ui.close();
                    self.open(ctx, LoadTarget::Underlay);
                }
                if ui.button("Load statistic…").clicked() {
                    ui.close();
                    self.open(ctx, LoadTarget::Statistic);
                }
                #[cfg(not(target_arch = "wasm32"))]
                if ui.button("Save snapshot…").clicked() {
                    ui.close();
                    self.save_snapshot();
                }
            });
            ui.menu_button("View", |ui| {
                for (label, zoom) in [
                    ("Full volume", Zoom::Full),
                    ("±80 mm", Zoom::Extent(80.0)),
                    ("±40 mm", Zoom::Extent(40.0)),
                    ("±20 mm", Zoom::Extent(20.0)),
                    ("Non-zero box", Zoom::NonzeroBox),
                ] {
                    if ui.button(label).clicked() {
                        ui.close();
                        self.zoom(zoom);
                    }
                }
                ui.separator();
                if ui.button("World space").clicked() {
                    ui.close();
                    if let Err(e) = self.session.set_space(None) {
                        self.error_msg = Some(e.to_string());
                    }
                }
                if ui.button("Underlay space").clicked() {
                    ui.close();
                    if let Err(e) = self.session.set_space(self.session.underlay()) {
                        self.error_msg = Some(e.to_string());
                    }
                }
                ui.separator();
                for mm in [1.0, 2.0] {
                    if ui.button(format!("{mm} mm resolution")).clicked() {
                        ui.close();
                        if let Err(e) = self.session.set_resolution(mm) {
                            self.error_msg = Some(e.to_string());
                        }
                    }
                }
            });
        });
        if let Some(ref msg) = self.error_msg {
            ui.colored_label(egui::Color32::RED, msg);
        }
    }

    fn controls(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let has_stat = self.session.statistic().is_some();
            ui.add_enabled_ui(has_stat, |ui| {
                ui.label("Threshold");
                ui.add(egui::DragValue::new(&mut self.threshold).speed(0.1).range(0.0..=100.0));
                ui.label("Extent");
                ui.add(egui::DragValue::new(&mut self.extent).range(0..=100_000));
                egui::ComboBox::from_id_salt("direction")
                    .selected_text(format!("{:?}", self.direction))
                    .show_ui(ui, |ui| {
                        ui.selectable_value(&mut self.direction, Direction::Positive, "Positive");
                        ui.selectable_value(&mut self.direction, Direction::Negative, "Negative");
                        ui.selectable_value(&mut self.direction, Direction::Both, "Both");
                    });
                if ui.button("Apply").clicked() {
                    self.apply_threshold();
                }
            });
            if let Some(report) = &self.report {
                let text = match report.status {
                    ThresholdStatus::NoSurvivors => "nothing survives".to_string(),
                    ThresholdStatus::Survivors { positive, negative } => {
                        format!("{positive} positive, {negative} negative clusters")
                    }
                };
                ui.label(text);
            }
            ui.separator();
            let b = ui.add(egui::Slider::new(&mut self.brightness, -1.0..=1.0).text("Brightness"));
            let c = ui.add(egui::Slider::new(&mut self.contrast, 0.1..=4.0).text("Contrast"));
            if b.changed() || c.changed() {
                self.apply_intensity();
            }
        });

        let report = self.session.describe_cursor();
        let mut line = self.readout.borrow().text().to_string();
        if let Some(v) = report.value {
            line.push_str(&format!("   value {v:.3}"));
        }
        if let Some(cluster) = &report.cluster {
            line.push_str(&format!("   cluster {} ({} voxels)", cluster.id, cluster.size));
        }
        if let Some(region) = &report.region {
            line.push_str(&format!("   {region}"));
        }
        ui.label(line);
    }

    fn draw_colorbar(ui: &egui::Ui, origin: egui::Pos2, bar: &Colorbar, name: &str) {
        let texture = ui.ctx().load_texture(
            format!("colorbar-{}", bar.layer),
            Self::slice_to_color_image(&bar.image),
            egui::TextureOptions::LINEAR,
        );
        let rect = to_screen(origin, bar.rect);
        let uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));
        ui.painter().image(texture.id(), rect, uv, egui::Color32::WHITE);
        let font = egui::FontId::proportional(11.0);
        for tick in &bar.ticks {
            let y = rect.top() + tick.offset * rect.height();
            ui.painter().text(
                egui::pos2(rect.right() + 3.0, y),
                egui::Align2::LEFT_CENTER,
                &tick.label,
                font.clone(),
                egui::Color32::WHITE,
            );
        }
        ui.painter().text(
            egui::pos2(rect.left(), rect.bottom() + 2.0),
            egui::Align2::LEFT_TOP,
            name,
            font,
            egui::Color32::GRAY,
        );
    }
}

fn to_screen(origin: egui::Pos2, r: PixelRect) -> egui::Rect {
    egui::Rect::from_min_size(origin + egui::vec2(r.x, r.y), egui::vec2(r.width, r.height))
}

fn plane_colour(plane: Plane) -> egui::Color32 {
    match plane {
        Plane::Transverse => egui::Color32::YELLOW,
        Plane::Coronal => egui::Color32::GREEN,
        Plane::Sagittal => egui::Color32::RED,
    }
}

impl eframe::App for OrthoViewer {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        egui::TopBottomPanel::top("menu_bar").show(ctx, |ui| self.menu_bar(ctx, ui));
        egui::TopBottomPanel::top("controls").show(ctx, |ui| self.controls(ui));

        #[cfg(target_arch = "wasm32")]
        if let Some((target, bytes)) = take_pending_bytes() {
            self.load_from_bytes("upload", &bytes, target);
        }

        let frame = egui::Frame::new()
            .fill(egui::Color32::BLACK)
            .inner_margin(0.0);
        egui::CentralPanel::default().frame(frame).show(ctx, |ui| {
            let Some(view_id) = self.view else {
                ui.centered_and_justified(|ui| {
                    ui.label(
                        egui::RichText::new(
                            "No volume loaded.\nUse File > Load underlay… to open a file.",
                        )
                        .color(egui::Color32::GRAY)
                        .size(20.0),
                    );
                });
                return;
            };

            let avail = ui.available_size();
            let available = [avail.x, avail.y];
            if (available[0] - self.available[0]).abs() > 0.5
                || (available[1] - self.available[1]).abs() > 0.5
            {
                self.available = available;
                if let Err(e) = self.session.relayout(view_id, available) {
                    warn!("relayout failed: {e}");
                }
            }

            let (area, response) = ui.allocate_exact_size(avail, egui::Sense::click_and_drag());
            let origin = area.min;

            if response.clicked() || response.dragged() {
                if let Some(pos) = response.interact_pointer_pos() {
                    let local = pos - origin;
                    let hit = self.session.view(view_id).ok().and_then(|view| {
                        let layout = view.layout()?;
                        let plane = layout.hit(local.x, local.y)?;
                        let r = layout.rect(plane);
                        Some((plane, [local.x - r.x, local.y - r.y]))
                    });
                    if let Some((plane, panel_pos)) = hit {
                        match self.session.world_at(view_id, plane, panel_pos) {
                            Ok(Some(world)) => {
                                if let Err(e) = self.session.reposition(world) {
                                    warn!("reposition failed: {e}");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("picking failed: {e}"),
                        }
                    }
                }
            }

            let Ok(view) = self.session.view(view_id) else {
                return;
            };
            let config = self.session.config();
            let [r, g, b] = config.crosshair_colour.map(|c| (c.clamp(0.0, 1.0) * 255.0) as u8);
            let crosshair = egui::Stroke::new(1.0, egui::Color32::from_rgb(r, g, b));
            let uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));
            let overlay_bg = egui::Color32::from_black_alpha(160);
            let label_font = egui::FontId::proportional(14.0);
            let strip_h = 22.0;

            for surface in view.surfaces() {
                let Some(image) = surface.image() else {
                    continue;
                };
                let texture = ui.ctx().load_texture(
                    surface.plane().label(),
                    Self::slice_to_color_image(image),
                    egui::TextureOptions::NEAREST,
                );
                let rect = to_screen(origin, surface.rect());
                ui.painter().image(texture.id(), rect, uv, egui::Color32::WHITE);

                if config.show_crosshairs {
                    let ch = surface.crosshair_in_panel();
                    for seg in [ch.horizontal, ch.vertical] {
                        ui.painter().line_segment(
                            [
                                rect.min + egui::vec2(seg.start[0], seg.start[1]),
                                rect.min + egui::vec2(seg.end[0], seg.end[1]),
                            ],
                            crosshair,
                        );
                    }
                }

                let label_strip =
                    egui::Rect::from_min_size(rect.min, egui::vec2(rect.width(), strip_h));
                ui.painter().rect_filled(label_strip, 0.0, overlay_bg);
                ui.painter().text(
                    label_strip.left_center() + egui::vec2(6.0, 0.0),
                    egui::Align2::LEFT_CENTER,
                    surface.plane().label(),
                    label_font.clone(),
                    plane_colour(surface.plane()),
                );
            }

            let names: Vec<String> = self
                .session
                .volume(view.volume())
                .map(|v| v.blobs().iter().map(|b| b.name().to_string()).collect())
                .unwrap_or_default();
            for bar in view.colorbars() {
                let name = names.get(bar.layer).map(String::as_str).unwrap_or("");
                Self::draw_colorbar(ui, origin, bar, name);
            }
        });
    }
}

#[cfg(target_arch = "wasm32")]
thread_local! {
    static PENDING_BYTES: RefCell<Option<(LoadTarget, Vec<u8>)>> = const { RefCell::new(None) };
}

#[cfg(target_arch = "wasm32")]
fn set_pending_bytes(target: LoadTarget, bytes: Vec<u8>) {
    PENDING_BYTES.with(|cell| {
        *cell.borrow_mut() = Some((target, bytes));
    });
}

#[cfg(target_arch = "wasm32")]
fn take_pending_bytes() -> Option<(LoadTarget, Vec<u8>)> {
    PENDING_BYTES.with(|cell| cell.borrow_mut().take())
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()?;

    // Usage: nifti_ortho_viewer [config.json] [underlay.nii] [statistic.nii]
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ViewerConfig::from_json_file(&path).unwrap_or_else(|e| {
            warn!("could not read config '{path}': {e}; using defaults");
            ViewerConfig::default()
        }),
        None => ViewerConfig::default(),
    };
    let mut app = OrthoViewer::new(config);
    if let Some(path) = args.next() {
        app.load_from_path(&path, LoadTarget::Underlay);
    }
    if let Some(path) = args.next() {
        app.load_from_path(&path, LoadTarget::Statistic);
    }

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([1000.0, 800.0]),
        ..Default::default()
    };
    eframe::run_native(
        "NIfTI Orthogonal Viewer",
        native_options,
        Box::new(|_cc| Ok(Box::new(app))),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))
}

#[cfg(target_arch = "wasm32")]
fn main() {
    console_error_panic_hook::set_once();
    wasm_logger::init(wasm_logger::Config::default());
    let app = OrthoViewer::new(ViewerConfig::default());
    let web_options = eframe::WebOptions::default();
    let Some(canvas) = web_sys::window()
        .and_then(|w| w.document())
        .and_then(|d| d.get_element_by_id("canvas_render"))
        .and_then(|e| e.dyn_into::<HtmlCanvasElement>().ok())
    else {
        log::error!("canvas 'canvas_render' not found");
        return;
    };
    wasm_bindgen_futures::spawn_local(async move {
        if let Err(e) = eframe::WebRunner::new()
            .start(canvas, web_options, Box::new(|_cc| Ok(Box::new(app))))
            .await
        {
            log::error!("failed to start eframe web app: {e:?}");
        }
    });
}
