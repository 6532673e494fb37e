use anyhow::Context;
use derm_core::{
    classify_image, describe, Decision, OnnxClassifier, PipelineConfig, Prediction,
};
use eframe::{egui, App, Frame, NativeOptions};
use image::DynamicImage;
use rfd::FileDialog;
use std::path::{Path, PathBuf};

const PREVIEW_SIZE: u32 = 360;
const DISCLAIMER: &str =
    "This result is not a medical diagnosis. Consult a dermatologist for any skin concern.";

fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = run() {
        eprintln!("Cannot start DermScan: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cfg = load_config().context("invalid configuration")?;
    // Model load failure is fatal: without a classifier there is nothing to serve.
    let classifier =
        OnnxClassifier::new(&cfg.model_path).context("could not load the classifier model")?;

    let options = NativeOptions::default();
    eframe::run_native(
        "DermScan",
        options,
        Box::new(move |_cc| {
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(Box::new(UiApp::new(
                cfg, classifier,
            )))
        }),
    )
    .map_err(|e| anyhow::anyhow!("application stopped: {e}"))
}

/// First CLI argument, when present, is a TOML settings file.
fn load_config() -> derm_core::Result<PipelineConfig> {
    match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_file(path),
        None => Ok(PipelineConfig::default()),
    }
}

struct UiApp {
    cfg: PipelineConfig,
    classifier: OnnxClassifier,
    chosen: Option<PathBuf>,
    image: Option<DynamicImage>,
    preview: Option<egui::TextureHandle>,
    prediction: Option<Prediction>,
    pending_threshold: f32,
    status: String,
}

impl UiApp {
    fn new(cfg: PipelineConfig, classifier: OnnxClassifier) -> Self {
        let pending_threshold = cfg.confidence_threshold;
        Self {
            cfg,
            classifier,
            chosen: None,
            image: None,
            preview: None,
            prediction: None,
            pending_threshold,
            status: String::new(),
        }
    }

    fn open_image(&mut self, ctx: &egui::Context, path: PathBuf) {
        self.preview = None;
        self.prediction = None;
        match image::open(&path) {
            Ok(img) => {
                self.preview = Some(load_preview(ctx, &path, &img));
                self.image = Some(img);
                self.chosen = Some(path);
                self.status.clear();
                self.run_pipeline();
            }
            Err(e) => {
                tracing::warn!("failed to decode {}: {e}", path.display());
                self.image = None;
                self.chosen = None;
                self.status =
                    "Could not read that image. Please upload a JPEG or PNG photo.".to_string();
            }
        }
    }

    fn run_pipeline(&mut self) {
        let Some(image) = &self.image else {
            return;
        };
        match classify_image(image, &self.classifier, &self.cfg) {
            Ok(prediction) => {
                self.prediction = Some(prediction);
            }
            Err(e) => {
                // Internal detail stays in the log; the user sees a neutral line.
                tracing::error!("classification failed: {e}");
                self.prediction = None;
                self.status = "Detection unavailable.".to_string();
            }
        }
    }
}

fn load_preview(ctx: &egui::Context, path: &Path, img: &DynamicImage) -> egui::TextureHandle {
    let thumb = image::imageops::thumbnail(img, PREVIEW_SIZE, PREVIEW_SIZE);
    let (w, h) = thumb.dimensions();
    let pixels = thumb.into_raw();
    let color = egui::ColorImage::from_rgba_unmultiplied([w as usize, h as usize], &pixels);
    ctx.load_texture(
        format!("preview:{}", path.display()),
        color,
        egui::TextureOptions::LINEAR,
    )
}

impl App for UiApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        egui::TopBottomPanel::top("top").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Choose image...").clicked() {
                    if let Some(path) = FileDialog::new()
                        .add_filter("Images", &["jpg", "jpeg", "png"])
                        .pick_file()
                    {
                        self.open_image(ctx, path);
                    }
                }
                if let Some(chosen) = &self.chosen {
                    ui.label(chosen.display().to_string());
                }
                if !self.status.is_empty() {
                    ui.label(&self.status);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.image.is_none() {
                ui.heading("Upload a skin photo to begin");
                ui.label("Supported formats: JPEG and PNG.");
                return;
            }

            if let Some(tex) = &self.preview {
                let size = tex.size_vec2();
                let (resp, painter) = ui.allocate_painter(size, egui::Sense::hover());
                let uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));
                painter.image(tex.id(), resp.rect, uv, egui::Color32::WHITE);
            }

            ui.add_space(8.0);
            if let Some(prediction) = self.prediction {
                match prediction.decision {
                    Decision::Undefined => {
                        ui.heading("Undefined");
                        if prediction.confidence_pct == 0.0 {
                            ui.label("No skin was detected in this photo.");
                        } else {
                            ui.label(format!(
                                "The classifier was not confident enough ({:.2} %).",
                                prediction.confidence_pct
                            ));
                        }
                    }
                    Decision::Condition(condition) => {
                        ui.heading(condition.name());
                        ui.label(format!("Confidence: {:.2} %", prediction.confidence_pct));
                        ui.add_space(4.0);
                        ui.group(|ui| {
                            ui.label(describe(&prediction.decision));
                        });
                    }
                }
                ui.add_space(8.0);
                ui.small(DISCLAIMER);
            }

            ui.add_space(12.0);
            ui.separator();
            ui.horizontal(|ui| {
                let slider = egui::Slider::new(&mut self.pending_threshold, 0.0..=1.0)
                    .text("Confidence threshold")
                    .custom_formatter(|v, _| format!("{:.0}%", v * 100.0));
                ui.add(slider);
                if ui.button("Re-classify").clicked() {
                    self.cfg.confidence_threshold = self.pending_threshold;
                    self.run_pipeline();
                }
            });
        });
    }
}
