//! Skin-condition screening pipeline: skin-presence gating, preprocessing,
//! classifier inference, and confidence-thresholded labeling.
//!
//! The pipeline is a stateless function of (image, config, classifier); callers
//! re-invoke it per photo. The classifier is an injected [`Classifier`]
//! implementation so front-ends share one loaded model and tests substitute a
//! stub.

use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Number of recognized skin conditions.
pub const NUM_CLASSES: usize = 5;

/// Spatial side length of the classifier's input tensor.
pub const INPUT_SIZE: u32 = 224;

/// Minimum top-class probability required to accept a label.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

/// Returned by [`describe`] for the `Undefined` sentinel or anything unmapped.
pub const FALLBACK_DESCRIPTION: &str = "Description unavailable.";

/// Raw per-class scores for one image, in [`Condition::ALL`] order.
///
/// Values are expected in [0,1] but are not assumed to sum to 1.
pub type ProbabilityVector = [f32; NUM_CLASSES];

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Upload is empty, corrupt, or not decodable as a raster.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// A malformed tensor reached the classifier; indicates a preprocessing
    /// defect, not a user error.
    #[error("classifier input has shape {got:?}, expected {expected:?}")]
    InvalidInput {
        expected: [usize; 4],
        got: Vec<usize>,
    },
    /// The model artifact is missing or unreadable. Fatal to startup.
    #[error("failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },
    /// A loaded model failed to produce usable scores.
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Labels and registry
// ---------------------------------------------------------------------------

/// The closed set of recognized skin conditions, in classifier output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Cellulitis,
    Chickenpox,
    Impetigo,
    NailFungus,
    Ringworm,
}

impl Condition {
    /// All conditions, index-aligned with [`ProbabilityVector`].
    pub const ALL: [Condition; NUM_CLASSES] = [
        Condition::Cellulitis,
        Condition::Chickenpox,
        Condition::Impetigo,
        Condition::NailFungus,
        Condition::Ringworm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Condition::Cellulitis => "cellulitis",
            Condition::Chickenpox => "chickenpox",
            Condition::Impetigo => "impetigo",
            Condition::NailFungus => "nail fungus",
            Condition::Ringworm => "ringworm",
        }
    }

    /// Long-form, user-facing description of the condition.
    pub fn description(&self) -> &'static str {
        match self {
            Condition::Cellulitis => {
                "Cellulitis is a bacterial infection of the deeper layers of the skin and \
                 the soft tissue beneath it, most often caused by Streptococcus or \
                 Staphylococcus species. The affected area becomes red, swollen, warm and \
                 painful, frequently accompanied by fever. It usually develops where broken \
                 skin has let bacteria in. Treatment is generally with oral antibiotics; \
                 severe cases can require hospital admission."
            }
            Condition::Chickenpox => {
                "Chickenpox is a highly contagious disease caused by the varicella-zoster \
                 virus, marked by an itchy rash of red spots that develop into fluid-filled \
                 blisters. It spreads very easily through the air or by direct contact, and \
                 is often accompanied by fever and fatigue. Most childhood cases resolve on \
                 their own within one to two weeks; adults and severe cases may be given \
                 antiviral treatment."
            }
            Condition::Impetigo => {
                "Impetigo is a contagious superficial bacterial skin infection, commonly \
                 involving Staphylococcus aureus, group A beta-haemolytic Streptococcus \
                 pyogenes, or both. Although impetigo can clear without intervention, some \
                 cases persist for several weeks, so treatment is often started to shorten \
                 the course and limit spread. It can also have serious consequences, being \
                 associated with post-infectious glomerulonephritis and cellulitis in \
                 certain populations."
            }
            Condition::NailFungus => {
                "Nail fungus, or onychomycosis, is a fungal infection of the fingernails or \
                 toenails that leaves nails discolored, thickened, brittle and sometimes \
                 foul-smelling. It is favored by persistent moisture, poor hygiene, or \
                 prolonged wear of closed footwear. Treatment requires topical or oral \
                 antifungals, and in severe cases the nail may need to be removed to clear \
                 the infection. It is more than a cosmetic problem: infected nails can \
                 trigger secondary bacterial infections, cellulitis, id reactions and \
                 chronic urticaria."
            }
            Condition::Ringworm => {
                "Ringworm is caused by dermatophyte fungi (various Trichophyton, \
                 Microsporum and Epidermophyton species) infecting the trunk and limbs with \
                 a characteristic appearance. Lesions are itchy, typically round and \
                 sharply demarcated, with varied surface changes and inflammation most \
                 pronounced at the advancing edge. Neighboring lesions can merge into \
                 polycyclic patterns, and in immunodeficient patients they may spread \
                 widely and lose their typical appearance."
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Labeling outcome for one analyzed photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// No skin detected, or the classifier was not confident enough.
    Undefined,
    /// One of the recognized conditions.
    Condition(Condition),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Undefined => f.write_str("undefined"),
            Decision::Condition(c) => f.write_str(c.name()),
        }
    }
}

/// Decision plus confidence, produced once per uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub decision: Decision,
    /// Top-class probability as a percentage in [0,100], rounded to two
    /// decimals. 0.0 when the skin gate rejected the image.
    pub confidence_pct: f32,
}

/// Looks up the user-facing description for a decision.
///
/// The `Undefined` sentinel maps to [`FALLBACK_DESCRIPTION`]; never fails.
pub fn describe(decision: &Decision) -> &'static str {
    match decision {
        Decision::Undefined => FALLBACK_DESCRIPTION,
        Decision::Condition(c) => c.description(),
    }
}

// ---------------------------------------------------------------------------
// Skin presence gate
// ---------------------------------------------------------------------------

/// Inclusive HSV ranges and area ratio for the skin presence gate.
///
/// Ranges are on the OpenCV 8-bit scale (hue in [0,179] = degrees / 2,
/// saturation and value in [0,255]); the defaults are the empirically chosen
/// reference values, not derived from a skin-tone model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkinGateConfig {
    pub hue: [u8; 2],
    pub saturation: [u8; 2],
    pub value: [u8; 2],
    /// Minimum fraction of skin-like pixels; the gate passes only when the
    /// observed fraction strictly exceeds this.
    pub min_skin_ratio: f32,
}

impl Default for SkinGateConfig {
    fn default() -> Self {
        Self {
            hue: [0, 20],
            saturation: [30, 150],
            value: [60, 255],
            min_skin_ratio: 0.02,
        }
    }
}

/// Converts an RGB pixel to OpenCV-scale 8-bit HSV.
fn rgb_to_hsv8(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let saturation = if max == 0.0 { 0.0 } else { delta / max * 255.0 };

    let mut hue_deg = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if hue_deg < 0.0 {
        hue_deg += 360.0;
    }

    let hue = ((hue_deg / 2.0).round() as u16 % 180) as u8;
    (hue, saturation.round() as u8, max as u8)
}

/// Fraction of pixels whose HSV triple falls inside the configured skin range.
pub fn skin_ratio(image: &DynamicImage, cfg: &SkinGateConfig) -> Result<f32> {
    let rgb = image.to_rgb8();
    let total = rgb.width() as usize * rgb.height() as usize;
    if total == 0 {
        return Err(PipelineError::InvalidImage("image has no pixels".into()));
    }

    let mut skin = 0usize;
    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        let (h, s, v) = rgb_to_hsv8(r, g, b);
        if (cfg.hue[0]..=cfg.hue[1]).contains(&h)
            && (cfg.saturation[0]..=cfg.saturation[1]).contains(&s)
            && (cfg.value[0]..=cfg.value[1]).contains(&v)
        {
            skin += 1;
        }
    }
    Ok(skin as f32 / total as f32)
}

/// Heuristic pre-filter: does the image plausibly contain skin?
pub fn has_skin_with(image: &DynamicImage, cfg: &SkinGateConfig) -> Result<bool> {
    let ratio = skin_ratio(image, cfg)?;
    tracing::debug!(ratio, min = cfg.min_skin_ratio, "skin gate evaluated");
    Ok(ratio > cfg.min_skin_ratio)
}

/// [`has_skin_with`] using the reference gate configuration.
pub fn has_skin(image: &DynamicImage) -> Result<bool> {
    has_skin_with(image, &SkinGateConfig::default())
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Transforms an arbitrary raster into the classifier's input tensor.
///
/// Forces RGB, resamples to exactly 224x224 with a triangle filter (a direct
/// resize; aspect ratio is deliberately not preserved, for parity with the
/// reference model's training pipeline), and scales each 8-bit channel by
/// 1/255 into NHWC shape `(1, 224, 224, 3)`.
pub fn preprocess(image: &DynamicImage) -> Result<Array4<f32>> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::InvalidImage("image has no pixels".into()));
    }
    let resized = image
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();

    let side = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, side, side, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, y, x, 0]] = r as f32 / 255.0;
        tensor[[0, y, x, 1]] = g as f32 / 255.0;
        tensor[[0, y, x, 2]] = b as f32 / 255.0;
    }
    Ok(tensor)
}

// ---------------------------------------------------------------------------
// Classifier seam
// ---------------------------------------------------------------------------

/// A pre-trained five-class classifier.
///
/// Implementations are read-only after construction and safe for concurrent
/// use; the pipeline never retries a failed inference.
pub trait Classifier {
    fn infer(&self, input: &Array4<f32>) -> Result<ProbabilityVector>;
}

/// Rejects any tensor that is not `(1, 224, 224, 3)`.
///
/// Adapters call this instead of reshaping: a wrong shape here means a
/// preprocessing defect upstream.
pub fn validate_classifier_input(input: &Array4<f32>) -> Result<()> {
    let side = INPUT_SIZE as usize;
    let expected = [1, side, side, 3];
    let (n, h, w, c) = input.dim();
    if [n, h, w, c] != expected {
        return Err(PipelineError::InvalidInput {
            expected,
            got: vec![n, h, w, c],
        });
    }
    Ok(())
}

#[cfg(feature = "ort")]
mod onnx {
    use super::*;
    use ndarray::CowArray;
    use once_cell::sync::Lazy;
    use ort::{
        environment::Environment, session::Session, tensor::OrtOwnedTensor, value::Value,
        GraphOptimizationLevel, SessionBuilder,
    };
    use std::sync::Arc;

    static ORT_ENV: Lazy<Arc<Environment>> = Lazy::new(|| {
        Environment::builder()
            .with_name("derm-scan")
            .build()
            .expect("failed to initialize ONNX Runtime environment")
            .into_arc()
    });

    /// Skin-condition classifier backed by ONNX Runtime.
    ///
    /// The serialized model is loaded once, at startup; the session is never
    /// mutated afterwards and may be shared across sessions for reads. The
    /// artifact's output is already softmax-like, so scores are returned
    /// as-is.
    pub struct OnnxClassifier {
        session: Session,
    }

    impl OnnxClassifier {
        pub fn new(model_path: &Path) -> Result<Self> {
            let load_err = |reason: String| PipelineError::ModelLoad {
                path: model_path.to_path_buf(),
                reason,
            };
            if !model_path.exists() {
                return Err(load_err("file not found".into()));
            }
            let env = ORT_ENV.clone();
            let session = SessionBuilder::new(&env)
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
                .and_then(|b| b.with_model_from_file(model_path))
                .map_err(|e| load_err(e.to_string()))?;
            Ok(Self { session })
        }
    }

    impl Classifier for OnnxClassifier {
        fn infer(&self, input: &Array4<f32>) -> Result<ProbabilityVector> {
            validate_classifier_input(input)?;
            let array = input.clone().into_dyn();
            let cow = CowArray::from(array.view());
            let value = Value::from_array(self.session.allocator(), &cow).map_err(|e| {
                PipelineError::Inference(format!("could not build input tensor: {e}"))
            })?;
            let outputs: Vec<Value> = self
                .session
                .run(vec![value])
                .map_err(|e| PipelineError::Inference(e.to_string()))?;
            let first = outputs
                .first()
                .ok_or_else(|| PipelineError::Inference("model produced no output".into()))?;
            let scores: OrtOwnedTensor<f32, _> = first
                .try_extract()
                .map_err(|e| PipelineError::Inference(e.to_string()))?;
            let view = scores.view();
            let flat: Vec<f32> = view.iter().copied().collect();
            let probs: ProbabilityVector = flat.as_slice().try_into().map_err(|_| {
                PipelineError::Inference(format!(
                    "expected {NUM_CLASSES} class scores, got {}",
                    flat.len()
                ))
            })?;
            Ok(probs)
        }
    }
}

#[cfg(feature = "ort")]
pub use onnx::OnnxClassifier;

// ---------------------------------------------------------------------------
// Decision policy
// ---------------------------------------------------------------------------

/// Combines the gate result, class scores, and threshold into a [`Prediction`].
///
/// A rejected gate short-circuits to `(undefined, 0.0)` without consulting the
/// scores. Otherwise the top class wins (first index on ties); its probability
/// must be at least `threshold` or the label collapses to `undefined` while
/// still reporting the confidence. Total function, cannot fail.
pub fn decide(has_skin: bool, probabilities: &ProbabilityVector, threshold: f32) -> Prediction {
    if !has_skin {
        return Prediction {
            decision: Decision::Undefined,
            confidence_pct: 0.0,
        };
    }

    let mut best = 0usize;
    for (idx, p) in probabilities.iter().enumerate() {
        if *p > probabilities[best] {
            best = idx;
        }
    }
    let confidence = probabilities[best];
    let decision = if confidence < threshold {
        Decision::Undefined
    } else {
        Decision::Condition(Condition::ALL[best])
    };
    Prediction {
        decision,
        confidence_pct: round2(confidence * 100.0),
    }
}

/// Half-up rounding to two decimals.
fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Pipeline configuration and entry points
// ---------------------------------------------------------------------------

/// Tunable pipeline settings with reference defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path to the serialized classifier artifact.
    pub model_path: PathBuf,
    /// Minimum top-class probability to accept a label, in [0,1].
    pub confidence_threshold: f32,
    pub gate: SkinGateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/dermscan.onnx"),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            gate: SkinGateConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads and validates settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Self = toml::from_str(&raw).map_err(|e| PipelineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

/// Runs the full pipeline on one decoded image.
///
/// Deterministic in (image, config): any front-end may re-invoke this freely
/// for the same upload.
pub fn classify_image<C: Classifier>(
    image: &DynamicImage,
    classifier: &C,
    cfg: &PipelineConfig,
) -> Result<Prediction> {
    let present = has_skin_with(image, &cfg.gate)?;
    if !present {
        return Ok(decide(false, &[0.0; NUM_CLASSES], cfg.confidence_threshold));
    }
    let tensor = preprocess(image)?;
    let probabilities = classifier.infer(&tensor)?;
    let prediction = decide(true, &probabilities, cfg.confidence_threshold);
    tracing::debug!(
        decision = %prediction.decision,
        confidence_pct = prediction.confidence_pct,
        "image classified"
    );
    Ok(prediction)
}

/// Decodes a JPEG/PNG file and runs [`classify_image`] on it.
pub fn classify_path<C: Classifier>(
    path: impl AsRef<Path>,
    classifier: &C,
    cfg: &PipelineConfig,
) -> Result<Prediction> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|e| PipelineError::InvalidImage(format!("cannot decode {}: {e}", path.display())))?;
    classify_image(&image, classifier, cfg)
}
