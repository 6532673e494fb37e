use derm_core::{
    classify_image, classify_path, describe, Classifier, Condition, Decision, PipelineConfig,
    PipelineError, Prediction, ProbabilityVector,
};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array4;
use std::io::Write;

/// Uniform skin-toned pixel; HSV8 = (9, 89, 200), inside the default gate
/// range, so a solid image of it is 100% skin-like.
const SKIN_RGB: [u8; 3] = [200, 150, 130];

struct StubClassifier(ProbabilityVector);

impl Classifier for StubClassifier {
    fn infer(&self, input: &Array4<f32>) -> derm_core::Result<ProbabilityVector> {
        derm_core::validate_classifier_input(input)?;
        Ok(self.0)
    }
}

fn solid(rgb: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(224, 224, Rgb(rgb)))
}

#[test]
fn e2e_no_skin_yields_undefined_and_fallback_description() {
    // Scenario: an all-black photo
    // Given a 224x224 image with no skin-tone pixels
    // When the pipeline runs
    // Then the gate rejects it before inference
    // And the prediction is (undefined, 0.0) with the fallback description
    let stub = StubClassifier([0.9, 0.025, 0.025, 0.025, 0.025]);
    let prediction = classify_image(&solid([0, 0, 0]), &stub, &PipelineConfig::default()).unwrap();

    assert_eq!(
        prediction,
        Prediction {
            decision: Decision::Undefined,
            confidence_pct: 0.0,
        }
    );
    assert_eq!(describe(&prediction.decision), "Description unavailable.");
}

#[test]
fn e2e_skin_image_at_threshold_yields_labeled_prediction() {
    // Scenario: a fully skin-toned photo with a borderline classifier
    // Given an image where 100% of pixels fall in the skin HSV range
    // And a classifier scoring nail fungus at exactly the 0.6 threshold
    // When the pipeline runs
    // Then the prediction is (nail fungus, 60.0)
    // And the registry returns the nail fungus description
    let stub = StubClassifier([0.1, 0.1, 0.1, 0.1, 0.6]);
    let prediction = classify_image(&solid(SKIN_RGB), &stub, &PipelineConfig::default()).unwrap();

    assert_eq!(
        prediction.decision,
        Decision::Condition(Condition::NailFungus)
    );
    assert_eq!(prediction.confidence_pct, 60.0);
    assert_eq!(
        describe(&prediction.decision),
        Condition::NailFungus.description()
    );
}

#[test]
fn e2e_low_confidence_reports_undefined_with_confidence() {
    // Scenario: skin detected but the classifier is unsure
    let stub = StubClassifier([0.3, 0.25, 0.2, 0.15, 0.1]);
    let prediction = classify_image(&solid(SKIN_RGB), &stub, &PipelineConfig::default()).unwrap();

    assert_eq!(prediction.decision, Decision::Undefined);
    assert_eq!(prediction.confidence_pct, 30.0);
}

#[test]
fn e2e_threshold_is_a_caller_knob() {
    // The same scores flip from undefined to labeled when the caller relaxes
    // the threshold, with no other pipeline change.
    let stub = StubClassifier([0.1, 0.55, 0.15, 0.1, 0.1]);
    let strict = PipelineConfig::default();
    let relaxed = PipelineConfig {
        confidence_threshold: 0.5,
        ..PipelineConfig::default()
    };

    let undefined = classify_image(&solid(SKIN_RGB), &stub, &strict).unwrap();
    assert_eq!(undefined.decision, Decision::Undefined);

    let labeled = classify_image(&solid(SKIN_RGB), &stub, &relaxed).unwrap();
    assert_eq!(labeled.decision, Decision::Condition(Condition::Chickenpox));
    assert_eq!(labeled.confidence_pct, 55.0);
}

#[test]
fn e2e_undecodable_file_is_an_invalid_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_an_image.jpg");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"this is not a jpeg").unwrap();
    drop(file);

    let stub = StubClassifier([0.2; 5]);
    let err = classify_path(&path, &stub, &PipelineConfig::default()).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidImage(_)));
}
