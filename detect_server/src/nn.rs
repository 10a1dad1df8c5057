//! Object detection with an SSD MobileNet model trained on COCO.
//!
use std::{
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::Result;
use common::protocol::Prediction;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::{error::DetectError, labels::coco_label, sensors::Frame, utils::download_file};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const SSD_MOBILENET_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/object_detection_segmentation/ssd-mobilenetv1/model/ssd_mobilenet_v1_10.onnx";
const SSD_MOBILENET_FILE: &str = "ssd_mobilenet_v1_10.onnx";

/// Black-box object detector.
pub trait Detector: Send + Sync + 'static {
    /// Detect objects on a frame.
    ///
    /// Bounding boxes of the returned predictions are in pixel coordinates of the frame. The order
    /// of the predictions is unspecified.
    fn detect(
        &self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Vec<Prediction>, DetectError>> + Send;
}

/// Parameters of the SSD detector.
#[derive(Clone, Debug)]
pub struct SsdConfig {
    /// Location of the ONNX file, downloaded from `model_url` if missing.
    pub model_path: PathBuf,
    pub model_url: String,
    /// Width and height of the network input.
    pub input_size: (u32, u32),
    /// Maximum number of boxes returned per frame.
    pub max_detections: usize,
    /// Boxes scoring at or below this value are dropped by the detector.
    pub min_score: f32,
}

impl Default for SsdConfig {
    fn default() -> Self {
        let model_path = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("detect_server")
            .join(SSD_MOBILENET_FILE);

        Self {
            model_path,
            model_url: SSD_MOBILENET_URL.to_owned(),
            input_size: (300, 300),
            max_detections: 20,
            min_score: 0.5,
        }
    }
}

/// Positions of the SSD outputs in the output list of the model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct SsdOutputs {
    boxes: usize,
    classes: usize,
    scores: usize,
}

impl Default for SsdOutputs {
    fn default() -> Self {
        Self {
            boxes: 0,
            classes: 1,
            scores: 2,
        }
    }
}

impl SsdOutputs {
    /// Resolve output positions from the tensor names of the exported graph.
    fn from_labels<'a>(labels: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        let mut outputs = Self::default();
        for (index, label) in labels.into_iter().enumerate() {
            match label {
                Some(name) if name.contains("boxes") => outputs.boxes = index,
                Some(name) if name.contains("classes") => outputs.classes = index,
                Some(name) if name.contains("scores") => outputs.scores = index,
                _ => (),
            }
        }
        outputs
    }
}

/// SSD MobileNet v1 detector executed with tract.
pub struct SsdMobilenet {
    model: Arc<NnModel>,
    outputs: SsdOutputs,
    config: SsdConfig,
}

impl SsdMobilenet {
    /// Load the model, downloading it first if it is not cached yet.
    pub async fn load(config: SsdConfig) -> Result<Self> {
        if !config.model_path.exists() {
            if let Some(dir) = config.model_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            log::info!(
                "Downloading model from {} to {}",
                &config.model_url,
                config.model_path.display()
            );
            let client = reqwest::Client::new();
            download_file(&client, &config.model_url, &config.model_path).await?;
        }

        let path = config.model_path.clone();
        let input_size = config.input_size;
        let (model, outputs) =
            tokio::task::spawn_blocking(move || get_ssd_model(&path, input_size)).await??;

        log::info!("Model loaded, outputs at {:?}", outputs);

        Ok(Self {
            model: Arc::new(model),
            outputs,
            config,
        })
    }

    fn postproc(
        outputs: SsdOutputs,
        config: &SsdConfig,
        raw_nn_out: &[TValue],
        frame_size: (u32, u32),
    ) -> Result<Vec<Prediction>, DetectError> {
        let tensor = |index: usize| {
            raw_nn_out
                .get(index)
                .ok_or_else(|| DetectError::Shape(format!("missing output {index}")))
        };

        let boxes = tensor(outputs.boxes)?.as_slice::<f32>()?;
        let classes = tensor(outputs.classes)?.as_slice::<f32>()?;
        let scores = tensor(outputs.scores)?.as_slice::<f32>()?;

        decode_detections(boxes, classes, scores, frame_size, config)
    }
}

impl Detector for SsdMobilenet {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Prediction>, DetectError> {
        let model = Arc::clone(&self.model);
        let outputs = self.outputs;
        let config = self.config.clone();
        let image = frame.image.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<Prediction>, DetectError> {
            let frame_size = image.dimensions();
            let input = preproc(&image, config.input_size);
            let raw_nn_out = model.run(tvec!(input.into()))?;
            Self::postproc(outputs, &config, &raw_nn_out, frame_size)
        })
        .await?
    }
}

fn get_ssd_model(path: &Path, input_size: (u32, u32)) -> TractResult<(NnModel, SsdOutputs)> {
    let (width, height) = input_size;
    let input_fact = InferenceFact::dt_shape(
        u8::datum_type(),
        tvec!(1, height as usize, width as usize, 3),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?;

    let outputs = SsdOutputs::from_labels(
        model
            .output_outlets()?
            .iter()
            .map(|outlet| model.outlet_label(*outlet)),
    );

    let model = model.into_optimized()?.into_runnable()?;

    Ok((model, outputs))
}

/// Resize the frame to the network input and lay it out as an NHWC `u8` tensor.
fn preproc(image: &RgbImage, input_size: (u32, u32)) -> Tensor {
    let (width, height) = input_size;
    let resized: RgbImage = image::imageops::resize(
        image,
        width,
        height,
        image::imageops::FilterType::Triangle,
    );

    tract_ndarray::Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| resized[(x as _, y as _)][c],
    )
    .into()
}

/// Turn raw SSD outputs into predictions in frame pixel coordinates.
///
/// `boxes` holds `[y_min, x_min, y_max, x_max]` per detection, normalized to the unit square.
/// Detections of unknown classes are skipped. The result is ordered by descending score.
fn decode_detections(
    boxes: &[f32],
    classes: &[f32],
    scores: &[f32],
    frame_size: (u32, u32),
    config: &SsdConfig,
) -> Result<Vec<Prediction>, DetectError> {
    if boxes.len() < scores.len() * 4 || classes.len() < scores.len() {
        return Err(DetectError::Shape(format!(
            "{} boxes and {} classes for {} scores",
            boxes.len() / 4,
            classes.len(),
            scores.len()
        )));
    }

    let (width, height) = (frame_size.0 as f32, frame_size.1 as f32);

    let mut predictions: Vec<_> = scores
        .iter()
        .zip(classes.iter())
        .zip(boxes.chunks_exact(4))
        .filter(|((score, _), _)| **score > config.min_score)
        .filter_map(|((score, class), bbox)| {
            let label = coco_label(class.round() as usize)?;
            let [y_min, x_min, y_max, x_max] = [
                bbox[0].clamp(0.0, 1.0),
                bbox[1].clamp(0.0, 1.0),
                bbox[2].clamp(0.0, 1.0),
                bbox[3].clamp(0.0, 1.0),
            ];
            Some(Prediction::new(
                label,
                *score,
                [
                    x_min * width,
                    y_min * height,
                    (x_max - x_min).max(0.0) * width,
                    (y_max - y_min).max(0.0) * height,
                ],
            ))
        })
        .collect();

    predictions.sort_by(|a, b| b.score.total_cmp(&a.score));
    predictions.truncate(config.max_detections);

    Ok(predictions)
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_decode_scales_boxes_to_frame() -> Result<(), DetectError> {
        let boxes = [0.1, 0.25, 0.5, 0.75, 0.0, 0.0, 1.0, 1.0];
        let classes = [1.0, 18.0];
        let scores = [0.9, 0.4];

        let predictions =
            decode_detections(&boxes, &classes, &scores, (640, 480), &SsdConfig::default())?;

        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].class, "person");
        assert_eq!(predictions[0].bbox.x, 160.0);
        assert!((predictions[0].bbox.y - 48.0).abs() < 1e-3);
        assert_eq!(predictions[0].bbox.width, 320.0);
        assert!((predictions[0].bbox.height - 192.0).abs() < 1e-3);

        Ok(())
    }

    #[test]
    fn test_decode_orders_and_truncates() -> Result<(), DetectError> {
        let boxes = [0.0; 12];
        let classes = [17.0, 18.0, 12.0];
        let scores = [0.6, 0.8, 0.99];
        let config = SsdConfig {
            max_detections: 1,
            ..Default::default()
        };

        let predictions = decode_detections(&boxes, &classes, &scores, (100, 100), &config)?;

        // Class 12 has no COCO category and is skipped
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].class, "dog");

        Ok(())
    }

    #[test]
    fn test_decode_rejects_short_outputs() {
        let config = SsdConfig::default();
        let result = decode_detections(&[0.0; 4], &[1.0, 1.0], &[0.9, 0.9], (1, 1), &config);
        assert!(matches!(result, Err(DetectError::Shape(_))));
    }

    #[test]
    fn test_outputs_from_labels() {
        let outputs = SsdOutputs::from_labels([
            Some("num_detections:0"),
            Some("detection_boxes:0"),
            Some("detection_scores:0"),
            Some("detection_classes:0"),
        ]);
        assert_eq!(
            outputs,
            SsdOutputs {
                boxes: 1,
                classes: 3,
                scores: 2
            }
        );

        assert_eq!(SsdOutputs::from_labels([None, None]), SsdOutputs::default());
    }

    #[test]
    fn test_preproc_layout() {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([1, 2, 3]));
        let tensor = preproc(&image, (8, 6));

        assert_eq!(tensor.shape(), &[1, 6, 8, 3]);
        assert_eq!(&tensor.as_slice::<u8>().unwrap()[..3], &[1, 2, 3]);
    }
}
