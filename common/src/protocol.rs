//! Data exchanged between the detection server and its HTTP clients.
//!
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in frame pixel coordinates.
///
/// Serialized as `[x, y, width, height]` with the origin at the top-left corner.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<[f32; 4]> for BBox {
    fn from(raw: [f32; 4]) -> Self {
        Self::new(raw[0], raw[1], raw[2], raw[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(bbox: BBox) -> Self {
        [bbox.x, bbox.y, bbox.width, bbox.height]
    }
}

/// One detection result of the object detector.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Prediction {
    pub class: String,
    pub score: f32,
    pub bbox: BBox,
}

impl Prediction {
    pub fn new(class: impl Into<String>, score: f32, bbox: impl Into<BBox>) -> Self {
        Self {
            class: class.into(),
            score,
            bbox: bbox.into(),
        }
    }
}

/// Description of a single overlay node drawn on top of the live view.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayDescriptor {
    /// Hollow box around the detected object.
    Highlight {
        left: f32,
        top: f32,
        width: f32,
        height: f32,
    },
    /// Text label placed just above the highlight box.
    Label {
        text: String,
        margin_left: f32,
        margin_top: f32,
        width: f32,
    },
}

impl OverlayDescriptor {
    /// Inline CSS positioning the node inside the live view container.
    pub fn style(&self) -> String {
        match self {
            OverlayDescriptor::Highlight {
                left,
                top,
                width,
                height,
            } => format!("left: {left}px; top: {top}px; width: {width}px; height: {height}px;"),
            OverlayDescriptor::Label {
                margin_left,
                margin_top,
                width,
                ..
            } => format!(
                "margin-left: {margin_left}px; margin-top: {margin_top}px; width: {width}px; top: 0; left: 0;"
            ),
        }
    }
}

/// State of the trigger control that starts the webcam.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No camera is available, the control is never armed.
    Unsupported,
    /// Control armed, waiting for a trigger.
    Armed,
    /// Capture requested, waiting for the stream.
    Starting,
    /// Stream bound, detection loop running.
    Running,
    /// Detection loop finished.
    Stopped,
}

/// Status report served to clients.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatusMsg {
    pub model_loaded: bool,
    pub gate: GateState,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_prediction_json_layout() -> Result<(), Error> {
        let json = r#"{"class":"person","score":0.95,"bbox":[10.0,20.0,100.0,50.0]}"#;
        let prediction: Prediction = serde_json::from_str(json)?;

        assert_eq!(
            prediction,
            Prediction::new("person", 0.95, [10.0, 20.0, 100.0, 50.0])
        );

        Ok(())
    }

    #[test]
    fn test_overlay_styles() {
        let highlight = OverlayDescriptor::Highlight {
            left: 10.0,
            top: 20.0,
            width: 100.0,
            height: 50.0,
        };
        assert_eq!(
            highlight.style(),
            "left: 10px; top: 20px; width: 100px; height: 50px;"
        );

        let label = OverlayDescriptor::Label {
            text: "person - with 95% confidence.".into(),
            margin_left: 10.0,
            margin_top: 10.0,
            width: 90.0,
        };
        assert!(label.style().starts_with("margin-left: 10px; margin-top: 10px; width: 90px;"));
    }

    #[test]
    fn test_overlay_tagging() -> Result<(), Error> {
        let highlight = OverlayDescriptor::Highlight {
            left: 1.0,
            top: 2.0,
            width: 3.0,
            height: 4.0,
        };
        let value = serde_json::to_value(&highlight)?;

        assert_eq!(value["kind"], "highlight");
        assert_eq!(value["left"], 1.0);

        Ok(())
    }
}
