//! Mapping of predictions to overlay nodes and the per-frame overlay bookkeeping.
//!
use std::collections::BTreeMap;

use common::protocol::{OverlayDescriptor, Prediction};

use crate::sensors::Frame;

/// Default minimum confidence for a prediction to be shown.
pub const DEFAULT_MIN_SCORE: f32 = 0.66;

/// Vertical offset of a label above its highlight box.
const LABEL_OFFSET: f32 = 10.0;

/// Identifier of a node appended to an overlay surface.
pub type NodeId = u64;

/// Container the overlay nodes are rendered into.
pub trait OverlaySurface: Send + 'static {
    /// Add a node and return its identifier.
    fn append(&mut self, node: OverlayDescriptor) -> NodeId;

    /// Remove a previously appended node. Unknown identifiers are ignored.
    fn remove(&mut self, id: NodeId);

    /// Show a frame together with the nodes currently on the surface.
    fn present(&mut self, frame: &Frame);
}

/// Whether a prediction is confident enough to be shown. The threshold itself is excluded.
pub fn qualifies(prediction: &Prediction, min_score: f32) -> bool {
    prediction.score > min_score
}

/// Overlay nodes for the qualifying predictions, a highlight box followed by its label each.
pub fn overlay_descriptors(predictions: &[Prediction], min_score: f32) -> Vec<OverlayDescriptor> {
    predictions
        .iter()
        .filter(|prediction| qualifies(prediction, min_score))
        .flat_map(|prediction| {
            let bbox = prediction.bbox;
            [
                OverlayDescriptor::Highlight {
                    left: bbox.x,
                    top: bbox.y,
                    width: bbox.width,
                    height: bbox.height,
                },
                OverlayDescriptor::Label {
                    text: label_text(prediction),
                    margin_left: bbox.x,
                    margin_top: bbox.y - LABEL_OFFSET,
                    width: bbox.width - LABEL_OFFSET,
                },
            ]
        })
        .collect()
}

/// Number of qualifying predictions per class label.
pub fn class_counts(predictions: &[Prediction], min_score: f32) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for prediction in predictions
        .iter()
        .filter(|prediction| qualifies(prediction, min_score))
    {
        *counts.entry(prediction.class.clone()).or_insert(0) += 1;
    }
    counts
}

fn label_text(prediction: &Prediction) -> String {
    format!(
        "{} - with {}% confidence.",
        prediction.class,
        (prediction.score * 100.0).round()
    )
}

/// Nodes appended during the current cycle, removed at the start of the next one.
#[derive(Debug, Default)]
pub struct OverlaySet {
    children: Vec<NodeId>,
}

impl OverlaySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every node of the previous cycle from the surface.
    pub fn clear(&mut self, surface: &mut impl OverlaySurface) {
        for id in self.children.drain(..) {
            surface.remove(id);
        }
    }

    /// Append the nodes of the current cycle and remember them for removal.
    pub fn extend(
        &mut self,
        surface: &mut impl OverlaySurface,
        nodes: impl IntoIterator<Item = OverlayDescriptor>,
    ) {
        for node in nodes {
            self.children.push(surface.append(node));
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[derive(Default)]
    struct VecSurface {
        next_id: NodeId,
        nodes: Vec<(NodeId, OverlayDescriptor)>,
    }

    impl OverlaySurface for VecSurface {
        fn append(&mut self, node: OverlayDescriptor) -> NodeId {
            self.next_id += 1;
            self.nodes.push((self.next_id, node));
            self.next_id
        }

        fn remove(&mut self, id: NodeId) {
            self.nodes.retain(|(node_id, _)| *node_id != id);
        }

        fn present(&mut self, _frame: &Frame) {}
    }

    fn prediction(class: &str, score: f32) -> Prediction {
        Prediction::new(class, score, [0.0, 0.0, 10.0, 10.0])
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let predictions = [prediction("cat", 0.66), prediction("dog", 0.6600001)];
        let nodes = overlay_descriptors(&predictions, DEFAULT_MIN_SCORE);

        assert_eq!(nodes.len(), 2);
        match &nodes[1] {
            OverlayDescriptor::Label { text, .. } => assert!(text.starts_with("dog")),
            other => panic!("expected label, got {other:?}"),
        }
    }

    #[test]
    fn test_low_scores_produce_no_nodes() {
        let predictions = [prediction("cat", 0.1), prediction("cat", 0.66)];
        assert!(overlay_descriptors(&predictions, DEFAULT_MIN_SCORE).is_empty());
        assert!(class_counts(&predictions, DEFAULT_MIN_SCORE).is_empty());
    }

    #[test]
    fn test_class_counts() {
        let predictions = [
            prediction("cat", 0.9),
            prediction("cat", 0.7),
            prediction("dog", 0.5),
        ];
        let counts = class_counts(&predictions, DEFAULT_MIN_SCORE);

        assert_eq!(counts, BTreeMap::from([("cat".to_owned(), 2)]));
    }

    #[test]
    fn test_descriptor_geometry() {
        let predictions = [Prediction::new("person", 0.95, [10.0, 20.0, 100.0, 50.0])];
        let nodes = overlay_descriptors(&predictions, DEFAULT_MIN_SCORE);

        assert_eq!(
            nodes,
            vec![
                OverlayDescriptor::Highlight {
                    left: 10.0,
                    top: 20.0,
                    width: 100.0,
                    height: 50.0,
                },
                OverlayDescriptor::Label {
                    text: "person - with 95% confidence.".into(),
                    margin_left: 10.0,
                    margin_top: 10.0,
                    width: 90.0,
                },
            ]
        );
    }

    #[test]
    fn test_overlay_set_does_not_leak() {
        let mut surface = VecSurface::default();
        let mut overlays = OverlaySet::new();

        for num_predictions in [3, 1, 4, 0, 2] {
            let predictions = vec![prediction("cat", 0.9); num_predictions];
            overlays.clear(&mut surface);
            overlays.extend(&mut surface, overlay_descriptors(&predictions, DEFAULT_MIN_SCORE));

            assert_eq!(surface.nodes.len(), 2 * num_predictions);
            assert_eq!(overlays.len(), 2 * num_predictions);
        }

        overlays.clear(&mut surface);
        assert!(surface.nodes.is_empty());
        assert!(overlays.is_empty());
    }
}
