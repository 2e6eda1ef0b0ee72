//! Detection results as returned by an [`InferModel`](crate::nn::InferModel).
//!
use std::{borrow::Cow, path::Path, sync::Arc};

use anyhow::{Context, Result};

/// Label shown when the model did not find anything.
pub const NO_DETECTION: &str = "No detection";

/// Class ids in model metadata must be below this.
const MAX_CLASSES: usize = 10_000;

/// Bounding box as `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`, normalized to the
/// image size.
pub type Bbox = [f32; 4];

/// A single detected object.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: Bbox,
}

/// Names of the classes a model was trained on, indexed by class id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassNames(Vec<String>);

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// Read class names from a text file with one name per line.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read class names from {}", path.display()))?;

        Ok(Self(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }

    /// Parse the `names` metadata entry written by ultralytics exports, e.g.
    /// `{0: 'person', 1: 'bicycle'}`.
    pub fn from_metadata(value: &str) -> Option<Self> {
        let body = value.trim().strip_prefix('{')?.strip_suffix('}')?;
        let mut entries: Vec<(usize, String)> = Vec::new();

        for part in body.split(',') {
            match part.split_once(':') {
                Some((key, name)) if key.trim().parse::<usize>().is_ok() => {
                    let id = key.trim().parse::<usize>().ok()?;
                    if id >= MAX_CLASSES {
                        log::warn!("Ignoring class names with out of range id {id}");
                        return None;
                    }
                    entries.push((id, unquote(name).to_owned()));
                }
                // A name containing a comma got split, glue it back together
                _ => {
                    let (_, name) = entries.last_mut()?;
                    let rest = format!("{},{}", name, part);
                    *name = unquote(&rest).to_owned();
                }
            }
        }

        if entries.is_empty() {
            return None;
        }

        let len = entries.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
        let mut names: Vec<String> = (0..len).map(|id| format!("class_{id}")).collect();
        for (id, name) in entries {
            names[id] = name;
        }

        Some(Self(names))
    }

    /// Generic names for a model without any class information.
    pub fn numbered(num_classes: usize) -> Self {
        Self((0..num_classes).map(|id| format!("class_{id}")).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Name bound to a class id, falls back to `class_<id>` for unknown ids.
    pub fn name(&self, class_id: usize) -> Cow<'_, str> {
        match self.0.get(class_id) {
            Some(name) => Cow::Borrowed(name.as_str()),
            None => Cow::Owned(format!("class_{class_id}")),
        }
    }
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c: char| c == '\'' || c == '"')
}

/// All detections of one image together with the class names of the model.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub names: Arc<ClassNames>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>, names: Arc<ClassNames>) -> Self {
        Self { detections, names }
    }

    /// Label of the first detection in model output order, or [`NO_DETECTION`].
    ///
    /// The first entry is taken as is, the detections are not re-sorted here.
    pub fn top_label(&self) -> String {
        match self.detections.first() {
            Some(detection) => self.names.name(detection.class_id).into_owned(),
            None => NO_DETECTION.to_owned(),
        }
    }

    /// Caption drawn next to a detection.
    pub fn caption(&self, detection: &Detection) -> String {
        format!(
            "{} {:.2}",
            self.names.name(detection.class_id),
            detection.confidence
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn names() -> Arc<ClassNames> {
        Arc::new(ClassNames::new(vec![
            "person".into(),
            "dog".into(),
            "cat".into(),
        ]))
    }

    fn detection(class_id: usize, confidence: f32) -> Detection {
        Detection {
            class_id,
            confidence,
            bbox: [0.1, 0.1, 0.5, 0.5],
        }
    }

    #[test]
    fn empty_result_has_sentinel_label() {
        let result = DetectionResult::new(vec![], names());
        assert_eq!(result.top_label(), "No detection");
    }

    #[test]
    fn top_label_uses_first_entry() {
        // The less confident first entry still wins
        let result = DetectionResult::new(vec![detection(1, 0.3), detection(2, 0.9)], names());
        assert_eq!(result.top_label(), "dog");
    }

    #[test]
    fn unknown_class_id_gets_numbered_name() {
        let result = DetectionResult::new(vec![detection(7, 0.5)], names());
        assert_eq!(result.top_label(), "class_7");
        assert_eq!(result.caption(&result.detections[0]), "class_7 0.50");
    }

    #[test]
    fn parse_ultralytics_names_metadata() {
        let names =
            ClassNames::from_metadata("{0: 'person', 1: 'traffic light', 2: \"dog\"}").unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.name(1), "traffic light");
        assert_eq!(names.name(2), "dog");
    }

    #[test]
    fn parse_names_metadata_with_comma_and_gaps() {
        let names = ClassNames::from_metadata("{0: 'salt, pepper', 2: 'bowl'}").unwrap();
        assert_eq!(names.name(0), "salt, pepper");
        assert_eq!(names.name(1), "class_1");
        assert_eq!(names.name(2), "bowl");
    }

    #[test]
    fn reject_malformed_names_metadata() {
        assert!(ClassNames::from_metadata("person, dog").is_none());
        assert!(ClassNames::from_metadata("{}").is_none());
    }

    #[test]
    fn reject_out_of_range_metadata_ids() {
        assert!(ClassNames::from_metadata("{18446744073709551615: 'x'}").is_none());
        assert!(ClassNames::from_metadata("{0: 'person', 400000000000000000: 'x'}").is_none());
        assert!(ClassNames::from_metadata("{10000: 'x'}").is_none());

        let names = ClassNames::from_metadata("{9999: 'last'}").unwrap();
        assert_eq!(names.len(), 10_000);
        assert_eq!(names.name(9999), "last");
    }

    #[test]
    fn read_names_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("names.txt");
        std::fs::write(&path, "person\n\n dog \ncat\n")?;

        let names = ClassNames::from_file(&path)?;
        assert_eq!(names, ClassNames::new(vec!["person".into(), "dog".into(), "cat".into()]));

        Ok(())
    }
}
