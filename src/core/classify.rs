/*!
 * Acquisition file recognition
 *
 * Staging only depends on the outcome of classification: a file is either
 * a recognized acquisition (with a tag, a series identity and header
 * fields) or it is not. How recognition happens is up to the implementor.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::metadata::Metadata;
use crate::error::Result;

/// Logical type of recognized imaging series files
pub const DICOM_SERIES_TYPE: &str = "medimage/dicom-series";

/// A file that belongs to a recognized acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedFile {
    /// Acquisition type tag (e.g. PET, CT)
    pub acquisition_tag: String,
    /// Logical type reported to the remote repository
    pub logical_type: String,
    /// Identity shared by all files of one series
    pub series_id: String,
    /// Header fields available to naming templates
    pub metadata: Metadata,
}

/// Outcome of classifying one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Recognized(RecognizedFile),
    Unrecognized,
}

/// Recognizes acquisition files
pub trait Classifier: Send + Sync {
    fn classify(&self, path: &Path) -> Result<Classification>;
}

/// Classifier backed by a fixed table of paths
#[derive(Debug, Default, Clone)]
pub struct StaticClassifier {
    files: HashMap<PathBuf, RecognizedFile>,
}

impl StaticClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, file: RecognizedFile) {
        self.files.insert(path.into(), file);
    }
}

impl Classifier for StaticClassifier {
    fn classify(&self, path: &Path) -> Result<Classification> {
        Ok(match self.files.get(path) {
            Some(file) => Classification::Recognized(file.clone()),
            None => Classification::Unrecognized,
        })
    }
}

/// Map a DICOM modality code to an acquisition tag
pub fn modality_tag(modality: &str) -> String {
    match modality.trim() {
        "PT" => "PET".to_string(),
        other => other.to_string(),
    }
}

#[cfg(feature = "dicom")]
pub use dicom_impl::DicomClassifier;

#[cfg(feature = "dicom")]
mod dicom_impl {
    use super::*;
    use dicom_dictionary_std::tags;
    use dicom_object::OpenFileOptions;
    use tracing::trace;

    /// Header attributes always collected from DICOM files
    const DEFAULT_FIELDS: &[&str] = &[
        "PatientName",
        "PatientID",
        "AccessionNumber",
        "StudyID",
        "StudyInstanceUID",
        "StudyDate",
        "SeriesInstanceUID",
        "SeriesNumber",
        "SeriesDescription",
        "SeriesDate",
        "SeriesTime",
        "AcquisitionDate",
        "AcquisitionTime",
        "Modality",
        "InstanceNumber",
    ];

    /// Recognizes DICOM files by reading their header
    #[derive(Debug, Clone, Default)]
    pub struct DicomClassifier {
        extra_fields: Vec<String>,
    }

    impl DicomClassifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Collect additional header attributes by keyword
        pub fn with_fields(mut self, fields: Vec<String>) -> Self {
            self.extra_fields = fields;
            self
        }
    }

    impl Classifier for DicomClassifier {
        fn classify(&self, path: &Path) -> Result<Classification> {
            let obj = match OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(path)
            {
                Ok(obj) => obj,
                Err(e) => {
                    trace!(path = %path.display(), error = %e, "not a DICOM file");
                    return Ok(Classification::Unrecognized);
                }
            };

            let mut metadata = Metadata::new();
            let names = DEFAULT_FIELDS
                .iter()
                .copied()
                .chain(self.extra_fields.iter().map(String::as_str));
            for name in names {
                if let Ok(element) = obj.element_by_name(name) {
                    if let Ok(value) = element.to_str() {
                        let value = value.trim_end_matches(['\0', ' ']);
                        metadata.insert(name, value);
                    }
                }
            }

            let (Some(modality), Some(series_id)) = (
                metadata.get("Modality").map(modality_tag),
                metadata.get("SeriesInstanceUID").map(str::to_string),
            ) else {
                return Ok(Classification::Unrecognized);
            };

            Ok(Classification::Recognized(RecognizedFile {
                acquisition_tag: modality,
                logical_type: DICOM_SERIES_TYPE.to_string(),
                series_id,
                metadata,
            }))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_classifier() {
        let mut classifier = StaticClassifier::new();
        let file = RecognizedFile {
            acquisition_tag: "PET".to_string(),
            logical_type: DICOM_SERIES_TYPE.to_string(),
            series_id: "1.2.3".to_string(),
            metadata: Metadata::new().with("PatientID", "subject0"),
        };
        classifier.insert("/data/pet0.dcm", file.clone());

        assert_eq!(
            classifier.classify(Path::new("/data/pet0.dcm")).unwrap(),
            Classification::Recognized(file)
        );
        assert_eq!(
            classifier.classify(Path::new("/data/other.ptd")).unwrap(),
            Classification::Unrecognized
        );
    }

    #[test]
    fn test_modality_tag() {
        assert_eq!(modality_tag("PT"), "PET");
        assert_eq!(modality_tag("CT "), "CT");
    }
}
