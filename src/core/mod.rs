/*!
 * Local staging: recognition, naming, association and bundle placement
 */

pub mod associate;
pub mod checksum;
pub mod classify;
pub mod discovery;
pub mod identifier;
pub mod manifest;
pub mod metadata;
pub mod placement;
pub mod stage;

pub use associate::{associate, AssociatedFiles, Association, AuxiliaryFile, UnclaimedFile};
pub use classify::{Classification, Classifier, RecognizedFile, StaticClassifier};
pub use discovery::{discover_acquisitions, AcquisitionItem, Discovery};
pub use identifier::{IdentifierExtractor, SessionKey, SortKey, Template};
pub use manifest::BundleManifest;
pub use metadata::Metadata;
pub use placement::{FilePlacer, LinkMode, LinkOrCopyPlacer, PlacementMethod};
pub use stage::{plan_sessions, run_stage, Bundler, SessionPlan, StageOptions, StageSummary};

#[cfg(feature = "dicom")]
pub use classify::DicomClassifier;
