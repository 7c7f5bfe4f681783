//! Guard against importing vectors into a different embedding space.

use ingest_types::LearningConfiguration;

use crate::error::ExportError;

/// Fails when both sides name a semantic model and the models differ.
///
/// A destination without configuration accepts anything; the importer then
/// adopts the exported one.
pub fn check_compatible(
    exported: Option<&LearningConfiguration>,
    destination: Option<&LearningConfiguration>,
) -> Result<(), ExportError> {
    match (exported, destination) {
        (Some(exported), Some(destination)) if exported.semantic_model != destination.semantic_model => {
            Err(ExportError::IncompatibleExport {
                exported: exported.semantic_model.clone(),
                destination: destination.semantic_model.clone(),
            })
        }
        _ => Ok(()),
    }
}
