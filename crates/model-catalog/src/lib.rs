//! Where images and GGUF model files live on disk, and which models can be downloaded.

mod images;
mod models;
mod registry;

pub use images::{is_image_file, scan_images, sidecar_path, IMAGE_EXTENSIONS};
pub use models::{
    find_vision_encoder, is_vision_encoder, model_file_exists, model_search_dirs, scan_models,
    ModelFile,
};
pub use registry::{
    registry_model, HubFile, Quant, RegistryModel, MODEL_REPO_ID, VISION_ENCODER_SOURCES,
};
