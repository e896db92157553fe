//! Shared-session inference: detector and describer over one serialized
//! execution path.

mod describer;
mod detector;
mod session;

pub use describer::{
    clean_description, pool_embedding, Describer, DescriptionOutput, PromptTokenizer,
    DEFAULT_PROMPT, DESCRIBER_INPUT, MAX_DESCRIPTION_CHARS,
};
pub use detector::{
    is_person, is_vehicle, label_for, Detector, Letterbox, DETECTOR_INPUT, LABELS, PERSON_CLASS,
};
pub use session::{
    InferenceError, InferenceSession, ModelLoader, OnnxModel, SessionRegistry, TensorBuf,
    TensorPool, VisionModel,
};
