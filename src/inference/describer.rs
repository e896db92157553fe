//! Scene description over the shared session.
//!
//! The describer takes a `[1, 3, 384, 384]` image tensor plus a prompt
//! token tensor, and yields generated token ids together with encoder
//! hidden states. Token ids detokenize into the scene text; hidden states
//! mean-pool into an L2-normalized embedding.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tract_onnx::prelude::{Datum, Tensor};

use crate::inference::session::{InferenceError, InferenceSession, TensorPool};
use crate::pipeline::frame_to_rgb;
use crate::types::RawFrame;

pub const DESCRIBER_INPUT: usize = 384;
pub const MAX_DESCRIPTION_CHARS: usize = 200;
pub const DEFAULT_PROMPT: &str = "describe the scene";

const PAD_ID: i64 = 0;
const BOS_ID: i64 = 1;
const EOS_ID: i64 = 2;
const UNK_ID: i64 = 3;

/// Deterministic prompt preprocessor: lowercase, whitespace split, exact
/// vocab lookup, `<unk>` for misses, wrapped in `<s>`/`</s>`.
pub struct PromptTokenizer {
    vocab: HashMap<String, i64>,
    reverse: HashMap<i64, String>,
}

impl PromptTokenizer {
    pub fn new(vocab: HashMap<String, i64>) -> Self {
        let reverse = vocab.iter().map(|(w, &id)| (id, w.clone())).collect();
        Self { vocab, reverse }
    }

    /// Loads a `{"word": id}` JSON vocabulary.
    pub fn from_file(path: &Path) -> Result<Self, InferenceError> {
        let bytes = std::fs::read(path).map_err(|e| InferenceError::ModelUnavailable {
            name: "vocab".to_string(),
            reason: e.to_string(),
        })?;
        let vocab: HashMap<String, i64> =
            serde_json::from_slice(&bytes).map_err(|e| InferenceError::ModelUnavailable {
                name: "vocab".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(vocab))
    }

    /// Minimal built-in vocabulary covering the default prompt; used when
    /// no vocab file is configured.
    pub fn builtin() -> Self {
        let mut vocab = HashMap::new();
        for (word, id) in [("describe", 4i64), ("scene", 5), ("the", 6)] {
            vocab.insert(word.to_string(), id);
        }
        Self::new(vocab)
    }

    pub fn encode(&self, prompt: &str) -> Vec<i64> {
        let mut ids = vec![BOS_ID];
        for word in prompt.to_lowercase().split_whitespace() {
            ids.push(*self.vocab.get(word).unwrap_or(&UNK_ID));
        }
        ids.push(EOS_ID);
        ids
    }

    /// Detokenizes generated ids, skipping special markers.
    pub fn decode(&self, ids: &[i64]) -> String {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| !matches!(id, PAD_ID | BOS_ID | EOS_ID | UNK_ID))
            .filter_map(|id| self.reverse.get(id).map(String::as_str))
            .collect();
        words.join(" ")
    }
}

/// Cleans generated text: collapse whitespace, cap at 200 characters on a
/// char boundary, guarantee trailing punctuation. Empty stays empty.
pub fn clean_description(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return collapsed;
    }

    let mut text: String = collapsed.chars().take(MAX_DESCRIPTION_CHARS).collect();
    while text.ends_with([' ', ',', ';', ':']) {
        text.pop();
    }
    if !text.ends_with(['.', '!', '?']) && text.len() < MAX_DESCRIPTION_CHARS {
        text.push('.');
    }
    text
}

/// Mean-pools `[seq, dim]` hidden states over the sequence axis and
/// L2-normalizes to unit length. An all-zero input stays zero.
pub fn pool_embedding(hidden: &[f32], seq: usize, dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; dim];
    if seq == 0 {
        return pooled;
    }
    for s in 0..seq {
        for d in 0..dim {
            pooled[d] += hidden[s * dim + d];
        }
    }
    let inv = 1.0 / seq as f32;
    for v in pooled.iter_mut() {
        *v *= inv;
    }

    let norm = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in pooled.iter_mut() {
            *v /= norm;
        }
    }
    pooled
}

pub struct DescriptionOutput {
    pub text: String,
    pub embedding: Vec<f32>,
}

pub struct Describer {
    session: Arc<InferenceSession>,
    pool: TensorPool,
    tokenizer: PromptTokenizer,
    prompt_ids: Vec<i64>,
}

impl Describer {
    pub fn new(
        session: Arc<InferenceSession>,
        pool: TensorPool,
        tokenizer: PromptTokenizer,
        prompt: &str,
    ) -> Self {
        let prompt_ids = tokenizer.encode(prompt);
        Self {
            session,
            pool,
            tokenizer,
            prompt_ids,
        }
    }

    /// Prompt tensor for warm-up passes.
    pub fn prompt_tensor(&self) -> Result<Tensor, InferenceError> {
        Tensor::from_shape(&[1, self.prompt_ids.len()], &self.prompt_ids)
            .map_err(|e| InferenceError::Run(e.to_string()))
    }

    pub async fn describe(&self, frame: &RawFrame) -> Result<DescriptionOutput, InferenceError> {
        let staged = self.preprocess(frame)?;
        let image = staged.to_tensor()?;
        drop(staged);
        let prompt = self.prompt_tensor()?;

        let outputs = self.session.run(vec![image, prompt]).await?;
        if outputs.len() < 2 {
            return Err(InferenceError::Output(format!(
                "describer produced {} outputs, expected token ids and hidden states",
                outputs.len()
            )));
        }

        let ids = token_ids(&outputs[0])?;
        let text = clean_description(&self.tokenizer.decode(&ids));

        let hidden = &outputs[1];
        let shape = hidden.shape();
        if shape.len() != 3 {
            return Err(InferenceError::Output(format!(
                "expected [1, seq, dim] hidden states, got {shape:?}"
            )));
        }
        let (seq, dim) = (shape[1], shape[2]);
        let values = hidden
            .as_slice::<f32>()
            .map_err(|e| InferenceError::Output(e.to_string()))?;
        let embedding = pool_embedding(values, seq, dim);

        Ok(DescriptionOutput { text, embedding })
    }

    /// Stages the frame as `[1, 3, 384, 384]` CHW RGB with an
    /// aspect-preserving pad.
    fn preprocess(
        &self,
        frame: &RawFrame,
    ) -> Result<crate::inference::session::TensorBuf, InferenceError> {
        let rgb = frame_to_rgb(&frame.pixels)
            .ok_or_else(|| InferenceError::Output("frame buffer has wrong size".to_string()))?;

        let scale = (DESCRIBER_INPUT as f32 / rgb.width() as f32)
            .min(DESCRIBER_INPUT as f32 / rgb.height() as f32);
        let scaled_w = (rgb.width() as f32 * scale).round() as u32;
        let scaled_h = (rgb.height() as f32 * scale).round() as u32;
        let resized = image::imageops::resize(
            &rgb,
            scaled_w.max(1),
            scaled_h.max(1),
            image::imageops::FilterType::Triangle,
        );

        let pad_x = (DESCRIBER_INPUT as u32 - resized.width()) / 2;
        let pad_y = (DESCRIBER_INPUT as u32 - resized.height()) / 2;
        let plane = DESCRIBER_INPUT * DESCRIBER_INPUT;

        let mut buf = self.pool.rent(&[1, 3, DESCRIBER_INPUT, DESCRIBER_INPUT]);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let idx = (y + pad_y) as usize * DESCRIBER_INPUT + (x + pad_x) as usize;
            buf[idx] = f32::from(pixel.0[0]) / 255.0;
            buf[plane + idx] = f32::from(pixel.0[1]) / 255.0;
            buf[2 * plane + idx] = f32::from(pixel.0[2]) / 255.0;
        }
        Ok(buf)
    }
}

/// Reads generated token ids from the first model output, tolerating i64
/// or f32 storage.
fn token_ids(tensor: &Tensor) -> Result<Vec<i64>, InferenceError> {
    if tensor.datum_type() == i64::datum_type() {
        Ok(tensor
            .as_slice::<i64>()
            .map_err(|e| InferenceError::Output(e.to_string()))?
            .to_vec())
    } else {
        Ok(tensor
            .as_slice::<f32>()
            .map_err(|e| InferenceError::Output(e.to_string()))?
            .iter()
            .map(|&v| v as i64)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_tokenization_test_vector() {
        // Pinned preprocessor behavior: any conforming implementation must
        // produce exactly this sequence for the default prompt.
        let tokenizer = PromptTokenizer::builtin();
        assert_eq!(tokenizer.encode("Describe the scene"), vec![1, 4, 6, 5, 2]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tokenizer = PromptTokenizer::builtin();
        assert_eq!(tokenizer.encode("describe a scene"), vec![1, 4, 3, 5, 2]);
    }

    #[test]
    fn decode_skips_special_markers() {
        let tokenizer = PromptTokenizer::builtin();
        assert_eq!(tokenizer.decode(&[1, 6, 5, 0, 0, 2]), "the scene");
    }

    #[test]
    fn clean_adds_trailing_punctuation() {
        assert_eq!(clean_description("a quiet street"), "a quiet street.");
        assert_eq!(clean_description("already ended!"), "already ended!");
    }

    #[test]
    fn clean_collapses_whitespace() {
        assert_eq!(clean_description("  two   people \n walking "), "two people walking.");
    }

    #[test]
    fn clean_caps_at_200_chars() {
        let long = "word ".repeat(100);
        let cleaned = clean_description(&long);
        assert!(cleaned.chars().count() <= MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn clean_keeps_empty_empty() {
        assert_eq!(clean_description("   "), "");
    }

    #[test]
    fn pooled_embedding_is_unit_length() {
        // Two steps of a 3-dim sequence.
        let hidden = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let e = pool_embedding(&hidden, 2, 3);
        let norm: f32 = e.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((e[0] - e[1]).abs() < 1e-6, "symmetric input pools evenly");
    }

    #[test]
    fn zero_hidden_states_pool_to_zero() {
        let e = pool_embedding(&[0.0; 12], 4, 3);
        assert!(e.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn token_ids_accepts_f32_storage() {
        let t = Tensor::from_shape(&[1, 3], &[1.0f32, 5.0, 2.0]).unwrap();
        assert_eq!(token_ids(&t).unwrap(), vec![1, 5, 2]);
    }
}
