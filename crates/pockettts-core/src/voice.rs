use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::store::Store;

/// A speaker conditioning prefix consumed by Stage A. Internally stored as
/// `[T, D]` flattened row-major; the leading batch axis from the on-disk
/// `[1, T, D]` shape carries no information once loaded.
#[derive(Clone)]
pub struct VoiceEmbedding {
    pub frames: Vec<f32>,
    pub len: usize,
    pub dim: usize,
}

impl VoiceEmbedding {
    /// Accepts a tensor of rank 2 (`[T, D]`) or rank 3 (`[1, T, D]`); a rank-3
    /// leading dimension other than 1 is rejected as malformed. `expected_dim`
    /// is the model's voice-embedding dimension.
    pub fn from_tensor(shape: &[usize], data: Vec<f32>, expected_dim: usize) -> Result<Self, CoreError> {
        let (len, dim) = match *shape {
            [t, d] => (t, d),
            [1, t, d] => (t, d),
            _ => {
                return Err(CoreError::Schema {
                    detail: format!("voice embedding must be rank 2 [T, D] or rank 3 [1, T, D], got shape {shape:?}"),
                });
            }
        };

        if dim != expected_dim {
            return Err(CoreError::Schema {
                detail: format!("voice embedding dim {dim} does not match model voice-embedding dim {expected_dim}"),
            });
        }
        if data.len() != len * dim {
            return Err(CoreError::Schema {
                detail: format!(
                    "voice embedding shape {shape:?} implies {} elements, found {}",
                    len * dim,
                    data.len()
                ),
            });
        }

        Ok(VoiceEmbedding { frames: data, len, dim })
    }

    /// Loads the sole tensor out of a voice-file store (§6: "exactly one
    /// float32 tensor").
    pub fn load_from_store(store: &Store, expected_dim: usize) -> Result<Self, CoreError> {
        let keys = store.keys();
        let key = match keys.as_slice() {
            [only] => only,
            [] => {
                return Err(CoreError::Schema {
                    detail: "voice file contains no tensors".to_string(),
                })
            }
            _ => {
                return Err(CoreError::Schema {
                    detail: format!(
                        "voice file must contain exactly one tensor, found {}: {}",
                        keys.len(),
                        crate::error::available_keys_hint(&keys)
                    ),
                })
            }
        };

        let tensor = store.tensor(key)?;
        VoiceEmbedding::from_tensor(&tensor.shape, tensor.data, expected_dim)
    }
}

/// A small set of named preset voice embeddings bundled alongside the model
/// weights, distinct from a caller-supplied voice file. Thin convenience over
/// [`VoiceEmbedding::load_from_store`] for callers that want a default voice.
pub struct VoiceBank {
    presets: BTreeMap<String, VoiceEmbedding>,
}

impl VoiceBank {
    /// Resolves every `voice_bank.<name>` tensor in the store as a named
    /// preset. A store with no such keys yields an empty bank; that is not
    /// an error; presets are a convenience, not a requirement.
    pub fn load_from_store(store: &Store, expected_dim: usize) -> Result<Self, CoreError> {
        let mut presets = BTreeMap::new();
        for key in store.keys() {
            let Some(name) = key.strip_prefix("voice_bank.") else {
                continue;
            };
            let tensor = store.tensor(&key)?;
            let embedding = VoiceEmbedding::from_tensor(&tensor.shape, tensor.data, expected_dim)?;
            presets.insert(name.to_string(), embedding);
        }
        Ok(VoiceBank { presets })
    }

    pub fn get(&self, name: &str) -> Option<&VoiceEmbedding> {
        self.presets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(|s| s.as_str())
    }
}
