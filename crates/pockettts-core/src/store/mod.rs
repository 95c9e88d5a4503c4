mod dtype;

pub use dtype::Dtype;

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use pockettts_base::Tensor;
use serde::Deserialize;

use crate::error::{available_keys_hint, CoreError};

/// A pure function `name -> (mapped_name, keep)` applied while constructing a
/// store. Used to strip source-checkpoint prefixes and reject tensors the
/// model catalog does not recognize.
pub trait KeyMapper {
    fn map(&self, name: &str) -> (String, bool);
}

/// Keeps every key unchanged.
pub struct IdentityMapper;

impl KeyMapper for IdentityMapper {
    fn map(&self, name: &str) -> (String, bool) {
        (name.to_string(), true)
    }
}

/// Strips a fixed prefix (e.g. `"model."`) from every key, dropping keys that
/// don't carry it.
pub struct PrefixStripMapper {
    pub prefix: String,
}

impl KeyMapper for PrefixStripMapper {
    fn map(&self, name: &str) -> (String, bool) {
        match name.strip_prefix(self.prefix.as_str()) {
            Some(rest) => (rest.to_string(), true),
            None => (name.to_string(), false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapMode {
    /// Dropped or collided entries are silently skipped.
    Lenient,
    /// Any rejection or collision is a fatal error.
    Strict,
}

pub struct OpenOptions<'a> {
    pub key_mapper: &'a dyn KeyMapper,
    pub remap_mode: RemapMode,
}

impl<'a> OpenOptions<'a> {
    pub fn identity() -> Self {
        static IDENTITY: IdentityMapper = IdentityMapper;
        OpenOptions {
            key_mapper: &IDENTITY,
            remap_mode: RemapMode::Lenient,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HeaderEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (i64, i64),
}

struct Descriptor {
    original_name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    byte_start: usize,
    byte_end: usize,
}

/// An opened, validated safetensors container. Tensors are materialized to
/// f32 lazily on `tensor()`/`tensor_with_shape()`; the backing bytes (owned
/// buffer or memory map) live as long as the store does.
pub struct Store {
    bytes: Arc<dyn AsRef<[u8]> + Send + Sync>,
    entries: BTreeMap<String, Descriptor>,
}

struct OwnedBytes(Vec<u8>);
impl AsRef<[u8]> for OwnedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

struct MappedBytes(Mmap);
impl AsRef<[u8]> for MappedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Store {
    pub fn open(bytes: Vec<u8>, options: &OpenOptions) -> Result<Self, CoreError> {
        Self::open_backing(Arc::new(OwnedBytes(bytes)), options)
    }

    pub fn open_mmap(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| CoreError::Format(format!("cannot open '{}': {e}", path.display())))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| CoreError::Format(format!("cannot mmap '{}': {e}", path.display())))?;
        Self::open_backing(Arc::new(MappedBytes(mmap)), options)
    }

    fn open_backing(
        bytes: Arc<dyn AsRef<[u8]> + Send + Sync>,
        options: &OpenOptions,
    ) -> Result<Self, CoreError> {
        let buf = (*bytes).as_ref();

        if buf.len() < 8 {
            return Err(CoreError::Format(
                "safetensors file shorter than 8-byte header length prefix".to_string(),
            ));
        }

        let header_len =
            u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        if 8usize.checked_add(header_len).is_none_or(|end| end > buf.len()) {
            return Err(CoreError::Format(format!(
                "header_len {header_len} extends past end of file ({} bytes)",
                buf.len()
            )));
        }

        let header_bytes = &buf[8..8 + header_len];
        let header: BTreeMap<String, serde_json::Value> = serde_json::from_slice(header_bytes)
            .map_err(|e| CoreError::Format(format!("malformed safetensors JSON header: {e}")))?;

        let data_start = 8 + header_len;
        let data_len = buf.len() - data_start;

        let mut entries: BTreeMap<String, Descriptor> = BTreeMap::new();

        for (name, value) in header {
            if name == "__metadata__" {
                continue;
            }

            let entry: HeaderEntry = serde_json::from_value(value).map_err(|e| {
                CoreError::Format(format!("malformed header entry for '{name}': {e}"))
            })?;

            let dtype = Dtype::from_header_str(&entry.dtype).ok_or_else(|| {
                CoreError::Unsupported(format!(
                    "tensor '{name}' has unsupported dtype '{}'",
                    entry.dtype
                ))
            })?;

            let (start, end) = entry.data_offsets;
            if start < 0 || end < start {
                return Err(CoreError::Format(format!(
                    "tensor '{name}' has inconsistent data_offsets ({start}, {end})"
                )));
            }
            let (start, end) = (start as usize, end as usize);
            if end > data_len {
                return Err(CoreError::Format(format!(
                    "tensor '{name}' data range [{start}, {end}) exceeds available data ({data_len} bytes)"
                )));
            }

            let element_count: usize = entry.shape.iter().try_fold(1usize, |acc, &d| {
                acc.checked_mul(d)
            }).ok_or_else(|| {
                CoreError::Overflow(format!("shape of tensor '{name}' overflows element count"))
            })?;
            let required_bytes = element_count
                .checked_mul(dtype.byte_size())
                .ok_or_else(|| CoreError::Overflow(format!("tensor '{name}' byte size overflows")))?;
            if end - start < required_bytes {
                return Err(CoreError::Format(format!(
                    "tensor '{name}' has {} bytes but shape {:?} needs at least {required_bytes}",
                    end - start,
                    entry.shape
                )));
            }

            let (mapped_name, keep) = options.key_mapper.map(&name);

            if !keep {
                if options.remap_mode == RemapMode::Strict {
                    return Err(CoreError::Schema {
                        detail: format!("key mapper rejected tensor '{name}' under strict remap"),
                    });
                }
                continue;
            }

            if entries.contains_key(&mapped_name) {
                if options.remap_mode == RemapMode::Strict {
                    return Err(CoreError::Schema {
                        detail: format!(
                            "tensor '{name}' remaps to '{mapped_name}', which collides with an existing key"
                        ),
                    });
                }
                continue;
            }

            entries.insert(
                mapped_name,
                Descriptor {
                    original_name: name,
                    dtype,
                    shape: entry.shape,
                    byte_start: data_start + start,
                    byte_end: data_start + end,
                },
            );
        }

        if entries.is_empty() {
            return Err(CoreError::Schema {
                detail: "store is empty after key-mapper remapping".to_string(),
            });
        }

        Ok(Store { bytes, entries })
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn shape_of(&self, key: &str) -> Option<&[usize]> {
        self.entries.get(key).map(|d| d.shape.as_slice())
    }

    pub fn tensor(&self, key: &str) -> Result<Tensor<f32>, CoreError> {
        let descriptor = self.entries.get(key).ok_or_else(|| CoreError::Schema {
            detail: format!(
                "tensor '{key}' not found; available: {}",
                available_keys_hint(&self.keys())
            ),
        })?;

        let buf = (*self.bytes).as_ref();
        let raw = &buf[descriptor.byte_start..descriptor.byte_end];
        let data = dtype::decode_bytes(descriptor.dtype, raw);

        Tensor::new(descriptor.shape.clone(), data).map_err(CoreError::from)
    }

    pub fn tensor_with_shape(&self, key: &str, expected: &[usize]) -> Result<Tensor<f32>, CoreError> {
        let tensor = self.tensor(key)?;
        if tensor.shape != expected {
            return Err(CoreError::Schema {
                detail: format!(
                    "tensor '{key}' has shape {:?}, expected {:?}",
                    tensor.shape, expected
                ),
            });
        }
        Ok(tensor)
    }

    pub fn all_tensors(&self) -> Result<BTreeMap<String, Tensor<f32>>, CoreError> {
        self.keys()
            .into_iter()
            .map(|k| {
                let t = self.tensor(&k)?;
                Ok((k, t))
            })
            .collect()
    }

    pub fn original_name(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|d| d.original_name.as_str())
    }
}
