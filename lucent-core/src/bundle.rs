//! On-disk layout of a fine-tune weight bundle.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

pub const BACKBONE_FILE: &str = "unet.safetensors";
pub const ADAPTER_FILE: &str = "lora.safetensors";
pub const EMBEDDINGS_FILE: &str = "embeddings.pti";
pub const SPECIAL_PARAMS_FILE: &str = "special_params.json";

/// Every file a bundle may carry, used when fetching from a hub repository.
pub const BUNDLE_FILES: [&str; 4] = [
    BACKBONE_FILE,
    ADAPTER_FILE,
    EMBEDDINGS_FILE,
    SPECIAL_PARAMS_FILE,
];

const EMBEDDING_KEYS: [&str; 2] = ["text_encoders_0", "text_encoders_1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// `unet.safetensors` replaces matching backbone parameters.
    FullBackbone,
    /// `lora.safetensors` holds low-rank attention adapters.
    Adapter,
}

/// A resolved bundle directory whose required files are known to exist.
#[derive(Debug, Clone)]
pub struct WeightBundle {
    identifier: String,
    dir: PathBuf,
    kind: BundleKind,
}

impl WeightBundle {
    /// Classifies the bundle and checks that its required files are present.
    /// Nothing is read beyond directory metadata.
    pub fn open(identifier: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let kind = if dir.join(BACKBONE_FILE).is_file() {
            BundleKind::FullBackbone
        } else if dir.join(ADAPTER_FILE).is_file() {
            BundleKind::Adapter
        } else {
            return Err(Error::invalid_bundle(
                identifier,
                format!("neither {BACKBONE_FILE} nor {ADAPTER_FILE} is present"),
            ));
        };
        for required in [EMBEDDINGS_FILE, SPECIAL_PARAMS_FILE] {
            if !dir.join(required).is_file() {
                return Err(Error::invalid_bundle(
                    identifier,
                    format!("missing {required}"),
                ));
            }
        }
        Ok(Self {
            identifier: identifier.to_string(),
            dir,
            kind,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    /// Backbone or adapter tensors, loaded on the CPU.
    pub fn load_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let file = match self.kind {
            BundleKind::FullBackbone => BACKBONE_FILE,
            BundleKind::Adapter => ADAPTER_FILE,
        };
        candle_core::safetensors::load(self.dir.join(file), &Device::Cpu)
            .map_err(|e| Error::invalid_bundle(&self.identifier, format!("{file}: {e}")))
    }

    pub fn load_token_map(&self) -> Result<TokenMap> {
        let raw = std::fs::read_to_string(self.dir.join(SPECIAL_PARAMS_FILE))?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::invalid_bundle(&self.identifier, format!("{SPECIAL_PARAMS_FILE}: {e}"))
        })
    }

    pub fn load_embeddings(&self) -> Result<TokenEmbeddings> {
        let mut tensors = candle_core::safetensors::load(self.dir.join(EMBEDDINGS_FILE), &Device::Cpu)
            .map_err(|e| Error::invalid_bundle(&self.identifier, format!("{EMBEDDINGS_FILE}: {e}")))?;
        let mut encoders = Vec::with_capacity(EMBEDDING_KEYS.len());
        for key in EMBEDDING_KEYS {
            let tensor = tensors.remove(key).ok_or_else(|| {
                Error::invalid_bundle(&self.identifier, format!("{EMBEDDINGS_FILE} has no {key}"))
            })?;
            if tensor.rank() != 2 {
                return Err(Error::invalid_bundle(
                    &self.identifier,
                    format!("{key} must be (tokens, dim), got {:?}", tensor.dims()),
                ));
            }
            encoders.push(tensor);
        }
        let rows = encoders[0].dim(0)?;
        if encoders[1].dim(0)? != rows {
            return Err(Error::invalid_bundle(
                &self.identifier,
                "text encoder embeddings disagree on the number of tokens",
            ));
        }
        Ok(TokenEmbeddings { encoders })
    }
}

/// Special-token replacements applied to prompts while a bundle is loaded.
/// Entries keep the order of `special_params.json`; a repeated key keeps its
/// first position and its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMap(Vec<(String, String)>);

impl TokenMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, from: String, to: String) {
        match self.0.iter_mut().find(|(key, _)| *key == from) {
            Some(entry) => entry.1 = to,
            None => self.0.push((from, to)),
        }
    }

    /// Replaces every occurrence of every mapped token, in entry order.
    pub fn substitute(&self, prompt: &str) -> String {
        self.0
            .iter()
            .fold(prompt.to_string(), |prompt, (from, to)| prompt.replace(from, to))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TokenMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::default();
        for (k, v) in iter {
            map.insert(k.into(), v.into());
        }
        map
    }
}

impl Serialize for TokenMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (from, to) in &self.0 {
            map.serialize_entry(from, to)?;
        }
        map.end()
    }
}

struct TokenMapVisitor;

impl<'de> Visitor<'de> for TokenMapVisitor {
    type Value = TokenMap;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of special tokens to replacements")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<TokenMap, A::Error> {
        let mut map = TokenMap::default();
        while let Some((from, to)) = access.next_entry::<String, String>()? {
            map.insert(from, to);
        }
        Ok(map)
    }
}

impl<'de> Deserialize<'de> for TokenMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(TokenMapVisitor)
    }
}

/// New token rows for each of the two text encoders, appended as `<s0>`,
/// `<s1>`, ... after the pretrained vocabulary.
#[derive(Debug, Clone)]
pub struct TokenEmbeddings {
    encoders: Vec<Tensor>,
}

impl TokenEmbeddings {
    pub fn new(first: Tensor, second: Tensor) -> Self {
        Self {
            encoders: vec![first, second],
        }
    }

    pub fn len(&self) -> usize {
        self.encoders[0].dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens(&self) -> Vec<String> {
        (0..self.len()).map(|i| format!("<s{i}>")).collect()
    }

    /// Rows for text encoder `index` (0 or 1).
    pub fn for_encoder(&self, index: usize) -> Option<&Tensor> {
        self.encoders.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn substitutes_every_occurrence() {
        let map: TokenMap = [("TOK", "ohwx person")].into_iter().collect();
        assert_eq!(
            map.substitute("a photo of TOK smiling"),
            "a photo of ohwx person smiling"
        );
        assert_eq!(map.substitute("TOK and TOK"), "ohwx person and ohwx person");
        assert_eq!(TokenMap::default().substitute("TOK"), "TOK");
    }

    #[test]
    fn token_map_reads_special_params_json() {
        let map: TokenMap = serde_json::from_str(r#"{"TOK": "<s0><s1>"}"#).unwrap();
        assert_eq!(map.substitute("TOK"), "<s0><s1>");
    }

    #[test]
    fn replacements_follow_document_order() {
        // Sorted order would rewrite the TOK prefix of TOK2 first.
        let map: TokenMap =
            serde_json::from_str(r#"{"TOK2": "<s2><s3>", "TOK": "<s0><s1>"}"#).unwrap();
        assert_eq!(map.substitute("TOK2 beside TOK"), "<s2><s3> beside <s0><s1>");
        assert_eq!(
            serde_json::to_string(&map).unwrap(),
            r#"{"TOK2":"<s2><s3>","TOK":"<s0><s1>"}"#
        );

        let map: TokenMap = serde_json::from_str(r#"{"B": "1", "A": "2", "B": "3"}"#).unwrap();
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"B":"3","A":"2"}"#);
    }

    #[test]
    fn classifies_by_backbone_presence() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), EMBEDDINGS_FILE);
        touch(dir.path(), SPECIAL_PARAMS_FILE);
        touch(dir.path(), ADAPTER_FILE);
        let bundle = WeightBundle::open("b", dir.path()).unwrap();
        assert_eq!(bundle.kind(), BundleKind::Adapter);

        touch(dir.path(), BACKBONE_FILE);
        let bundle = WeightBundle::open("b", dir.path()).unwrap();
        assert_eq!(bundle.kind(), BundleKind::FullBackbone);
    }

    #[test]
    fn rejects_bundles_without_weights_or_params() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), EMBEDDINGS_FILE);
        touch(dir.path(), SPECIAL_PARAMS_FILE);
        assert!(matches!(
            WeightBundle::open("b", dir.path()),
            Err(Error::InvalidBundle { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), ADAPTER_FILE);
        touch(dir.path(), EMBEDDINGS_FILE);
        assert!(matches!(
            WeightBundle::open("b", dir.path()),
            Err(Error::InvalidBundle { .. })
        ));
    }

    #[test]
    fn loads_embeddings_for_both_encoders() {
        let dir = tempfile::tempdir().unwrap();
        let first = Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap();
        let second = Tensor::ones((2, 12), DType::F32, &Device::Cpu).unwrap();
        let tensors = HashMap::from([
            ("text_encoders_0".to_string(), first),
            ("text_encoders_1".to_string(), second),
        ]);
        candle_core::safetensors::save(&tensors, dir.path().join(EMBEDDINGS_FILE)).unwrap();
        touch(dir.path(), SPECIAL_PARAMS_FILE);
        touch(dir.path(), ADAPTER_FILE);

        let embeddings = WeightBundle::open("b", dir.path())
            .unwrap()
            .load_embeddings()
            .unwrap();
        assert_eq!(embeddings.tokens(), vec!["<s0>", "<s1>"]);
        assert_eq!(embeddings.for_encoder(1).unwrap().dims(), &[2, 12]);
    }
}
