use crate::core::{Result, VlmError};
use crate::envconfig::EnvConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Unparsed model metadata as found next to the weights.
#[derive(Debug, Clone, Default)]
pub struct RawMetadata {
    /// `config.json`
    pub config: Value,
    /// `preprocessor_config.json`
    pub preprocessor: Option<Value>,
    /// `tokenizer_config.json`
    pub tokenizer: Option<Value>,
    /// `chat_template.json` or `chat_template.jinja`
    pub chat_template: Option<String>,
    pub model_dir: Option<PathBuf>,
}

pub trait MetadataLoader {
    fn load_metadata(&self, path_or_id: &str) -> Result<RawMetadata>;
}

/// Finds model directories on disk. Never downloads.
pub struct LocalModelStore {
    roots: Vec<PathBuf>,
}

impl LocalModelStore {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn from_env() -> Self {
        Self::new(EnvConfig::from_env().search_roots())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// A directory path is used as is; `org/name` is looked up under each
    /// root, either directly or as a hub cache snapshot.
    pub fn locate(&self, path_or_id: &str) -> Result<PathBuf> {
        let direct = Path::new(path_or_id);
        if direct.is_dir() {
            return Ok(direct.to_path_buf());
        }

        for root in &self.roots {
            let candidate = root.join(path_or_id);
            if candidate.is_dir() {
                return Ok(candidate);
            }

            let hub_dir = root.join(format!("models--{}", path_or_id.replace('/', "--")));
            if let Some(snapshot) = latest_snapshot(&hub_dir.join("snapshots"))? {
                return Ok(snapshot);
            }
        }

        Err(VlmError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("model {} not found in {:?}", path_or_id, self.roots),
        )))
    }
}

impl Default for LocalModelStore {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MetadataLoader for LocalModelStore {
    fn load_metadata(&self, path_or_id: &str) -> Result<RawMetadata> {
        let dir = self.locate(path_or_id)?;
        debug!(path = %dir.display(), "loading model metadata");
        read_metadata(&dir)
    }
}

pub fn read_metadata(dir: &Path) -> Result<RawMetadata> {
    let config = read_json(&dir.join("config.json"))?;
    let preprocessor = read_optional_json(&dir.join("preprocessor_config.json"))?;
    let tokenizer = read_optional_json(&dir.join("tokenizer_config.json"))?;

    let mut chat_template = read_optional_json(&dir.join("chat_template.json"))?
        .and_then(|v| v.get("chat_template").and_then(Value::as_str).map(String::from));
    let jinja = dir.join("chat_template.jinja");
    if chat_template.is_none() && jinja.is_file() {
        chat_template = Some(std::fs::read_to_string(jinja)?);
    }

    Ok(RawMetadata {
        config,
        preprocessor,
        tokenizer,
        chat_template,
        model_dir: Some(dir.to_path_buf()),
    })
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn read_optional_json(path: &Path) -> Result<Option<Value>> {
    if path.is_file() {
        read_json(path).map(Some)
    } else {
        Ok(None)
    }
}

fn latest_snapshot(snapshots: &Path) -> Result<Option<PathBuf>> {
    if !snapshots.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(snapshots)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()?
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_metadata_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"model_type": "llava"}"#).unwrap();
        std::fs::write(
            dir.path().join("chat_template.json"),
            r#"{"chat_template": "{{ bos_token }}"}"#,
        )
        .unwrap();

        let raw = read_metadata(dir.path()).unwrap();
        assert_eq!(raw.config["model_type"], "llava");
        assert!(raw.preprocessor.is_none());
        assert_eq!(raw.chat_template.as_deref(), Some("{{ bos_token }}"));
    }

    #[test]
    fn test_locates_hub_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let snapshot = root
            .path()
            .join("models--org--tiny-vlm")
            .join("snapshots")
            .join("abc123");
        std::fs::create_dir_all(&snapshot).unwrap();

        let store = LocalModelStore::new(vec![root.path().to_path_buf()]);
        assert_eq!(store.locate("org/tiny-vlm").unwrap(), snapshot);
        assert!(matches!(store.locate("org/missing"), Err(VlmError::Io(_))));
    }
}
