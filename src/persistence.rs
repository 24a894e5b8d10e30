//! 本地状态持久化
//!
//! 每类状态（会话、承诺队列、会话簿记）各自一个 JSON 文件，外层带 schema 版本号。
//! 版本不一致或文件损坏时整体重置为默认值，不做迁移。写入先落临时文件再 rename。

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::HiveResult;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    data: T,
}

#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    version: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl AsRef<Path>, version: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            version,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取状态；文件不存在、版本不一致或内容损坏时返回默认值
    pub fn load(&self) -> HiveResult<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;

        let envelope: Envelope<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "State file unreadable, resetting");
                return Ok(T::default());
            }
        };

        if envelope.version != self.version {
            tracing::warn!(
                path = %self.path.display(),
                found = envelope.version,
                expected = self.version,
                "State schema version changed, resetting"
            );
            return Ok(T::default());
        }

        match serde_json::from_value(envelope.data) {
            Ok(data) => Ok(data),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "State payload invalid, resetting");
                Ok(T::default())
            }
        }
    }

    pub fn save(&self, data: &T) -> HiveResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let envelope = Envelope {
            version: self.version,
            saved_at: Utc::now(),
            data,
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&envelope)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        names: Vec<String>,
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonStore<Sample> = JsonStore::new(dir.path().join("none.json"), 1);
        assert_eq!(store.load().unwrap(), Sample::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested").join("s.json"), 3);
        let sample = Sample {
            count: 2,
            names: vec!["a".into()],
        };
        store.save(&sample).unwrap();
        assert_eq!(store.load().unwrap(), sample);
    }

    #[test]
    fn test_version_mismatch_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        JsonStore::new(&path, 1)
            .save(&Sample { count: 9, names: vec![] })
            .unwrap();
        let newer: JsonStore<Sample> = JsonStore::new(&path, 2);
        assert_eq!(newer.load().unwrap(), Sample::default());
    }

    #[test]
    fn test_corrupt_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, "{not json").unwrap();
        let store: JsonStore<Sample> = JsonStore::new(&path, 1);
        assert_eq!(store.load().unwrap(), Sample::default());
    }
}
