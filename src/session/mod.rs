//! 会话：目录布局、资产清单与历史树
//!
//! ```text
//! <sessions_root>/<id>/
//!   assets/        导入与编辑产出的资产
//!   scripts/       已接受的脚本
//!   reports/       每次请求的执行报告
//!   .work/         进行中请求的临时工作目录
//!   assets.json    资产清单
//!   history.json   历史树
//! ```

pub mod history;
pub mod store;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use history::{EntryStatus, History, HistoryEntry, HistoryNode, NewEntry};
pub use store::{Session, SessionStore};

/// 一个会话目录下的各路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn scripts(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn reports(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn work(&self) -> PathBuf {
        self.root.join(".work")
    }

    pub fn inventory_file(&self) -> PathBuf {
        self.root.join("assets.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("history.json")
    }

    /// 把相对会话目录的路径转为绝对路径
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    pub async fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [self.assets(), self.scripts(), self.reports(), self.work()] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// 先写同目录临时文件再 rename，读者不会看到半写的 JSON
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, &data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/data.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).await.unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).await.unwrap();

        let value: serde_json::Value = read_json(&path).await.unwrap();
        assert_eq!(value["a"], 2);
        let names: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_layout() {
        let paths = SessionPaths::new("/s/abc");
        assert_eq!(paths.assets(), PathBuf::from("/s/abc/assets"));
        assert_eq!(paths.history_file(), PathBuf::from("/s/abc/history.json"));
        assert_eq!(
            paths.resolve(Path::new("assets/a.mp4")),
            PathBuf::from("/s/abc/assets/a.mp4")
        );
    }
}
