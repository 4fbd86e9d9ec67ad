//! 会话存储：每个会话一个 Session（资产清单 + 历史），按需从磁盘加载
//!
//! 会话之间不共享任何可变状态；同一会话的状态由一把 Mutex 保护。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::core::EditError;
use crate::media::{Asset, MediaMetadata, MediaProbe};
use crate::session::{read_json, write_json_atomic, History, SessionPaths};

/// 单个会话的全部可变状态
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub paths: SessionPaths,
    pub inventory: Vec<Asset>,
    pub history: History,
}

impl Session {
    /// 建目录；有源文件时导入并作为根条目的资产
    async fn create(
        id: String,
        paths: SessionPaths,
        source: Option<&Path>,
        probe: &dyn MediaProbe,
    ) -> Result<Self, EditError> {
        paths.create_dirs().await?;
        let mut session = Self {
            id,
            paths,
            inventory: Vec::new(),
            history: History::new(None),
        };
        if let Some(source) = source {
            let asset = session.import_file(source, probe).await?;
            session.history = History::new(Some(asset.name));
        }
        session.save().await?;
        Ok(session)
    }

    async fn load(id: String, paths: SessionPaths) -> Result<Self, EditError> {
        let history = History::load(&paths.history_file()).await?;
        let inventory: Vec<Asset> = if paths.inventory_file().exists() {
            read_json(&paths.inventory_file())
                .await
                .map_err(|e| EditError::Persistence(format!("assets.json: {}", e)))?
        } else {
            Vec::new()
        };
        paths.create_dirs().await?;
        Ok(Self {
            id,
            paths,
            inventory,
            history,
        })
    }

    /// 写回资产清单与历史
    pub async fn save(&self) -> Result<(), EditError> {
        write_json_atomic(&self.paths.inventory_file(), &self.inventory)
            .await
            .map_err(|e| EditError::Persistence(format!("assets.json: {}", e)))?;
        self.history.save(&self.paths.history_file()).await
    }

    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.inventory.iter().find(|a| a.name == name)
    }

    /// 当前历史指针对应的资产
    pub fn current_asset(&self) -> Option<&Asset> {
        self.history.current_asset().and_then(|name| self.asset(name))
    }

    /// 在清单中不重名的文件名：`stem.ext`、`stem_1.ext`、...
    pub fn unique_asset_name(&self, stem: &str, ext: &str) -> String {
        let make = |n: usize| match (n, ext.is_empty()) {
            (0, true) => stem.to_string(),
            (0, false) => format!("{}.{}", stem, ext),
            (n, true) => format!("{}_{}", stem, n),
            (n, false) => format!("{}_{}.{}", stem, n, ext),
        };
        (0..)
            .map(make)
            .find(|name| self.asset(name).is_none() && !self.paths.assets().join(name).exists())
            .unwrap_or_else(|| format!("{}-{}", stem, uuid::Uuid::new_v4()))
    }

    pub fn add_asset(&mut self, asset: Asset) {
        self.inventory.push(asset);
    }

    /// 复制外部文件到 assets/ 并探测元数据
    pub async fn import_file(&mut self, source: &Path, probe: &dyn MediaProbe) -> Result<Asset, EditError> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "asset".to_string());
        let ext = source
            .extension()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = self.unique_asset_name(&stem, &ext);
        let dest = self.paths.assets().join(&name);
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| EditError::Io(format!("cannot import {}: {}", source.display(), e)))?;

        let metadata = probe_or_size(probe, &dest).await;
        let asset = Asset::new(name.clone(), PathBuf::from("assets").join(&name), metadata);
        tracing::info!(session = %self.id, asset = %asset.name, meta = %asset.metadata.summary(), "asset imported");
        self.add_asset(asset.clone());
        Ok(asset)
    }
}

/// 探测失败时退化为只记录文件大小
pub async fn probe_or_size(probe: &dyn MediaProbe, path: &Path) -> MediaMetadata {
    match probe.probe(path).await {
        Ok(meta) => meta,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "probe failed, keeping size only");
            MediaMetadata {
                size_bytes: tokio::fs::metadata(path).await.ok().map(|m| m.len()),
                ..Default::default()
            }
        }
    }
}

/// 所有会话的入口
pub struct SessionStore {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    /// 相对路径按当前目录转为绝对路径（脚本以绝对路径接收文件）
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        Self {
            root,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths_for(&self, id: &str) -> Result<SessionPaths, EditError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EditError::SessionNotFound(id.to_string()));
        }
        Ok(SessionPaths::new(self.root.join(id)))
    }

    /// 新建会话：只有根历史条目，可选导入一个源文件
    pub async fn create(
        &self,
        source: Option<&Path>,
        probe: &dyn MediaProbe,
    ) -> Result<Arc<Mutex<Session>>, EditError> {
        let id = uuid::Uuid::new_v4().to_string();
        let paths = self.paths_for(&id)?;
        let created = Session::create(id.clone(), paths.clone(), source, probe).await;
        let session = match created {
            Ok(session) => Arc::new(Mutex::new(session)),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(paths.root()).await;
                return Err(e);
            }
        };
        self.sessions.write().await.insert(id.clone(), session.clone());
        tracing::info!(session = %id, "session created");
        Ok(session)
    }

    /// 取会话；未缓存时从磁盘加载
    pub async fn open(&self, id: &str) -> Result<Arc<Mutex<Session>>, EditError> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return Ok(session.clone());
        }
        let paths = self.paths_for(id)?;
        if !paths.history_file().exists() {
            return Err(EditError::SessionNotFound(id.to_string()));
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }
        let session = Arc::new(Mutex::new(Session::load(id.to_string(), paths).await?));
        sessions.insert(id.to_string(), session.clone());
        tracing::debug!(session = %id, "session loaded from disk");
        Ok(session)
    }

    /// 磁盘上所有会话 id
    pub async fn list(&self) -> Result<Vec<String>, EditError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join("history.json").is_file() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
