//! 会话历史：以稳定下标寻址的条目 arena + 父链接构成的树，外加一个可移动的当前指针
//!
//! undo 只移动指针，不删除后代；redo 回到最近创建的子条目。从根到当前指针的路径即活动线性历史。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::EditError;
use crate::session::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// 会话创建时的根状态
    Initial,
    /// 一次完整成功的编辑请求
    Committed,
}

/// 一个已提交的会话状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub index: usize,
    pub parent: Option<usize>,
    /// 结果资产名称（空会话的根为 None）
    pub asset: Option<String>,
    /// 已接受脚本的路径（相对会话目录）
    #[serde(default)]
    pub scripts: Vec<PathBuf>,
    /// 执行报告路径（相对会话目录）
    pub report: Option<PathBuf>,
    pub prompt: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: EntryStatus,
}

/// 提交一个新条目所需的内容
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub asset: Option<String>,
    pub scripts: Vec<PathBuf>,
    pub report: Option<PathBuf>,
    pub prompt: Option<String>,
    pub request_id: Option<String>,
}

/// 树形视图节点（get_history 返回）
#[derive(Debug, Clone, Serialize)]
pub struct HistoryNode {
    #[serde(flatten)]
    pub entry: HistoryEntry,
    pub is_current: bool,
    pub children: Vec<HistoryNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(rename = "current_index")]
    current: usize,
    entries: Vec<HistoryEntry>,
}

impl History {
    /// 新历史：只有根条目，当前指针指向根
    pub fn new(root_asset: Option<String>) -> Self {
        Self {
            current: 0,
            entries: vec![HistoryEntry {
                index: 0,
                parent: None,
                asset: root_asset,
                scripts: Vec::new(),
                report: None,
                prompt: None,
                request_id: None,
                timestamp: Utc::now(),
                status: EntryStatus::Initial,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &HistoryEntry {
        &self.entries[self.current]
    }

    /// 当前状态对应的资产名称
    pub fn current_asset(&self) -> Option<&str> {
        self.current().asset.as_deref()
    }

    /// 以当前条目为父追加一个条目并前移指针，返回新下标
    pub fn commit(&mut self, new: NewEntry) -> usize {
        let index = self.entries.len();
        self.entries.push(HistoryEntry {
            index,
            parent: Some(self.current),
            asset: new.asset,
            scripts: new.scripts,
            report: new.report,
            prompt: new.prompt,
            request_id: new.request_id,
            timestamp: Utc::now(),
            status: EntryStatus::Committed,
        });
        self.current = index;
        index
    }

    pub fn set_current(&mut self, index: usize) -> Result<(), EditError> {
        if index >= self.entries.len() {
            return Err(EditError::HistoryNotFound(index));
        }
        self.current = index;
        Ok(())
    }

    /// 移到父条目；根没有父条目
    pub fn undo(&mut self) -> Result<usize, EditError> {
        let parent = self
            .current()
            .parent
            .ok_or(EditError::HistoryNotFound(self.current))?;
        self.current = parent;
        Ok(parent)
    }

    /// 移到最近创建的子条目
    pub fn redo(&mut self) -> Result<usize, EditError> {
        let child = self
            .children(self.current)
            .last()
            .copied()
            .ok_or(EditError::HistoryNotFound(self.current))?;
        self.current = child;
        Ok(child)
    }

    /// 子条目下标（按创建顺序）
    pub fn children(&self, index: usize) -> Vec<usize> {
        self.entries
            .iter()
            .filter(|e| e.parent == Some(index))
            .map(|e| e.index)
            .collect()
    }

    /// 从根到当前指针的下标序列
    pub fn active_path(&self) -> Vec<usize> {
        let mut path = vec![self.current];
        let mut cursor = self.current().parent;
        while let Some(i) = cursor {
            path.push(i);
            cursor = self.entries[i].parent;
        }
        path.reverse();
        path
    }

    pub fn tree(&self) -> HistoryNode {
        self.node(0)
    }

    fn node(&self, index: usize) -> HistoryNode {
        HistoryNode {
            entry: self.entries[index].clone(),
            is_current: index == self.current,
            children: self.children(index).into_iter().map(|c| self.node(c)).collect(),
        }
    }

    /// 缩进文本树（CLI 展示用），当前条目以 `*` 标记
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(0, 0, &mut out);
        out
    }

    fn render_node(&self, index: usize, depth: usize, out: &mut String) {
        let e = &self.entries[index];
        let marker = if index == self.current { "*" } else { " " };
        let label = e.prompt.as_deref().unwrap_or("(initial)");
        let asset = e.asset.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "{}{} [{}] {} -> {}\n",
            "  ".repeat(depth),
            marker,
            index,
            label,
            asset
        ));
        for child in self.children(index) {
            self.render_node(child, depth + 1, out);
        }
    }

    /// 结构检查：下标连续、父条目先于子条目、指针有效
    fn check(&self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("history has no root".to_string());
        }
        for (i, e) in self.entries.iter().enumerate() {
            if e.index != i {
                return Err(format!("entry {} stored at position {}", e.index, i));
            }
            match e.parent {
                None if i != 0 => return Err(format!("entry {} has no parent", i)),
                Some(p) if p >= i => return Err(format!("entry {} has parent {}", i, p)),
                _ => {}
            }
        }
        if self.current >= self.entries.len() {
            return Err(format!("current index {} out of range", self.current));
        }
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, EditError> {
        let history: History = read_json(path)
            .await
            .map_err(|e| EditError::Persistence(format!("{}: {}", path.display(), e)))?;
        history
            .check()
            .map_err(|e| EditError::Persistence(format!("{}: {}", path.display(), e)))?;
        Ok(history)
    }

    pub async fn save(&self, path: &Path) -> Result<(), EditError> {
        write_json_atomic(path, self)
            .await
            .map_err(|e| EditError::Persistence(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(asset: &str) -> NewEntry {
        NewEntry {
            asset: Some(asset.to_string()),
            prompt: Some(format!("make {}", asset)),
            ..Default::default()
        }
    }

    #[test]
    fn test_commit_advances_pointer() {
        let mut h = History::new(Some("clip.mp4".to_string()));
        assert_eq!(h.current_asset(), Some("clip.mp4"));
        let i = h.commit(entry("a.mp4"));
        assert_eq!(i, 1);
        assert_eq!(h.current().parent, Some(0));
        assert_eq!(h.current_asset(), Some("a.mp4"));
        assert_eq!(h.active_path(), vec![0, 1]);
    }

    #[test]
    fn test_undo_then_redo_restores_asset() {
        let mut h = History::new(Some("clip.mp4".to_string()));
        h.commit(entry("a.mp4"));
        let before = h.current_asset().map(String::from);
        assert_eq!(h.undo().unwrap(), 0);
        assert_eq!(h.current_asset(), Some("clip.mp4"));
        assert_eq!(h.redo().unwrap(), 1);
        assert_eq!(h.current_asset().map(String::from), before);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_undo_at_root_and_redo_at_leaf_fail() {
        let mut h = History::new(None);
        assert!(matches!(h.undo(), Err(EditError::HistoryNotFound(0))));
        assert!(matches!(h.redo(), Err(EditError::HistoryNotFound(0))));
        assert!(matches!(h.set_current(3), Err(EditError::HistoryNotFound(3))));
    }

    #[test]
    fn test_branching_keeps_undone_entries() {
        let mut h = History::new(Some("clip.mp4".to_string()));
        h.commit(entry("a.mp4"));
        h.commit(entry("b.mp4"));
        h.set_current(1).unwrap();
        let c = h.commit(entry("c.mp4"));
        assert_eq!(c, 3);
        assert_eq!(h.children(1), vec![2, 3]);
        assert_eq!(h.active_path(), vec![0, 1, 3]);
        // 旧分支仍可寻址
        h.set_current(2).unwrap();
        assert_eq!(h.current_asset(), Some("b.mp4"));
        // redo 选最近创建的子条目
        h.set_current(1).unwrap();
        assert_eq!(h.redo().unwrap(), 3);

        let tree = h.tree();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].children.len(), 2);
        assert!(tree.children[0].children[1].is_current);
        assert!(h.render().contains("* [3] make c.mp4 -> c.mp4"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let mut h = History::new(Some("clip.mp4".to_string()));
        h.commit(entry("a.mp4"));
        h.undo().unwrap();
        h.save(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"current_index\": 0"));
        let loaded = History::load(&path).await.unwrap();
        assert_eq!(loaded, h);
    }

    #[tokio::test]
    async fn test_load_rejects_broken_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let mut h = History::new(None);
        h.commit(entry("a.mp4"));
        let mut value = serde_json::to_value(&h).unwrap();
        value["current_index"] = serde_json::json!(9);
        std::fs::write(&path, value.to_string()).unwrap();
        assert!(matches!(History::load(&path).await, Err(EditError::Persistence(_))));
    }
}
