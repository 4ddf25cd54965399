//! 播放列表：维护条目顺序和当前位置，决定下一首/上一首。

use crate::core::log_ctx;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 播放列表条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub path: PathBuf,
    pub title: String,
    /// 时长（秒），未知时为 None
    pub duration: Option<f64>,
}

impl PlaylistEntry {
    /// 以文件名（不含扩展名）作为标题
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            title,
            duration: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct Playlist {
    entries: Vec<PlaylistEntry>,
    current: Option<usize>,
    rng: StdRng,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Playlist {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// 固定随机种子（随机播放可复现）
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            entries: Vec::new(),
            current: None,
            rng,
        }
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// 追加条目；第一个条目自动成为当前条目
    pub fn add(&mut self, entry: PlaylistEntry) {
        debug!("{} ➕ 加入播放列表: {}", log_ctx(), entry.title);
        self.entries.push(entry);
        if self.current.is_none() {
            self.current = Some(0);
        }
    }

    /// 删除条目；越界忽略。当前位置超出新长度时落到最后一个条目
    pub fn remove(&mut self, index: usize) -> Option<PlaylistEntry> {
        if index >= self.entries.len() {
            return None;
        }
        let removed = self.entries.remove(index);
        if self.entries.is_empty() {
            self.current = None;
        } else if let Some(current) = self.current {
            if current >= self.entries.len() {
                self.current = Some(self.entries.len() - 1);
            }
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current = None;
    }

    pub fn current(&self) -> Option<&PlaylistEntry> {
        self.current.and_then(|i| self.entries.get(i))
    }

    /// 跳到指定条目；越界忽略
    pub fn set_index(&mut self, index: usize) -> bool {
        if index < self.entries.len() {
            self.current = Some(index);
            true
        } else {
            false
        }
    }

    /// 前进到下一个条目
    ///
    /// 随机模式下任选一个条目。顺序模式下走到结尾时：循环则回到第一个，
    /// 否则清除当前位置并返回 None。
    pub fn next(&mut self, repeat: bool, shuffle: bool) -> Option<&PlaylistEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let next = if shuffle {
            self.rng.gen_range(0..self.entries.len())
        } else {
            match self.current {
                None => 0,
                Some(current) if current + 1 < self.entries.len() => current + 1,
                Some(_) if repeat => 0,
                Some(_) => {
                    self.current = None;
                    return None;
                }
            }
        };
        self.current = Some(next);
        self.current()
    }

    /// 回到上一个条目；第一个条目之前：循环则跳到最后一个，否则停在第一个
    pub fn previous(&mut self, repeat: bool) -> Option<&PlaylistEntry> {
        let current = self.current?;
        if self.entries.is_empty() {
            return None;
        }
        self.current = Some(match current {
            0 if repeat => self.entries.len() - 1,
            0 => 0,
            n => n - 1,
        });
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(names: &[&str]) -> Playlist {
        let mut playlist = Playlist::with_seed(7);
        for name in names {
            playlist.add(PlaylistEntry::new(format!("/media/{}.mp4", name)));
        }
        playlist
    }

    fn title(entry: Option<&PlaylistEntry>) -> Option<&str> {
        entry.map(|e| e.title.as_str())
    }

    #[test]
    fn first_added_entry_becomes_current() {
        let mut playlist = Playlist::new();
        assert!(playlist.current().is_none());
        playlist.add(PlaylistEntry::new("/media/a.mkv"));
        playlist.add(PlaylistEntry::new("/media/b.mkv"));
        assert_eq!(playlist.current_index(), Some(0));
        assert_eq!(title(playlist.current()), Some("a"));
    }

    #[test]
    fn next_stops_at_end_without_repeat() {
        let mut playlist = playlist(&["a", "b"]);
        assert_eq!(title(playlist.next(false, false)), Some("b"));
        assert!(playlist.next(false, false).is_none());
        assert!(playlist.current().is_none());
        // 没有当前位置时从头开始
        assert_eq!(title(playlist.next(false, false)), Some("a"));
    }

    #[test]
    fn next_wraps_with_repeat() {
        let mut playlist = playlist(&["a", "b", "c"]);
        playlist.set_index(2);
        assert_eq!(title(playlist.next(true, false)), Some("a"));
    }

    #[test]
    fn previous_wraps_or_stays_at_first() {
        let mut playlist = playlist(&["a", "b", "c"]);
        assert_eq!(title(playlist.previous(false)), Some("a"));
        assert_eq!(title(playlist.previous(true)), Some("c"));
        assert_eq!(title(playlist.previous(false)), Some("b"));
    }

    #[test]
    fn remove_keeps_current_in_range() {
        let mut playlist = playlist(&["a", "b", "c"]);
        playlist.set_index(2);
        assert!(playlist.remove(9).is_none());
        assert_eq!(playlist.remove(2).map(|e| e.title), Some("c".to_string()));
        assert_eq!(playlist.current_index(), Some(1));
        playlist.remove(0);
        playlist.remove(0);
        assert!(playlist.is_empty());
        assert!(playlist.current_index().is_none());
    }

    #[test]
    fn set_index_ignores_out_of_range() {
        let mut playlist = playlist(&["a", "b"]);
        assert!(!playlist.set_index(5));
        assert_eq!(playlist.current_index(), Some(0));
        playlist.clear();
        assert!(playlist.next(true, true).is_none());
        assert!(playlist.previous(true).is_none());
    }

    #[test]
    fn shuffle_picks_entries_within_range() {
        let mut playlist = playlist(&["a", "b", "c", "d"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            assert!(playlist.next(false, true).is_some());
            let index = playlist.current_index().unwrap();
            assert!(index < 4);
            seen.insert(index);
        }
        assert!(seen.len() > 1);
    }
}
