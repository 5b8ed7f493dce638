// List Store
// Owns the user whitelist / blacklist, validates every change at the boundary
// and writes through to the ConfigStore when one is attached.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{ListItem, ListItemDraft, ListKind};
use crate::services::config_store::{ConfigStore, StoredLists};
use crate::services::detection::list_override::{parse_draft, validate_item, ListOverride, ValidationError};

/// Innocent words that contain lexicon substrings
const DEFAULT_WHITELIST: &[(&str, &str)] = &[
    ("시발점", "ko"),
    ("시발택시", "ko"),
    ("시발역", "ko"),
    ("scunthorpe", "en"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

struct ListState {
    whitelist: Vec<ListItem>,
    blacklist: Vec<ListItem>,
    matcher: Arc<ListOverride>,
}

impl ListState {
    fn new(whitelist: Vec<ListItem>, blacklist: Vec<ListItem>) -> Self {
        let matcher = Arc::new(ListOverride::new(&whitelist, &blacklist));
        Self {
            whitelist,
            blacklist,
            matcher,
        }
    }

    fn items(&self, kind: ListKind) -> &Vec<ListItem> {
        match kind {
            ListKind::Whitelist => &self.whitelist,
            ListKind::Blacklist => &self.blacklist,
        }
    }

    fn items_mut(&mut self, kind: ListKind) -> &mut Vec<ListItem> {
        match kind {
            ListKind::Whitelist => &mut self.whitelist,
            ListKind::Blacklist => &mut self.blacklist,
        }
    }

    fn rebuild(&mut self) {
        self.matcher = Arc::new(ListOverride::new(&self.whitelist, &self.blacklist));
    }
}

pub struct ListStore {
    state: RwLock<ListState>,
    persistence: Option<Arc<ConfigStore>>,
    revision: AtomicU64,
}

impl Default for ListStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ListStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(ListState::new(Vec::new(), Vec::new())),
            persistence: None,
            revision: AtomicU64::new(0),
        }
    }

    /// Load persisted lists; unreadable storage degrades to empty lists
    pub fn with_persistence(store: Arc<ConfigStore>) -> Self {
        let lists = match store.load_lists() {
            Ok(lists) => lists,
            Err(e) => {
                warn!("[list_store] Failed to load lists, starting empty: {}", e);
                StoredLists::default()
            }
        };
        let whitelist = sanitize(ListKind::Whitelist, lists.whitelist);
        let blacklist = sanitize(ListKind::Blacklist, lists.blacklist);
        info!(
            "[list_store] Loaded {} whitelist / {} blacklist items",
            whitelist.len(),
            blacklist.len()
        );
        Self {
            state: RwLock::new(ListState::new(whitelist, blacklist)),
            persistence: Some(store),
            revision: AtomicU64::new(0),
        }
    }

    /// Bumped on every successful change
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Current matcher snapshot
    pub fn snapshot(&self) -> Arc<ListOverride> {
        match self.state.read() {
            Ok(state) => Arc::clone(&state.matcher),
            Err(e) => Arc::clone(&e.into_inner().matcher),
        }
    }

    pub fn get(&self, kind: ListKind) -> Vec<ListItem> {
        match self.state.read() {
            Ok(state) => state.items(kind).clone(),
            Err(e) => e.into_inner().items(kind).clone(),
        }
    }

    pub fn whitelist(&self) -> Vec<ListItem> {
        self.get(ListKind::Whitelist)
    }

    pub fn blacklist(&self) -> Vec<ListItem> {
        self.get(ListKind::Blacklist)
    }

    pub fn add(&self, kind: ListKind, draft: &ListItemDraft) -> Result<ListItem, ValidationError> {
        let item = parse_draft(kind, draft, Utc::now())?;
        self.mutate(|state| {
            let items = state.items_mut(kind);
            if items.iter().any(|existing| existing.same_rule(&item)) {
                return Err(ValidationError::Duplicate(item.text.clone()));
            }
            items.push(item.clone());
            Ok(())
        })?;
        info!("[list_store] Added {:?} item {}", kind, item.id);
        Ok(item)
    }

    pub fn add_whitelist(&self, draft: &ListItemDraft) -> Result<ListItem, ValidationError> {
        self.add(ListKind::Whitelist, draft)
    }

    pub fn add_blacklist(&self, draft: &ListItemDraft) -> Result<ListItem, ValidationError> {
        self.add(ListKind::Blacklist, draft)
    }

    /// Replace a whole list. Every item must validate; duplicates collapse
    /// to their first occurrence.
    pub fn set(&self, kind: ListKind, items: Vec<ListItem>) -> Result<(), ValidationError> {
        for item in &items {
            validate_item(kind, item)?;
        }
        let deduped = dedupe(items);
        self.mutate(|state| {
            *state.items_mut(kind) = deduped;
            Ok(())
        })
    }

    /// Removing an unknown id is reported, not an error
    pub fn remove(&self, kind: ListKind, id: Uuid) -> RemoveOutcome {
        let found = self
            .get(kind)
            .iter()
            .any(|i| i.id == id);
        if !found {
            return RemoveOutcome::NotFound;
        }
        let removed = self.mutate(|state| {
            let items = state.items_mut(kind);
            let before = items.len();
            items.retain(|i| i.id != id);
            Ok(items.len() != before)
        });
        match removed {
            Ok(true) => RemoveOutcome::Removed,
            _ => RemoveOutcome::NotFound,
        }
    }

    /// Add the default whitelist entries that are not present yet
    pub fn seed_defaults(&self) -> usize {
        let mut added = 0;
        for (text, locale) in DEFAULT_WHITELIST {
            let draft = ListItemDraft::new(text, "contains", locale);
            if self.add_whitelist(&draft).is_ok() {
                added += 1;
            }
        }
        added
    }

    /// Apply a change, rebuild the matcher and persist. Nothing changes
    /// when `f` fails.
    fn mutate<T, F>(&self, f: F) -> Result<T, ValidationError>
    where
        F: FnOnce(&mut ListState) -> Result<T, ValidationError>,
    {
        let (value, snapshot) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let value = f(&mut state)?;
            state.rebuild();
            self.revision.fetch_add(1, Ordering::SeqCst);
            let snapshot = StoredLists {
                whitelist: state.whitelist.clone(),
                blacklist: state.blacklist.clone(),
            };
            (value, snapshot)
        };
        if let Some(store) = &self.persistence {
            if let Err(e) = store.save_lists(&snapshot) {
                warn!("[list_store] Failed to persist lists: {}", e);
            }
        }
        Ok(value)
    }
}

fn dedupe(items: Vec<ListItem>) -> Vec<ListItem> {
    let mut out: Vec<ListItem> = Vec::with_capacity(items.len());
    for item in items {
        if !out.iter().any(|existing| existing.same_rule(&item)) {
            out.push(item);
        }
    }
    out
}

/// Drop stored items that no longer validate
fn sanitize(kind: ListKind, items: Vec<ListItem>) -> Vec<ListItem> {
    let valid: Vec<ListItem> = items
        .into_iter()
        .filter(|item| match validate_item(kind, item) {
            Ok(()) => true,
            Err(e) => {
                warn!("[list_store] Dropping stored {:?} item {}: {}", kind, item.id, e);
                false
            }
        })
        .collect();
    dedupe(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Locale;

    #[test]
    fn test_add_rejects_duplicates() {
        let store = ListStore::in_memory();
        let draft = ListItemDraft::new("시발점", "contains", "ko");
        store.add_whitelist(&draft).unwrap();
        assert_eq!(
            store.add_whitelist(&draft),
            Err(ValidationError::Duplicate("시발점".to_string()))
        );
        // Different locale is a different rule
        store.add_whitelist(&ListItemDraft::new("시발점", "contains", "all")).unwrap();
        assert_eq!(store.whitelist().len(), 2);
    }

    #[test]
    fn test_add_updates_snapshot() {
        let store = ListStore::in_memory();
        assert!(!store.snapshot().is_whitelisted("시발점", Locale::Ko));
        store.add_whitelist(&ListItemDraft::new("시발점", "contains", "ko")).unwrap();
        assert!(store.snapshot().is_whitelisted("시발점", Locale::Ko));
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_remove_reports_not_found() {
        let store = ListStore::in_memory();
        let item = store
            .add_blacklist(&ListItemDraft::new("꼰대", "contains", "ko").with_weight(2))
            .unwrap();
        assert_eq!(store.remove(ListKind::Blacklist, item.id), RemoveOutcome::Removed);
        assert_eq!(store.remove(ListKind::Blacklist, item.id), RemoveOutcome::NotFound);
        assert_eq!(store.remove(ListKind::Whitelist, Uuid::new_v4()), RemoveOutcome::NotFound);
        assert!(store.blacklist().is_empty());
    }

    #[test]
    fn test_invalid_add_leaves_state_untouched() {
        let store = ListStore::in_memory();
        assert!(store.add_blacklist(&ListItemDraft::new("꼰대", "contains", "ko")).is_err());
        assert!(store.blacklist().is_empty());
        assert_eq!(store.snapshot().blacklist_len(), 0);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_set_validates_and_dedupes() {
        let store = ListStore::in_memory();
        let a = parse_draft(ListKind::Whitelist, &ListItemDraft::new("ok", "exact", "all"), Utc::now()).unwrap();
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        store.set(ListKind::Whitelist, vec![a.clone(), b]).unwrap();
        assert_eq!(store.whitelist(), vec![a.clone()]);

        let mut blank = a;
        blank.text = " ".to_string();
        assert_eq!(store.set(ListKind::Whitelist, vec![blank]), Err(ValidationError::BlankText));
        assert_eq!(store.whitelist().len(), 1);
    }

    #[test]
    fn test_seed_defaults_is_idempotent() {
        let store = ListStore::in_memory();
        let first = store.seed_defaults();
        assert!(first > 0);
        assert_eq!(store.seed_defaults(), 0);
        assert_eq!(store.whitelist().len(), first);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = std::env::temp_dir().join(format!("cleanchat_lists_{}", Uuid::new_v4()));
        let config = Arc::new(ConfigStore::new(dir.clone()));
        {
            let store = ListStore::with_persistence(Arc::clone(&config));
            store
                .add_blacklist(&ListItemDraft::new("월급루팡", "contains", "ko").with_weight(3))
                .unwrap();
        }
        let reloaded = ListStore::with_persistence(config);
        assert_eq!(reloaded.blacklist().len(), 1);
        assert_eq!(reloaded.snapshot().blacklist_matches("저 월급루팡", Locale::Ko).len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_storage_degrades_to_empty() {
        let dir = std::env::temp_dir().join(format!("cleanchat_lists_bad_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("lists.json"), "{not json").unwrap();
        let store = ListStore::with_persistence(Arc::new(ConfigStore::new(dir.clone())));
        assert!(store.whitelist().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }
}
