// Hierarchical key/value store: every subgroup is a prefixed view over one shared map.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::config::{GROUP_SEPARATOR, SAFE_KEY_CHARS};
use crate::error::{Error, Result};

/// Called with the full backing map each time a commit reaches the root.
///
/// Runs synchronously while the storage mutex is held, so it must not call
/// back into the store. Whatever it costs is paid by every committing
/// `set` and blocks other users of the tree meanwhile; on an async runtime
/// that includes the worker thread. Use `lock()`/`batch()` to fold many
/// writes into one commit.
pub type CommitHook = Box<dyn Fn(&BTreeMap<String, String>) + Send + Sync>;

type SharedMap = Arc<Mutex<BTreeMap<String, String>>>;

fn is_safe_char(c: char) -> bool {
    SAFE_KEY_CHARS.contains(c)
}

pub struct ParameterStore {
    storage: SharedMap,
    prefix: String,
    locked: AtomicBool,
    dirty: AtomicBool,
    parent: Option<Arc<ParameterStore>>,
    hook: Option<CommitHook>,
    commits: AtomicU64,
}

impl ParameterStore {
    /// Create an empty root store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::root(None))
    }

    /// Create an empty root store whose commits invoke `hook`.
    pub fn with_commit_hook(hook: CommitHook) -> Arc<Self> {
        Arc::new(Self::root(Some(hook)))
    }

    fn root(hook: Option<CommitHook>) -> Self {
        Self {
            storage: Arc::new(Mutex::new(BTreeMap::new())),
            prefix: String::new(),
            locked: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            parent: None,
            hook,
            commits: AtomicU64::new(0),
        }
    }

    /// Return a view over the same storage with `name` + separator appended to the prefix.
    pub fn subgroup(self: &Arc<Self>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            storage: Arc::clone(&self.storage),
            prefix: format!("{}{}{}", self.prefix, name, GROUP_SEPARATOR),
            locked: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            parent: Some(Arc::clone(self)),
            hook: None,
            commits: AtomicU64::new(0),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Look up `name`. Returns `None` when absent.
    pub fn get(&self, name: &str) -> Option<String> {
        self.storage.lock().get(&self.full_key(name)).cloned()
    }

    /// Look up `name`, falling back to `default`.
    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    /// Like [`get_or`](Self::get_or), but characters outside the safe set are
    /// rewritten to `_` in the key before the lookup.
    pub fn get_strict(&self, name: &str, default: &str) -> String {
        let key: String = name
            .chars()
            .map(|c| if is_safe_char(c) { c } else { '_' })
            .collect();
        self.get_or(&key, default)
    }

    /// Store `value` and commit, or mark dirty while locked.
    pub fn set(&self, name: &str, value: impl Into<String>) -> &Self {
        self.storage.lock().insert(self.full_key(name), value.into());
        self.changed();
        self
    }

    /// Insert only if absent. Never commits.
    pub fn set_default(&self, name: &str, value: impl Into<String>) {
        self.storage
            .lock()
            .entry(self.full_key(name))
            .or_insert_with(|| value.into());
    }

    pub fn erase(&self, name: &str) -> &Self {
        self.storage.lock().remove(&self.full_key(name));
        self
    }

    /// Parse a numeric value. A missing key yields `T::default()`, a malformed
    /// one a conversion error.
    pub fn get_num<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr + Default,
    {
        match self.get(name) {
            None => Ok(T::default()),
            Some(raw) => raw.trim().parse::<T>().map_err(|_| Error::Conversion {
                key: self.full_key(name),
                value: raw,
            }),
        }
    }

    /// Parse a numeric value, using `default` when missing or malformed.
    pub fn get_num_or<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr,
    {
        self.get(name)
            .and_then(|raw| raw.trim().parse::<T>().ok())
            .unwrap_or(default)
    }

    pub fn set_num<T: Display>(&self, name: &str, value: T) -> &Self {
        self.set(name, value.to_string())
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(v) if !v.is_empty() => matches!(v.as_bytes()[0], b'y' | b't' | b'1'),
            _ => default,
        }
    }

    pub fn set_bool(&self, name: &str, value: bool) -> &Self {
        self.set(name, if value { "y" } else { "n" })
    }

    /// Remove this node's direct keys. Nested subgroup keys are kept.
    pub fn clear(&self) -> &Self {
        let keys = self.enum_keys();
        let mut map = self.storage.lock();
        for key in keys {
            map.remove(&self.full_key(&key));
        }
        self
    }

    /// Remove every key in the shared storage, including keys owned by the
    /// parent and by sibling subgroups.
    pub fn clear_all(&self) -> &Self {
        self.storage.lock().clear();
        self
    }

    /// Start batching: writes mark the node dirty instead of committing.
    pub fn lock(&self) -> &Self {
        self.locked.store(true, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
        self
    }

    /// Stop batching. Commits once if anything was written while locked.
    pub fn unlock(&self) -> &Self {
        self.locked.store(false, Ordering::SeqCst);
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.commit();
        }
        self
    }

    /// Leave batching mode without committing what was written meanwhile.
    pub(crate) fn unlock_discarding(&self) {
        self.locked.store(false, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Lock now and unlock when the guard drops.
    pub fn batch(&self) -> BatchGuard<'_> {
        self.lock();
        BatchGuard { store: self }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Number of commits this node has seen, including ones forwarded by children.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn changed(&self) {
        if self.is_locked() {
            self.dirty.store(true, Ordering::SeqCst);
        } else {
            self.commit();
        }
    }

    fn commit(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
        match &self.parent {
            Some(parent) => parent.commit(),
            None => self.run_hook(),
        }
    }

    fn run_hook(&self) {
        if let Some(hook) = &self.hook {
            let map = self.storage.lock();
            hook(&map);
        }
    }

    /// Flush the whole tree through the root's hook.
    pub fn sync(&self) -> bool {
        match &self.parent {
            Some(parent) => parent.sync(),
            None => {
                self.run_hook();
                true
            }
        }
    }

    /// Direct children of this prefix, with the prefix stripped.
    pub fn enum_keys(&self) -> Vec<String> {
        let map = self.storage.lock();
        map.keys()
            .filter_map(|key| key.strip_prefix(self.prefix.as_str()))
            .filter(|rest| !rest.contains(GROUP_SEPARATOR))
            .map(str::to_string)
            .collect()
    }

    /// Whether `name` exists. With `use_blank`, an empty value counts as absent.
    pub fn contains(&self, name: &str, use_blank: bool) -> bool {
        match self.storage.lock().get(&self.full_key(name)) {
            Some(v) => !use_blank || !v.is_empty(),
            None => false,
        }
    }

    /// Strip characters outside the safe set from the value of `name`.
    ///
    /// Returns `false` only if filtering left the value empty.
    pub fn filter_parameter(&self, name: &str) -> bool {
        let Some(value) = self.get(name) else {
            debug!("filter_parameter: {} is not in the store", name);
            return true;
        };
        let filtered: String = value.chars().filter(|c| is_safe_char(*c)).collect();
        if filtered == value {
            return true;
        }
        debug!(
            "filtered parameter {} from '{}' to '{}'",
            name, value, filtered
        );
        let empty = filtered.is_empty();
        self.set(name, filtered);
        !empty
    }

    /// Import key/value pairs under this prefix. With `replace = false`
    /// existing keys are preserved.
    pub fn from_map<I, K, V>(&self, entries: I, clear_before: bool, replace: bool)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        if clear_before {
            self.clear();
        }
        {
            let mut map = self.storage.lock();
            for (k, v) in entries {
                let key = self.full_key(k.as_ref());
                if replace || !map.contains_key(&key) {
                    map.insert(key, v.into());
                }
            }
        }
        self.changed();
    }

    /// Import the direct keys of another node.
    pub fn from_parameters(&self, other: &ParameterStore, clear_before: bool, replace: bool) {
        let entries = other.to_map();
        self.from_map(entries, clear_before, replace);
    }

    /// Import a JSON object. Objects recurse into subgroups, strings and
    /// integers become values, everything else is ignored.
    pub fn from_json(self: &Arc<Self>, json: &Value, clear_before: bool, replace: bool) -> Result<()> {
        let Value::Object(members) = json else {
            return Err(Error::Usage("JSON import expects an object".to_string()));
        };
        if clear_before {
            self.clear();
        }
        let mut leaves: Vec<(String, String)> = Vec::new();
        for (k, v) in members {
            match v {
                Value::Object(_) => self.subgroup(k).from_json(v, false, replace)?,
                Value::String(s) => leaves.push((k.clone(), s.clone())),
                Value::Number(n) if n.is_i64() || n.is_u64() => {
                    leaves.push((k.clone(), n.to_string()))
                }
                _ => {}
            }
        }
        self.from_map(leaves, false, replace);
        Ok(())
    }

    /// Export the direct keys of this node.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let map = self.storage.lock();
        map.iter()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(self.prefix.as_str())?;
                if rest.contains(GROUP_SEPARATOR) {
                    return None;
                }
                Some((rest.to_string(), value.clone()))
            })
            .collect()
    }

    /// Copy of the entire shared storage, full keys included.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.storage.lock().clone()
    }
}

/// Keeps a store locked for its lifetime; unlocking (and the single flush) runs on drop.
pub struct BatchGuard<'a> {
    store: &'a ParameterStore,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.store.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_across_subgroup() {
        let root = ParameterStore::new();
        let machine = root.subgroup("machine");
        machine.set("cpus", "4");

        assert_eq!(machine.get("cpus").as_deref(), Some("4"));
        assert_eq!(root.get("machine.cpus").as_deref(), Some("4"));
        assert_eq!(root.get("cpus"), None);

        root.set("machine.memory", "2048");
        assert_eq!(machine.get_or("memory", ""), "2048");
    }

    #[test]
    fn test_strict_get_rewrites_key() {
        let root = ParameterStore::new();
        root.set("a_b_c", "ok");
        assert_eq!(root.get_strict("a/b c", "none"), "ok");
        assert_eq!(root.get_or("a/b c", "none"), "none");
    }

    #[test]
    fn test_set_default_does_not_overwrite_or_commit() {
        let root = ParameterStore::new();
        root.set("cpus", "2");
        let commits = root.commit_count();

        root.set_default("cpus", "1");
        root.set_default("memory", "512");

        assert_eq!(root.get_or("cpus", ""), "2");
        assert_eq!(root.get_or("memory", ""), "512");
        assert_eq!(root.commit_count(), commits);
    }

    #[test]
    fn test_numeric_codec() {
        let root = ParameterStore::new();
        root.set_num("memory", 2048i64);
        assert_eq!(root.get_num::<i64>("memory").unwrap(), 2048);
        assert_eq!(root.get_num::<i32>("missing").unwrap(), 0);

        root.set("broken", "12abc");
        let err = root.get_num::<i32>("broken").unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
        assert_eq!(root.get_num_or("broken", 7), 7);
    }

    #[test]
    fn test_bool_codec() {
        let root = ParameterStore::new();
        root.set_bool("a", true);
        assert_eq!(root.get_or("a", ""), "y");
        root.set("b", "true");
        root.set("c", "1");
        root.set("d", "no");
        assert!(root.get_bool("a", false));
        assert!(root.get_bool("b", false));
        assert!(root.get_bool("c", false));
        assert!(!root.get_bool("d", true));
        assert!(root.get_bool("missing", true));
    }

    #[test]
    fn test_enum_keys_excludes_other_groups() {
        let root = ParameterStore::new();
        let local = root.subgroup("local");
        let machine = root.subgroup("machine");
        root.set("name", "x");
        local.set("contextImage", "/tmp/ctx.iso");
        machine.set("cpus", "1");
        local.subgroup("nested").set("deep", "1");

        assert_eq!(root.enum_keys(), vec!["name".to_string()]);
        assert_eq!(local.enum_keys(), vec!["contextImage".to_string()]);
        assert_eq!(machine.enum_keys(), vec!["cpus".to_string()]);
    }

    #[test]
    fn test_clear_is_scoped_and_clear_all_is_not() {
        let root = ParameterStore::new();
        let local = root.subgroup("local");
        root.set("name", "x");
        local.set("a", "1");

        local.clear();
        assert!(!local.contains("a", false));
        assert!(root.contains("name", false));

        local.set("a", "1");
        local.clear_all();
        assert!(root.snapshot().is_empty());
    }

    #[test]
    fn test_lock_commits_once() {
        let root = ParameterStore::new();
        root.lock();
        for i in 0..10 {
            root.set(&format!("k{}", i), "v");
        }
        assert_eq!(root.commit_count(), 0);
        root.unlock();
        assert_eq!(root.commit_count(), 1);

        root.lock();
        root.unlock();
        assert_eq!(root.commit_count(), 1);
    }

    #[test]
    fn test_batch_guard_flushes_on_early_return() {
        fn write_then_bail(store: &ParameterStore) -> Result<()> {
            let _batch = store.batch();
            store.set("a", "1");
            store.set("b", "2");
            Err(Error::Usage("bail".into()))
        }
        let root = ParameterStore::new();
        assert!(write_then_bail(&root).is_err());
        assert!(!root.is_locked());
        assert_eq!(root.commit_count(), 1);
    }

    #[test]
    fn test_subgroup_commit_reaches_root_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let root = ParameterStore::with_commit_hook(Box::new(move |map| {
            sink.lock().push(map.len());
        }));
        let sub = root.subgroup("user-data");
        sub.set("x", "1");
        sub.set("y", "2");
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(root.commit_count(), 2);
    }

    #[test]
    fn test_filter_parameter() {
        let root = ParameterStore::new();
        root.set("ok", "abc!@#");
        root.set("bad", "!@#");
        root.set("clean", "abc");

        assert!(root.filter_parameter("ok"));
        assert_eq!(root.get_or("ok", ""), "abc");
        assert!(!root.filter_parameter("bad"));
        assert_eq!(root.get_or("bad", "x"), "");
        assert!(root.filter_parameter("clean"));
        assert!(root.filter_parameter("missing"));
    }

    #[test]
    fn test_from_map_replace_flag() {
        let root = ParameterStore::new();
        root.set("a", "old");
        root.from_map([("a", "new"), ("b", "new")], false, false);
        assert_eq!(root.get_or("a", ""), "old");
        assert_eq!(root.get_or("b", ""), "new");

        root.from_map([("a", "new")], false, true);
        assert_eq!(root.get_or("a", ""), "new");
    }

    #[test]
    fn test_from_json_recurses_and_ignores_other_leaves() {
        let root = ParameterStore::new();
        let doc = json!({
            "name": "vm",
            "cpus": 2,
            "ratio": 0.5,
            "enabled": true,
            "list": [1, 2],
            "machine": { "memory": 1024, "inner": { "deep": "x" } }
        });
        root.from_json(&doc, false, true).unwrap();

        assert_eq!(root.get_or("name", ""), "vm");
        assert_eq!(root.get_or("cpus", ""), "2");
        assert!(!root.contains("ratio", false));
        assert!(!root.contains("enabled", false));
        assert!(!root.contains("list", false));
        assert_eq!(root.get_or("machine.memory", ""), "1024");
        assert_eq!(root.get_or("machine.inner.deep", ""), "x");
    }

    #[test]
    fn test_from_parameters_copies_direct_keys() {
        let src = ParameterStore::new();
        src.set("a", "1");
        src.subgroup("g").set("b", "2");

        let dst = ParameterStore::new();
        let target = dst.subgroup("copy");
        target.from_parameters(&src, false, true);
        assert_eq!(dst.get_or("copy.a", ""), "1");
        assert!(!dst.contains("copy.g.b", false));
    }

    #[test]
    fn test_concurrent_writers_share_one_map() {
        let root = ParameterStore::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let group = root.subgroup(&format!("t{}", t));
                std::thread::spawn(move || {
                    for i in 0..100 {
                        group.set_num(&format!("k{}", i), i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(root.snapshot().len(), 400);
    }
}
