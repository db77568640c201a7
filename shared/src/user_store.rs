//! Player record persistence.
//!
//! Each player lives in its own file, `<dir>/<name>`, holding
//! `hp exp x y` on one line.

use crate::ring::{user_ring_id, KeyRange};
use crate::{is_valid_name, Error, Result, UserRecord};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub trait UserStore {
    fn load(&self, name: &str) -> Result<Option<UserRecord>>;

    fn save(&mut self, record: &UserRecord) -> Result<()>;

    /// Every stored record whose name hashes into `range`.
    fn list_in_range(&self, range: KeyRange) -> Result<Vec<UserRecord>>;
}

#[derive(Debug)]
pub struct FileUserStore {
    dir: PathBuf,
}

impl FileUserStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            Error::resource(format!("cannot create users directory {}: {}", dir.display(), err))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(Error::malformed(format!("invalid player name {:?}", name)));
        }
        Ok(self.dir.join(name))
    }
}

fn parse_record(name: &str, contents: &str) -> Result<UserRecord> {
    let invalid = || Error::resource(format!("corrupt user file for {}", name));
    let mut fields = contents.split_whitespace();
    let mut next = || fields.next().ok_or_else(invalid);
    let hp = next()?.parse().map_err(|_| invalid())?;
    let exp = next()?.parse().map_err(|_| invalid())?;
    let x = next()?.parse().map_err(|_| invalid())?;
    let y = next()?.parse().map_err(|_| invalid())?;
    let record = UserRecord::new(name, hp, exp, x, y);
    record.validate().map_err(|_| invalid())?;
    Ok(record)
}

impl UserStore for FileUserStore {
    fn load(&self, name: &str) -> Result<Option<UserRecord>> {
        let path = self.path_of(name)?;
        match fs::read_to_string(&path) {
            Ok(contents) => parse_record(name, &contents).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::resource(format!(
                "cannot read {}: {}",
                path.display(),
                err
            ))),
        }
    }

    fn save(&mut self, record: &UserRecord) -> Result<()> {
        record.validate()?;
        let path = self.path_of(&record.name)?;
        let line = format!("{} {} {} {}\n", record.hp, record.exp, record.x, record.y);
        fs::write(&path, line).map_err(|err| {
            Error::resource(format!("cannot write {}: {}", path.display(), err))
        })?;
        debug!("saved {} to {}", record.name, path.display());
        Ok(())
    }

    fn list_in_range(&self, range: KeyRange) -> Result<Vec<UserRecord>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            Error::resource(format!("cannot list {}: {}", self.dir.display(), err))
        })?;
        let mut users = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !is_valid_name(name) || !range.contains(user_ring_id(name)) {
                continue;
            }
            match self.load(name) {
                Ok(Some(record)) => users.push(record),
                Ok(None) => {}
                Err(err) => warn!("skipping user file {}: {}", name, err),
            }
        }
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }
}

/// In-memory store for tests and tools.
#[derive(Debug, Default, Clone)]
pub struct MemoryUserStore {
    records: BTreeMap<String, UserRecord>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl UserStore for MemoryUserStore {
    fn load(&self, name: &str) -> Result<Option<UserRecord>> {
        Ok(self.records.get(name).cloned())
    }

    fn save(&mut self, record: &UserRecord) -> Result<()> {
        record.validate()?;
        self.records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn list_in_range(&self, range: KeyRange) -> Result<Vec<UserRecord>> {
        Ok(self
            .records
            .values()
            .filter(|record| range.contains(user_ring_id(&record.name)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RING_SIZE;
    use tempfile::tempdir;

    #[test]
    fn test_file_format() {
        let dir = tempdir().unwrap();
        let mut store = FileUserStore::open(dir.path().join("users")).unwrap();
        let alice = UserRecord::new("alice", 104, 12, 7, 93);

        store.save(&alice).unwrap();
        let written = fs::read_to_string(store.dir().join("alice")).unwrap();
        assert_eq!(written, "104 12 7 93\n");
        assert_eq!(store.load("alice").unwrap(), Some(alice));
        assert_eq!(store.load("nobody").unwrap(), None);
    }

    #[test]
    fn test_rejects_bad_names_and_files() {
        let dir = tempdir().unwrap();
        let mut store = FileUserStore::open(dir.path()).unwrap();
        assert!(store.load("../etc").is_err());
        assert!(store.save(&UserRecord::new("a b", 1, 1, 1, 1)).is_err());

        fs::write(dir.path().join("broken"), "12 x").unwrap();
        assert!(store.load("broken").is_err());
    }

    #[test]
    fn test_list_in_range() {
        let dir = tempdir().unwrap();
        let mut store = FileUserStore::open(dir.path()).unwrap();
        let names = ["alice", "bob", "carol", "dave"];
        for name in names {
            store.save(&UserRecord::new(name, 100, 0, 1, 1)).unwrap();
        }

        let all = store.list_in_range(KeyRange::new(0, RING_SIZE - 1)).unwrap();
        assert_eq!(all.len(), names.len());

        let bob = user_ring_id("bob");
        let only_bob = store.list_in_range(KeyRange::new(bob, bob)).unwrap();
        assert!(only_bob.iter().any(|r| r.name == "bob"));
        assert!(only_bob.iter().all(|r| user_ring_id(&r.name) == bob));
    }

    #[test]
    fn test_memory_store_matches_file_store() {
        let mut memory = MemoryUserStore::new();
        memory.save(&UserRecord::new("alice", 1, 2, 3, 4)).unwrap();
        let id = user_ring_id("alice");
        assert_eq!(memory.list_in_range(KeyRange::new(id, id)).unwrap().len(), 1);
        assert!(memory
            .list_in_range(KeyRange::new((id + 1) % RING_SIZE, (id + 2) % RING_SIZE))
            .unwrap()
            .is_empty());
    }
}
