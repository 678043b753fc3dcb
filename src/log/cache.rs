//! A bounded cache of recently appended log entries.
//!
//! Entries that are still being shipped to followers or waiting to be applied are served from here instead of from
//! the log. The cache is bounded both by entry count and by total content size; the oldest entries are evicted first.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::error::LogError;
use crate::{Index, Term};

use super::{LogEntry, RaftLog};

pub struct InFlightCache {
    inner: Mutex<Entries>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct Entries {
    map: BTreeMap<Index, LogEntry>,
    total_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl InFlightCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Entries {
                map: BTreeMap::new(),
                total_bytes: 0,
                max_entries,
                max_bytes,
            }),
            enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Caches `entry` at `index`, replacing any entry already cached there. Entries larger than the byte bound on
    /// their own are not cached.
    pub fn put(&self, index: Index, entry: LogEntry) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        let len = entry.content.len();
        if len > inner.max_bytes {
            return;
        }
        if let Some(old) = inner.map.insert(index, entry) {
            inner.total_bytes -= old.content.len();
        }
        inner.total_bytes += len;

        while inner.map.len() > inner.max_entries || inner.total_bytes > inner.max_bytes {
            match inner.pop_first() {
                Some((evicted, _)) if evicted == index => break,
                Some(_) => (),
                None => break,
            }
        }
    }

    pub fn get(&self, index: Index) -> Option<LogEntry> {
        let entry = if self.is_enabled() {
            self.inner.lock().map.get(&index).cloned()
        } else {
            None
        };
        let counter = if entry.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        entry
    }

    pub fn remove(&self, index: Index) -> Option<LogEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.map.remove(&index)?;
        inner.total_bytes -= entry.content.len();
        Some(entry)
    }

    /// Removes all entries at and after `from`, mirroring a log truncation.
    pub fn truncate(&self, from: Index) {
        let mut inner = self.inner.lock();
        let removed = inner.map.split_off(&from);
        let removed_bytes: usize = removed.values().map(|entry| entry.content.len()).sum();
        inner.total_bytes -= removed_bytes;
        if !removed.is_empty() {
            debug!("dropped {} cached entries from {}", removed.len(), from);
        }
    }

    /// Removes all entries at and before `up_to`, once they are no longer needed.
    pub fn prune(&self, up_to: Index) {
        let mut inner = self.inner.lock();
        let kept = inner.map.split_off(&up_to.saturating_add(1));
        let pruned = mem::replace(&mut inner.map, kept);
        inner.total_bytes -= pruned.values().map(|entry| entry.content.len()).sum::<usize>();
    }

    /// Disables the cache, dropping everything held. Subsequent reads miss until re-enabled.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.total_bytes = 0;
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Reads log entries through an [`InFlightCache`], falling back to the log on a miss.
#[derive(Clone, Copy)]
pub struct CachingReader<'a> {
    log: &'a dyn RaftLog,
    cache: &'a InFlightCache,
}

impl<'a> CachingReader<'a> {
    pub fn new(log: &'a dyn RaftLog, cache: &'a InFlightCache) -> Self {
        Self { log, cache }
    }

    /// Reads up to `max_entries` consecutive entries starting at `from`.
    pub fn read(&self, from: Index, max_entries: usize) -> Result<Vec<LogEntry>, LogError> {
        let end = from.saturating_add(max_entries as Index).min(self.log.append_index() + 1);
        let mut entries = Vec::new();
        let mut index = from.max(0);
        while index < end {
            match self.cache.get(index) {
                Some(entry) => entries.push(entry),
                None => {
                    let remaining = (end - index) as usize;
                    let read = self.log.read(index, remaining)?;
                    if read.is_empty() {
                        break;
                    }
                    index += read.len() as Index;
                    entries.extend(read);
                    continue;
                }
            }
            index += 1;
        }
        Ok(entries)
    }

    pub fn read_entry(&self, index: Index) -> Result<Option<LogEntry>, LogError> {
        match self.cache.get(index) {
            Some(entry) => Ok(Some(entry)),
            None => self.log.read_entry(index),
        }
    }

    pub fn read_term(&self, index: Index) -> Result<Option<Term>, LogError> {
        self.log.read_term(index)
    }

    pub fn append_index(&self) -> Index {
        self.log.append_index()
    }
}

impl Entries {
    fn pop_first(&mut self) -> Option<(Index, LogEntry)> {
        let first = *self.map.keys().next()?;
        let entry = self.map.remove(&first)?;
        self.total_bytes -= entry.content.len();
        Some((first, entry))
    }
}
