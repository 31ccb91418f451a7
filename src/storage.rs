//! Event store: primary records plus secondary indexes on a key-value engine.
//!
//! Key layout (all keys are UTF-8, `\0` separates components):
//!
//! - `ev\0<id>` – event JSON (primary record)
//! - `tomb\0<id>` – tombstone written by an authorised delete
//! - `latest\0<kind>\0<pubkey>\0<d>` – newest version of a replaceable event
//! - `ic\0<ts>\0<id>` – every event by time
//! - `ia\0<pubkey>\0<ts>\0<id>` – by author
//! - `ik\0<kind>\0<ts>\0<id>` – by kind
//! - `ig\0<tag>\0<value>\0<ts>\0<id>` – by single-letter tag
//!
//! `<ts>` is `u64::MAX - created_at` in fixed-width hex so a prefix scan walks
//! newest first. A primary record and its indexes go into one atomic batch;
//! an index entry whose primary is missing is still skipped at read time.

use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::kv::{Batch, KvBackend, RocksConfig, RocksKv};

const EVENT: &str = "ev\0";
const TOMB: &str = "tomb\0";
const LATEST: &str = "latest\0";
const BY_TIME: &str = "ic\0";
const BY_AUTHOR: &str = "ia\0";
const BY_KIND: &str = "ik\0";
const BY_TAG: &str = "ig\0";

/// Result of [`Store::save`]. A duplicate is a success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored,
    Duplicate,
}

/// Tombstone record kept next to a logically deleted event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tombstone {
    pub deleted_by: String,
}

/// How a scan treats tombstones and replaceable versions.
#[derive(Debug, Clone, Copy)]
struct Visibility {
    include_deleted: bool,
    collapse_replaceable: bool,
}

const PUBLIC: Visibility = Visibility {
    include_deleted: false,
    collapse_replaceable: true,
};

const EVERYTHING: Visibility = Visibility {
    include_deleted: true,
    collapse_replaceable: false,
};

/// Persistent store for events and indexes.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvBackend>,
    replaceable: Arc<BTreeSet<u32>>,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Store on an explicit engine.
    pub fn with_backend(kv: Arc<dyn KvBackend>, replaceable: BTreeSet<u32>) -> Self {
        Self {
            kv,
            replaceable: Arc::new(replaceable),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open (or create) the durable store rooted at `root`.
    pub fn open(root: &Path, replaceable: BTreeSet<u32>) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let kv = RocksKv::open(root.join("events"), &RocksConfig::default())?;
        Ok(Self::with_backend(Arc::new(kv), replaceable))
    }

    /// Volatile store for tests.
    #[cfg(test)]
    pub fn in_memory(replaceable: BTreeSet<u32>) -> Self {
        Self::with_backend(Arc::new(crate::kv::MemoryKv::new()), replaceable)
    }

    pub fn is_replaceable(&self, kind: u32) -> bool {
        self.replaceable.contains(&kind)
    }

    /// Persist an event unless its id is already stored.
    pub fn save(&self, ev: &Event) -> Result<SaveOutcome> {
        let _guard = self.write_lock.lock();
        let primary = event_key(&ev.id);
        if self.kv.contains(primary.as_bytes())? {
            return Ok(SaveOutcome::Duplicate);
        }
        let mut batch = self.index_batch(ev)?;
        batch.put(primary, serde_json::to_vec(ev)?);
        self.kv.commit(batch)?;
        debug!(id = %ev.id, kind = ev.kind, "stored event");
        Ok(SaveOutcome::Stored)
    }

    /// Index entries and latest pointer for an event.
    fn index_batch(&self, ev: &Event) -> Result<Batch> {
        let ts = time_suffix(ev.created_at, &ev.id);
        let mut batch = Batch::new();
        batch.put(format!("{BY_TIME}{ts}"), Vec::new());
        batch.put(format!("{BY_AUTHOR}{}\0{ts}", ev.pubkey), Vec::new());
        batch.put(format!("{}{ts}", kind_prefix(ev.kind)), Vec::new());
        let mut seen = HashSet::new();
        for tag in &ev.tags {
            if let (Some(key), Some(val)) = (tag.key(), tag.value()) {
                if is_indexed_tag(key) && seen.insert((key, val)) {
                    batch.put(format!("{}{ts}", tag_prefix(key, val)), Vec::new());
                }
            }
        }
        if self.is_replaceable(ev.kind) {
            let key = latest_key(ev);
            let newer = match self.kv.get(key.as_bytes())? {
                Some(cur) => {
                    let (cur_ts, cur_id) = decode_latest(&cur)?;
                    supersedes((ev.created_at, &ev.id), (cur_ts, &cur_id))
                }
                None => true,
            };
            if newer {
                batch.put(key, encode_latest(ev.created_at, &ev.id));
            }
        }
        Ok(batch)
    }

    /// Matching events, newest first, after replaceable collapse and
    /// tombstone exclusion, cut to `filter.limit`.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        self.select(filter, PUBLIC, filter.limit)
    }

    /// Number of events [`Store::query`] would return without a limit.
    pub fn count(&self, filter: &Filter) -> Result<usize> {
        Ok(self.select(filter, PUBLIC, None)?.len())
    }

    /// Every matching event oldest first, tombstoned or superseded ones
    /// included. Used to replay derived state.
    pub fn replay_log(&self, filter: &Filter) -> Result<Vec<Event>> {
        let mut events = self.select(filter, EVERYTHING, None)?;
        events.reverse();
        Ok(events)
    }

    /// Visible event by id.
    pub fn get(&self, id: &str) -> Result<Option<Event>> {
        if self.is_deleted(id)? {
            return Ok(None);
        }
        self.get_raw(id)
    }

    /// Stored event by id regardless of tombstones, for auditing.
    pub fn get_raw(&self, id: &str) -> Result<Option<Event>> {
        match self.kv.get(event_key(id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_event(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn is_deleted(&self, id: &str) -> Result<bool> {
        self.kv.contains(tomb_key(id).as_bytes())
    }

    /// Tombstone `id` on behalf of `requester`.
    ///
    /// The author may always delete; for group-scoped events `is_moderator`
    /// decides whether the requester holds delete rights in that group.
    pub fn delete(
        &self,
        id: &str,
        requester: &str,
        is_moderator: impl FnOnce(&Event) -> bool,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let ev = self.get_raw(id)?.ok_or(Error::NotFound)?;
        if self.is_deleted(id)? {
            return Ok(());
        }
        let allowed =
            ev.pubkey == requester || (ev.group_id().is_some() && is_moderator(&ev));
        if !allowed {
            return Err(Error::NotAuthorized);
        }
        let tomb = Tombstone {
            deleted_by: requester.to_string(),
        };
        let mut batch = Batch::new();
        batch.put(tomb_key(id), serde_json::to_vec(&tomb)?);
        self.kv.commit(batch)?;
        info!(id, requester, "tombstoned event");
        Ok(())
    }

    fn select(&self, filter: &Filter, vis: Visibility, limit: Option<usize>) -> Result<Vec<Event>> {
        let mut candidates: Vec<(u64, String)> = match &filter.ids {
            Some(ids) => ids.iter().map(|id| (0, id.clone())).collect(),
            None => {
                let mut seen = HashSet::new();
                let mut out = Vec::new();
                for prefix in plan(filter) {
                    self.kv.prefix_iterate(prefix.as_bytes(), &mut |key: &[u8], _: &[u8]| {
                        let Some((created_at, id)) = parse_index_key(key) else {
                            warn!(key = %String::from_utf8_lossy(key), "malformed index key");
                            return true;
                        };
                        // Newest first: nothing further down can satisfy `since`.
                        if filter.since.is_some_and(|s| created_at < s) {
                            return false;
                        }
                        if !filter.time_excludes(created_at) && seen.insert(id.clone()) {
                            out.push((created_at, id));
                        }
                        true
                    })?;
                }
                out
            }
        };
        candidates.sort_by(|a, b| b.cmp(a));

        let limit = limit.unwrap_or(usize::MAX);
        let by_time = filter.ids.is_none();
        let mut events = Vec::new();
        for (_, id) in candidates {
            if by_time && events.len() >= limit {
                break;
            }
            // Stale index entries (primary never committed) fall out here.
            let Some(ev) = self.get_raw(&id)? else {
                continue;
            };
            if !filter.matches(&ev) {
                continue;
            }
            if !vis.include_deleted && self.is_deleted(&ev.id)? {
                continue;
            }
            if vis.collapse_replaceable && self.is_replaceable(ev.kind) && !self.is_latest(&ev)? {
                continue;
            }
            events.push(ev);
        }
        // Direct id lookups skipped the time-ordered scan.
        events.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        events.truncate(limit);
        Ok(events)
    }

    fn is_latest(&self, ev: &Event) -> Result<bool> {
        match self.kv.get(latest_key(ev).as_bytes())? {
            Some(cur) => Ok(decode_latest(&cur)?.1 == ev.id),
            None => Ok(true),
        }
    }

    /// Rebuild all indexes and latest pointers from the primary records.
    pub fn reindex(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut wipe = Batch::new();
        for prefix in [BY_TIME, BY_AUTHOR, BY_KIND, BY_TAG, LATEST] {
            for (key, _) in self.kv.scan_prefix(prefix.as_bytes())? {
                wipe.delete(key);
            }
        }
        self.kv.commit(wipe)?;
        let mut rebuilt = 0;
        for (_, bytes) in self.kv.scan_prefix(EVENT.as_bytes())? {
            let ev = decode_event(&bytes)?;
            self.kv.commit(self.index_batch(&ev)?)?;
            rebuilt += 1;
        }
        info!(events = rebuilt, "rebuilt indexes");
        Ok(rebuilt)
    }

    /// Verify Schnorr signatures for a random sample of stored events,
    /// tombstoned ones included.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let mut records = self.kv.scan_prefix(EVENT.as_bytes())?;
        records.shuffle(&mut thread_rng());
        let take = sample.min(records.len());
        for (_, bytes) in records.iter().take(take) {
            decode_event(bytes)?.verify()?;
        }
        Ok(take)
    }

    pub fn compact(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.kv.compact()
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }
}

/// Choose the most selective index prefixes for a filter.
fn plan(filter: &Filter) -> Vec<String> {
    if let Some(authors) = &filter.authors {
        return authors
            .iter()
            .map(|a| format!("{BY_AUTHOR}{a}\0"))
            .collect();
    }
    if let Some((key, values)) = filter.tags.iter().find(|(k, _)| is_indexed_tag(k)) {
        return values.iter().map(|v| tag_prefix(key, v)).collect();
    }
    if let Some(kinds) = &filter.kinds {
        return kinds.iter().map(|k| kind_prefix(*k)).collect();
    }
    vec![BY_TIME.to_string()]
}

fn is_indexed_tag(key: &str) -> bool {
    key.len() == 1 && key.bytes().all(|b| b.is_ascii_alphabetic())
}

fn event_key(id: &str) -> String {
    format!("{EVENT}{id}")
}

fn tomb_key(id: &str) -> String {
    format!("{TOMB}{id}")
}

fn kind_prefix(kind: u32) -> String {
    format!("{BY_KIND}{kind:010}\0")
}

fn tag_prefix(key: &str, value: &str) -> String {
    format!("{BY_TAG}{key}\0{value}\0")
}

fn time_suffix(created_at: u64, id: &str) -> String {
    format!("{:016x}\0{id}", u64::MAX - created_at)
}

/// Replaceable events collapse on `(kind, pubkey, d tag)`; a missing `d`
/// tag counts as empty.
fn latest_key(ev: &Event) -> String {
    let d = ev.tag_value("d").unwrap_or("");
    format!("{LATEST}{}\0{}\0{d}", ev.kind, ev.pubkey)
}

/// Newer timestamp wins; on a tie the lower id wins.
fn supersedes(new: (u64, &str), cur: (u64, &str)) -> bool {
    new.0 > cur.0 || (new.0 == cur.0 && new.1 < cur.1)
}

fn encode_latest(created_at: u64, id: &str) -> Vec<u8> {
    format!("{created_at}:{id}").into_bytes()
}

fn decode_latest(bytes: &[u8]) -> Result<(u64, String)> {
    let s = std::str::from_utf8(bytes).map_err(|e| Error::Corruption(e.to_string()))?;
    let (ts, id) = s
        .split_once(':')
        .ok_or_else(|| Error::Corruption("latest pointer".into()))?;
    let ts = ts
        .parse()
        .map_err(|_| Error::Corruption("latest pointer timestamp".into()))?;
    Ok((ts, id.to_string()))
}

fn decode_event(bytes: &[u8]) -> Result<Event> {
    serde_json::from_slice(bytes).map_err(|e| Error::Corruption(e.to_string()))
}

/// Extract `(created_at, id)` from the tail of an index key.
fn parse_index_key(key: &[u8]) -> Option<(u64, String)> {
    let s = std::str::from_utf8(key).ok()?;
    let (head, id) = s.rsplit_once('\0')?;
    let inv = head.get(head.len().checked_sub(16)?..)?;
    let inv = u64::from_str_radix(inv, 16).ok()?;
    Some((u64::MAX - inv, id.to_string()))
}
