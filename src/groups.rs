//! Group membership and permissions, derived by folding moderation events.
//!
//! A group's state is never stored. It is the result of applying every
//! moderation event addressed to the group (`h` tag) in `(created_at, id)`
//! order, starting from an empty state. [`GroupRules::apply`] is the pure
//! transition function; [`GroupRegistry`] keeps a memoised snapshot per group
//! and serialises admissions for one group behind an async mutex.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::Result;
use crate::event::{Event, Keys, Tag};
use crate::filter::Filter;
use crate::policy::KindSet;
use crate::storage::Store;

/// Moderation action implied by an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PutUser,
    RemoveUser,
    EditMetadata,
    AddAdmin,
    RemoveAdmin,
    DeleteEvent,
    EditStatus,
    CreateGroup,
    DeleteGroup,
    JoinRequest,
}

/// Kind numbers for moderation actions and relay-signed snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationKinds {
    pub put_user: u32,
    pub remove_user: u32,
    pub edit_metadata: u32,
    pub add_admin: u32,
    pub remove_admin: u32,
    pub delete_event: u32,
    pub edit_status: u32,
    pub create_group: u32,
    pub delete_group: u32,
    pub join_request: u32,
    pub metadata: u32,
    pub admins: u32,
    pub members: u32,
}

impl Default for ModerationKinds {
    fn default() -> Self {
        Self {
            put_user: 9000,
            remove_user: 9001,
            edit_metadata: 9002,
            add_admin: 9003,
            remove_admin: 9004,
            delete_event: 9005,
            edit_status: 9006,
            create_group: 9007,
            delete_group: 9008,
            join_request: 9021,
            metadata: 39000,
            admins: 39001,
            members: 39002,
        }
    }
}

impl ModerationKinds {
    fn table(&self) -> [(u32, Action); 10] {
        [
            (self.put_user, Action::PutUser),
            (self.remove_user, Action::RemoveUser),
            (self.edit_metadata, Action::EditMetadata),
            (self.add_admin, Action::AddAdmin),
            (self.remove_admin, Action::RemoveAdmin),
            (self.delete_event, Action::DeleteEvent),
            (self.edit_status, Action::EditStatus),
            (self.create_group, Action::CreateGroup),
            (self.delete_group, Action::DeleteGroup),
            (self.join_request, Action::JoinRequest),
        ]
    }

    pub fn action(&self, kind: u32) -> Option<Action> {
        self.table()
            .into_iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, a)| a)
    }

    /// Every kind that drives the fold.
    pub fn moderation(&self) -> Vec<u32> {
        self.table().into_iter().map(|(k, _)| k).collect()
    }

    /// Kinds the relay signs to publish derived state.
    pub fn snapshots(&self) -> [u32; 3] {
        [self.metadata, self.admins, self.members]
    }

    pub fn is_snapshot(&self, kind: u32) -> bool {
        self.snapshots().contains(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub relays: Vec<String>,
}

/// Derived state of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupState {
    pub id: String,
    pub created: bool,
    pub deleted: bool,
    pub open: bool,
    pub public: bool,
    pub metadata: Metadata,
    pub members: BTreeMap<String, BTreeSet<Role>>,
    /// Order key of the last event the fold has seen, applied or not.
    pub last_folded: Option<(u64, String)>,
}

impl GroupState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created: false,
            deleted: false,
            open: true,
            public: true,
            metadata: Metadata::default(),
            members: BTreeMap::new(),
            last_folded: None,
        }
    }

    /// Created and not deleted.
    pub fn is_live(&self) -> bool {
        self.created && !self.deleted
    }

    pub fn is_member(&self, pubkey: &str) -> bool {
        self.members.contains_key(pubkey)
    }

    pub fn is_admin(&self, pubkey: &str) -> bool {
        self.members
            .get(pubkey)
            .is_some_and(|roles| roles.contains(&Role::Admin))
    }

    pub fn admins(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .filter(|(_, roles)| roles.contains(&Role::Admin))
            .map(|(pk, _)| pk.as_str())
    }

    pub fn admin_count(&self) -> usize {
        self.admins().count()
    }

    /// Same observable state, ignoring the fold cursor.
    pub fn same_view(&self, other: &GroupState) -> bool {
        self.created == other.created
            && self.deleted == other.deleted
            && self.open == other.open
            && self.public == other.public
            && self.metadata == other.metadata
            && self.members == other.members
    }

    /// Whether `ev` sorts after everything already folded.
    pub fn follows(&self, ev: &Event) -> bool {
        match &self.last_folded {
            Some((ts, id)) => ev.order_key() > (*ts, id.as_str()),
            None => true,
        }
    }
}

/// A transition the reducer refused. The state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Rejected(pub String);

fn rejected(msg: impl Into<String>) -> Rejected {
    Rejected(msg.into())
}

/// Result of folding a sequence of moderation events.
#[derive(Debug, Clone)]
pub struct Fold {
    pub state: GroupState,
    /// Ids of events that had no effect, with the reason.
    pub rejected: Vec<(String, Rejected)>,
}

/// Static rules shared by the reducer and the admission pipeline.
#[derive(Debug, Clone)]
pub struct GroupRules {
    pub kinds: ModerationKinds,
    pub chat_kinds: KindSet,
    /// The relay key acts as super-admin in every group.
    pub relay_pubkey: String,
    pub allow_creation: bool,
}

impl GroupRules {
    pub fn new(relay_pubkey: impl Into<String>) -> Self {
        Self {
            kinds: ModerationKinds::default(),
            chat_kinds: KindSet::from_ranges([9..=12]),
            relay_pubkey: relay_pubkey.into(),
            allow_creation: true,
        }
    }

    pub fn is_super_admin(&self, pubkey: &str) -> bool {
        pubkey == self.relay_pubkey
    }

    /// Chat and moderation kinds must carry an `h` tag.
    pub fn is_group_kind(&self, kind: u32) -> bool {
        self.chat_kinds.contains(kind) || self.kinds.action(kind).is_some()
    }

    /// Pure transition: `(state, event) -> state'` or a rejection.
    ///
    /// Events that are not moderation kinds leave the state as is.
    pub fn apply(&self, state: &GroupState, ev: &Event) -> std::result::Result<GroupState, Rejected> {
        let Some(action) = self.kinds.action(ev.kind) else {
            return Ok(state.clone());
        };
        if ev.group_id() != Some(state.id.as_str()) {
            return Err(rejected("event is addressed to another group"));
        }
        if state.deleted {
            return Err(rejected("group has been deleted"));
        }
        let actor = ev.pubkey.as_str();
        let mut next = state.clone();

        if action == Action::CreateGroup {
            if state.created {
                return Err(rejected("group already exists"));
            }
            if !self.allow_creation && !self.is_super_admin(actor) {
                return Err(rejected("group creation is restricted"));
            }
            next.created = true;
            next.members
                .insert(actor.to_string(), BTreeSet::from([Role::Member, Role::Admin]));
            return Ok(next);
        }
        if !state.created {
            return Err(rejected("unknown group"));
        }
        if action == Action::JoinRequest {
            if !state.open && !self.is_super_admin(actor) {
                return Err(rejected("group is closed"));
            }
            next.members
                .entry(actor.to_string())
                .or_default()
                .insert(Role::Member);
            return Ok(next);
        }
        if !state.is_admin(actor) && !self.is_super_admin(actor) {
            return Err(rejected("only group admins may do that"));
        }

        match action {
            Action::PutUser => {
                for tag in targets(ev)? {
                    let roles = next.members.entry(tag.pubkey.clone()).or_default();
                    roles.insert(Role::Member);
                    if tag.admin {
                        roles.insert(Role::Admin);
                    }
                }
            }
            Action::RemoveUser => {
                for tag in targets(ev)? {
                    self.guard_last_admin(&next, &tag.pubkey, actor)?;
                    next.members.remove(&tag.pubkey);
                }
            }
            Action::AddAdmin => {
                for tag in targets(ev)? {
                    next.members
                        .entry(tag.pubkey)
                        .or_default()
                        .extend([Role::Member, Role::Admin]);
                }
            }
            Action::RemoveAdmin => {
                for tag in targets(ev)? {
                    self.guard_last_admin(&next, &tag.pubkey, actor)?;
                    if let Some(roles) = next.members.get_mut(&tag.pubkey) {
                        roles.remove(&Role::Admin);
                    }
                }
            }
            Action::EditMetadata => {
                let relays: Vec<String> = ev.tag_values("relay").map(str::to_string).collect();
                for tag in &ev.tags {
                    let value = tag.value().map(str::to_string);
                    match tag.key() {
                        Some("name") => next.metadata.name = value,
                        Some("about") => next.metadata.about = value,
                        Some("picture") => next.metadata.picture = value,
                        _ => {}
                    }
                }
                if !relays.is_empty() {
                    next.metadata.relays = relays;
                }
            }
            Action::EditStatus => {
                for tag in &ev.tags {
                    match tag.key() {
                        Some("open") => next.open = true,
                        Some("closed") => next.open = false,
                        Some("public") => next.public = true,
                        Some("private") => next.public = false,
                        _ => {}
                    }
                }
            }
            Action::DeleteEvent => {
                if !ev.has_tag("e") {
                    return Err(rejected("missing e tag"));
                }
            }
            Action::DeleteGroup => next.deleted = true,
            Action::CreateGroup | Action::JoinRequest => {}
        }
        Ok(next)
    }

    /// Removing `target`'s admin role must leave at least one admin, unless
    /// the relay itself is acting.
    fn guard_last_admin(
        &self,
        state: &GroupState,
        target: &str,
        actor: &str,
    ) -> std::result::Result<(), Rejected> {
        if state.is_admin(target) && state.admin_count() == 1 && !self.is_super_admin(actor) {
            return Err(rejected("cannot remove the last admin"));
        }
        Ok(())
    }

    /// Apply one event in fold order and advance the cursor either way.
    pub fn step(&self, state: &mut GroupState, ev: &Event) -> std::result::Result<(), Rejected> {
        let outcome = self.apply(state, ev).map(|next| *state = next);
        state.last_folded = Some((ev.created_at, ev.id.clone()));
        outcome
    }

    /// Fold events addressed to `id` from the empty state.
    ///
    /// Input order does not matter; events are sorted by `(created_at, id)`
    /// and duplicates are folded once.
    pub fn fold<'a>(&self, id: &str, events: impl IntoIterator<Item = &'a Event>) -> Fold {
        let mut ordered: Vec<&Event> = events
            .into_iter()
            .filter(|e| self.kinds.action(e.kind).is_some() && e.group_id() == Some(id))
            .collect();
        ordered.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        ordered.dedup_by(|a, b| a.id == b.id);

        let mut state = GroupState::new(id);
        let mut rejected = Vec::new();
        for ev in ordered {
            if let Err(reason) = self.step(&mut state, ev) {
                rejected.push((ev.id.clone(), reason));
            }
        }
        Fold { state, rejected }
    }

    /// Relay-signed metadata, admin and member snapshots for `state`.
    pub fn snapshot_events(&self, state: &GroupState, keys: &Keys, created_at: u64) -> Result<Vec<Event>> {
        let d = Tag::new(["d", state.id.as_str()]);

        let mut meta = vec![d.clone()];
        if let Some(name) = &state.metadata.name {
            meta.push(Tag::new(["name", name.as_str()]));
        }
        if let Some(about) = &state.metadata.about {
            meta.push(Tag::new(["about", about.as_str()]));
        }
        if let Some(picture) = &state.metadata.picture {
            meta.push(Tag::new(["picture", picture.as_str()]));
        }
        for relay in &state.metadata.relays {
            meta.push(Tag::new(["relay", relay.as_str()]));
        }
        meta.push(Tag::new([if state.public { "public" } else { "private" }]));
        meta.push(Tag::new([if state.open { "open" } else { "closed" }]));

        let mut admins = vec![d.clone()];
        let mut members = vec![d];
        if !state.deleted {
            admins.extend(state.admins().map(|pk| Tag::new(["p", pk, "admin"])));
            members.extend(state.members.keys().map(|pk| Tag::new(["p", pk.as_str()])));
        }

        Ok(vec![
            keys.sign(self.kinds.metadata, created_at, meta, "")?,
            keys.sign(self.kinds.admins, created_at, admins, "")?,
            keys.sign(self.kinds.members, created_at, members, "")?,
        ])
    }
}

struct Target {
    pubkey: String,
    admin: bool,
}

/// `p` tags of a membership change. Extra tag elements name roles.
fn targets(ev: &Event) -> std::result::Result<Vec<Target>, Rejected> {
    let mut out = Vec::new();
    for tag in ev.tags.iter().filter(|t| t.key() == Some("p")) {
        let Some(pubkey) = tag.value() else {
            return Err(rejected("empty p tag"));
        };
        if pubkey.len() != 64 || !pubkey.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(rejected("p tag is not a public key"));
        }
        out.push(Target {
            pubkey: pubkey.to_string(),
            admin: tag.0.iter().skip(2).any(|r| r == "admin"),
        });
    }
    if out.is_empty() {
        return Err(rejected("missing p tag"));
    }
    Ok(out)
}

type Slot = Arc<AsyncMutex<Option<GroupState>>>;
type Slots = Arc<parking_lot::Mutex<HashMap<String, Slot>>>;

/// Per-group locks and memoised snapshots.
///
/// Slots of groups that were never created are dropped when their last lock
/// is released, so unknown `h` values do not accumulate.
pub struct GroupRegistry {
    rules: Arc<GroupRules>,
    slots: Slots,
}

impl GroupRegistry {
    pub fn new(rules: Arc<GroupRules>) -> Self {
        Self {
            rules,
            slots: Slots::default(),
        }
    }

    /// Exclusive access to one group until the returned lock drops.
    pub async fn lock(&self, id: &str) -> GroupLock {
        let handle = self.slots.lock().entry(id.to_string()).or_default().clone();
        let slot = handle.clone().lock_owned().await;
        GroupLock {
            id: id.to_string(),
            rules: self.rules.clone(),
            slots: self.slots.clone(),
            handle,
            slot,
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.slots.lock().len()
    }

    /// Current state of a group, rebuilding it from the store if needed.
    pub async fn snapshot(&self, store: &Store, id: &str) -> Result<GroupState> {
        let mut lock = self.lock(id).await;
        Ok(lock.current(store)?.clone())
    }
}

/// Held while a group event moves through authorisation, save and fold.
pub struct GroupLock {
    id: String,
    rules: Arc<GroupRules>,
    slots: Slots,
    handle: Slot,
    slot: OwnedMutexGuard<Option<GroupState>>,
}

impl Drop for GroupLock {
    fn drop(&mut self) {
        if (*self.slot).as_ref().is_some_and(|s| s.created) {
            return;
        }
        let mut slots = self.slots.lock();
        // Map entry, `handle` and the guard; any other holder is waiting on
        // this group and keeps the slot alive.
        let idle = Arc::strong_count(&self.handle) == 3;
        if idle && slots.get(&self.id).is_some_and(|s| Arc::ptr_eq(s, &self.handle)) {
            slots.remove(&self.id);
        }
    }
}

impl GroupLock {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Memoised state, replayed from the store on first use.
    pub fn current(&mut self, store: &Store) -> Result<&GroupState> {
        let state = match self.slot.take() {
            Some(state) => state,
            None => self.replay(store, None)?.state,
        };
        let state: &GroupState = self.slot.insert(state);
        Ok(state)
    }

    /// State after `ev` would be admitted, or why the reducer refuses it.
    ///
    /// An event that sorts after the memoised cursor is applied
    /// incrementally; anything else forces a full replay with `ev` included.
    pub fn preview(&mut self, store: &Store, ev: &Event) -> Result<std::result::Result<GroupState, Rejected>> {
        let current = self.current(store)?.clone();
        if current.follows(ev) {
            let mut next = current;
            return Ok(self.rules.step(&mut next, ev).map(|()| next));
        }
        debug!(group = %self.id, id = %ev.id, "out-of-order moderation event, replaying");
        let fold = self.replay(store, Some(ev))?;
        if let Some((_, reason)) = fold.rejected.iter().find(|(id, _)| *id == ev.id) {
            return Ok(Err(reason.clone()));
        }
        Ok(Ok(fold.state))
    }

    pub fn install(&mut self, state: GroupState) {
        *self.slot = Some(state);
    }

    fn replay(&self, store: &Store, extra: Option<&Event>) -> Result<Fold> {
        let filter = Filter::new()
            .kinds(self.rules.kinds.moderation())
            .tag("h", [self.id.clone()]);
        let log = store.replay_log(&filter)?;
        Ok(self.rules.fold(&self.id, log.iter().chain(extra)))
    }
}
