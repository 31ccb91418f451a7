//! Admission and subscription orchestration.
//!
//! `publish` runs an event through the policy pipeline, the group reducer and
//! the store, then fans it out. Events addressed to a group hold that group's
//! lock for the whole path so the group sees its events one at a time.
//! `save` and `broadcast` share one short lock so subscribers observe events
//! in admission order.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, Keys};
use crate::filter::Filter;
use crate::groups::{Action, GroupLock, GroupRegistry, GroupRules, GroupState};
use crate::hub::{ConnectionId, Hub, Outbound};
use crate::policy::{Admission, Pipeline, PolicyConfig};
use crate::storage::{SaveOutcome, Store};

/// NIP-09 deletion request.
pub const DELETION_KIND: u32 = 5;

/// Upper bound on ids, authors, kinds and tag values listed by one filter.
const MAX_FILTER_VALUES: usize = 1000;

/// Relay-wide settings threaded in at construction.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub name: String,
    pub description: String,
    pub policy: PolicyConfig,
    pub max_filters: usize,
    pub max_limit: usize,
    pub subscriber_buffer: usize,
    pub allow_group_creation: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "Chatstr Relay".into(),
            description: "NIP29 relay for Chatstr".into(),
            policy: PolicyConfig::default(),
            max_filters: 10,
            max_limit: 500,
            subscriber_buffer: 256,
            allow_group_creation: true,
        }
    }
}

/// How an accepted event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Stored,
    Duplicate,
}

impl Published {
    /// Message text for the `OK` reply.
    pub fn message(self) -> &'static str {
        match self {
            Published::Stored => "",
            Published::Duplicate => "duplicate: already have this event",
        }
    }
}

pub struct Relay {
    store: Store,
    keys: Keys,
    config: RelayConfig,
    rules: Arc<GroupRules>,
    pipeline: Pipeline,
    groups: GroupRegistry,
    hub: Hub,
    publish_lock: Mutex<()>,
    snapshot_clock: Mutex<HashMap<String, u64>>,
}

impl Relay {
    pub fn new(store: Store, keys: Keys, config: RelayConfig) -> Self {
        let mut rules = GroupRules::new(keys.public_key());
        rules.allow_creation = config.allow_group_creation;
        let rules = Arc::new(rules);
        let pipeline = Pipeline::standard(&config.policy, rules.clone());
        debug!(stages = ?pipeline.stage_names(), "admission pipeline");
        Self {
            pipeline,
            groups: GroupRegistry::new(rules.clone()),
            hub: Hub::new(config.subscriber_buffer),
            rules,
            store,
            keys,
            config,
            publish_lock: Mutex::new(()),
            snapshot_clock: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pubkey(&self) -> &str {
        self.keys.public_key()
    }

    /// Current derived state of a group.
    pub async fn group(&self, id: &str) -> Result<GroupState> {
        self.groups.snapshot(&self.store, id).await
    }

    /// Admit, store and broadcast a client event.
    pub async fn publish(&self, ev: Event) -> Result<Published> {
        self.publish_at(ev, unix_now()).await
    }

    pub async fn publish_at(&self, ev: Event, now: u64) -> Result<Published> {
        if self.store.get_raw(&ev.id)?.as_ref() == Some(&ev) {
            return Ok(Published::Duplicate);
        }
        let group_id = ev
            .group_id()
            .filter(|_| !self.rules.kinds.is_snapshot(ev.kind))
            .map(str::to_string);
        let Some(group_id) = group_id else {
            self.pipeline.admit(&Admission {
                event: &ev,
                group: None,
                now,
            })?;
            let outcome = self.commit(ev.clone())?;
            if outcome == Published::Stored && ev.kind == DELETION_KIND {
                self.apply_deletions(&ev, None).await;
            }
            return Ok(outcome);
        };

        let mut lock = self.groups.lock(&group_id).await;
        let before = lock.current(&self.store)?.clone();
        self.pipeline.admit(&Admission {
            event: &ev,
            group: Some(&before),
            now,
        })?;
        let action = self.rules.kinds.action(ev.kind);
        let next = match action {
            Some(_) => Some(
                lock.preview(&self.store, &ev)?
                    .map_err(|r| Error::authorization(r.0))?,
            ),
            None => None,
        };
        let outcome = self.commit(ev.clone())?;
        if let Some(next) = next {
            let changed = !next.same_view(&before);
            lock.install(next);
            if outcome == Published::Stored {
                if action == Some(Action::DeleteEvent) || ev.kind == DELETION_KIND {
                    self.apply_deletions(&ev, Some(&mut lock)).await;
                }
                if changed {
                    // The event itself is already stored and folded.
                    if let Err(e) = self.publish_snapshots(&mut lock, now) {
                        warn!(group = %group_id, error = %e, "publishing group snapshots failed");
                    }
                }
            }
        } else if outcome == Published::Stored && ev.kind == DELETION_KIND {
            self.apply_deletions(&ev, Some(&mut lock)).await;
        }
        Ok(outcome)
    }

    /// Save and fan out under the publish lock.
    fn commit(&self, ev: Event) -> Result<Published> {
        let _order = self.publish_lock.lock();
        match self.store.save(&ev)? {
            SaveOutcome::Duplicate => Ok(Published::Duplicate),
            SaveOutcome::Stored => {
                let reached = self.hub.broadcast(&Arc::new(ev));
                debug!(subscriptions = reached, "broadcast");
                Ok(Published::Stored)
            }
        }
    }

    /// Tombstone the `e` targets of a deletion request.
    ///
    /// `held` is the lock of the group the request was addressed to; targets
    /// in any other group can only be deleted by their author.
    async fn apply_deletions(&self, ev: &Event, mut held: Option<&mut GroupLock>) {
        let requester = ev.pubkey.as_str();
        for target in ev.tag_values("e") {
            let target_group = match self.store.get_raw(target) {
                Ok(Some(t)) => t.group_id().map(str::to_string),
                Ok(None) => {
                    debug!(target, "deletion target not stored");
                    continue;
                }
                Err(e) => {
                    warn!(target, error = %e, "deletion lookup failed");
                    continue;
                }
            };
            let moderator = match (target_group.as_deref(), held.as_deref_mut()) {
                (Some(g), Some(lock)) if lock.id() == g => match lock.current(&self.store) {
                    Ok(state) => state.is_admin(requester),
                    Err(_) => false,
                },
                (Some(g), None) => match self.groups.snapshot(&self.store, g).await {
                    Ok(state) => state.is_admin(requester),
                    Err(_) => false,
                },
                _ => false,
            };
            let super_admin = self.rules.is_super_admin(requester);
            match self
                .store
                .delete(target, requester, |_| moderator || super_admin)
            {
                Ok(()) => info!(target, requester, "deleted"),
                Err(e) => debug!(target, requester, error = %e, "deletion refused"),
            }
        }
    }

    /// Sign and publish 39000/39001/39002 for the locked group.
    fn publish_snapshots(&self, lock: &mut GroupLock, now: u64) -> Result<()> {
        let state = lock.current(&self.store)?.clone();
        let created_at = {
            let mut clock = self.snapshot_clock.lock();
            let last = match clock.get(&state.id) {
                Some(t) => *t,
                None => self.last_snapshot_at(&state.id)?,
            };
            let at = now.max(last + 1);
            clock.insert(state.id.clone(), at);
            at
        };
        for snapshot in self.rules.snapshot_events(&state, &self.keys, created_at)? {
            self.commit(snapshot)?;
        }
        debug!(group = %state.id, created_at, "published group snapshots");
        Ok(())
    }

    fn last_snapshot_at(&self, group: &str) -> Result<u64> {
        let filter = Filter::new()
            .kinds(self.rules.kinds.snapshots())
            .authors([self.keys.public_key()])
            .tag("d", [group])
            .limit(1);
        Ok(self
            .store
            .query(&filter)?
            .first()
            .map_or(0, |e| e.created_at))
    }

    /// Reject filter sets that are too many or too complex.
    pub fn check_filters(&self, filters: &[Filter]) -> Result<()> {
        if filters.is_empty() {
            return Err(Error::validation("at least one filter is required"));
        }
        if filters.len() > self.config.max_filters {
            return Err(Error::validation(format!(
                "at most {} filters per request",
                self.config.max_filters
            )));
        }
        for f in filters {
            f.validate(MAX_FILTER_VALUES)?;
        }
        Ok(())
    }

    /// Stored events matching any filter, deduplicated, newest first.
    pub fn backfill(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for f in filters {
            let limit = f.limit.unwrap_or(self.config.max_limit).min(self.config.max_limit);
            let capped = f.clone().limit(limit);
            for ev in self.store.query(&capped)? {
                if seen.insert(ev.id.clone()) {
                    events.push(ev);
                }
            }
        }
        events.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(events)
    }

    /// Register a subscription, send its backfill and hand over to live
    /// delivery.
    pub async fn subscribe(
        &self,
        conn: ConnectionId,
        tx: &mpsc::Sender<Outbound>,
        sub_id: &str,
        filters: Vec<Filter>,
    ) -> Result<()> {
        self.check_filters(&filters)?;
        let Some(generation) = self.hub.register(conn, sub_id, filters.clone()) else {
            return Ok(());
        };
        let events = match self.backfill(&filters) {
            Ok(events) => events,
            Err(e) => {
                self.hub.unregister(conn, sub_id);
                return Err(e);
            }
        };
        let mut sent = HashSet::with_capacity(events.len());
        for event in events {
            sent.insert(event.id.clone());
            let msg = Outbound::Event {
                sub_id: sub_id.to_string(),
                generation,
                event: Arc::new(event),
            };
            if tx.send(msg).await.is_err() {
                return Ok(());
            }
        }
        self.hub.finish_backfill(conn, sub_id, generation, &sent).await;
        Ok(())
    }

    /// Number of stored events matching any filter (NIP-45).
    pub fn count(&self, filters: &[Filter]) -> Result<usize> {
        self.check_filters(filters)?;
        if let [single] = filters {
            return self.store.count(single);
        }
        let mut ids = HashSet::new();
        for f in filters {
            let mut unlimited = f.clone();
            unlimited.limit = None;
            ids.extend(self.store.query(&unlimited)?.into_iter().map(|e| e.id));
        }
        Ok(ids.len())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::testing::{relay, relay_keys};
    use super::*;
    use crate::event::testing::{group_event, keys};
    use crate::event::Tag;
    use crate::kv::{testing::FailingKv, Op};
    use std::collections::BTreeSet;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000;

    fn p(k: &Keys) -> Tag {
        Tag::new(["p", k.public_key()])
    }

    async fn accept(r: &Relay, ev: &Event) {
        assert_eq!(r.publish_at(ev.clone(), NOW).await.unwrap(), Published::Stored);
    }

    async fn lounge(r: &Relay, owner: &Keys) {
        accept(r, &group_event(owner, 9007, NOW - 100, "lounge", vec![])).await;
    }

    #[tokio::test]
    async fn group_lifecycle() {
        let r = relay();
        let owner = keys(1);
        let alice = keys(2);
        lounge(&r, &owner).await;

        let hello = group_event(&alice, 9, NOW - 90, "lounge", vec![]);
        let err = r.publish_at(hello.clone(), NOW).await.unwrap_err();
        assert!(err.to_string().starts_with("restricted:"), "{err}");

        accept(&r, &group_event(&owner, 9000, NOW - 80, "lounge", vec![p(&alice)])).await;
        let hello = group_event(&alice, 9, NOW - 70, "lounge", vec![]);
        accept(&r, &hello).await;
        assert_eq!(r.publish_at(hello, NOW).await.unwrap(), Published::Duplicate);

        let state = r.group("lounge").await.unwrap();
        assert!(state.is_member(alice.public_key()));
    }

    #[tokio::test]
    async fn state_changes_publish_relay_snapshots() {
        let r = relay();
        let owner = keys(1);
        lounge(&r, &owner).await;
        accept(
            &r,
            &group_event(&owner, 9002, NOW - 50, "lounge", vec![Tag::new(["name", "Lounge"])]),
        )
        .await;

        let meta = r
            .store()
            .query(&Filter::new().kinds([39000]).tag("d", ["lounge"]))
            .unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].pubkey, relay_keys().public_key());
        assert_eq!(meta[0].tag_value("name"), Some("Lounge"));
        let admins = r
            .store()
            .query(&Filter::new().kinds([39001]).tag("d", ["lounge"]))
            .unwrap();
        assert_eq!(admins[0].tag_values("p").collect::<Vec<_>>(), vec![owner.public_key()]);
        // Two state changes in the same second still order correctly.
        assert!(meta[0].created_at > NOW);
    }

    #[tokio::test]
    async fn non_admin_moderation_is_rejected_and_state_unchanged() {
        let r = relay();
        let owner = keys(1);
        let alice = keys(2);
        lounge(&r, &owner).await;
        accept(&r, &group_event(&owner, 9000, NOW - 80, "lounge", vec![p(&alice)])).await;
        let before = r.group("lounge").await.unwrap();

        let kick = group_event(&alice, 9001, NOW - 70, "lounge", vec![p(&owner)]);
        assert!(r.publish_at(kick.clone(), NOW).await.is_err());
        assert!(r.store().get_raw(&kick.id).unwrap().is_none());
        assert_eq!(r.group("lounge").await.unwrap(), before);
    }

    #[tokio::test]
    async fn last_admin_cannot_leave() {
        let r = relay();
        let owner = keys(1);
        lounge(&r, &owner).await;
        let demote = group_event(&owner, 9004, NOW - 10, "lounge", vec![p(&owner)]);
        let err = r.publish_at(demote, NOW).await.unwrap_err();
        assert_eq!(err.to_string(), "restricted: cannot remove the last admin");
        assert!(r.group("lounge").await.unwrap().is_admin(owner.public_key()));
    }

    #[tokio::test]
    async fn admins_delete_group_events() {
        let r = relay();
        let owner = keys(1);
        let alice = keys(2);
        lounge(&r, &owner).await;
        accept(&r, &group_event(&owner, 9000, NOW - 80, "lounge", vec![p(&alice)])).await;
        let spam = group_event(&alice, 9, NOW - 70, "lounge", vec![]);
        accept(&r, &spam).await;

        let delete = group_event(&owner, 9005, NOW - 60, "lounge", vec![Tag::new(["e", spam.id.as_str()])]);
        accept(&r, &delete).await;
        assert!(r.store().get(&spam.id).unwrap().is_none());
        r.store().get_raw(&spam.id).unwrap().unwrap().verify().unwrap();
        let visible = r.store().query(&Filter::new().kinds([9])).unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn rejects_kinds_outside_the_allow_list() {
        let r = relay();
        let note = keys(1).sign(1, NOW, vec![], "hi").unwrap();
        let err = r.publish_at(note, NOW).await.unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn clients_cannot_forge_snapshots() {
        let r = relay();
        let forged = keys(1)
            .sign(39000, NOW, vec![Tag::new(["d", "lounge"])], "")
            .unwrap();
        assert!(r.publish_at(forged, NOW).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_backfills_then_goes_live() {
        let r = relay();
        let owner = keys(1);
        lounge(&r, &owner).await;
        let old = group_event(&owner, 9, NOW - 50, "lounge", vec![]);
        accept(&r, &old).await;

        let mut conn = r.hub().connect();
        let filters = vec![Filter::new().kinds([9]).tag("h", ["lounge"])];
        r.subscribe(conn.id, &conn.tx, "s", filters).await.unwrap();
        let fresh = group_event(&owner, 9, NOW - 40, "lounge", vec![]);
        accept(&r, &fresh).await;

        let mut seen = Vec::new();
        while let Ok(msg) = conn.rx.try_recv() {
            seen.push(match msg {
                Outbound::Event { event, .. } => event.id.clone(),
                Outbound::Eose { .. } => "EOSE".into(),
                other => panic!("unexpected {other:?}"),
            });
        }
        assert_eq!(seen, vec![old.id.clone(), "EOSE".into(), fresh.id.clone()]);
    }

    #[tokio::test]
    async fn filter_limits_are_enforced() {
        let r = relay();
        let conn = r.hub().connect();
        let too_many = vec![Filter::new(); 11];
        assert!(r.subscribe(conn.id, &conn.tx, "s", too_many).await.is_err());
        assert!(r.subscribe(conn.id, &conn.tx, "s", vec![]).await.is_err());
        assert_eq!(r.hub().subscription_count(), 0);
    }

    #[tokio::test]
    async fn count_unions_filters() {
        let r = relay();
        let owner = keys(1);
        lounge(&r, &owner).await;
        for t in 0..3 {
            accept(&r, &group_event(&owner, 9, NOW - 50 + t, "lounge", vec![])).await;
        }
        assert_eq!(r.count(&[Filter::new().kinds([9])]).unwrap(), 3);
        let both = [Filter::new().kinds([9]), Filter::new().authors([owner.public_key()])];
        // 3 messages + create-group; relay snapshots are authored by the relay.
        assert_eq!(r.count(&both).unwrap(), 4);
    }

    #[tokio::test]
    async fn rejected_events_for_unknown_groups_leave_no_state() {
        let r = relay();
        let stranger = keys(3);
        for i in 0..20u64 {
            let ev = group_event(&stranger, 9, NOW - 50 + i, &format!("g{i}"), vec![]);
            assert!(r.publish_at(ev, NOW).await.is_err());
        }
        assert_eq!(r.groups.cached(), 0);
    }

    #[tokio::test]
    async fn snapshot_failure_does_not_fail_the_admitted_event() {
        let needle = br#""kind":39000"#;
        let kv = FailingKv::new(move |batch| {
            batch.ops().iter().any(|op| match op {
                Op::Put(_, v) => v.windows(needle.len()).any(|w| w == needle),
                Op::Delete(_) => false,
            })
        });
        let store = Store::with_backend(Arc::new(kv), BTreeSet::from([39000, 39001, 39002]));
        let r = Relay::new(store, relay_keys(), RelayConfig::default());
        let owner = keys(1);
        let create = group_event(&owner, 9007, NOW - 100, "lounge", vec![]);
        assert_eq!(r.publish_at(create.clone(), NOW).await.unwrap(), Published::Stored);
        assert!(r.store().get(&create.id).unwrap().is_some());
        assert!(r.group("lounge").await.unwrap().is_admin(owner.public_key()));
        assert!(r.store().query(&Filter::new().kinds([39000])).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_moderation_is_serialised_per_group() {
        let r = Arc::new(relay());
        let owner = keys(1);
        let alice = keys(2);
        lounge(&r, &owner).await;
        accept(&r, &group_event(&owner, 9000, NOW - 90, "lounge", vec![p(&alice)])).await;
        accept(&r, &group_event(&owner, 9003, NOW - 80, "lounge", vec![p(&alice)])).await;

        // A held group blocks its own events but not other groups.
        let held = r.groups.lock("lounge").await;
        let chat = group_event(&owner, 9, NOW - 70, "lounge", vec![]);
        let blocked = tokio::spawn({
            let r = r.clone();
            async move { r.publish_at(chat, NOW).await }
        });
        let patio = group_event(&keys(3), 9007, NOW - 70, "patio", vec![]);
        let other = tokio::time::timeout(Duration::from_secs(5), r.publish_at(patio, NOW))
            .await
            .unwrap();
        assert_eq!(other.unwrap(), Published::Stored);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        drop(held);
        assert_eq!(blocked.await.unwrap().unwrap(), Published::Stored);

        // Each admin demotes the other at once.
        let demote_alice = group_event(&owner, 9004, NOW - 60, "lounge", vec![p(&alice)]);
        let demote_owner = group_event(&alice, 9004, NOW - 60, "lounge", vec![p(&owner)]);
        let spawn = |ev: Event| {
            let r = r.clone();
            tokio::spawn(async move { r.publish_at(ev, NOW).await })
        };
        let (a, b) = tokio::join!(spawn(demote_alice), spawn(demote_owner));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "{a:?} {b:?}");

        // The first admitted demotion strips the other author's admin role,
        // so the second is refused against the updated state.
        let (survivor, loser, refused) = if a.is_ok() {
            (&owner, &alice, &b)
        } else {
            (&alice, &owner, &a)
        };
        assert!(refused.as_ref().unwrap_err().to_string().starts_with("restricted:"));
        let state = r.group("lounge").await.unwrap();
        assert!(state.is_admin(survivor.public_key()));
        assert!(!state.is_admin(loser.public_key()));
        assert!(state.is_member(loser.public_key()));
    }
}
