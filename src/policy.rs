//! Admission pipeline: an ordered list of named stages.
//!
//! Each stage inspects an [`Admission`] and either lets it continue, accepts
//! it outright or rejects it with a prefixed reason. The pipeline stops at the
//! first verdict that is not `Continue`.

use std::{
    collections::HashMap,
    fmt,
    ops::RangeInclusive,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::groups::{Action, GroupRules, GroupState};

/// Closed set of kinds given as inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSet {
    ranges: Vec<RangeInclusive<u32>>,
}

impl KindSet {
    pub fn from_ranges<I: IntoIterator<Item = RangeInclusive<u32>>>(ranges: I) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    /// Parse `"9-12,9000-9021,39000"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut ranges = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let num = |s: &str| {
                s.trim()
                    .parse::<u32>()
                    .map_err(|_| Error::validation(format!("bad kind `{s}`")))
            };
            let range = match part.split_once('-') {
                Some((lo, hi)) => num(lo)?..=num(hi)?,
                None => {
                    let k = num(part)?;
                    k..=k
                }
            };
            if range.is_empty() {
                return Err(Error::validation(format!("empty kind range `{part}`")));
            }
            ranges.push(range);
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, kind: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(&kind))
    }

    pub fn ranges(&self) -> &[RangeInclusive<u32>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|r| {
                if r.start() == r.end() {
                    r.start().to_string()
                } else {
                    format!("{}-{}", r.start(), r.end())
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Limits and allow-lists enforced at admission.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub allowed_kinds: KindSet,
    pub max_content_length: usize,
    pub max_tags: usize,
    /// How far `created_at` may run ahead of the relay clock.
    pub max_future_secs: u64,
    pub events_per_minute: u32,
    pub event_burst: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_kinds: KindSet::from_ranges([9..=12, 9000..=9021, 39000..=39002]),
            max_content_length: 64 * 1024,
            max_tags: 2500,
            max_future_secs: 15 * 60,
            events_per_minute: 120,
            event_burst: 30,
        }
    }
}

/// What a stage sees: the event, the group snapshot held under the group
/// lock (if the event is addressed to one) and the relay clock.
pub struct Admission<'a> {
    pub event: &'a Event,
    pub group: Option<&'a GroupState>,
    pub now: u64,
}

#[derive(Debug)]
pub enum Verdict {
    Continue,
    Accept,
    Reject(Error),
}

/// One admission check.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, adm: &Admission<'_>) -> Verdict;
}

/// Ordered stages with short-circuit evaluation.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Structure, limits, kind allow-list, rate limit, group authorisation.
    pub fn standard(cfg: &PolicyConfig, rules: Arc<GroupRules>) -> Self {
        Self::new()
            .with_stage(Structure)
            .with_stage(Limits {
                max_content_length: cfg.max_content_length,
                max_tags: cfg.max_tags,
                max_future_secs: cfg.max_future_secs,
            })
            .with_stage(KindAllowList(cfg.allowed_kinds.clone()))
            .with_stage(RateLimit::new(
                cfg.events_per_minute,
                cfg.event_burst,
                [rules.relay_pubkey.clone()],
            ))
            .with_stage(GroupAuthorization(rules))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn admit(&self, adm: &Admission<'_>) -> Result<()> {
        for stage in &self.stages {
            match stage.check(adm) {
                Verdict::Continue => {}
                Verdict::Accept => {
                    trace!(stage = stage.name(), id = %adm.event.id, "accepted early");
                    return Ok(());
                }
                Verdict::Reject(err) => {
                    debug!(stage = stage.name(), id = %adm.event.id, reason = %err, "rejected");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

fn reject(err: Error) -> Verdict {
    Verdict::Reject(err)
}

/// Hex shapes, id recomputation and Schnorr signature.
pub struct Structure;

impl Stage for Structure {
    fn name(&self) -> &'static str {
        "structure"
    }

    fn check(&self, adm: &Admission<'_>) -> Verdict {
        match adm.event.verify() {
            Ok(()) => Verdict::Continue,
            Err(e) => reject(e),
        }
    }
}

/// Oversized events are rejected, never truncated.
pub struct Limits {
    pub max_content_length: usize,
    pub max_tags: usize,
    pub max_future_secs: u64,
}

impl Stage for Limits {
    fn name(&self) -> &'static str {
        "limits"
    }

    fn check(&self, adm: &Admission<'_>) -> Verdict {
        let ev = adm.event;
        if ev.content.len() > self.max_content_length {
            return reject(Error::validation(format!(
                "content exceeds {} bytes",
                self.max_content_length
            )));
        }
        if ev.tags.len() > self.max_tags {
            return reject(Error::validation(format!("more than {} tags", self.max_tags)));
        }
        if ev.created_at > adm.now.saturating_add(self.max_future_secs) {
            return reject(Error::validation("created_at is too far in the future"));
        }
        Verdict::Continue
    }
}

pub struct KindAllowList(pub KindSet);

impl Stage for KindAllowList {
    fn name(&self) -> &'static str {
        "kind-allow-list"
    }

    fn check(&self, adm: &Admission<'_>) -> Verdict {
        if self.0.contains(adm.event.kind) {
            Verdict::Continue
        } else {
            reject(Error::authorization(format!(
                "kind {} is not accepted here",
                adm.event.kind
            )))
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn try_take(&mut self, capacity: u32, per_sec: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(capacity as f64);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

const BUCKET_IDLE: Duration = Duration::from_secs(600);

/// Per-pubkey token bucket. The only stage that keeps state of its own.
pub struct RateLimit {
    capacity: u32,
    per_sec: f64,
    exempt: Vec<String>,
    buckets: Mutex<(HashMap<String, TokenBucket>, Instant)>,
}

impl RateLimit {
    /// `per_minute == 0` disables the limit.
    pub fn new(per_minute: u32, burst: u32, exempt: impl IntoIterator<Item = String>) -> Self {
        Self {
            capacity: burst.max(1),
            per_sec: per_minute as f64 / 60.0,
            exempt: exempt.into_iter().collect(),
            buckets: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, pubkey: &str, now: Instant) -> bool {
        let mut guard = self.buckets.lock();
        let (buckets, last_sweep) = &mut *guard;
        if now.saturating_duration_since(*last_sweep) > BUCKET_IDLE {
            let before = buckets.len();
            buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < BUCKET_IDLE);
            debug!(removed = before - buckets.len(), "swept idle rate-limit buckets");
            *last_sweep = now;
        }
        buckets
            .entry(pubkey.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity, now))
            .try_take(self.capacity, self.per_sec, now)
    }
}

impl Stage for RateLimit {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn check(&self, adm: &Admission<'_>) -> Verdict {
        let pubkey = adm.event.pubkey.as_str();
        if self.per_sec == 0.0 || self.exempt.iter().any(|p| p == pubkey) {
            return Verdict::Continue;
        }
        if self.allow(pubkey, Instant::now()) {
            Verdict::Continue
        } else {
            reject(Error::RateLimited("slow down".into()))
        }
    }
}

/// Role checks against the current group snapshot.
pub struct GroupAuthorization(pub Arc<GroupRules>);

impl Stage for GroupAuthorization {
    fn name(&self) -> &'static str {
        "group-authorization"
    }

    fn check(&self, adm: &Admission<'_>) -> Verdict {
        let rules = &self.0;
        let ev = adm.event;
        let author = ev.pubkey.as_str();

        if rules.kinds.is_snapshot(ev.kind) {
            return if rules.is_super_admin(author) {
                Verdict::Accept
            } else {
                reject(Error::authorization("only the relay publishes group state"))
            };
        }
        if ev.group_id().is_none() {
            return if rules.is_group_kind(ev.kind) {
                reject(Error::validation("missing h tag"))
            } else {
                Verdict::Continue
            };
        }
        if rules.is_super_admin(author) {
            return Verdict::Accept;
        }

        let action = rules.kinds.action(ev.kind);
        let state = adm.group.filter(|g| g.created);
        let Some(state) = state else {
            return if action == Some(Action::CreateGroup) {
                Verdict::Continue
            } else {
                reject(Error::authorization("unknown group"))
            };
        };
        if state.deleted {
            return reject(Error::authorization("group has been deleted"));
        }
        match action {
            Some(Action::CreateGroup) => reject(Error::authorization("group already exists")),
            Some(Action::JoinRequest) => Verdict::Continue,
            Some(_) if !state.is_admin(author) => {
                reject(Error::authorization("only group admins may do that"))
            }
            Some(_) => Verdict::Continue,
            None if !state.is_member(author) => {
                reject(Error::authorization("you are not a member of this group"))
            }
            None => Verdict::Continue,
        }
    }
}
