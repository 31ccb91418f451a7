//! Configuration loading from `.env` files.

use std::{collections::BTreeSet, env, path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};

use crate::event::Keys;
use crate::policy::{KindSet, PolicyConfig};
use crate::relay::RelayConfig;

/// Every key `Settings::from_env` reads.
pub const KEYS: &[&str] = &[
    "STORE_ROOT",
    "BIND_HTTP",
    "BIND_WS",
    "RELAY_PRIVATE_KEY",
    "RELAY_PUBLIC_KEY",
    "RELAY_NAME",
    "RELAY_DESCRIPTION",
    "ALLOWED_KINDS",
    "REPLACEABLE_KINDS",
    "MAX_CONTENT_LENGTH",
    "MAX_TAGS",
    "MAX_FUTURE_SECS",
    "MAX_FILTERS",
    "MAX_LIMIT",
    "EVENTS_PER_MINUTE",
    "EVENT_BURST",
    "SUBSCRIBER_BUFFER",
    "ALLOW_GROUP_CREATION",
];

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:3334`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:3335`.
    pub bind_ws: String,
    /// Key that signs group snapshots and acts as super-admin.
    pub relay_keys: Keys,
    pub relay: RelayConfig,
    /// Kinds where only the newest event per key is served.
    pub replaceable_kinds: BTreeSet<u32>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS").context("BIND_WS")?;

        let secret = env::var("RELAY_PRIVATE_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .context("RELAY_PRIVATE_KEY must be set")?;
        let relay_keys = Keys::from_secret_hex(&secret).context("RELAY_PRIVATE_KEY")?;
        if let Some(public) = env::var("RELAY_PUBLIC_KEY").ok().filter(|s| !s.is_empty()) {
            if public.trim() != relay_keys.public_key() {
                bail!("RELAY_PUBLIC_KEY does not match RELAY_PRIVATE_KEY");
            }
        }

        let defaults = RelayConfig::default();
        let policy_defaults = PolicyConfig::default();
        let allowed_kinds = match env::var("ALLOWED_KINDS").ok().filter(|s| !s.trim().is_empty()) {
            Some(raw) => {
                let kinds = KindSet::parse(&raw).context("ALLOWED_KINDS")?;
                if kinds.is_empty() {
                    bail!("ALLOWED_KINDS accepts no kinds");
                }
                kinds
            }
            None => policy_defaults.allowed_kinds.clone(),
        };
        let replaceable_kinds = match env::var("REPLACEABLE_KINDS") {
            Ok(s) => csv_u32(s).into_iter().collect(),
            Err(_) => BTreeSet::from([39000, 39001, 39002]),
        };
        let policy = PolicyConfig {
            allowed_kinds,
            max_content_length: parsed("MAX_CONTENT_LENGTH", policy_defaults.max_content_length)?,
            max_tags: parsed("MAX_TAGS", policy_defaults.max_tags)?,
            max_future_secs: parsed("MAX_FUTURE_SECS", policy_defaults.max_future_secs)?,
            events_per_minute: parsed("EVENTS_PER_MINUTE", policy_defaults.events_per_minute)?,
            event_burst: parsed("EVENT_BURST", policy_defaults.event_burst)?,
        };
        let relay = RelayConfig {
            name: env::var("RELAY_NAME").unwrap_or(defaults.name),
            description: env::var("RELAY_DESCRIPTION").unwrap_or(defaults.description),
            policy,
            max_filters: parsed("MAX_FILTERS", defaults.max_filters)?,
            max_limit: parsed("MAX_LIMIT", defaults.max_limit)?,
            subscriber_buffer: parsed("SUBSCRIBER_BUFFER", defaults.subscriber_buffer)?,
            allow_group_creation: env::var("ALLOW_GROUP_CREATION")
                .map(|v| v != "0")
                .unwrap_or(defaults.allow_group_creation),
        };
        Ok(Self {
            store_root,
            bind_http,
            bind_ws,
            relay_keys,
            relay,
            replaceable_kinds,
        })
    }
}

/// Parse `key` if set and non-empty, otherwise use `default`.
fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().with_context(|| format!("parsing {key}")),
        _ => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Split a comma-separated string into `u32` values, skipping invalid entries.
pub fn csv_u32(input: impl AsRef<str>) -> Vec<u32> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}
