//! Nostr event model, canonical hashing and Schnorr signatures.

use rand::RngCore;
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the following elements hold data.
/// The group extension relies on a few of them:
///
/// - `h` – the group an event is addressed to
/// - `d` – the group a relay-signed metadata snapshot describes
/// - `p` – the member targeted by a moderation action
/// - `e` – the event targeted by a delete request
///
/// Tags are stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name, e.g. `"h"`.
    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event as received from clients and persisted by the store.
///
/// ```json
/// {
///   "id": "aa11…",
///   "pubkey": "79be…",
///   "kind": 9,
///   "created_at": 1700000000,
///   "tags": [["h", "lounge"]],
///   "content": "hello",
///   "sig": "dead…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `9` for a group chat message.
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some(key))
            .and_then(Tag::value)
    }

    /// All first values of tags named `key`, in tag order.
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.key() == Some(key))
            .filter_map(Tag::value)
    }

    /// Whether a tag with exactly this name is present, regardless of values.
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.iter().any(|t| t.key() == Some(key))
    }

    /// Group id from the `h` tag, if the event is addressed to a group.
    pub fn group_id(&self) -> Option<&str> {
        self.tag_value("h")
    }

    /// Total fold/query ordering key: `(created_at, id)`.
    pub fn order_key(&self) -> (u64, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Check hex shapes of id, pubkey and sig without any cryptography.
    pub fn check_shape(&self) -> Result<()> {
        if !is_lower_hex(&self.id, 64) {
            return Err(Error::validation("id must be 64 lowercase hex characters"));
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(Error::validation(
                "pubkey must be 64 lowercase hex characters",
            ));
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err(Error::validation(
                "sig must be 128 lowercase hex characters",
            ));
        }
        Ok(())
    }

    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<()> {
        self.check_shape()?;
        let hash = event_hash(self)?;
        if hex::encode(hash) != self.id {
            return Err(Error::validation("id mismatch"));
        }
        let sig_bytes = hex::decode(&self.sig).map_err(|e| Error::validation(e.to_string()))?;
        let pk_bytes = hex::decode(&self.pubkey).map_err(|e| Error::validation(e.to_string()))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| Error::validation(format!("bad signature encoding: {e}")))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|e| Error::validation(format!("bad public key: {e}")))?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Error::validation(e.to_string()))?;
        Secp256k1::verification_only()
            .verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| Error::validation("signature verification failed"))
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Signing identity; the relay uses one to publish group snapshots.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_hex: String,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_hex)
            .finish_non_exhaustive()
    }
}

impl Keys {
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, secret)
            .map_err(|e| Error::validation(format!("bad secret key: {e}")))?;
        let public_hex = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self {
            keypair,
            public_hex,
        })
    }

    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| Error::validation(format!("secret key is not hex: {e}")))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Fresh random key pair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(keys) = Self::from_secret_bytes(&secret) {
                return keys;
            }
        }
    }

    /// Hex x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_hex
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// Build, hash and sign a new event authored by these keys.
    pub fn sign(
        &self,
        kind: u32,
        created_at: u64,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Result<Event> {
        let mut ev = Event {
            id: String::new(),
            pubkey: self.public_hex.clone(),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).map_err(|e| Error::validation(e.to_string()))?;
        let sig = Secp256k1::new().sign_schnorr_no_aux_rand(&msg, &self.keypair);
        ev.sig = hex::encode(sig.as_ref());
        Ok(ev)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic keys derived from a single repeated byte.
    pub fn keys(seed: u8) -> Keys {
        Keys::from_secret_bytes(&[seed; 32]).unwrap()
    }

    /// Signed event with the given `h` group tag plus extra tags.
    pub fn group_event(
        keys: &Keys,
        kind: u32,
        created_at: u64,
        group: &str,
        extra: Vec<Tag>,
    ) -> Event {
        let mut tags = vec![Tag::new(["h", group])];
        tags.extend(extra);
        keys.sign(kind, created_at, tags, "").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::keys;
    use super::*;

    #[test]
    fn signed_event_verifies() {
        let k = keys(1);
        let ev = k
            .sign(9, 1, vec![Tag::new(["h", "g"])], "hello")
            .unwrap();
        assert_eq!(ev.pubkey, k.public_key());
        ev.verify().unwrap();
    }

    #[test]
    fn mutating_any_field_invalidates() {
        let ev = keys(1)
            .sign(9, 1, vec![Tag::new(["h", "g"])], "hello")
            .unwrap();
        let mutations: Vec<Box<dyn Fn(&mut Event)>> = vec![
            Box::new(|e| e.content.push('!')),
            Box::new(|e| e.created_at += 1),
            Box::new(|e| e.kind = 10),
            Box::new(|e| e.tags.push(Tag::new(["t", "x"]))),
            Box::new(|e| e.pubkey = keys(2).public_key().to_string()),
            Box::new(|e| e.sig.replace_range(0..2, "00")),
            Box::new(|e| e.id.replace_range(0..2, "ff")),
        ];
        for m in mutations {
            let mut bad = ev.clone();
            m(&mut bad);
            if bad == ev {
                continue;
            }
            assert!(bad.verify().is_err(), "mutation went undetected: {bad:?}");
        }
    }

    #[test]
    fn shape_rejects_uppercase_and_short_hex() {
        let mut ev = keys(3).sign(9, 1, vec![], "").unwrap();
        ev.id = ev.id.to_uppercase();
        assert!(ev.check_shape().is_err());
        let mut ev = keys(3).sign(9, 1, vec![], "").unwrap();
        ev.sig.truncate(10);
        assert!(matches!(ev.verify(), Err(Error::Validation(_))));
    }

    #[test]
    fn event_hash_matches_reference() {
        let ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&obj).unwrap());
            let out: [u8; 32] = hasher.finalize().into();
            out
        };
        assert_eq!(event_hash(&ev).unwrap(), expected);
    }

    #[test]
    fn tag_helpers() {
        let ev = keys(4)
            .sign(
                9000,
                5,
                vec![
                    Tag::new(["h", "lounge"]),
                    Tag::new(["p", "aa"]),
                    Tag::new(["p", "bb", "admin"]),
                    Tag::new(["open"]),
                ],
                "",
            )
            .unwrap();
        assert_eq!(ev.group_id(), Some("lounge"));
        assert_eq!(ev.tag_values("p").collect::<Vec<_>>(), vec!["aa", "bb"]);
        assert!(ev.has_tag("open"));
        assert_eq!(ev.tag_value("open"), None);
    }

    #[test]
    fn keys_round_trip_through_hex() {
        let k = Keys::generate();
        let again = Keys::from_secret_hex(&k.secret_hex()).unwrap();
        assert_eq!(k.public_key(), again.public_key());
        assert!(Keys::from_secret_hex("zz").is_err());
    }
}
