//! Process-wide lookup of live sessions.
//!
//! External request handlers (status callbacks, out-of-band HTTP calls) only
//! see the payload of their own request. The registry derives a session key
//! from that payload according to the configured [`SessionIdKey`] policy and
//! returns the matching live [`Session`], if any.

use crate::{protocol::SetupMessage, session::Session};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Weak},
};
use thiserror::Error;
use tracing::{debug, info, warn};

const CALL_SID_FIELDS: [&str; 4] = ["CallSid", "Sid", "callSid", "sid"];
const SESSION_ID_FIELDS: [&str; 3] = ["sessionId", "SessionId", "id"];
const FROM_FIELDS: [&str; 2] = ["From", "from"];

const CALL_SID_PREFIX: &str = "CA";
const SESSION_ID_PREFIX: &str = "VX";

/// Which identifier sessions are registered and looked up under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionIdKey {
    /// The caller's address.
    From,
    /// The call identifier (`CA...`).
    #[default]
    CallSid,
    /// The relay session identifier (`VX...`).
    SessionId,
}

#[derive(Debug, Error)]
#[error("unknown session id key '{0}', expected one of: From, CallSid, SessionId")]
pub struct ParseSessionIdKeyError(String);

impl FromStr for SessionIdKey {
    type Err = ParseSessionIdKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "from" => Ok(SessionIdKey::From),
            "callsid" | "call_sid" => Ok(SessionIdKey::CallSid),
            "sessionid" | "session_id" => Ok(SessionIdKey::SessionId),
            _ => Err(ParseSessionIdKeyError(s.to_string())),
        }
    }
}

impl fmt::Display for SessionIdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionIdKey::From => write!(f, "From"),
            SessionIdKey::CallSid => write!(f, "CallSid"),
            SessionIdKey::SessionId => write!(f, "SessionId"),
        }
    }
}

/// A payload that keys can be derived from.
///
/// Only string values count as present; nulls and other JSON types are
/// treated as missing.
pub trait KeySource {
    fn field(&self, name: &str) -> Option<&str>;
}

impl KeySource for Map<String, Value> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }
}

impl KeySource for Value {
    fn field(&self, name: &str) -> Option<&str> {
        self.as_object().and_then(|map| map.field(name))
    }
}

impl KeySource for HashMap<String, String> {
    fn field(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl KeySource for SetupMessage {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "callSid" => Some(self.call_sid.as_str()),
            "sessionId" => Some(self.session_id.as_str()),
            "from" => Some(self.from.as_str()),
            _ => None,
        }
    }
}

fn first_of<'a, P>(payload: &'a P, fields: &[&str]) -> Option<&'a str>
where
    P: KeySource + ?Sized,
{
    fields.iter().find_map(|name| payload.field(name))
}

/// Derives the registry key for `payload` under `policy`.
///
/// The policy's identifier is tried first and must carry its expected prefix;
/// otherwise the caller address (`From`/`from`) is used. Returns `None` when
/// neither yields a non-empty key.
pub fn derive_key<P>(payload: &P, policy: SessionIdKey) -> Option<String>
where
    P: KeySource + ?Sized,
{
    let candidate = match policy {
        SessionIdKey::CallSid => first_of(payload, &CALL_SID_FIELDS)
            .filter(|sid| sid.starts_with(CALL_SID_PREFIX)),
        SessionIdKey::SessionId => first_of(payload, &SESSION_ID_FIELDS)
            .filter(|id| id.starts_with(SESSION_ID_PREFIX)),
        SessionIdKey::From => None,
    };
    candidate
        .or_else(|| first_of(payload, &FROM_FIELDS).filter(|from| !from.is_empty()))
        .map(str::to_string)
}

/// Concurrent map from session key to live session.
///
/// Entries do not keep sessions alive: once a connection's session is dropped
/// its entry resolves to nothing and is pruned lazily.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Weak<Session>>,
    policy: SessionIdKey,
}

impl SessionRegistry {
    pub fn new(policy: SessionIdKey) -> Self {
        Self {
            sessions: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> SessionIdKey {
        self.policy
    }

    /// Derives a key from `payload` using this registry's policy.
    pub fn key_for<P>(&self, payload: &P) -> Option<String>
    where
        P: KeySource + ?Sized,
    {
        derive_key(payload, self.policy)
    }

    /// Registers `session` under `key`, replacing any previous entry.
    ///
    /// Returns the previously registered session if it was still alive.
    pub fn register(&self, key: impl Into<String>, session: &Arc<Session>) -> Option<Arc<Session>> {
        let key = key.into();
        let previous = self
            .sessions
            .insert(key.clone(), Arc::downgrade(session))
            .and_then(|weak| weak.upgrade());
        if previous.is_some() {
            warn!(%key, "Replacing a live session registered under the same key.");
        } else {
            info!(%key, "Session registered.");
        }
        previous
    }

    /// Looks a session up by its exact key.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        // Clone out of the map so the shard lock is released before any removal.
        let weak = self.sessions.get(key).map(|entry| entry.value().clone())?;
        let session = weak.upgrade();
        if session.is_none() {
            self.sessions.remove_if(key, |_, weak| weak.strong_count() == 0);
            debug!(%key, "Pruned stale session entry.");
        }
        session
    }

    /// Removes the entry for `key` if it still refers to `session`.
    ///
    /// A newer session registered under the same key is left in place.
    pub fn deregister(&self, key: &str, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(key, |_, weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(session)))
            .is_some();
        if removed {
            info!(%key, "Session deregistered.");
        }
        removed
    }

    /// Finds the session an external request refers to.
    ///
    /// An explicit key is looked up as-is. Otherwise the key is derived from
    /// `payload`; see [`derive_key`]. A miss is a normal outcome.
    pub fn resolve<P>(&self, explicit_key: Option<&str>, payload: &P) -> Option<Arc<Session>>
    where
        P: KeySource + ?Sized,
    {
        let key = match explicit_key {
            Some(key) => key.to_string(),
            None => self.key_for(payload)?,
        };
        let session = self.get(&key);
        debug!(%key, found = session.is_some(), "Resolved session.");
        session
    }

    /// Number of entries, including ones whose session has already gone.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of entries whose session is still alive.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Drops entries whose session has gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, weak| weak.strong_count() > 0);
        before.saturating_sub(self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Transport;
    use async_trait::async_trait;
    use serde_json::json;

    struct Detached;

    #[async_trait]
    impl Transport for Detached {
        fn is_open(&self) -> bool {
            false
        }

        async fn send_text(&self, _frame: String) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(Arc::new(Detached)))
    }

    fn registry_with(policy: SessionIdKey, keys: &[&str]) -> (SessionRegistry, Vec<Arc<Session>>) {
        let registry = SessionRegistry::new(policy);
        let sessions = keys
            .iter()
            .map(|key| {
                let session = session();
                registry.register(*key, &session);
                session
            })
            .collect();
        (registry, sessions)
    }

    fn same(a: &Option<Arc<Session>>, b: &Arc<Session>) -> bool {
        a.as_ref().is_some_and(|a| Arc::ptr_eq(a, b))
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("From".parse::<SessionIdKey>().unwrap(), SessionIdKey::From);
        assert_eq!("callsid".parse::<SessionIdKey>().unwrap(), SessionIdKey::CallSid);
        assert_eq!("SESSION_ID".parse::<SessionIdKey>().unwrap(), SessionIdKey::SessionId);
        assert!("phone".parse::<SessionIdKey>().is_err());
        assert_eq!(SessionIdKey::default().to_string(), "CallSid");
    }

    #[test]
    fn registry_keeps_its_policy() {
        let registry = SessionRegistry::new(SessionIdKey::SessionId);
        assert_eq!(registry.policy(), SessionIdKey::SessionId);
        assert_eq!(SessionRegistry::default().policy(), SessionIdKey::CallSid);
    }

    #[test]
    fn call_sid_policy_uses_field_precedence() {
        let (registry, sessions) = registry_with(SessionIdKey::CallSid, &["CA1", "CA2"]);

        assert!(same(&registry.resolve(None, &json!({"CallSid": "CA1"})), &sessions[0]));
        assert!(same(&registry.resolve(None, &json!({"sid": "CA2"})), &sessions[1]));
        assert!(same(
            &registry.resolve(None, &json!({"Sid": "CA2", "callSid": "CA1"})),
            &sessions[1]
        ));
    }

    #[test]
    fn bad_call_sid_prefix_falls_back_to_from() {
        let (registry, sessions) = registry_with(SessionIdKey::CallSid, &["CA1", "+15550001"]);

        assert!(registry.resolve(None, &json!({"CallSid": "XX1"})).is_none());
        assert!(same(
            &registry.resolve(None, &json!({"CallSid": "XX1", "from": "+15550001"})),
            &sessions[1]
        ));
        // The first present field decides, even when a later one would pass.
        assert!(registry
            .resolve(None, &json!({"CallSid": "XX1", "Sid": "CA1"}))
            .is_none());
    }

    #[test]
    fn session_id_policy() {
        let (registry, sessions) = registry_with(SessionIdKey::SessionId, &["VX2", "+1"]);

        assert!(same(&registry.resolve(None, &json!({"SessionId": "VX2"})), &sessions[0]));
        assert!(same(&registry.resolve(None, &json!({"id": "VX2"})), &sessions[0]));
        assert!(registry.resolve(None, &json!({"SessionId": "CA2"})).is_none());
        assert!(same(
            &registry.resolve(None, &json!({"sessionId": "bad", "From": "+1"})),
            &sessions[1]
        ));
    }

    #[test]
    fn from_policy_uses_address() {
        let (registry, sessions) = registry_with(SessionIdKey::From, &["+1", "CA1"]);

        assert!(same(&registry.resolve(None, &json!({"From": "+1"})), &sessions[0]));
        // The call identifier is never consulted under this policy.
        assert!(registry.resolve(None, &json!({"CallSid": "CA1"})).is_none());
        assert!(registry.resolve(None, &json!({"From": ""})).is_none());
        assert!(registry.resolve(None, &json!({})).is_none());
    }

    #[test]
    fn explicit_key_bypasses_policy() {
        let (registry, sessions) = registry_with(SessionIdKey::CallSid, &["anything"]);
        assert!(same(
            &registry.resolve(Some("anything"), &json!({"CallSid": "CA9"})),
            &sessions[0]
        ));
        assert!(registry.resolve(Some("missing"), &json!({})).is_none());
    }

    #[test]
    fn form_payloads_and_setup_frames_derive_keys() {
        let form: HashMap<String, String> =
            [("CallSid".to_string(), "CA77".to_string())].into_iter().collect();
        assert_eq!(derive_key(&form, SessionIdKey::CallSid).as_deref(), Some("CA77"));

        let setup: SetupMessage = serde_json::from_value(json!({
            "sessionId": "VX5",
            "callSid": "CA5",
            "accountSid": "AC5",
            "from": "+15550005",
            "to": "+15550006",
            "direction": "inbound"
        }))
        .unwrap();
        assert_eq!(derive_key(&setup, SessionIdKey::CallSid).as_deref(), Some("CA5"));
        assert_eq!(derive_key(&setup, SessionIdKey::SessionId).as_deref(), Some("VX5"));
        assert_eq!(derive_key(&setup, SessionIdKey::From).as_deref(), Some("+15550005"));
    }

    #[test]
    fn non_string_values_are_ignored() {
        let numeric = json!({"CallSid": 42, "Sid": "CA3"});
        assert_eq!(derive_key(&numeric, SessionIdKey::CallSid).as_deref(), Some("CA3"));

        let null_from = json!({"From": null, "from": "+2"});
        assert_eq!(derive_key(&null_from, SessionIdKey::From).as_deref(), Some("+2"));
    }

    #[test]
    fn last_registration_wins() {
        let registry = SessionRegistry::new(SessionIdKey::CallSid);
        let first = session();
        let second = session();

        assert!(registry.register("CA1", &first).is_none());
        let replaced = registry.register("CA1", &second);
        assert!(same(&replaced, &first));
        assert!(same(&registry.get("CA1"), &second));

        // The older session closing must not evict the newer one.
        assert!(!registry.deregister("CA1", &first));
        assert!(registry.deregister("CA1", &second));
        assert!(registry.get("CA1").is_none());
    }

    #[test]
    fn dropped_sessions_are_not_returned() {
        let (registry, mut sessions) = registry_with(SessionIdKey::CallSid, &["CA1", "CA2"]);
        sessions.remove(0);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get("CA1").is_none());
        assert_eq!(registry.len(), 1);

        sessions.clear();
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_and_lookup() {
        let registry = Arc::new(SessionRegistry::new(SessionIdKey::CallSid));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let session = session();
                let key = format!("CA{i}");
                registry.register(key.clone(), &session);
                for _ in 0..100 {
                    let found = registry.resolve(None, &json!({ "CallSid": key }));
                    assert!(found.is_some_and(|found| Arc::ptr_eq(&found, &session)));
                    tokio::task::yield_now().await;
                }
                session
            }));
        }
        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }
        assert_eq!(registry.active_count(), 64);
    }
}
