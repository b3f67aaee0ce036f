//! Shared agent state: the connecting record, one-shot credential caches,
//! and the deferred VPN save.
//!
//! Everything here is touched from the bus's worker tasks, so it sits
//! behind locks. The caches are keyed by connection UUID and consumed on
//! match; a mismatching UUID drops the cached entry's claim to relevance
//! but leaves it in place for its own connection.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// How long a failed Wi-Fi attempt counts as "recent" for the
/// wrong-password prompt reason.
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// What the shell is currently activating. The agent only answers for
/// these; anything else defers to other agents.
#[derive(Debug, Clone, Default)]
pub struct ConnectingState {
    pub is_connecting: bool,
    pub connecting_ssid: String,
    pub is_connecting_vpn: bool,
    pub connecting_vpn_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPkcs11Pin {
    pub connection_uuid: String,
    pub pin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedVpnCredentials {
    pub connection_uuid: String,
    pub password: String,
    pub save_password: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedGpSamlCookie {
    pub connection_uuid: String,
    pub cookie: String,
    pub host: String,
    pub user: String,
    pub fingerprint: String,
}

/// Credentials to persist after NetworkManager confirms the activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingVpnSave {
    pub connection_path: String,
    pub username: String,
    pub password: String,
    pub save_password: bool,
}

/// All mutable agent state.
#[derive(Default)]
pub struct AgentState {
    connecting: RwLock<ConnectingState>,
    cached_pkcs11: Mutex<Option<CachedPkcs11Pin>>,
    cached_vpn: Mutex<Option<CachedVpnCredentials>>,
    cached_gp_saml: Mutex<Option<CachedGpSamlCookie>>,
    pending_vpn_save: Mutex<Option<PendingVpnSave>>,
    recent_failures: Mutex<HashMap<String, Instant>>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Connecting record
    // -------------------------------------------------------------------------

    pub fn connecting(&self) -> ConnectingState {
        self.connecting.read().unwrap().clone()
    }

    pub fn set_connecting_wifi(&self, ssid: &str) {
        let mut state = self.connecting.write().unwrap();
        state.is_connecting = true;
        state.connecting_ssid = ssid.to_owned();
    }

    pub fn set_connecting_vpn(&self, uuid: &str) {
        let mut state = self.connecting.write().unwrap();
        state.is_connecting_vpn = true;
        state.connecting_vpn_uuid = uuid.to_owned();
    }

    /// Clears the connecting record, returning what it was.
    pub fn clear_connecting(&self) -> ConnectingState {
        let mut state = self.connecting.write().unwrap();
        std::mem::take(&mut state)
    }

    // -------------------------------------------------------------------------
    // Recent failures
    // -------------------------------------------------------------------------

    pub fn mark_recent_failure(&self, ssid: &str) {
        self.recent_failures
            .lock()
            .unwrap()
            .insert(ssid.to_owned(), Instant::now());
    }

    pub fn was_recently_failed(&self, ssid: &str) -> bool {
        let mut failures = self.recent_failures.lock().unwrap();
        failures.retain(|_, at| at.elapsed() < RECENT_FAILURE_WINDOW);
        failures.contains_key(ssid)
    }

    // -------------------------------------------------------------------------
    // One-shot caches
    // -------------------------------------------------------------------------

    pub fn cache_pkcs11_pin(&self, pin: CachedPkcs11Pin) {
        *self.cached_pkcs11.lock().unwrap() = Some(pin);
    }

    /// Consumes the cached PIN if it belongs to `uuid`.
    pub fn take_pkcs11_pin(&self, uuid: &str) -> Option<CachedPkcs11Pin> {
        let mut slot = self.cached_pkcs11.lock().unwrap();
        if slot.as_ref().is_some_and(|c| c.connection_uuid == uuid) {
            slot.take()
        } else {
            None
        }
    }

    pub fn cache_vpn_credentials(&self, creds: CachedVpnCredentials) {
        *self.cached_vpn.lock().unwrap() = Some(creds);
    }

    pub fn take_vpn_credentials(&self, uuid: &str) -> Option<CachedVpnCredentials> {
        let mut slot = self.cached_vpn.lock().unwrap();
        if slot.as_ref().is_some_and(|c| c.connection_uuid == uuid) {
            slot.take()
        } else {
            None
        }
    }

    pub fn cache_gp_saml(&self, cookie: CachedGpSamlCookie) {
        *self.cached_gp_saml.lock().unwrap() = Some(cookie);
    }

    pub fn take_gp_saml(&self, uuid: &str) -> Option<CachedGpSamlCookie> {
        let mut slot = self.cached_gp_saml.lock().unwrap();
        if slot.as_ref().is_some_and(|c| c.connection_uuid == uuid) {
            slot.take()
        } else {
            None
        }
    }

    // -------------------------------------------------------------------------
    // Deferred persistence
    // -------------------------------------------------------------------------

    pub fn queue_vpn_save(&self, save: PendingVpnSave) {
        *self.pending_vpn_save.lock().unwrap() = Some(save);
    }

    /// Taken by the activation watcher once NM reports the connection up.
    pub fn take_pending_vpn_save(&self) -> Option<PendingVpnSave> {
        self.pending_vpn_save.lock().unwrap().take()
    }

    /// Consumes the pending save if it belongs to `connection_path`.
    pub fn take_pending_vpn_save_for(&self, connection_path: &str) -> Option<PendingVpnSave> {
        let mut slot = self.pending_vpn_save.lock().unwrap();
        if slot
            .as_ref()
            .is_some_and(|s| s.connection_path == connection_path)
        {
            slot.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_are_single_shot() {
        let state = AgentState::new();
        state.cache_pkcs11_pin(CachedPkcs11Pin {
            connection_uuid: "u-1".to_owned(),
            pin: "1234".to_owned(),
        });

        assert!(state.take_pkcs11_pin("u-1").is_some());
        assert!(state.take_pkcs11_pin("u-1").is_none(), "consumed on match");
    }

    #[test]
    fn mismatched_uuid_does_not_consume() {
        let state = AgentState::new();
        state.cache_vpn_credentials(CachedVpnCredentials {
            connection_uuid: "u-1".to_owned(),
            password: "pw".to_owned(),
            save_password: false,
        });

        assert!(state.take_vpn_credentials("u-2").is_none());
        assert!(state.take_vpn_credentials("u-1").is_some());
    }

    #[test]
    fn gp_saml_cache_round_trips() {
        let state = AgentState::new();
        let cookie = CachedGpSamlCookie {
            connection_uuid: "u-3".to_owned(),
            cookie: "authcookie".to_owned(),
            host: "vpn.example.com".to_owned(),
            user: "alice".to_owned(),
            fingerprint: "pin-sha256:abc".to_owned(),
        };
        state.cache_gp_saml(cookie.clone());
        assert_eq!(state.take_gp_saml("u-3"), Some(cookie));
        assert!(state.take_gp_saml("u-3").is_none());
    }

    #[test]
    fn connecting_record_clears_whole() {
        let state = AgentState::new();
        state.set_connecting_wifi("Alpha");
        state.set_connecting_vpn("u-9");

        let prev = state.clear_connecting();
        assert!(prev.is_connecting);
        assert_eq!(prev.connecting_ssid, "Alpha");
        assert!(prev.is_connecting_vpn);

        let now = state.connecting();
        assert!(!now.is_connecting && !now.is_connecting_vpn);
    }

    #[test]
    fn recent_failures_expire_by_window() {
        let state = AgentState::new();
        assert!(!state.was_recently_failed("Alpha"));
        state.mark_recent_failure("Alpha");
        assert!(state.was_recently_failed("Alpha"));
        assert!(!state.was_recently_failed("Beta"));
    }

    #[test]
    fn pending_save_matches_by_path() {
        let state = AgentState::new();
        state.queue_vpn_save(PendingVpnSave {
            connection_path: "/conn/7".to_owned(),
            ..Default::default()
        });
        assert!(state.take_pending_vpn_save_for("/conn/other").is_none());
        assert!(state.take_pending_vpn_save_for("/conn/7").is_some());
        assert!(state.take_pending_vpn_save_for("/conn/7").is_none());
    }

    #[test]
    fn pending_save_is_taken_once() {
        let state = AgentState::new();
        state.queue_vpn_save(PendingVpnSave {
            connection_path: "/conn/1".to_owned(),
            username: "bob".to_owned(),
            password: "pw".to_owned(),
            save_password: true,
        });
        assert!(state.take_pending_vpn_save().is_some());
        assert!(state.take_pending_vpn_save().is_none());
    }
}
