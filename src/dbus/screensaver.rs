//! The freedesktop screensaver inhibit hub.
//!
//! Claims `org.freedesktop.ScreenSaver` (exported on both `/ScreenSaver`
//! and `/org/freedesktop/ScreenSaver`) and `org.gnome.ScreenSaver`
//! (`/org/gnome/ScreenSaver`). Either claim alone is enough to operate.
//! Tracks per-peer inhibit cookies, reaps orphans when a peer drops off the
//! bus, and fans state snapshots out to in-process subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use serde::Serialize;
use zbus::fdo::{self, RequestNameFlags, RequestNameReply};
use zbus::message::Header;
use zbus::names::WellKnownName;
use zbus::zvariant::ObjectPath;

use crate::utils::basename;

const FREEDESKTOP_NAME: &str = "org.freedesktop.ScreenSaver";
const FREEDESKTOP_PATHS: [&str; 2] = ["/ScreenSaver", "/org/freedesktop/ScreenSaver"];
const GNOME_NAME: &str = "org.gnome.ScreenSaver";
const GNOME_PATHS: [&str; 1] = ["/org/gnome/ScreenSaver"];

/// One recorded inhibition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inhibitor {
    pub cookie: u32,
    pub app_name: String,
    pub reason: String,
    pub peer: String,
    pub start_time: i64,
}

/// Snapshot fanned out to subscribers.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreensaverState {
    pub available: bool,
    pub active: bool,
    pub inhibited: bool,
    pub inhibitors: Vec<Inhibitor>,
}

/// Capacity of each subscriber channel; slow subscribers drop ticks.
const SUBSCRIBER_DEPTH: usize = 64;

/// The hub proper. The D-Bus interface wrappers below all point at one of
/// these.
pub struct Hub {
    state: RwLock<ScreensaverState>,
    cookie_counter: AtomicU32,
    subscribers: Mutex<HashMap<String, tokio::sync::mpsc::Sender<ScreensaverState>>>,
    conn: OnceLock<zbus::Connection>,
    freedesktop_claimed: AtomicBool,
    gnome_claimed: AtomicBool,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            state: RwLock::new(ScreensaverState::default()),
            cookie_counter: AtomicU32::new(0),
            subscribers: Mutex::new(HashMap::new()),
            conn: OnceLock::new(),
            freedesktop_claimed: AtomicBool::new(false),
            gnome_claimed: AtomicBool::new(false),
        }
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ScreensaverState {
        self.state.read().unwrap().clone()
    }

    pub fn subscribe(&self, id: &str) -> tokio::sync::mpsc::Receiver<ScreensaverState> {
        let (tx, rx) = tokio::sync::mpsc::channel(SUBSCRIBER_DEPTH);
        self.subscribers.lock().unwrap().insert(id.to_owned(), tx);
        rx
    }

    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.lock().unwrap().remove(id);
    }

    fn notify_subscribers(&self) {
        let state = self.state();
        let subscribers = self.subscribers.lock().unwrap();
        for (id, tx) in subscribers.iter() {
            // Non-blocking: a stalled subscriber loses ticks, never stalls
            // the bus thread.
            if tx.try_send(state.clone()).is_err() {
                trace!("screensaver subscriber {id} is behind, dropping tick");
            }
        }
    }

    /// Records an inhibition and returns its cookie.
    ///
    /// Audio-only reasons (contain "audio" but not "video") are filtered
    /// with a zero cookie, matching compositor etiquette upstream.
    pub fn inhibit(&self, app_name: &str, reason: &str, peer: &str) -> Result<u32, fdo::Error> {
        if app_name.is_empty() {
            return Err(fdo::Error::InvalidArgs("application name required".into()));
        }
        if reason.is_empty() {
            return Err(fdo::Error::InvalidArgs("reason required".into()));
        }

        let lower = reason.to_lowercase();
        if lower.contains("audio") && !lower.contains("video") {
            debug!("ignoring audio-only inhibit from {app_name}: {reason}");
            return Ok(0);
        }

        let app_name = basename(app_name);
        let cookie = self.cookie_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        {
            let mut state = self.state.write().unwrap();
            state.inhibitors.push(Inhibitor {
                cookie,
                app_name: app_name.to_owned(),
                reason: reason.to_owned(),
                peer: peer.to_owned(),
                start_time,
            });
            state.inhibited = true;
        }

        info!("screensaver inhibited by {app_name} ({peer}): {reason} -> cookie {cookie:08X}");
        self.notify_subscribers();
        Ok(cookie)
    }

    /// Drops the inhibition matching `cookie`. Unknown cookies are ignored.
    pub fn uninhibit(&self, cookie: u32, peer: &str) {
        let removed = {
            let mut state = self.state.write().unwrap();
            let before = state.inhibitors.len();
            state.inhibitors.retain(|inh| inh.cookie != cookie);
            let removed = state.inhibitors.len() != before;
            state.inhibited = !state.inhibitors.is_empty();
            removed
        };

        if removed {
            info!("screensaver uninhibited by {peer}, cookie {cookie:08X}");
            self.notify_subscribers();
        } else {
            debug!("uninhibit: no match for cookie {cookie:08X}");
        }
    }

    /// Reaps every inhibitor owned by a departed peer.
    pub fn remove_peer(&self, peer: &str) {
        let removed = {
            let mut state = self.state.write().unwrap();
            let (gone, kept): (Vec<_>, Vec<_>) = state
                .inhibitors
                .drain(..)
                .partition(|inh| inh.peer == peer);
            state.inhibitors = kept;
            state.inhibited = !state.inhibitors.is_empty();
            gone
        };

        if removed.is_empty() {
            return;
        }
        for inh in &removed {
            info!(
                "screensaver: peer {peer} died, removing inhibitor from {} (cookie {:08X})",
                inh.app_name, inh.cookie
            );
        }
        self.notify_subscribers();
    }

    pub fn active(&self) -> bool {
        self.state.read().unwrap().active
    }

    /// Sets the active (locked) flag. Returns true when the flag actually
    /// changed; the caller then emits `ActiveChanged`.
    pub fn set_active(&self, active: bool) -> bool {
        let changed = {
            let mut state = self.state.write().unwrap();
            let changed = state.active != active;
            state.active = active;
            changed
        };

        if changed {
            info!("screensaver active changed: {active}");
            self.notify_subscribers();
        }
        changed
    }

    async fn set_active_and_emit(&self, active: bool) {
        if !self.set_active(active) {
            return;
        }
        let Some(conn) = self.conn.get() else {
            return;
        };

        let mut targets: Vec<(&str, &str)> = Vec::new();
        if self.freedesktop_claimed.load(Ordering::Relaxed) {
            for path in FREEDESKTOP_PATHS {
                targets.push((path, FREEDESKTOP_NAME));
            }
        }
        if self.gnome_claimed.load(Ordering::Relaxed) {
            for path in GNOME_PATHS {
                targets.push((path, GNOME_NAME));
            }
        }

        for (path, interface) in targets {
            let result = conn
                .emit_signal(
                    None::<zbus::names::BusName<'_>>,
                    path,
                    interface,
                    "ActiveChanged",
                    &(active),
                )
                .await;
            if let Err(err) = result {
                warn!("failed to emit ActiveChanged on {path}: {err}");
            }
        }
    }
}

fn peer_from_header(header: &Header<'_>) -> String {
    header
        .sender()
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// `org.freedesktop.ScreenSaver` interface wrapper.
pub struct FreedesktopScreenSaver(pub std::sync::Arc<Hub>);
/// `org.gnome.ScreenSaver` interface wrapper.
pub struct GnomeScreenSaver(pub std::sync::Arc<Hub>);

#[zbus::interface(name = "org.freedesktop.ScreenSaver")]
impl FreedesktopScreenSaver {
    async fn inhibit(
        &self,
        #[zbus(header)] header: Header<'_>,
        application_name: String,
        reason_for_inhibit: String,
    ) -> fdo::Result<u32> {
        self.0.inhibit(
            &application_name,
            &reason_for_inhibit,
            &peer_from_header(&header),
        )
    }

    async fn un_inhibit(&self, #[zbus(header)] header: Header<'_>, cookie: u32) {
        self.0.uninhibit(cookie, &peer_from_header(&header));
    }

    async fn get_active(&self) -> bool {
        self.0.active()
    }

    async fn set_active(&self, active: bool) {
        self.0.set_active_and_emit(active).await;
    }

    async fn lock(&self) {
        self.0.set_active_and_emit(true).await;
    }
}

#[zbus::interface(name = "org.gnome.ScreenSaver")]
impl GnomeScreenSaver {
    async fn inhibit(
        &self,
        #[zbus(header)] header: Header<'_>,
        application_name: String,
        reason_for_inhibit: String,
    ) -> fdo::Result<u32> {
        self.0.inhibit(
            &application_name,
            &reason_for_inhibit,
            &peer_from_header(&header),
        )
    }

    async fn un_inhibit(&self, #[zbus(header)] header: Header<'_>, cookie: u32) {
        self.0.uninhibit(cookie, &peer_from_header(&header));
    }

    async fn get_active(&self) -> bool {
        self.0.active()
    }

    async fn set_active(&self, active: bool) {
        self.0.set_active_and_emit(active).await;
    }

    async fn lock(&self) {
        self.0.set_active_and_emit(true).await;
    }
}

/// Claims the screensaver names on the session bus and starts the peer
/// watcher. Returns false when no name could be claimed; the hub is then
/// marked unavailable but the rest of the process keeps running.
pub async fn initialize(
    hub: std::sync::Arc<Hub>,
    conn: &zbus::Connection,
) -> zbus::Result<bool> {
    let _ = hub.conn.set(conn.clone());

    let freedesktop = claim_name(
        conn,
        FREEDESKTOP_NAME,
        &FREEDESKTOP_PATHS,
        |path| {
            let hub = hub.clone();
            async move { conn.object_server().at(path, FreedesktopScreenSaver(hub)).await }
        },
    )
    .await;
    hub.freedesktop_claimed.store(freedesktop, Ordering::Relaxed);

    let gnome = claim_name(conn, GNOME_NAME, &GNOME_PATHS, |path| {
        let hub = hub.clone();
        async move { conn.object_server().at(path, GnomeScreenSaver(hub)).await }
    })
    .await;
    hub.gnome_claimed.store(gnome, Ordering::Relaxed);

    if !freedesktop && !gnome {
        warn!("no screensaver interface could be claimed");
        return Ok(false);
    }

    {
        let mut state = hub.state.write().unwrap();
        state.available = true;
        state.active = false;
        state.inhibited = false;
        state.inhibitors.clear();
    }

    spawn_peer_watcher(hub, conn.clone());

    info!("screensaver hub initialized");
    Ok(true)
}

async fn claim_name<'a, F, Fut>(
    conn: &zbus::Connection,
    name: &str,
    paths: &[&'a str],
    mut serve: F,
) -> bool
where
    F: FnMut(&'a str) -> Fut,
    Fut: std::future::Future<Output = zbus::Result<bool>>,
{
    for &path in paths {
        if let Err(err) = serve(path).await {
            warn!("failed to export screensaver on {path}: {err}");
            return false;
        }
    }

    let well_known = match WellKnownName::try_from(name) {
        Ok(n) => n,
        Err(err) => {
            warn!("bad screensaver name {name}: {err}");
            return false;
        }
    };
    match conn
        .request_name_with_flags(well_known, RequestNameFlags::DoNotQueue.into())
        .await
    {
        Ok(RequestNameReply::PrimaryOwner) => {
            info!("claimed {name} on the session bus");
            true
        }
        Ok(_) => {
            warn!("screensaver name {name} already owned by another process");
            // Withdraw the objects so a later owner is not confused.
            for path in paths {
                if let Ok(p) = ObjectPath::try_from(*path) {
                    let _ = remove_paths(conn, name, p).await;
                }
            }
            false
        }
        Err(err) => {
            warn!("failed to request screensaver name {name}: {err}");
            false
        }
    }
}

async fn remove_paths(
    conn: &zbus::Connection,
    name: &str,
    path: ObjectPath<'_>,
) -> zbus::Result<()> {
    if name == FREEDESKTOP_NAME {
        conn.object_server()
            .remove::<FreedesktopScreenSaver, _>(path)
            .await?;
    } else {
        conn.object_server()
            .remove::<GnomeScreenSaver, _>(path)
            .await?;
    }
    Ok(())
}

/// Watches `NameOwnerChanged` and reaps inhibitors whose peer vanished.
fn spawn_peer_watcher(hub: std::sync::Arc<Hub>, conn: zbus::Connection) {
    tokio::spawn(async move {
        let dbus = match fdo::DBusProxy::new(&conn).await {
            Ok(proxy) => proxy,
            Err(err) => {
                warn!("failed to watch peer disconnects: {err}");
                return;
            }
        };
        let mut stream = match dbus.receive_name_owner_changed().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to subscribe to NameOwnerChanged: {err}");
                return;
            }
        };

        while let Some(signal) = stream.next().await {
            let Ok(args) = signal.args() else {
                continue;
            };
            // Only care about peers leaving the bus entirely.
            if args.new_owner().is_none() {
                hub.remove_peer(args.name().as_str());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inhibit_records_and_uninhibit_removes() {
        let hub = Hub::new();
        let c1 = hub.inhibit("/usr/bin/mpv", "video playback", ":1.7").unwrap();
        assert!(c1 > 0);
        let state = hub.state();
        assert!(state.inhibited);
        assert_eq!(state.inhibitors.len(), 1);
        assert_eq!(state.inhibitors[0].app_name, "mpv");

        hub.uninhibit(c1, ":1.7");
        let state = hub.state();
        assert!(!state.inhibited);
        assert!(state.inhibitors.is_empty());
    }

    #[test]
    fn rejects_empty_arguments() {
        let hub = Hub::new();
        assert!(hub.inhibit("", "reason", ":1.1").is_err());
        assert!(hub.inhibit("app", "", ":1.1").is_err());
        assert!(hub.state().inhibitors.is_empty());
    }

    #[test]
    fn filters_audio_only_reasons() {
        let hub = Hub::new();
        let cookie = hub.inhibit("mpv", "Playing Audio", ":1.2").unwrap();
        assert_eq!(cookie, 0);
        assert!(hub.state().inhibitors.is_empty());

        // "video" anywhere in the reason defeats the filter.
        let cookie = hub.inhibit("mpv", "audio and video playback", ":1.2").unwrap();
        assert_ne!(cookie, 0);
        assert_eq!(hub.state().inhibitors.len(), 1);
    }

    #[test]
    fn cookies_are_unique_and_monotonic() {
        let hub = Hub::new();
        let mut last = 0;
        for _ in 0..32 {
            let cookie = hub.inhibit("app", "video work", ":1.3").unwrap();
            assert!(cookie > last);
            last = cookie;
        }
        assert_eq!(hub.state().inhibitors.len(), 32);
    }

    #[test]
    fn unknown_cookie_is_ignored() {
        let hub = Hub::new();
        hub.inhibit("app", "video", ":1.4").unwrap();
        hub.uninhibit(9999, ":1.4");
        assert_eq!(hub.state().inhibitors.len(), 1);
    }

    #[test]
    fn peer_death_reaps_only_that_peer() {
        let hub = Hub::new();
        let c1 = hub.inhibit("a", "video", ":1.42").unwrap();
        let c2 = hub.inhibit("b", "video", ":1.42").unwrap();
        let keep = hub.inhibit("c", "video", ":1.50").unwrap();
        assert_ne!(c1, c2);

        hub.remove_peer(":1.42");

        let state = hub.state();
        assert_eq!(state.inhibitors.len(), 1);
        assert_eq!(state.inhibitors[0].cookie, keep);
        assert!(state.inhibited);

        hub.remove_peer(":1.50");
        assert!(!hub.state().inhibited);
    }

    #[test]
    fn peer_death_without_inhibitors_is_silent() {
        let hub = Hub::new();
        let mut rx = hub.subscribe("test");
        hub.remove_peer(":1.99");
        assert!(rx.try_recv().is_err(), "no tick for an unknown peer");
    }

    #[test]
    fn set_active_reports_transitions_only() {
        let hub = Hub::new();
        assert!(!hub.active());
        assert!(hub.set_active(true));
        assert!(hub.active());
        // Second identical set is not a transition.
        assert!(!hub.set_active(true));
        assert!(hub.set_active(false));
    }

    #[test]
    fn subscribers_receive_snapshots_nonblocking() {
        let hub = Hub::new();
        let mut rx = hub.subscribe("ui");

        hub.inhibit("app", "video", ":1.5").unwrap();
        let tick = rx.try_recv().unwrap();
        assert!(tick.inhibited);

        // A full channel drops ticks instead of blocking.
        for _ in 0..SUBSCRIBER_DEPTH + 8 {
            hub.set_active(true);
            hub.set_active(false);
        }
        hub.unsubscribe("ui");
        hub.set_active(true);
    }

    #[test]
    fn peer_death_fires_subscriber_tick_without_active_change() {
        let hub = Hub::new();
        hub.inhibit("a", "video", ":1.42").unwrap();
        hub.inhibit("b", "video", ":1.42").unwrap();

        let mut rx = hub.subscribe("ui");
        hub.remove_peer(":1.42");

        let tick = rx.try_recv().unwrap();
        assert!(!tick.active, "active must not change on peer death");
        assert!(tick.inhibitors.is_empty());
        assert!(rx.try_recv().is_err(), "exactly one tick expected");
    }
}
