//! The prompt broker.
//!
//! Joins the secret agent to whatever answers credential prompts (the shell
//! UI, over its own IPC). `ask` registers a pending prompt and returns its
//! token immediately; `wait` suspends until the UI submits or cancels, or
//! the deadline fires. Cancellation from NetworkManager's side arrives as
//! `CancelGetSecrets(path, setting)` and is matched against outstanding
//! tokens by `(connection_path, setting_name)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

/// Opaque handle to a pending prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromptToken(u64);

impl std::fmt::Display for PromptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "prompt-{}", self.0)
    }
}

/// Presentation metadata for one requested field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub label: String,
    pub is_secret: bool,
}

/// A credential prompt posted to the UI.
#[derive(Debug, Clone, Default)]
pub struct PromptRequest {
    pub name: String,
    pub ssid: String,
    pub conn_type: String,
    pub vpn_service: String,
    pub setting_name: String,
    pub fields: Vec<String>,
    pub fields_info: Vec<FieldInfo>,
    pub hints: Vec<String>,
    pub reason: String,
    pub connection_id: String,
    pub connection_uuid: String,
    pub connection_path: String,
}

/// The UI's answer.
#[derive(Debug, Clone, Default)]
pub struct PromptReply {
    pub secrets: HashMap<String, String>,
    pub save: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("prompt cancelled")]
    Cancelled,
    #[error("prompt timed out")]
    TimedOut,
}

struct Pending {
    request: PromptRequest,
    reply_tx: oneshot::Sender<Result<PromptReply, PromptError>>,
}

/// Channel-map broker keyed by token.
#[derive(Default)]
pub struct PromptBroker {
    next_token: AtomicU64,
    pending: Mutex<HashMap<PromptToken, Pending>>,
    receivers: Mutex<HashMap<PromptToken, oneshot::Receiver<Result<PromptReply, PromptError>>>>,
}

impl PromptBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a prompt and returns its token.
    pub fn ask(&self, request: PromptRequest) -> PromptToken {
        let token = PromptToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending
            .lock()
            .unwrap()
            .insert(token, Pending { request, reply_tx });
        self.receivers.lock().unwrap().insert(token, reply_rx);

        token
    }

    /// Suspends until the prompt is answered, cancelled, or `timeout`
    /// elapses.
    pub async fn wait(
        &self,
        token: PromptToken,
        timeout: Duration,
    ) -> Result<PromptReply, PromptError> {
        let Some(rx) = self.receivers.lock().unwrap().remove(&token) else {
            return Err(PromptError::Cancelled);
        };

        let result = tokio::time::timeout(timeout, rx).await;
        // Whatever happened, the prompt is no longer pending.
        self.pending.lock().unwrap().remove(&token);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_closed)) => Err(PromptError::Cancelled),
            Err(_elapsed) => Err(PromptError::TimedOut),
        }
    }

    /// Resolves a prompt with secrets from the UI. Returns false for an
    /// unknown or already-settled token.
    pub fn submit(&self, token: PromptToken, reply: PromptReply) -> bool {
        let Some(pending) = self.pending.lock().unwrap().remove(&token) else {
            return false;
        };
        pending.reply_tx.send(Ok(reply)).is_ok()
    }

    /// Cancels a prompt by token (UI-side cancel).
    pub fn cancel_token(&self, token: PromptToken) -> bool {
        let Some(pending) = self.pending.lock().unwrap().remove(&token) else {
            return false;
        };
        pending.reply_tx.send(Err(PromptError::Cancelled)).is_ok()
    }

    /// Cancels outstanding prompts matching `(connection_path, setting)`,
    /// the shape NetworkManager's `CancelGetSecrets` gives us.
    pub fn cancel_matching(&self, connection_path: &str, setting_name: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let tokens: Vec<PromptToken> = pending
            .iter()
            .filter(|(_, p)| {
                p.request.connection_path == connection_path
                    && p.request.setting_name == setting_name
            })
            .map(|(t, _)| *t)
            .collect();

        let mut cancelled = false;
        for token in tokens {
            if let Some(p) = pending.remove(&token) {
                let _ = p.reply_tx.send(Err(PromptError::Cancelled));
                cancelled = true;
            }
        }
        cancelled
    }

    /// Cancels every outstanding prompt, e.g. when the requesting peer
    /// drops off the bus.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let count = pending.len();
        for (_, p) in pending.drain() {
            let _ = p.reply_tx.send(Err(PromptError::Cancelled));
        }
        count
    }

    /// Snapshot of outstanding prompts, for the UI to (re)display.
    pub fn pending_requests(&self) -> Vec<(PromptToken, PromptRequest)> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|(t, p)| (*t, p.request.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, setting: &str) -> PromptRequest {
        PromptRequest {
            connection_path: path.to_owned(),
            setting_name: setting.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_resolves_wait() {
        let broker = PromptBroker::new();
        let token = broker.ask(request("/path/1", "vpn"));

        let mut secrets = HashMap::new();
        secrets.insert("password".to_owned(), "hunter2".to_owned());
        assert!(broker.submit(
            token,
            PromptReply {
                secrets: secrets.clone(),
                save: true,
            }
        ));

        let reply = broker.wait(token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.secrets, secrets);
        assert!(reply.save);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let broker = PromptBroker::new();
        let token = broker.ask(request("/path/1", "vpn"));

        let err = broker
            .wait(token, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, PromptError::TimedOut);
        // Timed-out prompts are gone.
        assert!(!broker.submit(token, PromptReply::default()));
    }

    #[tokio::test]
    async fn cancel_matching_matches_path_and_setting() {
        let broker = PromptBroker::new();
        let token = broker.ask(request("/path/1", "vpn"));
        let other = broker.ask(request("/path/2", "vpn"));

        assert!(!broker.cancel_matching("/path/1", "802-11-wireless-security"));
        assert!(broker.cancel_matching("/path/1", "vpn"));

        let err = broker.wait(token, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, PromptError::Cancelled);

        // The other prompt is untouched.
        assert!(broker.submit(other, PromptReply::default()));
    }

    #[tokio::test]
    async fn cancel_all_sweeps_everything() {
        let broker = PromptBroker::new();
        let a = broker.ask(request("/a", "vpn"));
        let b = broker.ask(request("/b", "802-1x"));

        assert_eq!(broker.cancel_all(), 2);
        assert_eq!(
            broker.wait(a, Duration::from_secs(1)).await.unwrap_err(),
            PromptError::Cancelled
        );
        assert_eq!(
            broker.wait(b, Duration::from_secs(1)).await.unwrap_err(),
            PromptError::Cancelled
        );
    }

    #[tokio::test]
    async fn tokens_are_unique() {
        let broker = PromptBroker::new();
        let a = broker.ask(request("/a", "vpn"));
        let b = broker.ask(request("/b", "vpn"));
        assert_ne!(a, b);
        assert_eq!(broker.pending_requests().len(), 2);
    }
}
