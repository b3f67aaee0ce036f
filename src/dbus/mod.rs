//! D-Bus services: daemon bootstrap.
//!
//! Each subsystem degrades independently: losing the session bus only
//! costs the screensaver hub, losing the system bus only the secret agent.

use std::sync::Arc;

pub mod agent;
pub mod screensaver;

use agent::cache::AgentState;
use agent::SecretAgent;
use crate::prompt::PromptBroker;

/// Everything the daemon keeps alive for its lifetime.
pub struct Services {
    pub hub: Arc<screensaver::Hub>,
    pub agent_state: Arc<AgentState>,
    pub prompts: Arc<PromptBroker>,
    session: Option<zbus::Connection>,
    system: Option<zbus::Connection>,
}

impl Services {
    /// Connects the buses and brings up both services.
    pub async fn start() -> Services {
        let hub = Arc::new(screensaver::Hub::new());
        let agent_state = Arc::new(AgentState::new());
        let prompts = Arc::new(PromptBroker::new());

        let session = match zbus::Connection::session().await {
            Ok(conn) => {
                match screensaver::initialize(hub.clone(), &conn).await {
                    Ok(true) => (),
                    Ok(false) => info!("screensaver hub unavailable"),
                    Err(err) => warn!("screensaver hub failed to initialize: {err}"),
                }
                Some(conn)
            }
            Err(err) => {
                warn!("failed to connect to the session bus: {err}");
                None
            }
        };

        let system = match zbus::Connection::system().await {
            Ok(conn) => {
                let agent = SecretAgent::new(agent_state.clone(), prompts.clone());
                match agent.register(&conn).await {
                    Ok(()) => {
                        agent::spawn_activation_watcher(agent_state.clone(), conn.clone());
                        agent::spawn_peer_watcher(prompts.clone(), conn.clone());
                    }
                    Err(err) => warn!("secret agent failed to register: {err:#}"),
                }
                Some(conn)
            }
            Err(err) => {
                warn!("failed to connect to the system bus: {err}");
                None
            }
        };

        Services {
            hub,
            agent_state,
            prompts,
            session,
            system,
        }
    }

    /// Tears the services down in an orderly way.
    pub async fn shutdown(self) {
        if let Some(system) = &self.system {
            SecretAgent::unregister(system).await;
        }
        drop(self.session);
    }
}

/// Runs the daemon until interrupted.
pub async fn run_daemon() -> anyhow::Result<()> {
    let services = Services::start().await;
    info!("dusk daemon running");

    // The daemon's own subscription, mostly so state transitions show up in
    // the logs next to the bus traffic that caused them.
    let mut ticks = services.hub.subscribe("daemon");
    let log_task = tokio::spawn(async move {
        while let Some(state) = ticks.recv().await {
            debug!(
                "screensaver state: active={}, inhibitors={}",
                state.active,
                state.inhibitors.len()
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let pending = services.prompts.pending_requests();
    if !pending.is_empty() {
        info!("abandoning {} pending credential prompts", pending.len());
    }
    if services.agent_state.take_pending_vpn_save().is_some() {
        debug!("dropping an uncommitted VPN credential save");
    }

    log_task.abort();
    services.shutdown().await;
    Ok(())
}
