//! The NetworkManager secret agent.
//!
//! A system-bus service implementing
//! `org.freedesktop.NetworkManager.SecretAgent` at a fixed object path,
//! registered with the agent manager. `GetSecrets` only answers for the
//! connection the shell is currently activating; everything else defers to
//! other agents with `NoSecrets` so we never steal prompts from nmcli.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

pub mod cache;
pub mod fields;
pub mod nm;
pub mod saml;
pub mod settings;

use cache::{AgentState, CachedGpSamlCookie, CachedPkcs11Pin, PendingVpnSave};
use fields::{GP_SAML_FIELD, KEY_PASS_FIELD};
use settings::{ConnectionDict, VariantMap, FLAGS_UNKNOWN};

use crate::prompt::{PromptBroker, PromptError, PromptReply, PromptRequest};

const AGENT_PATH: &str = "/org/freedesktop/NetworkManager/SecretAgent";
const AGENT_ID: &str = "com.danklinux.NMAgent";
const AGENT_MANAGER_PATH: &str = "/org/freedesktop/NetworkManager/AgentManager";
const AGENT_MANAGER_IFACE: &str = "org.freedesktop.NetworkManager.AgentManager";
const NM_DEST: &str = "org.freedesktop.NetworkManager";

/// How long a prompt may sit unanswered before NM gets `Failed`.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

const NM_SETTING_SECRET_FLAG_AGENT_OWNED: u32 = 0x1;
const NM_SETTING_SECRET_FLAG_NOT_REQUIRED: u32 = 0x4;

/// Errors surfaced to NetworkManager under its secret-agent error names.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.freedesktop.NetworkManager.SecretAgent.Error")]
pub enum AgentError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NoSecrets(String),
    UserCanceled(String),
    Failed(String),
}

/// The exported agent object.
pub struct SecretAgent {
    state: Arc<AgentState>,
    prompts: Arc<PromptBroker>,
}

impl SecretAgent {
    pub fn new(state: Arc<AgentState>, prompts: Arc<PromptBroker>) -> Self {
        Self { state, prompts }
    }

    /// Exports the agent and registers it with NetworkManager.
    pub async fn register(self, conn: &zbus::Connection) -> anyhow::Result<()> {
        use anyhow::Context as _;

        conn.object_server()
            .at(AGENT_PATH, self)
            .await
            .context("failed to export secret agent")?;

        conn.call_method(
            Some(NM_DEST),
            AGENT_MANAGER_PATH,
            Some(AGENT_MANAGER_IFACE),
            "Register",
            &(AGENT_ID),
        )
        .await
        .context("failed to register agent with NetworkManager")?;

        info!(
            "secret agent registered with NetworkManager (id={AGENT_ID}, path={AGENT_PATH})"
        );
        Ok(())
    }

    /// Unregisters from the agent manager.
    pub async fn unregister(conn: &zbus::Connection) {
        if let Err(err) = conn
            .call_method(
                Some(NM_DEST),
                AGENT_MANAGER_PATH,
                Some(AGENT_MANAGER_IFACE),
                "Unregister",
                &(AGENT_ID),
            )
            .await
        {
            debug!("agent unregister failed: {err}");
        }
    }
}

#[zbus::interface(name = "org.freedesktop.NetworkManager.SecretAgent")]
impl SecretAgent {
    async fn get_secrets(
        &self,
        #[zbus(connection)] bus: &zbus::Connection,
        connection: ConnectionDict,
        connection_path: OwnedObjectPath,
        setting_name: String,
        hints: Vec<String>,
        flags: u32,
    ) -> Result<ConnectionDict, AgentError> {
        info!(
            "GetSecrets called: path={connection_path}, setting={setting_name}, \
             hints={hints:?}, flags={flags}"
        );
        self.get_secrets_inner(bus, connection, connection_path, setting_name, hints, flags)
            .await
    }

    async fn delete_secrets(
        &self,
        connection: ConnectionDict,
        connection_path: OwnedObjectPath,
    ) {
        let ssid = settings::ssid(&connection);
        info!("DeleteSecrets called: path={connection_path}, ssid={ssid}");
    }

    async fn delete_secrets2(&self, connection_path: OwnedObjectPath, setting: String) {
        info!("DeleteSecrets2 called: path={connection_path}, setting={setting}");
    }

    async fn cancel_get_secrets(&self, connection_path: OwnedObjectPath, setting_name: String) {
        info!("CancelGetSecrets called: path={connection_path}, setting={setting_name}");
        if !self
            .prompts
            .cancel_matching(connection_path.as_str(), &setting_name)
        {
            debug!("no pending prompt matched the cancel");
        }
    }
}

impl SecretAgent {
    async fn get_secrets_inner(
        &self,
        bus: &zbus::Connection,
        connection: ConnectionDict,
        connection_path: OwnedObjectPath,
        setting_name: String,
        hints: Vec<String>,
        flags: u32,
    ) -> Result<ConnectionDict, AgentError> {
        let (conn_type, display_name, vpn_service) = settings::conn_identity(&connection);
        let ssid = settings::ssid(&connection);
        let connection_uuid =
            settings::setting_str(&connection, "connection", "uuid").unwrap_or_default();
        let connection_id =
            settings::setting_str(&connection, "connection", "id").unwrap_or_default();

        let mut fields = fields::fields_needed(&setting_name, &hints, &connection);

        info!(
            "connType={conn_type}, name={display_name}, vpnSvc={vpn_service}, \
             fields={fields:?}, flags={flags}"
        );

        self.check_scope(&conn_type, &ssid, &connection_uuid)?;

        if fields.is_empty() {
            if setting_name == "vpn" {
                if !self.state.connecting().is_connecting_vpn {
                    info!("VPN with empty hints, deferring to other agents for {vpn_service}");
                    return Err(AgentError::NoSecrets(String::new()));
                }
                fields = fields::infer_vpn_fields(&connection, &vpn_service);
                info!("VPN with empty hints but we're connecting, inferred fields: {fields:?}");
            }

            if fields.is_empty() {
                match self.resolve_by_password_flags(&connection, &setting_name)? {
                    FlagResolution::Fields(inferred) => fields = inferred,
                    FlagResolution::EmptySetting => {
                        let mut out = ConnectionDict::new();
                        out.insert(setting_name, VariantMap::new());
                        return Ok(out);
                    }
                }
            }
        }

        let mut reason = fields::reason_from_flags(flags);
        if conn_type == "802-11-wireless" && self.state.was_recently_failed(&ssid) {
            reason = "wrong-password";
        }
        if setting_name == "vpn" && fields::is_pkcs11_auth(&connection, &vpn_service) {
            reason = "pkcs11";
        }

        if setting_name == "vpn" {
            if let Some(response) = self
                .consult_caches(
                    &connection_path.as_ref(),
                    &connection_uuid,
                    &setting_name,
                    &fields,
                )
                .map_err(AgentError::Failed)?
            {
                return Ok(response);
            }

            if fields.len() == 1 && fields[0] == GP_SAML_FIELD {
                return self
                    .run_saml_flow(&connection, &connection_uuid, &setting_name)
                    .await;
            }
        }

        let request = PromptRequest {
            name: display_name,
            ssid: ssid.clone(),
            conn_type: conn_type.clone(),
            vpn_service: vpn_service.clone(),
            setting_name: setting_name.clone(),
            fields_info: fields::build_fields_info(&setting_name, &fields, &vpn_service),
            fields,
            hints,
            reason: reason.to_owned(),
            connection_id,
            connection_uuid: connection_uuid.clone(),
            connection_path: connection_path.to_string(),
        };

        let token = self.prompts.ask(request);
        info!("waiting for user input (token={token})");

        match self.prompts.wait(token, PROMPT_TIMEOUT).await {
            Ok(reply) => {
                info!("user provided secrets, save={}", reply.save);
                self.shape_reply(
                    bus,
                    &connection_path.as_ref(),
                    &setting_name,
                    &connection_uuid,
                    reply,
                )
                .await
            }
            Err(err) => {
                warn!("prompt failed or cancelled: {err}");
                self.cleanup_cancelled_activation(bus, &conn_type).await;
                match err {
                    PromptError::Cancelled => Err(AgentError::UserCanceled(String::new())),
                    PromptError::TimedOut => Err(AgentError::Failed(String::new())),
                }
            }
        }
    }

    /// The scoping gate: only answer for the connection the shell is
    /// activating right now.
    fn check_scope(
        &self,
        conn_type: &str,
        ssid: &str,
        connection_uuid: &str,
    ) -> Result<(), AgentError> {
        let connecting = self.state.connecting();

        match conn_type {
            "802-11-wireless" => {
                if connecting.is_connecting && connecting.connecting_ssid != ssid {
                    info!(
                        "ignoring WiFi request for SSID {ssid:?}, we're connecting to {:?}",
                        connecting.connecting_ssid
                    );
                    return Err(AgentError::NoSecrets(String::new()));
                }
            }
            "vpn" | "wireguard" => {
                if connecting.is_connecting_vpn && connection_uuid != connecting.connecting_vpn_uuid
                {
                    info!(
                        "ignoring VPN request for UUID {connection_uuid:?}, we're connecting \
                         to {:?}",
                        connecting.connecting_vpn_uuid
                    );
                    return Err(AgentError::NoSecrets(String::new()));
                }
            }
            _ => (),
        }
        Ok(())
    }

    /// When neither hints nor inference produced fields, the setting's own
    /// secret flags decide.
    fn resolve_by_password_flags(
        &self,
        connection: &ConnectionDict,
        setting_name: &str,
    ) -> Result<FlagResolution, AgentError> {
        let password_flags = match setting_name {
            "802-11-wireless-security" => {
                settings::setting_u32(connection, "802-11-wireless-security", "psk-flags")
            }
            "802-1x" => settings::setting_u32(connection, "802-1x", "password-flags"),
            _ => None,
        }
        .unwrap_or(FLAGS_UNKNOWN);

        if password_flags == FLAGS_UNKNOWN {
            warn!("could not determine password-flags for empty hints, returning NoSecrets");
            return Err(AgentError::NoSecrets(String::new()));
        }

        if password_flags & NM_SETTING_SECRET_FLAG_NOT_REQUIRED != 0 {
            info!("secrets not required (flags={password_flags})");
            return Ok(FlagResolution::EmptySetting);
        }

        if password_flags & NM_SETTING_SECRET_FLAG_AGENT_OWNED != 0 {
            let fields = match setting_name {
                "802-11-wireless-security" => vec!["psk".to_owned()],
                "802-1x" => fields::infer_8021x_fields(connection),
                _ => {
                    warn!(
                        "agent-owned secrets for unhandled setting {setting_name} \
                         (flags={password_flags})"
                    );
                    return Err(AgentError::NoSecrets(String::new()));
                }
            };
            info!("agent-owned secrets, inferred fields: {fields:?}");
            return Ok(FlagResolution::Fields(fields));
        }

        info!("no secrets needed, using system stored secrets (flags={password_flags})");
        Ok(FlagResolution::EmptySetting)
    }

    /// One-shot cache consultation, GP SAML cookie first, then the PKCS11
    /// PIN, then the plain VPN password.
    fn consult_caches(
        &self,
        connection_path: &ObjectPath<'_>,
        connection_uuid: &str,
        setting_name: &str,
        fields: &[String],
    ) -> Result<Option<ConnectionDict>, String> {
        if let Some(cached) = self.state.take_gp_saml(connection_uuid) {
            info!("using cached GlobalProtect SAML cookie for {connection_uuid}");
            return build_gp_saml_response(
                setting_name,
                &cached.cookie,
                &cached.host,
                &cached.fingerprint,
            )
            .map(Some);
        }

        if fields.len() == 1 && fields[0] == KEY_PASS_FIELD {
            if let Some(cached) = self.state.take_pkcs11_pin(connection_uuid) {
                info!("using cached PKCS11 PIN");
                let mut secrets = HashMap::new();
                secrets.insert(KEY_PASS_FIELD.to_owned(), cached.pin);
                return wrap_vpn_secrets(setting_name, secrets).map(Some);
            }
        }

        if let Some(cached) = self.state.take_vpn_credentials(connection_uuid) {
            info!("using cached password from pre-activation prompt");

            if cached.save_password {
                self.state.queue_vpn_save(PendingVpnSave {
                    connection_path: connection_path.to_string(),
                    username: String::new(),
                    password: cached.password.clone(),
                    save_password: true,
                });
            }

            let mut secrets = HashMap::new();
            secrets.insert("password".to_owned(), cached.password);
            return wrap_vpn_secrets(setting_name, secrets).map(Some);
        }

        Ok(None)
    }

    /// The GlobalProtect SAML flow: external browser handshake, cookie
    /// conversion, cache for the impending re-request.
    async fn run_saml_flow(
        &self,
        connection: &ConnectionDict,
        connection_uuid: &str,
        setting_name: &str,
    ) -> Result<ConnectionDict, AgentError> {
        let data = settings::vpn_data(connection);
        let gateway = data.get("gateway").cloned().unwrap_or_default();
        let protocol = data.get("protocol").cloned().unwrap_or_default();

        if protocol != "gp" {
            return Err(AgentError::Failed(format!(
                "gp-saml auth only supported for GlobalProtect (protocol=gp), got: {protocol}"
            )));
        }

        info!("starting GlobalProtect SAML authentication for gateway={gateway}");

        let auth = saml::run_globalprotect_saml(&gateway, &protocol)
            .await
            .map_err(|err| {
                warn!("GlobalProtect SAML authentication failed: {err:#}");
                AgentError::Failed(format!("GlobalProtect SAML authentication failed: {err}"))
            })?;

        info!("GlobalProtect SAML authentication successful, returning cookie");

        self.state.cache_gp_saml(CachedGpSamlCookie {
            connection_uuid: connection_uuid.to_owned(),
            cookie: auth.cookie.clone(),
            host: auth.host.clone(),
            user: auth.user.clone(),
            fingerprint: auth.fingerprint.clone(),
        });

        build_gp_saml_response(setting_name, &auth.cookie, &auth.host, &auth.fingerprint)
            .map_err(AgentError::Failed)
    }

    /// Turns the user's reply into the wire shape NM expects for the
    /// setting, with the side effects each setting implies.
    async fn shape_reply(
        &self,
        bus: &zbus::Connection,
        connection_path: &ObjectPath<'_>,
        setting_name: &str,
        connection_uuid: &str,
        reply: PromptReply,
    ) -> Result<ConnectionDict, AgentError> {
        let mut out = ConnectionDict::new();

        match setting_name {
            "vpn" => {
                let pin = reply.secrets.get(KEY_PASS_FIELD).cloned();
                let is_pkcs11 = pin.is_some();
                let vpn_username = reply.secrets.get("username").cloned().unwrap_or_default();

                // VPN secrets are wrapped in a "secrets" dictionary; the
                // username travels out-of-band via the deferred save.
                let secrets: HashMap<String, String> = reply
                    .secrets
                    .iter()
                    .filter(|(k, _)| k.as_str() != "username")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                info!(
                    "returning VPN secrets with {} fields",
                    secrets.len()
                );
                out = wrap_vpn_secrets(setting_name, secrets).map_err(AgentError::Failed)?;

                if let Some(pin) = pin {
                    // NM may re-ask during the same activation; keep the PIN.
                    self.state.cache_pkcs11_pin(CachedPkcs11Pin {
                        connection_uuid: connection_uuid.to_owned(),
                        pin,
                    });
                    info!("cached PKCS11 PIN for potential re-request");
                } else if !vpn_username.is_empty() || reply.save {
                    self.state.queue_vpn_save(PendingVpnSave {
                        connection_path: connection_path.to_string(),
                        username: vpn_username,
                        password: reply.secrets.get("password").cloned().unwrap_or_default(),
                        save_password: reply.save,
                    });
                    info!("queued credentials persist for after connection succeeds");
                }
            }
            "802-1x" => {
                let mut secrets_only = VariantMap::new();
                for (k, v) in &reply.secrets {
                    match k.as_str() {
                        "password" | "private-key-password" | "phase2-private-key-password"
                        | "pin" => {
                            secrets_only.insert(k.clone(), owned_str(v)?);
                        }
                        _ => (),
                    }
                }
                info!(
                    "returning 802-1x enterprise secrets with {} fields",
                    secrets_only.len()
                );
                out.insert(setting_name.to_owned(), secrets_only);

                if let Some(identity) = reply.secrets.get("identity") {
                    if !identity.is_empty() {
                        if let Err(err) =
                            nm::save_8021x_identity(bus, connection_path, identity).await
                        {
                            warn!("failed to save 802.1x identity: {err:#}");
                        }
                    }
                }
            }
            _ => {
                let mut section = VariantMap::new();
                for (k, v) in &reply.secrets {
                    section.insert(k.clone(), owned_str(v)?);
                }
                out.insert(setting_name.to_owned(), section);
            }
        }

        Ok(out)
    }

    /// After a cancelled or failed prompt: clear the connecting record and
    /// roll back whatever partial state the activation left behind.
    async fn cleanup_cancelled_activation(&self, bus: &zbus::Connection, conn_type: &str) {
        let previous = self.state.clear_connecting();
        if !previous.is_connecting && !previous.is_connecting_vpn {
            return;
        }
        info!("clearing connecting state due to cancelled prompt");

        if previous.is_connecting
            && !previous.connecting_ssid.is_empty()
            && conn_type == "802-11-wireless"
        {
            info!(
                "removing connection profile for cancelled WiFi connection: {}",
                previous.connecting_ssid
            );
            if let Err(err) = nm::forget_wifi_network(bus, &previous.connecting_ssid).await {
                warn!("failed to remove cancelled connection profile: {err:#}");
            }
        }

        if previous.is_connecting_vpn && !previous.connecting_vpn_uuid.is_empty() {
            info!(
                "deactivating cancelled VPN connection: {}",
                previous.connecting_vpn_uuid
            );
            if let Err(err) = nm::disconnect_vpn(bus, &previous.connecting_vpn_uuid).await {
                warn!("failed to deactivate cancelled VPN: {err:#}");
            }
        }
    }
}

/// Cancels outstanding prompts if NetworkManager itself leaves the bus;
/// nobody is waiting for those answers anymore.
pub fn spawn_peer_watcher(prompts: Arc<PromptBroker>, conn: zbus::Connection) {
    use futures_util::StreamExt;

    tokio::spawn(async move {
        let dbus = match zbus::fdo::DBusProxy::new(&conn).await {
            Ok(proxy) => proxy,
            Err(err) => {
                warn!("failed to watch the system bus for peer death: {err}");
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
            if args.name().as_str() != NM_DEST || args.new_owner().is_some() {
                continue;
            }
            let reaped = prompts.cancel_all();
            if reaped > 0 {
                info!("NetworkManager left the bus, reaped {reaped} pending prompts");
            }
        }
    });
}

/// `org.freedesktop.NetworkManager.Connection.Active` activation states.
const NM_ACTIVE_CONNECTION_STATE_ACTIVATED: u32 = 2;

/// Watches activation state changes and commits the deferred VPN save once
/// NetworkManager confirms the connection came up.
pub fn spawn_activation_watcher(state: Arc<AgentState>, conn: zbus::Connection) {
    use futures_util::StreamExt;

    tokio::spawn(async move {
        let rule = match zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface("org.freedesktop.NetworkManager.Connection.Active")
            .and_then(|b| b.member("StateChanged"))
        {
            Ok(builder) => builder.build(),
            Err(err) => {
                warn!("failed to build activation match rule: {err}");
                return;
            }
        };

        let mut stream = match zbus::MessageStream::for_match_rule(rule, &conn, None).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to watch VPN activations: {err}");
                return;
            }
        };

        while let Some(Ok(msg)) = stream.next().await {
            let body = msg.body();
            let Ok((new_state, _reason)) = body.deserialize::<(u32, u32)>() else {
                continue;
            };
            if new_state != NM_ACTIVE_CONNECTION_STATE_ACTIVATED {
                continue;
            }
            let header = msg.header();
            let Some(active_path) = header.path() else {
                continue;
            };

            let profile = match nm::active_connection_path(&conn, active_path).await {
                Ok(path) => path,
                Err(err) => {
                    debug!("could not resolve activated connection: {err:#}");
                    continue;
                }
            };

            let Some(pending) = state.take_pending_vpn_save_for(profile.as_str()) else {
                continue;
            };

            info!("connection activated, committing deferred VPN credentials");
            if let Err(err) = nm::persist_vpn_credentials(
                &conn,
                &profile.as_ref(),
                &pending.username,
                &pending.password,
                pending.save_password,
            )
            .await
            {
                warn!("failed to persist VPN credentials: {err:#}");
            }
        }
    });
}

enum FlagResolution {
    Fields(Vec<String>),
    EmptySetting,
}

fn owned_str(s: &str) -> Result<OwnedValue, AgentError> {
    Value::from(s)
        .try_to_owned()
        .map_err(|err| AgentError::Failed(format!("variant construction failed: {err}")))
}

/// `{setting: {"secrets": {k: v}}}`, the VPN wire shape.
fn wrap_vpn_secrets(
    setting_name: &str,
    secrets: HashMap<String, String>,
) -> Result<ConnectionDict, String> {
    let value = Value::from(secrets)
        .try_to_owned()
        .map_err(|err| format!("variant construction failed: {err}"))?;

    let mut section = VariantMap::new();
    section.insert("secrets".to_owned(), value);

    let mut out = ConnectionDict::new();
    out.insert(setting_name.to_owned(), section);
    Ok(out)
}

/// The GP SAML reply: cookie, gateway, and gateway certificate pin.
fn build_gp_saml_response(
    setting_name: &str,
    cookie: &str,
    host: &str,
    fingerprint: &str,
) -> Result<ConnectionDict, String> {
    let mut secrets = HashMap::new();
    secrets.insert("cookie".to_owned(), cookie.to_owned());
    secrets.insert("gateway".to_owned(), host.to_owned());
    secrets.insert("gwcert".to_owned(), fingerprint.to_owned());
    wrap_vpn_secrets(setting_name, secrets)
}

#[cfg(test)]
mod tests {
    use super::settings::test_support::*;
    use super::*;

    fn agent() -> SecretAgent {
        SecretAgent::new(Arc::new(AgentState::new()), Arc::new(PromptBroker::new()))
    }

    fn wifi_dict(ssid_str: &str) -> ConnectionDict {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "connection".to_owned(),
            section(vec![
                ("type", sv("802-11-wireless")),
                ("id", sv(ssid_str)),
                ("uuid", sv("wifi-uuid")),
            ]),
        );
        dict.insert(
            "802-11-wireless".to_owned(),
            section(vec![("ssid", bytes(ssid_str.as_bytes()))]),
        );
        dict
    }

    #[test]
    fn scope_gate_defers_for_other_ssids() {
        let agent = agent();
        agent.state.set_connecting_wifi("Alpha");

        assert!(agent.check_scope("802-11-wireless", "Alpha", "").is_ok());
        let err = agent
            .check_scope("802-11-wireless", "Beta", "")
            .unwrap_err();
        assert!(matches!(err, AgentError::NoSecrets(_)));
    }

    #[test]
    fn scope_gate_defers_for_other_vpn_uuids() {
        let agent = agent();
        agent.state.set_connecting_vpn("u-1");

        assert!(agent.check_scope("vpn", "", "u-1").is_ok());
        assert!(matches!(
            agent.check_scope("vpn", "", "u-2"),
            Err(AgentError::NoSecrets(_))
        ));
        assert!(matches!(
            agent.check_scope("wireguard", "", "u-2"),
            Err(AgentError::NoSecrets(_))
        ));
        // Non-matching connection types pass through.
        assert!(agent.check_scope("802-3-ethernet", "", "u-2").is_ok());
    }

    #[test]
    fn idle_agent_answers_everything() {
        let agent = agent();
        assert!(agent.check_scope("802-11-wireless", "Any", "").is_ok());
        assert!(agent.check_scope("vpn", "", "any-uuid").is_ok());
    }

    #[test]
    fn password_flags_not_required_yields_empty_setting() {
        let agent = agent();
        let mut dict = wifi_dict("Alpha");
        dict.insert(
            "802-11-wireless-security".to_owned(),
            section(vec![("psk-flags", uv(4))]),
        );

        match agent
            .resolve_by_password_flags(&dict, "802-11-wireless-security")
            .unwrap()
        {
            FlagResolution::EmptySetting => (),
            FlagResolution::Fields(fields) => panic!("expected empty setting, got {fields:?}"),
        }
    }

    #[test]
    fn password_flags_agent_owned_infers_fields() {
        let agent = agent();
        let mut dict = wifi_dict("Alpha");
        dict.insert(
            "802-11-wireless-security".to_owned(),
            section(vec![("psk-flags", uv(1))]),
        );

        match agent
            .resolve_by_password_flags(&dict, "802-11-wireless-security")
            .unwrap()
        {
            FlagResolution::Fields(fields) => assert_eq!(fields, vec!["psk"]),
            FlagResolution::EmptySetting => panic!("expected fields"),
        }
    }

    #[test]
    fn password_flags_unknown_defers() {
        let agent = agent();
        let dict = wifi_dict("Alpha");
        assert!(matches!(
            agent.resolve_by_password_flags(&dict, "802-11-wireless-security"),
            Err(AgentError::NoSecrets(_))
        ));
    }

    #[test]
    fn vpn_wire_shape_wraps_secrets() {
        let mut secrets = HashMap::new();
        secrets.insert("password".to_owned(), "hunter2".to_owned());
        let out = wrap_vpn_secrets("vpn", secrets).unwrap();

        let section = out.get("vpn").unwrap();
        let value = section.get("secrets").unwrap();
        let cloned = value.try_clone().unwrap();
        let inner = HashMap::<String, String>::try_from(cloned).unwrap();
        assert_eq!(inner.get("password").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn gp_saml_response_shape() {
        let out = build_gp_saml_response("vpn", "cookie-v", "vpn.example.com", "pin-sha256:x")
            .unwrap();
        let value = out.get("vpn").unwrap().get("secrets").unwrap();
        let inner =
            HashMap::<String, String>::try_from(value.try_clone().unwrap()).unwrap();
        assert_eq!(inner.get("cookie").map(String::as_str), Some("cookie-v"));
        assert_eq!(
            inner.get("gateway").map(String::as_str),
            Some("vpn.example.com")
        );
        assert_eq!(inner.get("gwcert").map(String::as_str), Some("pin-sha256:x"));
    }

    #[test]
    fn cache_priority_gp_saml_first() {
        let agent = agent();
        agent.state.cache_gp_saml(CachedGpSamlCookie {
            connection_uuid: "u-1".to_owned(),
            cookie: "c".to_owned(),
            host: "h".to_owned(),
            user: "u".to_owned(),
            fingerprint: "f".to_owned(),
        });
        agent.state.cache_pkcs11_pin(CachedPkcs11Pin {
            connection_uuid: "u-1".to_owned(),
            pin: "1234".to_owned(),
        });

        let path = ObjectPath::try_from("/conn/1").unwrap();
        let out = agent
            .consult_caches(&path, "u-1", "vpn", &[KEY_PASS_FIELD.to_owned()])
            .unwrap()
            .unwrap();
        let inner = HashMap::<String, String>::try_from(
            out.get("vpn").unwrap().get("secrets").unwrap().try_clone().unwrap(),
        )
        .unwrap();
        assert!(inner.contains_key("cookie"), "GP SAML wins over PKCS11");

        // The PIN is still cached and is consumed next.
        let out = agent
            .consult_caches(&path, "u-1", "vpn", &[KEY_PASS_FIELD.to_owned()])
            .unwrap()
            .unwrap();
        let inner = HashMap::<String, String>::try_from(
            out.get("vpn").unwrap().get("secrets").unwrap().try_clone().unwrap(),
        )
        .unwrap();
        assert_eq!(inner.get(KEY_PASS_FIELD).map(String::as_str), Some("1234"));
    }

    #[test]
    fn cached_vpn_password_queues_save() {
        let agent = agent();
        agent.state.cache_vpn_credentials(cache::CachedVpnCredentials {
            connection_uuid: "u-2".to_owned(),
            password: "pw".to_owned(),
            save_password: true,
        });

        let path = ObjectPath::try_from("/conn/2").unwrap();
        let out = agent
            .consult_caches(&path, "u-2", "vpn", &["password".to_owned()])
            .unwrap()
            .unwrap();
        assert!(out.get("vpn").unwrap().contains_key("secrets"));

        let pending = agent.state.take_pending_vpn_save().unwrap();
        assert_eq!(pending.connection_path, "/conn/2");
        assert!(pending.save_password);
    }

    #[test]
    fn cache_miss_returns_none() {
        let agent = agent();
        let path = ObjectPath::try_from("/conn/3").unwrap();
        assert!(agent
            .consult_caches(&path, "u-3", "vpn", &["password".to_owned()])
            .unwrap()
            .is_none());
    }
}
