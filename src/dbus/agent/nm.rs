//! Direct NetworkManager D-Bus calls the agent needs.
//!
//! Saving a provided 802.1X identity back into the profile, deleting a
//! half-created Wi-Fi profile after a cancelled prompt, and deactivating a
//! partially-activated VPN.

use std::collections::HashMap;

use anyhow::Context as _;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use super::settings::VariantMap;

const NM_DEST: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_IFACE: &str = "org.freedesktop.NetworkManager";
const NM_SETTINGS_PATH: &str = "/org/freedesktop/NetworkManager/Settings";
const NM_SETTINGS_IFACE: &str = "org.freedesktop.NetworkManager.Settings";
const NM_CONNECTION_IFACE: &str = "org.freedesktop.NetworkManager.Settings.Connection";
const NM_ACTIVE_IFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// `Update2` flag: write the updated settings to disk.
const NM_SETTINGS_UPDATE2_FLAG_TO_DISK: u32 = 0x1;

async fn get_settings(
    conn: &zbus::Connection,
    path: &ObjectPath<'_>,
) -> anyhow::Result<HashMap<String, VariantMap>> {
    let reply = conn
        .call_method(
            Some(NM_DEST),
            path.clone(),
            Some(NM_CONNECTION_IFACE),
            "GetSettings",
            &(),
        )
        .await
        .context("failed to call GetSettings")?;
    reply
        .body()
        .deserialize()
        .context("failed to deserialize GetSettings reply")
}

/// Writes a user-provided 802.1X identity into the connection profile.
///
/// Only the connection and 802-1x sections are sent back; NM merges them.
pub async fn save_8021x_identity(
    conn: &zbus::Connection,
    path: &ObjectPath<'_>,
    identity: &str,
) -> anyhow::Result<()> {
    let existing = get_settings(conn, path).await?;

    let mut settings: HashMap<String, VariantMap> = HashMap::new();
    if let Some(connection_section) = existing.get("connection") {
        let mut copied = VariantMap::new();
        for (k, v) in connection_section {
            copied.insert(k.clone(), v.try_clone().context("unclonable variant")?);
        }
        settings.insert("connection".to_owned(), copied);
    }

    let mut dot1x = VariantMap::new();
    if let Some(existing_dot1x) = existing.get("802-1x") {
        for (k, v) in existing_dot1x {
            dot1x.insert(k.clone(), v.try_clone().context("unclonable variant")?);
        }
    }
    dot1x.insert(
        "identity".to_owned(),
        Value::from(identity).try_to_owned()?,
    );
    settings.insert("802-1x".to_owned(), dot1x);

    let args: HashMap<String, OwnedValue> = HashMap::new();
    conn.call_method(
        Some(NM_DEST),
        path.clone(),
        Some(NM_CONNECTION_IFACE),
        "Update2",
        &(settings, NM_SETTINGS_UPDATE2_FLAG_TO_DISK, args),
    )
    .await
    .context("failed to save 802.1x identity")?;

    info!("saved 802.1x identity to connection profile");
    Ok(())
}

/// Writes VPN credentials into the profile after a confirmed activation.
///
/// The username lands in `vpn.data`; with `save_password` the password goes
/// into `vpn.secrets` and `password-flags` drops to 0 so NM keeps it.
pub async fn persist_vpn_credentials(
    conn: &zbus::Connection,
    path: &ObjectPath<'_>,
    username: &str,
    password: &str,
    save_password: bool,
) -> anyhow::Result<()> {
    let existing = get_settings(conn, path).await?;

    let mut settings: HashMap<String, VariantMap> = HashMap::new();
    for (section, entries) in &existing {
        let mut copied = VariantMap::new();
        for (k, v) in entries {
            copied.insert(k.clone(), v.try_clone().context("unclonable variant")?);
        }
        settings.insert(section.clone(), copied);
    }

    let vpn = settings.entry("vpn".to_owned()).or_default();

    let mut data: HashMap<String, String> = vpn
        .get("data")
        .and_then(|v| v.try_clone().ok())
        .and_then(|v| HashMap::<String, String>::try_from(v).ok())
        .unwrap_or_default();
    if !username.is_empty() {
        data.insert("username".to_owned(), username.to_owned());
    }
    if save_password {
        data.insert("password-flags".to_owned(), "0".to_owned());

        let mut secrets: HashMap<String, String> = HashMap::new();
        secrets.insert("password".to_owned(), password.to_owned());
        vpn.insert("secrets".to_owned(), Value::from(secrets).try_to_owned()?);
    }
    vpn.insert("data".to_owned(), Value::from(data).try_to_owned()?);

    let args: HashMap<String, OwnedValue> = HashMap::new();
    conn.call_method(
        Some(NM_DEST),
        path.clone(),
        Some(NM_CONNECTION_IFACE),
        "Update2",
        &(settings, NM_SETTINGS_UPDATE2_FLAG_TO_DISK, args),
    )
    .await
    .context("failed to persist VPN credentials")?;

    info!("persisted VPN credentials to connection profile");
    Ok(())
}

/// Resolves an active connection's settings connection path.
pub async fn active_connection_path(
    conn: &zbus::Connection,
    active: &ObjectPath<'_>,
) -> anyhow::Result<OwnedObjectPath> {
    let reply = conn
        .call_method(
            Some(NM_DEST),
            active.clone(),
            Some(PROPERTIES_IFACE),
            "Get",
            &(NM_ACTIVE_IFACE, "Connection"),
        )
        .await
        .context("failed to read the active connection's profile path")?;
    let body = reply.body();
    let value: OwnedValue = body
        .deserialize()
        .context("failed to deserialize the Connection property")?;
    OwnedObjectPath::try_from(value).context("Connection property has an unexpected type")
}

/// Deletes the stored profile for `ssid`, if one exists.
pub async fn forget_wifi_network(conn: &zbus::Connection, ssid: &str) -> anyhow::Result<()> {
    let reply = conn
        .call_method(
            Some(NM_DEST),
            NM_SETTINGS_PATH,
            Some(NM_SETTINGS_IFACE),
            "ListConnections",
            &(),
        )
        .await
        .context("failed to list connections")?;
    let paths: Vec<OwnedObjectPath> = reply
        .body()
        .deserialize()
        .context("failed to deserialize ListConnections reply")?;

    for path in paths {
        let Ok(settings) = get_settings(conn, &path.as_ref()).await else {
            continue;
        };
        let dict: super::settings::ConnectionDict = settings;
        if super::settings::ssid(&dict) != ssid {
            continue;
        }

        conn.call_method(
            Some(NM_DEST),
            path.clone(),
            Some(NM_CONNECTION_IFACE),
            "Delete",
            &(),
        )
        .await
        .with_context(|| format!("failed to delete connection for {ssid}"))?;
        info!("removed connection profile for {ssid}");
        return Ok(());
    }

    debug!("no stored profile found for {ssid}");
    Ok(())
}

/// Deactivates the active connection with the given UUID.
pub async fn disconnect_vpn(conn: &zbus::Connection, uuid: &str) -> anyhow::Result<()> {
    let reply = conn
        .call_method(
            Some(NM_DEST),
            NM_PATH,
            Some(PROPERTIES_IFACE),
            "Get",
            &(NM_IFACE, "ActiveConnections"),
        )
        .await
        .context("failed to read ActiveConnections")?;
    let body = reply.body();
    let value: OwnedValue = body
        .deserialize()
        .context("failed to deserialize ActiveConnections")?;
    let actives = Vec::<OwnedObjectPath>::try_from(value)
        .context("ActiveConnections has an unexpected type")?;

    for active in actives {
        let Ok(reply) = conn
            .call_method(
                Some(NM_DEST),
                active.clone(),
                Some(PROPERTIES_IFACE),
                "Get",
                &(NM_ACTIVE_IFACE, "Uuid"),
            )
            .await
        else {
            continue;
        };
        let body = reply.body();
        let value: OwnedValue = match body.deserialize() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let active_uuid = String::try_from(value).unwrap_or_default();
        if active_uuid != uuid {
            continue;
        }

        conn.call_method(
            Some(NM_DEST),
            NM_PATH,
            Some(NM_IFACE),
            "DeactivateConnection",
            &(active),
        )
        .await
        .with_context(|| format!("failed to deactivate VPN {uuid}"))?;
        info!("deactivated VPN connection {uuid}");
        return Ok(());
    }

    debug!("no active connection with uuid {uuid}");
    Ok(())
}
