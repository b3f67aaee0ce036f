//! Typed getters over NetworkManager's `a{sa{sv}}` connection dictionary.
//!
//! The inference rules care about a handful of specific keys; everything
//! else stays opaque. Missing sections, missing keys, and wrong variant
//! types all read as absent.

use std::collections::HashMap;

use zbus::zvariant::{OwnedValue, Str};

pub type VariantMap = HashMap<String, OwnedValue>;
pub type ConnectionDict = HashMap<String, VariantMap>;

/// Sentinel for "could not determine password flags".
pub const FLAGS_UNKNOWN: u32 = 0xFFFF;

pub fn setting_str(dict: &ConnectionDict, section: &str, key: &str) -> Option<String> {
    let value = dict.get(section)?.get(key)?;
    value
        .downcast_ref::<Str<'_>>()
        .ok()
        .map(|s| s.as_str().to_owned())
}

pub fn setting_u32(dict: &ConnectionDict, section: &str, key: &str) -> Option<u32> {
    dict.get(section)?.get(key)?.downcast_ref::<u32>().ok()
}

pub fn setting_str_list(dict: &ConnectionDict, section: &str, key: &str) -> Option<Vec<String>> {
    let value = dict.get(section)?.get(key)?;
    let cloned = value.try_clone().ok()?;
    Vec::<String>::try_from(cloned).ok()
}

pub fn setting_string_map(
    dict: &ConnectionDict,
    section: &str,
    key: &str,
) -> Option<HashMap<String, String>> {
    let value = dict.get(section)?.get(key)?;
    let cloned = value.try_clone().ok()?;
    HashMap::<String, String>::try_from(cloned).ok()
}

/// The SSID, which NetworkManager serializes as a byte array but some
/// callers hand over as a string.
pub fn ssid(dict: &ConnectionDict) -> String {
    let Some(value) = dict.get("802-11-wireless").and_then(|s| s.get("ssid")) else {
        return String::new();
    };

    if let Ok(cloned) = value.try_clone() {
        if let Ok(bytes) = Vec::<u8>::try_from(cloned) {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    value
        .downcast_ref::<Str<'_>>()
        .ok()
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default()
}

/// Connection type, display name, and VPN service type.
///
/// Wi-Fi connections without an id fall back to the SSID as their name.
pub fn conn_identity(dict: &ConnectionDict) -> (String, String, String) {
    let conn_type = setting_str(dict, "connection", "type").unwrap_or_default();
    let mut name = setting_str(dict, "connection", "id").unwrap_or_default();
    let service = setting_str(dict, "vpn", "service-type").unwrap_or_default();

    if name.is_empty() && conn_type == "802-11-wireless" {
        name = ssid(dict);
    }
    (conn_type, name, service)
}

/// The VPN setting's `data` map (`a{ss}`).
pub fn vpn_data(dict: &ConnectionDict) -> HashMap<String, String> {
    setting_string_map(dict, "vpn", "data").unwrap_or_default()
}

/// `password-flags` buried in the VPN data map, [`FLAGS_UNKNOWN`] when it
/// cannot be read.
pub fn vpn_password_flags(dict: &ConnectionDict, setting_name: &str) -> u32 {
    if setting_name != "vpn" {
        return FLAGS_UNKNOWN;
    }
    vpn_data(dict)
        .get("password-flags")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(FLAGS_UNKNOWN)
}

#[cfg(test)]
pub(crate) mod test_support {
    use zbus::zvariant::Value;

    use super::*;

    pub fn sv(s: &str) -> OwnedValue {
        Value::from(s).try_to_owned().unwrap()
    }

    pub fn uv(n: u32) -> OwnedValue {
        Value::from(n).try_to_owned().unwrap()
    }

    pub fn bytes(b: &[u8]) -> OwnedValue {
        Value::from(b.to_vec()).try_to_owned().unwrap()
    }

    pub fn string_map(entries: &[(&str, &str)]) -> OwnedValue {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Value::from(map).try_to_owned().unwrap()
    }

    pub fn section(entries: Vec<(&str, OwnedValue)>) -> VariantMap {
        entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn reads_strings_and_integers() {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "connection".to_owned(),
            section(vec![("type", sv("vpn")), ("uuid", sv("u-1"))]),
        );
        dict.insert(
            "802-1x".to_owned(),
            section(vec![("password-flags", uv(1))]),
        );

        assert_eq!(
            setting_str(&dict, "connection", "type").as_deref(),
            Some("vpn")
        );
        assert_eq!(setting_str(&dict, "connection", "missing"), None);
        assert_eq!(setting_u32(&dict, "802-1x", "password-flags"), Some(1));
        // Wrong type reads as absent.
        assert_eq!(setting_u32(&dict, "connection", "type"), None);
    }

    #[test]
    fn ssid_handles_bytes_and_strings() {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "802-11-wireless".to_owned(),
            section(vec![("ssid", bytes(b"Alpha"))]),
        );
        assert_eq!(ssid(&dict), "Alpha");

        dict.insert(
            "802-11-wireless".to_owned(),
            section(vec![("ssid", sv("Beta"))]),
        );
        assert_eq!(ssid(&dict), "Beta");

        assert_eq!(ssid(&ConnectionDict::new()), "");
    }

    #[test]
    fn identity_falls_back_to_ssid() {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "connection".to_owned(),
            section(vec![("type", sv("802-11-wireless"))]),
        );
        dict.insert(
            "802-11-wireless".to_owned(),
            section(vec![("ssid", bytes(b"HomeNet"))]),
        );

        let (conn_type, name, service) = conn_identity(&dict);
        assert_eq!(conn_type, "802-11-wireless");
        assert_eq!(name, "HomeNet");
        assert_eq!(service, "");
    }

    #[test]
    fn vpn_password_flags_parses_the_data_map() {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "vpn".to_owned(),
            section(vec![("data", string_map(&[("password-flags", "4")]))]),
        );

        assert_eq!(vpn_password_flags(&dict, "vpn"), 4);
        assert_eq!(vpn_password_flags(&dict, "802-1x"), FLAGS_UNKNOWN);
        assert_eq!(vpn_password_flags(&ConnectionDict::new(), "vpn"), FLAGS_UNKNOWN);
    }
}
