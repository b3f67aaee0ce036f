//! Which credential fields an activation actually needs.
//!
//! NetworkManager's hints are authoritative when present; otherwise the
//! required fields are inferred from the connection dictionary: EAP method
//! for 802.1X, the VPN service's own conventions for VPNs, including
//! smartcard (`pkcs11:`) and GlobalProtect SAML special cases.

use std::collections::HashMap;

use super::settings::{self, ConnectionDict};
use crate::prompt::FieldInfo;

/// The synthetic field that routes a request into the SAML flow.
pub const GP_SAML_FIELD: &str = "gp-saml";
/// The PKCS11 PIN field openconnect asks for.
pub const KEY_PASS_FIELD: &str = "key_pass";

const NM_SECRET_AGENT_GET_SECRETS_FLAG_REQUEST_NEW: u32 = 0x2;
const NM_SECRET_AGENT_GET_SECRETS_FLAG_USER_REQUESTED: u32 = 0x4;

/// Fields required for `setting`, before the password-flags fallback.
pub fn fields_needed(setting: &str, hints: &[String], dict: &ConnectionDict) -> Vec<String> {
    match setting {
        "802-11-wireless-security" => vec!["psk".to_owned()],
        "802-1x" => {
            if !hints.is_empty() {
                hints.to_vec()
            } else {
                infer_8021x_fields(dict)
            }
        }
        "vpn" => hints.to_vec(),
        _ => Vec::new(),
    }
}

/// 802.1X: ask for the identity unless one is stored, and for the password
/// matching the EAP method (TLS wants the private key password).
pub fn infer_8021x_fields(dict: &ConnectionDict) -> Vec<String> {
    let mut fields = Vec::new();

    let stored_identity = settings::setting_str(dict, "802-1x", "identity")
        .is_some_and(|id| !id.is_empty());
    if !stored_identity {
        fields.push("identity".to_owned());
    }

    let eap = settings::setting_str_list(dict, "802-1x", "eap").unwrap_or_default();
    if eap.first().is_some_and(|m| m == "tls") {
        fields.push("private-key-password".to_owned());
    } else {
        fields.push("password".to_owned());
    }

    fields
}

/// VPN inference when NM supplied no hints.
pub fn infer_vpn_fields(dict: &ConnectionDict, vpn_service: &str) -> Vec<String> {
    let mut fields = vec!["password".to_owned()];
    let data = settings::vpn_data(dict);
    let conn_type = data.get("connection-type").map(String::as_str).unwrap_or("");

    if vpn_service.contains("openconnect") {
        let protocol = data.get("protocol").map(String::as_str).unwrap_or("");
        let authtype = data.get("authtype").map(String::as_str).unwrap_or("");
        let username = data.get("username").map(String::as_str).unwrap_or("");

        if authtype == "cert"
            && data
                .get("usercert")
                .is_some_and(|c| c.starts_with("pkcs11:"))
        {
            return vec![KEY_PASS_FIELD.to_owned()];
        }

        if needs_external_browser_auth(protocol, authtype, username, &data) {
            if protocol == "gp" {
                info!("GlobalProtect SAML auth detected");
                return vec![GP_SAML_FIELD.to_owned()];
            }
            info!(
                "external browser auth detected for protocol {protocol:?} but only \
                 GlobalProtect SAML is supported, falling back to credentials"
            );
        }

        if username.is_empty() {
            fields = vec!["username".to_owned(), "password".to_owned()];
        }
    } else if vpn_service.contains("openvpn") {
        if (conn_type == "password" || conn_type == "password-tls")
            && data.get("username").map(String::as_str).unwrap_or("").is_empty()
        {
            fields = vec!["username".to_owned(), "password".to_owned()];
        }
    } else if vpn_service.contains("vpnc")
        || vpn_service.contains("l2tp")
        || vpn_service.contains("pptp")
    {
        if data.get("username").map(String::as_str).unwrap_or("").is_empty() {
            fields = vec!["username".to_owned(), "password".to_owned()];
        }
    }

    fields
}

fn needs_external_browser_auth(
    protocol: &str,
    authtype: &str,
    username: &str,
    data: &HashMap<String, String>,
) -> bool {
    if let Some(method) = data.get("saml-auth-method") {
        if method == "REDIRECT" || method == "POST" {
            return true;
        }
    }

    if !authtype.is_empty() && authtype != "password" && authtype != "cert" {
        return true;
    }

    protocol == "gp" && authtype.is_empty() && username.is_empty()
}

/// Whether this openconnect profile authenticates with a smartcard key.
pub fn is_pkcs11_auth(dict: &ConnectionDict, vpn_service: &str) -> bool {
    if !vpn_service.contains("openconnect") {
        return false;
    }
    let data = settings::vpn_data(dict);
    data.get("authtype").map(String::as_str) == Some("cert")
        && data
            .get("usercert")
            .is_some_and(|c| c.starts_with("pkcs11:"))
}

/// Why the prompt is being shown, from NM's request flags.
pub fn reason_from_flags(flags: u32) -> &'static str {
    if flags & NM_SECRET_AGENT_GET_SECRETS_FLAG_REQUEST_NEW != 0 {
        return "wrong-password";
    }
    if flags & NM_SECRET_AGENT_GET_SECRETS_FLAG_USER_REQUESTED != 0 {
        return "user-requested";
    }
    "required"
}

/// Labels and secrecy for each prompted field.
pub fn build_fields_info(setting: &str, fields: &[String], vpn_service: &str) -> Vec<FieldInfo> {
    fields
        .iter()
        .map(|field| {
            let (label, is_secret) = match setting {
                "802-11-wireless-security" => ("Password".to_owned(), true),
                "802-1x" => match field.as_str() {
                    "identity" => ("Username".to_owned(), false),
                    "password" => ("Password".to_owned(), true),
                    other => (other.to_owned(), true),
                },
                "vpn" => vpn_field_meta(field, vpn_service),
                _ => (field.clone(), true),
            };
            FieldInfo {
                name: field.clone(),
                label,
                is_secret,
            }
        })
        .collect()
}

fn vpn_field_meta(field: &str, _vpn_service: &str) -> (String, bool) {
    match field {
        GP_SAML_FIELD => return ("GlobalProtect SAML/SSO".to_owned(), false),
        KEY_PASS_FIELD => return ("PIN".to_owned(), true),
        "password" => return ("Password".to_owned(), true),
        "Xauth password" => return ("IPSec Password".to_owned(), true),
        "IPSec secret" => return ("IPSec Pre-Shared Key".to_owned(), true),
        "cert-pass" => return ("Certificate Password".to_owned(), true),
        "http-proxy-password" => return ("HTTP Proxy Password".to_owned(), true),
        "username" => return ("Username".to_owned(), false),
        "Xauth username" => return ("IPSec Username".to_owned(), false),
        "proxy-password" => return ("Proxy Password".to_owned(), true),
        "private-key-password" => return ("Private Key Password".to_owned(), true),
        _ => (),
    }

    let is_secret = field.ends_with("password")
        || field.ends_with("secret")
        || field.ends_with("pass")
        || field.ends_with("psk");
    (title_case(field), is_secret)
}

fn title_case(field: &str) -> String {
    field
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::super::settings::test_support::*;
    use super::super::settings::VariantMap;
    use super::*;

    fn vpn_dict(service: &str, data: &[(&str, &str)]) -> ConnectionDict {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "connection".to_owned(),
            section(vec![("type", sv("vpn"))]),
        );
        dict.insert(
            "vpn".to_owned(),
            section(vec![
                ("service-type", sv(service)),
                ("data", string_map(data)),
            ]),
        );
        dict
    }

    #[test]
    fn wifi_psk_needs_psk() {
        assert_eq!(
            fields_needed("802-11-wireless-security", &[], &ConnectionDict::new()),
            vec!["psk"]
        );
    }

    #[test]
    fn dot1x_hints_win() {
        let hints = vec!["password".to_owned()];
        assert_eq!(
            fields_needed("802-1x", &hints, &ConnectionDict::new()),
            hints
        );
    }

    #[test]
    fn dot1x_inference_honors_stored_identity_and_eap() {
        let mut dict = ConnectionDict::new();
        dict.insert(
            "802-1x".to_owned(),
            section(vec![
                ("identity", sv("alice")),
                ("eap", {
                    let v = zbus::zvariant::Value::from(vec!["tls".to_owned()]);
                    v.try_to_owned().unwrap()
                }),
            ]),
        );
        assert_eq!(infer_8021x_fields(&dict), vec!["private-key-password"]);

        let mut dict = ConnectionDict::new();
        dict.insert("802-1x".to_owned(), VariantMap::new());
        assert_eq!(infer_8021x_fields(&dict), vec!["identity", "password"]);
    }

    #[test]
    fn openconnect_pkcs11_asks_for_pin() {
        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openconnect",
            &[("authtype", "cert"), ("usercert", "pkcs11:token=foo")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openconnect"),
            vec![KEY_PASS_FIELD]
        );
        assert!(is_pkcs11_auth(
            &dict,
            "org.freedesktop.NetworkManager.openconnect"
        ));
    }

    #[test]
    fn globalprotect_saml_is_detected() {
        // Explicit SAML method.
        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openconnect",
            &[("protocol", "gp"), ("saml-auth-method", "REDIRECT")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openconnect"),
            vec![GP_SAML_FIELD]
        );

        // gp with neither authtype nor username defaults to SAML.
        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openconnect",
            &[("protocol", "gp")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openconnect"),
            vec![GP_SAML_FIELD]
        );

        // Stored username means plain credentials.
        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openconnect",
            &[("protocol", "gp"), ("username", "bob"), ("authtype", "password")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openconnect"),
            vec!["password"]
        );
    }

    #[test]
    fn username_presence_controls_field_list() {
        let dict = vpn_dict("org.freedesktop.NetworkManager.vpnc", &[]);
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.vpnc"),
            vec!["username", "password"]
        );

        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.vpnc",
            &[("username", "carol")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.vpnc"),
            vec!["password"]
        );

        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openvpn",
            &[("connection-type", "password")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openvpn"),
            vec!["username", "password"]
        );
    }

    #[test]
    fn browser_auth_detection_table() {
        let cases: &[(&str, &str, &str, &[(&str, &str)], bool)] = &[
            ("gp", "password", "user", &[("saml-auth-method", "REDIRECT")], true),
            ("gp", "password", "user", &[("saml-auth-method", "POST")], true),
            ("gp", "", "", &[], true),
            ("gp", "password", "john", &[], false),
            ("gp", "", "john", &[], false),
            ("gp", "cert", "", &[], false),
            ("pulse", "", "", &[("saml-auth-method", "REDIRECT")], true),
            ("fortinet", "saml", "", &[], true),
            ("anyconnect", "cert", "", &[], false),
            ("anyconnect", "password", "user", &[], false),
            ("", "", "", &[], false),
        ];

        for (protocol, authtype, username, data, expected) in cases {
            let data: HashMap<String, String> = data
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect();
            assert_eq!(
                needs_external_browser_auth(protocol, authtype, username, &data),
                *expected,
                "protocol={protocol} authtype={authtype} username={username}"
            );
        }
    }

    #[test]
    fn non_gp_openconnect_asks_for_credentials() {
        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openconnect",
            &[("protocol", "anyconnect"), ("gateway", "vpn.example.com")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openconnect"),
            vec!["username", "password"]
        );

        // SAML on an unsupported protocol falls back to credentials.
        let dict = vpn_dict(
            "org.freedesktop.NetworkManager.openconnect",
            &[("protocol", "fortinet"), ("authtype", "saml")],
        );
        assert_eq!(
            infer_vpn_fields(&dict, "org.freedesktop.NetworkManager.openconnect"),
            vec!["username", "password"]
        );
    }

    #[test]
    fn reasons_from_flags() {
        assert_eq!(reason_from_flags(0x0), "required");
        assert_eq!(reason_from_flags(0x1), "required");
        assert_eq!(reason_from_flags(0x2), "wrong-password");
        assert_eq!(reason_from_flags(0x1 | 0x4), "user-requested");
        assert_eq!(reason_from_flags(0x2 | 0x4), "wrong-password");
    }

    #[test]
    fn field_labels() {
        let info = build_fields_info(
            "vpn",
            &[GP_SAML_FIELD.to_owned(), "http-proxy-password".to_owned()],
            "org.freedesktop.NetworkManager.openconnect",
        );
        assert_eq!(info[0].label, "GlobalProtect SAML/SSO");
        assert!(!info[0].is_secret);
        assert!(info[1].is_secret);

        let info = build_fields_info("vpn", &["gateway-secret".to_owned()], "");
        assert_eq!(info[0].label, "Gateway Secret");
        assert!(info[0].is_secret);
    }
}
