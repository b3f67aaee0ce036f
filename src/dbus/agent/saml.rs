//! The GlobalProtect SAML handshake.
//!
//! Runs `gp-saml-gui` for the browser-based SAML exchange, then converts
//! the prelogin cookie into a full activation cookie with
//! `openconnect --authenticate`. Only `protocol=gp` is supported.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context as _};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::utils::unshell_quote;

/// How long the whole SAML exchange may take, browser included.
pub const SAML_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpSamlAuthResult {
    pub cookie: String,
    pub host: String,
    pub user: String,
    pub fingerprint: String,
}

/// Runs the SAML flow against `gateway`, bounded by [`SAML_TIMEOUT`].
pub async fn run_globalprotect_saml(
    gateway: &str,
    protocol: &str,
) -> anyhow::Result<GpSamlAuthResult> {
    if gateway.is_empty() {
        bail!("GP SAML auth: gateway is empty");
    }
    if protocol != "gp" {
        bail!("only GlobalProtect (protocol=gp) SAML is supported, got: {protocol}");
    }

    match tokio::time::timeout(SAML_TIMEOUT, run_saml_flow(gateway)).await {
        Ok(result) => result,
        Err(_) => bail!("GP SAML auth timed out"),
    }
}

async fn run_saml_flow(gateway: &str) -> anyhow::Result<GpSamlAuthResult> {
    info!("starting GlobalProtect SAML authentication for gateway={gateway}");

    let mut child = Command::new("gp-saml-gui")
        .args(["--gateway", "--allow-insecure-crypto", gateway])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("GlobalProtect SAML requires gp-saml-gui (install: pip install gp-saml-gui)")?;

    let stdout = child
        .stdout
        .take()
        .context("GP SAML auth: failed to take stdout pipe")?;
    let stderr = child
        .stderr
        .take()
        .context("GP SAML auth: failed to take stderr pipe")?;

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("gp-saml-gui: {line}");
        }
    });

    let mut result = GpSamlAuthResult {
        host: gateway.to_owned(),
        ..Default::default()
    };
    let mut all_output = Vec::new();

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        debug!("gp-saml-gui stdout: {line}");
        parse_saml_line(&line, &mut result);
        all_output.push(line);
    }

    let status = child.wait().await.context("GP SAML auth: wait failed")?;
    if !status.success() {
        if result.cookie.is_empty() {
            bail!(
                "GP SAML auth failed: {status} (output: {})",
                all_output.join("\n")
            );
        }
        warn!("gp-saml-gui exited with {status} but a cookie was captured");
    }

    if result.cookie.is_empty() {
        bail!("GP SAML auth: no cookie in gp-saml-gui output");
    }

    info!("got prelogin cookie, converting to an openconnect cookie via --authenticate");
    let converted = convert_prelogin_cookie(gateway, &result.cookie, &result.user).await?;

    result.cookie = converted.cookie;
    result.host = converted.host;
    result.fingerprint = converted.fingerprint;

    info!(
        "GP SAML authentication successful: user={}, host={}, has_fingerprint={}",
        result.user,
        result.host,
        !result.fingerprint.is_empty()
    );
    Ok(result)
}

/// Feeds the prelogin cookie to `openconnect --authenticate` and parses the
/// activation cookie out of its output.
async fn convert_prelogin_cookie(
    gateway: &str,
    prelogin_cookie: &str,
    user: &str,
) -> anyhow::Result<GpSamlAuthResult> {
    let mut child = Command::new("openconnect")
        .args([
            "--protocol=gp",
            "--usergroup=gateway:prelogin-cookie",
            &format!("--user={user}"),
            "--passwd-on-stdin",
            "--allow-insecure-crypto",
            "--authenticate",
            gateway,
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("openconnect not found")?;

    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child
            .stdin
            .take()
            .context("failed to take openconnect stdin")?;
        stdin.write_all(prelogin_cookie.as_bytes()).await?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .context("openconnect --authenticate failed to run")?;
    let text = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        bail!(
            "openconnect --authenticate failed: {}\noutput: {}{}",
            output.status,
            text,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let mut result = GpSamlAuthResult::default();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("COOKIE=") {
            result.cookie = unshell_quote(rest).to_owned();
        } else if let Some(rest) = line.strip_prefix("HOST=") {
            result.host = unshell_quote(rest).to_owned();
        } else if let Some(rest) = line.strip_prefix("FINGERPRINT=") {
            result.fingerprint = unshell_quote(rest).to_owned();
        } else if let Some(rest) = line.strip_prefix("CONNECT_URL=") {
            let url = unshell_quote(rest);
            if !url.is_empty() && result.host.is_empty() {
                result.host = url.to_owned();
            }
        }
    }

    if result.cookie.is_empty() {
        bail!("no COOKIE in openconnect --authenticate output: {text}");
    }

    Ok(result)
}

/// Parses one stdout line from gp-saml-gui: `KEY=value` pairs, or the
/// suggested openconnect command line it prints at the end.
fn parse_saml_line(line: &str, result: &mut GpSamlAuthResult) {
    if let Some(rest) = line.strip_prefix("COOKIE=") {
        result.cookie = unshell_quote(rest).to_owned();
    } else if let Some(rest) = line.strip_prefix("HOST=") {
        result.host = unshell_quote(rest).to_owned();
    } else if let Some(rest) = line.strip_prefix("USER=") {
        result.user = unshell_quote(rest).to_owned();
    } else if let Some(rest) = line.strip_prefix("FINGERPRINT=") {
        result.fingerprint = unshell_quote(rest).to_owned();
    } else if line.contains("openconnect") {
        for part in line.split_whitespace() {
            if let Some(rest) = part.strip_prefix("--cookie=") {
                if result.cookie.is_empty() {
                    result.cookie = rest.to_owned();
                }
            } else if let Some(rest) = part.strip_prefix("--servercert=") {
                if result.fingerprint.is_empty() {
                    result.fingerprint = rest.to_owned();
                }
            } else if let Some(rest) = part.strip_prefix("--user=") {
                if result.user.is_empty() {
                    result.user = rest.to_owned();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_with_quoting() {
        let mut result = GpSamlAuthResult::default();
        parse_saml_line("COOKIE='abc=='", &mut result);
        parse_saml_line("HOST=\"vpn.example.com\"", &mut result);
        parse_saml_line("USER=alice@example.com", &mut result);
        parse_saml_line("FINGERPRINT=pin-sha256:xyz", &mut result);

        assert_eq!(result.cookie, "abc==");
        assert_eq!(result.host, "vpn.example.com");
        assert_eq!(result.user, "alice@example.com");
        assert_eq!(result.fingerprint, "pin-sha256:xyz");
    }

    #[test]
    fn parses_suggested_command_line_without_clobbering() {
        let mut result = GpSamlAuthResult::default();
        parse_saml_line(
            "openconnect --protocol=gp --user=bob --cookie=prelogin --servercert=pin-sha256:q vpn.example.com",
            &mut result,
        );
        assert_eq!(result.cookie, "prelogin");
        assert_eq!(result.user, "bob");
        assert_eq!(result.fingerprint, "pin-sha256:q");

        // KEY=value wins over the command line echo.
        parse_saml_line("COOKIE=real", &mut result);
        parse_saml_line(
            "openconnect --cookie=stale --user=mallory x",
            &mut result,
        );
        assert_eq!(result.cookie, "real");
        assert_eq!(result.user, "bob");
    }

    #[test]
    fn cookie_may_contain_equals_signs() {
        let mut result = GpSamlAuthResult::default();
        parse_saml_line(
            "openconnect --cookie=authcookie=xyz123&portal=GATE --user=jane",
            &mut result,
        );
        assert_eq!(result.cookie, "authcookie=xyz123&portal=GATE");
        assert_eq!(result.user, "jane");
    }

    #[test]
    fn non_matching_lines_are_ignored() {
        let mut result = GpSamlAuthResult::default();
        parse_saml_line("SAML REDIRECT to https://idp.example.com/sso", &mut result);
        parse_saml_line("", &mut result);
        assert_eq!(result, GpSamlAuthResult::default());
    }
}
