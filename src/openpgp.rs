//! OpenPGP verification envelope
//!
//! mantree does not implement OpenPGP. It shells out to an external
//! signing tool (GnuPG by default) and owns only the orchestration:
//! spawning the tool in batch mode, feeding it byte streams, and parsing
//! its machine-readable status output into typed results.
//!
//! Two environment flavors exist:
//!
//! - [`OpenPgpEnvironment::system`] uses the ambient keyring
//!   (`GNUPGHOME` or the user's home directory).
//! - [`OpenPgpEnvironment::isolated`] creates an ephemeral home
//!   directory, imports only keys explicitly provided, and removes the
//!   directory on every exit path. Verification results are then
//!   independent of user configuration.
//!
//! The tool name is taken from the `GNUPG` environment variable,
//! falling back to `gpg`. Availability is probed once, at construction:
//! a missing tool degrades the envelope to "unavailable" instead of
//! failing at first use, so tests and unrelated operations can proceed.
//!
//! Status lines recognized from `--status-fd`: `NEWSIG`, `GOODSIG`,
//! `BADSIG`, `EXPSIG`, `ERRSIG`, `EXPKEYSIG`, `REVKEYSIG`, `VALIDSIG`
//! and `TRUST_*`; each failure maps to a distinct error kind (see
//! [`crate::error::MantreeError`]).

use crate::error::{MantreeError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, trace, warn};

/// Environment variable naming the OpenPGP tool
pub const TOOL_ENV: &str = "GNUPG";
/// Environment variable naming the gpgconf companion tool
pub const CONF_TOOL_ENV: &str = "GNUPGCONF";

const DEFAULT_TOOL: &str = "gpg";
const DEFAULT_CONF_TOOL: &str = "gpgconf";

/// Metadata extracted from a good signature (the `VALIDSIG` record)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    /// Fingerprint of the signing (sub)key
    pub fingerprint: String,
    /// Signature creation time
    pub timestamp: Option<DateTime<Utc>>,
    /// Signature expiry, if any
    pub expire_timestamp: Option<DateTime<Utc>>,
    /// Fingerprint of the primary key
    pub primary_key_fingerprint: String,
}

/// Per-signature status from the tool's status stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureStatus {
    Good,
    Bad,
    Expired,
    ExpiredKey,
    RevokedKey,
    NoPublicKey,
    Error,
}

#[derive(Debug, Default)]
struct SigRecord {
    status: Option<SignatureStatus>,
    valid: bool,
    trusted: bool,
    fingerprint: String,
    primary_key_fingerprint: String,
    timestamp: Option<DateTime<Utc>>,
    expire_timestamp: Option<DateTime<Utc>>,
}

/// OpenPGP envelope around the external signing tool
///
/// Construct with [`OpenPgpEnvironment::system`] or
/// [`OpenPgpEnvironment::isolated`]; check [`is_available`] before
/// relying on signature operations.
///
/// [`is_available`]: OpenPgpEnvironment::is_available
#[derive(Debug)]
pub struct OpenPgpEnvironment {
    tool: String,
    conf_tool: String,
    available: bool,
    // Some(_) for the isolated flavor; removed on drop
    home: Option<TempDir>,
}

impl OpenPgpEnvironment {
    /// Create an envelope over the ambient keyring
    pub fn system() -> Self {
        let tool = std::env::var(TOOL_ENV).unwrap_or_else(|_| DEFAULT_TOOL.to_string());
        let conf_tool =
            std::env::var(CONF_TOOL_ENV).unwrap_or_else(|_| DEFAULT_CONF_TOOL.to_string());
        let available = probe_tool(&tool);
        if !available {
            warn!(tool = %tool, "OpenPGP tool not found, signature operations disabled");
        }
        Self {
            tool,
            conf_tool,
            available,
            home: None,
        }
    }

    /// Create an isolated envelope with an ephemeral home directory
    ///
    /// Only keys imported through [`import_key`] are present; the
    /// directory and its agent are destroyed when the envelope is
    /// dropped.
    ///
    /// [`import_key`]: OpenPgpEnvironment::import_key
    pub fn isolated() -> Result<Self> {
        let mut env = Self::system();
        let home = TempDir::with_prefix("mantree.")?;

        std::fs::write(
            home.path().join("gpg.conf"),
            "# autogenerated by mantree\n\
             # validity is set directly on imported keys\n\
             trust-model direct\n",
        )?;
        std::fs::write(
            home.path().join("gpg-agent.conf"),
            "# autogenerated by mantree\n\
             # no smartcard operations in an isolated home\n\
             disable-scdaemon\n",
        )?;
        std::fs::write(
            home.path().join("dirmngr.conf"),
            "# autogenerated by mantree\n\
             honor-http-proxy\n",
        )?;

        debug!(home = ?home.path(), "created isolated OpenPGP home");
        env.home = Some(home);
        Ok(env)
    }

    /// Whether the external tool was found at construction time
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Path of the isolated home directory, if this is an isolated
    /// envelope
    pub fn home_dir(&self) -> Option<&Path> {
        self.home.as_ref().map(|h| h.path())
    }

    fn spawn_tool(&self, args: &[&str], stdin_data: &[u8]) -> Result<(bool, Vec<u8>, Vec<u8>)> {
        if !self.available {
            return Err(MantreeError::OpenPgpUnavailable);
        }

        let mut command = Command::new(&self.tool);
        command
            .args(args)
            .env("TZ", "UTC")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(home) = &self.home {
            command.env("GNUPGHOME", home.path());
        }

        trace!(tool = %self.tool, ?args, "spawning OpenPGP tool");
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MantreeError::OpenPgpUnavailable
            } else {
                MantreeError::Io(e)
            }
        })?;

        // feed stdin from a helper thread so a full stdout pipe cannot
        // deadlock the child
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let data = stdin_data.to_vec();
        let writer = std::thread::spawn(move || {
            let _ = stdin.write_all(&data);
            drop(stdin);
        });

        let output = child.wait_with_output()?;
        let _ = writer.join();
        Ok((output.status.success(), output.stdout, output.stderr))
    }

    /// Verify a clearsigned blob and return the signature metadata
    ///
    /// The blob must contain the full envelope, from `BEGIN PGP SIGNED
    /// MESSAGE` through `END PGP SIGNATURE`.
    pub fn verify_clearsigned(&self, data: &[u8]) -> Result<SignatureData> {
        let (_, out, err) =
            self.spawn_tool(&["--batch", "--status-fd", "1", "--verify"], data)?;
        process_verify_status(&out, &err)
    }

    /// Verify a clearsigned stream, returning the embedded plaintext
    /// and the signature metadata
    ///
    /// The returned plaintext has the envelope stripped and dash
    /// escaping undone.
    pub fn verify_stream(&self, data: &[u8]) -> Result<(Vec<u8>, SignatureData)> {
        let signature = self.verify_clearsigned(data)?;
        let text = std::str::from_utf8(data).map_err(|_| {
            MantreeError::OpenPgpUnknownFailure("clearsigned data is not valid UTF-8".to_string())
        })?;
        Ok((strip_clearsign(text)?.into_bytes(), signature))
    }

    /// Verify a detached signature over a data file
    pub fn verify_detached(&self, signature: &Path, data: &Path) -> Result<SignatureData> {
        let sig = signature.to_str().ok_or_else(|| {
            MantreeError::OpenPgpUnknownFailure(format!("non-UTF-8 path: {:?}", signature))
        })?;
        let dat = data.to_str().ok_or_else(|| {
            MantreeError::OpenPgpUnknownFailure(format!("non-UTF-8 path: {:?}", data))
        })?;
        let (_, out, err) = self.spawn_tool(
            &["--batch", "--status-fd", "1", "--verify", sig, dat],
            &[],
        )?;
        process_verify_status(&out, &err)
    }

    /// Clearsign a plaintext, returning the full envelope
    ///
    /// Pass `key_id` to select a signing key; the tool's default key is
    /// used otherwise.
    pub fn clear_sign(&self, data: &[u8], key_id: Option<&str>) -> Result<Vec<u8>> {
        let mut args = vec!["--batch", "--clearsign"];
        if let Some(key) = key_id {
            args.push("--local-user");
            args.push(key);
        }
        let (ok, out, err) = self.spawn_tool(&args, data)?;
        if !ok {
            return Err(MantreeError::OpenPgpSigning(
                String::from_utf8_lossy(&err).into_owned(),
            ));
        }
        Ok(out)
    }

    /// Import key material into the keyring
    ///
    /// In the isolated flavor the imported keys are additionally marked
    /// ultimately trusted, matching the `trust-model direct` setup.
    pub fn import_key(&self, key_material: &[u8]) -> Result<()> {
        let (ok, out, err) = self.spawn_tool(
            &["--batch", "--import", "--status-fd", "1"],
            key_material,
        )?;
        if !ok {
            return Err(MantreeError::OpenPgpKeyImport(
                String::from_utf8_lossy(&err).into_owned(),
            ));
        }

        if self.home.is_some() {
            let mut ownertrust = String::new();
            for line in out.split(|&b| b == b'\n') {
                let line = String::from_utf8_lossy(line);
                if let Some(rest) = line.strip_prefix("[GNUPG:] IMPORT_OK ") {
                    if let Some(fpr) = rest.split(' ').nth(1) {
                        ownertrust.push_str(fpr);
                        ownertrust.push_str(":6:\n");
                    }
                }
            }
            let (ok, _, err) =
                self.spawn_tool(&["--batch", "--import-ownertrust"], ownertrust.as_bytes())?;
            if !ok {
                return Err(MantreeError::OpenPgpKeyImport(
                    String::from_utf8_lossy(&err).into_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Refresh keyring keys from their origin
    ///
    /// Tries Web Key Directory first (when built with the `wkd`
    /// feature), falling back to a keyserver refresh. `keyserver`
    /// overrides the tool's configured keyserver.
    pub fn refresh_keys(&self, allow_wkd: bool, keyserver: Option<&str>) -> Result<()> {
        debug!(allow_wkd, ?keyserver, "refreshing keys");
        if allow_wkd {
            match self.refresh_keys_wkd() {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(MantreeError::FeatureUnavailable(_)) if keyserver.is_some() => {}
                Err(MantreeError::FeatureUnavailable(feature)) => {
                    return Err(MantreeError::FeatureUnavailable(feature))
                }
                Err(e) => return Err(e),
            }
        }
        self.refresh_keys_keyserver(keyserver)
    }

    fn refresh_keys_keyserver(&self, keyserver: Option<&str>) -> Result<()> {
        let mut args = vec!["--batch", "--refresh-keys"];
        if let Some(ks) = keyserver {
            args.push("--keyserver");
            args.push(ks);
        }
        let (ok, _, err) = self.spawn_tool(&args, &[])?;
        if !ok {
            return Err(MantreeError::OpenPgpKeyRefresh(
                String::from_utf8_lossy(&err).into_owned(),
            ));
        }
        Ok(())
    }

    /// List keyring keys as fingerprint → mail addresses
    pub fn list_keys(&self) -> Result<Vec<(String, Vec<String>)>> {
        let (ok, out, err) =
            self.spawn_tool(&["--batch", "--with-colons", "--list-keys"], &[])?;
        if !ok {
            return Err(MantreeError::OpenPgpKeyRefresh(
                String::from_utf8_lossy(&err).into_owned(),
            ));
        }

        let mut keys: Vec<(String, Vec<String>)> = Vec::new();
        for line in String::from_utf8_lossy(&out).lines() {
            let fields: Vec<&str> = line.split(':').collect();
            match fields.first() {
                Some(&"fpr") if fields.len() > 9 => {
                    keys.push((fields[9].to_string(), Vec::new()));
                }
                Some(&"uid") if fields.len() > 9 => {
                    if let Some((_, uids)) = keys.last_mut() {
                        if let Some(addr) = extract_mail_address(fields[9]) {
                            uids.push(addr);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(keys)
    }

    /// Fetch updated keys through Web Key Directory
    ///
    /// Returns `Ok(true)` only when every keyring key was found and
    /// reimported; `Ok(false)` signals the caller to fall back to a
    /// keyserver.
    #[cfg(feature = "wkd")]
    pub fn refresh_keys_wkd(&self) -> Result<bool> {
        let keys = self.list_keys()?;
        if keys.is_empty() {
            debug!("wkd refresh: no keys in keyring");
            return Ok(false);
        }
        let mut pending = std::collections::BTreeSet::new();
        let mut addrs = std::collections::BTreeSet::new();
        for (fpr, uids) in &keys {
            if uids.is_empty() {
                debug!(fpr = %fpr, "wkd refresh: key has no mail UID");
                return Ok(false);
            }
            pending.insert(fpr.clone());
            addrs.extend(uids.iter().cloned());
        }

        let mut material = Vec::new();
        for addr in &addrs {
            let url = match wkd_url(addr) {
                Some(url) => url,
                None => return Ok(false),
            };
            debug!(url = %url, "wkd refresh: fetching");
            let response = reqwest::blocking::get(&url)
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    debug!(url = %url, error = %e, "wkd refresh: request failed");
                    MantreeError::OpenPgpKeyRefresh(e.to_string())
                });
            match response {
                Ok(resp) => match resp.bytes() {
                    Ok(bytes) => material.extend_from_slice(&bytes),
                    Err(_) => return Ok(false),
                },
                Err(_) => return Ok(false),
            }
        }

        let (ok, out, err) = self.spawn_tool(
            &["--batch", "--import", "--status-fd", "1"],
            &material,
        )?;
        if !ok {
            return Err(MantreeError::OpenPgpKeyRefresh(
                String::from_utf8_lossy(&err).into_owned(),
            ));
        }
        for line in String::from_utf8_lossy(&out).lines() {
            if let Some(rest) = line.strip_prefix("[GNUPG:] IMPORT_OK ") {
                if let Some(fpr) = rest.split(' ').nth(1) {
                    if !pending.remove(fpr) {
                        // fetched key we do not track, drop it again
                        let _ = self.spawn_tool(&["--batch", "--delete-keys", fpr], &[]);
                    }
                }
            }
        }
        Ok(pending.is_empty())
    }

    /// Web Key Directory refresh stub for builds without the `wkd`
    /// feature
    #[cfg(not(feature = "wkd"))]
    pub fn refresh_keys_wkd(&self) -> Result<bool> {
        Err(MantreeError::FeatureUnavailable(
            "Web Key Directory refresh requires the `wkd` feature",
        ))
    }
}

impl Drop for OpenPgpEnvironment {
    fn drop(&mut self) {
        if self.home.is_none() || !self.available {
            return;
        }
        // stop the agent so the home directory can be removed
        let home = self.home.as_ref().expect("checked above");
        let result = Command::new(&self.conf_tool)
            .args(["--kill", "all"])
            .env("GNUPGHOME", home.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            warn!(tool = %self.conf_tool, error = %e, "failed to stop OpenPGP agent");
        }
    }
}

fn probe_tool(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Parse a gpg status timestamp: epoch seconds or ISO 8601, "0" means
/// absent
fn parse_gpg_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value == "0" {
        None
    } else if value.contains('T') {
        NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
            .ok()
            .map(|naive| naive.and_utc())
    } else {
        value
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    }
}

fn extract_mail_address(uid: &str) -> Option<String> {
    // "Example Name <user@example.org>" or a bare address
    let candidate = match (uid.rfind('<'), uid.rfind('>')) {
        (Some(open), Some(close)) if open < close => &uid[open + 1..close],
        _ => uid,
    };
    candidate.contains('@').then(|| candidate.to_string())
}

/// Map the tool's `--status-fd` output to a verification outcome
fn process_verify_status(out: &[u8], err: &[u8]) -> Result<SignatureData> {
    let stderr = || String::from_utf8_lossy(err).into_owned();
    let mut sigs: Vec<SigRecord> = Vec::new();

    for line in String::from_utf8_lossy(out).lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let fields: Vec<&str> = rest.split(' ').collect();
        match fields[0] {
            "NEWSIG" => sigs.push(SigRecord::default()),
            "GOODSIG" => set_status(&mut sigs, SignatureStatus::Good),
            "BADSIG" => set_status(&mut sigs, SignatureStatus::Bad),
            "EXPSIG" => set_status(&mut sigs, SignatureStatus::Expired),
            "EXPKEYSIG" => set_status(&mut sigs, SignatureStatus::ExpiredKey),
            "REVKEYSIG" => set_status(&mut sigs, SignatureStatus::RevokedKey),
            "ERRSIG" => {
                // field 6 is the reason code; 9 means missing public key
                let status = if fields.get(6) == Some(&"9") {
                    SignatureStatus::NoPublicKey
                } else {
                    SignatureStatus::Error
                };
                set_status(&mut sigs, status);
            }
            "VALIDSIG" if fields.len() >= 11 => {
                if let Some(sig) = sigs.last_mut() {
                    sig.valid = true;
                    sig.fingerprint = fields[1].to_string();
                    sig.timestamp = parse_gpg_timestamp(fields[3]);
                    sig.expire_timestamp = parse_gpg_timestamp(fields[4]);
                    sig.primary_key_fingerprint = fields[10].to_string();
                }
            }
            "TRUST_MARGINAL" | "TRUST_FULL" | "TRUST_FULLY" | "TRUST_ULTIMATE" => {
                if let Some(sig) = sigs.last_mut() {
                    sig.trusted = true;
                }
            }
            _ => {}
        }
    }

    if sigs.is_empty() {
        return Err(MantreeError::OpenPgpUnknownFailure(stderr()));
    }

    // a bad signature always fails, regardless of any other good ones
    if sigs
        .iter()
        .any(|s| s.status == Some(SignatureStatus::Bad))
    {
        return Err(MantreeError::OpenPgpBadSignature(stderr()));
    }

    for sig in &sigs {
        match sig.status {
            Some(SignatureStatus::Good) => {}
            Some(SignatureStatus::Expired)
            | Some(SignatureStatus::Error) => {
                return Err(MantreeError::OpenPgpBadSignature(stderr()))
            }
            Some(SignatureStatus::NoPublicKey) => {
                return Err(MantreeError::OpenPgpUnknownKey(stderr()))
            }
            Some(SignatureStatus::ExpiredKey) => {
                return Err(MantreeError::OpenPgpExpiredKey(stderr()))
            }
            Some(SignatureStatus::RevokedKey) => {
                return Err(MantreeError::OpenPgpRevokedKey(stderr()))
            }
            Some(SignatureStatus::Bad) | None => {
                return Err(MantreeError::OpenPgpUnknownFailure(stderr()))
            }
        }
        if !sig.valid {
            return Err(MantreeError::OpenPgpUnknownFailure(stderr()));
        }
        if !sig.trusted {
            return Err(MantreeError::OpenPgpUntrustedKey(stderr()));
        }
    }

    let first = &sigs[0];
    Ok(SignatureData {
        fingerprint: first.fingerprint.clone(),
        timestamp: first.timestamp,
        expire_timestamp: first.expire_timestamp,
        primary_key_fingerprint: first.primary_key_fingerprint.clone(),
    })
}

fn set_status(sigs: &mut [SigRecord], status: SignatureStatus) {
    if let Some(sig) = sigs.last_mut() {
        if sig.status.is_none() {
            sig.status = Some(status);
        }
    }
}

/// Strip a clearsign envelope, undoing dash escaping
fn strip_clearsign(text: &str) -> Result<String> {
    let mut lines = text.lines();
    for line in lines.by_ref() {
        if line == "-----BEGIN PGP SIGNED MESSAGE-----" {
            break;
        }
    }
    // armor headers end at the first blank line
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }
    let mut payload = String::new();
    for line in lines {
        if line == "-----BEGIN PGP SIGNATURE-----" {
            return Ok(payload);
        }
        let line = line.strip_prefix("- ").unwrap_or(line);
        payload.push_str(line);
        payload.push('\n');
    }
    Err(MantreeError::OpenPgpUnknownFailure(
        "clearsigned data has no signature part".to_string(),
    ))
}

/// Derive the Web Key Directory URL for a mail address
#[cfg(feature = "wkd")]
fn wkd_url(address: &str) -> Option<String> {
    use digest::Digest;

    let (local, domain) = address.split_once('@')?;
    let digest = sha1::Sha1::digest(local.to_lowercase().as_bytes());
    let hu = zbase32(&digest);
    let escaped_local: String = local
        .bytes()
        .flat_map(|b| {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                vec![b as char]
            } else {
                format!("%{:02X}", b).chars().collect()
            }
        })
        .collect();
    Some(format!(
        "https://{}/.well-known/openpgpkey/hu/{}?l={}",
        domain.to_lowercase(),
        hu,
        escaped_local
    ))
}

/// z-base-32 encoding used by WKD local-part hashes
#[cfg(feature = "wkd")]
fn zbase32(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";
    let mut out = String::new();
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(lines: &[&str]) -> Vec<u8> {
        lines
            .iter()
            .map(|l| format!("[GNUPG:] {}\n", l))
            .collect::<String>()
            .into_bytes()
    }

    const VALIDSIG: &str = "VALIDSIG 0123456789ABCDEF0123456789ABCDEF01234567 2024-01-01 \
                            1704067200 0 4 0 1 8 00 FEDCBA9876543210FEDCBA9876543210FEDCBA98";

    #[test]
    fn test_good_trusted_signature() {
        let out = status(&["NEWSIG", "GOODSIG DEADBEEF someone", VALIDSIG, "TRUST_ULTIMATE 0 pgp"]);
        let sig = process_verify_status(&out, b"").unwrap();
        assert_eq!(
            sig.fingerprint,
            "0123456789ABCDEF0123456789ABCDEF01234567"
        );
        assert_eq!(
            sig.primary_key_fingerprint,
            "FEDCBA9876543210FEDCBA9876543210FEDCBA98"
        );
        assert_eq!(
            sig.timestamp,
            DateTime::<Utc>::from_timestamp(1_704_067_200, 0)
        );
        assert_eq!(sig.expire_timestamp, None);
    }

    #[test]
    fn test_bad_signature() {
        let out = status(&["NEWSIG", "BADSIG DEADBEEF someone"]);
        assert!(matches!(
            process_verify_status(&out, b"boom"),
            Err(MantreeError::OpenPgpBadSignature(_))
        ));
    }

    #[test]
    fn test_expired_key() {
        let out = status(&["NEWSIG", "EXPKEYSIG DEADBEEF someone", VALIDSIG]);
        assert!(matches!(
            process_verify_status(&out, b""),
            Err(MantreeError::OpenPgpExpiredKey(_))
        ));
    }

    #[test]
    fn test_revoked_key() {
        let out = status(&["NEWSIG", "REVKEYSIG DEADBEEF someone", VALIDSIG]);
        assert!(matches!(
            process_verify_status(&out, b""),
            Err(MantreeError::OpenPgpRevokedKey(_))
        ));
    }

    #[test]
    fn test_missing_public_key() {
        let out = status(&["NEWSIG", "ERRSIG DEADBEEF 1 8 00 1704067200 9 -"]);
        assert!(matches!(
            process_verify_status(&out, b""),
            Err(MantreeError::OpenPgpUnknownKey(_))
        ));
    }

    #[test]
    fn test_untrusted_signature() {
        let out = status(&["NEWSIG", "GOODSIG DEADBEEF someone", VALIDSIG, "TRUST_UNDEFINED 0 pgp"]);
        assert!(matches!(
            process_verify_status(&out, b""),
            Err(MantreeError::OpenPgpUntrustedKey(_))
        ));
    }

    #[test]
    fn test_no_signature_at_all() {
        assert!(matches!(
            process_verify_status(b"", b"gpg: no valid OpenPGP data found"),
            Err(MantreeError::OpenPgpUnknownFailure(_))
        ));
    }

    #[test]
    fn test_bad_overrides_good() {
        let out = status(&[
            "NEWSIG",
            "GOODSIG AAAA one",
            VALIDSIG,
            "TRUST_ULTIMATE 0 pgp",
            "NEWSIG",
            "BADSIG BBBB two",
        ]);
        assert!(matches!(
            process_verify_status(&out, b""),
            Err(MantreeError::OpenPgpBadSignature(_))
        ));
    }

    #[test]
    fn test_parse_gpg_timestamp() {
        assert_eq!(parse_gpg_timestamp("0"), None);
        assert_eq!(
            parse_gpg_timestamp("1704067200"),
            DateTime::<Utc>::from_timestamp(1_704_067_200, 0)
        );
        let iso = parse_gpg_timestamp("20240101T000000").unwrap();
        assert_eq!(iso, DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap());
    }

    #[test]
    fn test_strip_clearsign() {
        let text = "-----BEGIN PGP SIGNED MESSAGE-----\n\
                    Hash: SHA256\n\
                    \n\
                    DATA a 1 SHA256 00\n\
                    - DATA dashed 1 SHA256 00\n\
                    -----BEGIN PGP SIGNATURE-----\n\
                    \n\
                    sig\n\
                    -----END PGP SIGNATURE-----\n";
        let payload = strip_clearsign(text).unwrap();
        assert_eq!(payload, "DATA a 1 SHA256 00\nDATA dashed 1 SHA256 00\n");
    }

    #[test]
    fn test_unavailable_tool() {
        std::env::set_var(TOOL_ENV, "/nonexistent/not-a-gpg");
        let env = OpenPgpEnvironment::system();
        std::env::remove_var(TOOL_ENV);
        assert!(!env.is_available());
        assert!(matches!(
            env.verify_clearsigned(b""),
            Err(MantreeError::OpenPgpUnavailable)
        ));
    }

    #[test]
    fn test_extract_mail_address() {
        assert_eq!(
            extract_mail_address("Example <user@example.org>"),
            Some("user@example.org".to_string())
        );
        assert_eq!(
            extract_mail_address("user@example.org"),
            Some("user@example.org".to_string())
        );
        assert_eq!(extract_mail_address("no mail here"), None);
    }

    #[cfg(feature = "wkd")]
    #[test]
    fn test_wkd_url() {
        // reference value from the GnuPG documentation
        let url = wkd_url("Joe.Doe@Example.ORG").unwrap();
        assert_eq!(
            url,
            "https://example.org/.well-known/openpgpkey/hu/iy9q119eutrkn8s1mk4r39qejnbu3n5q?l=Joe.Doe"
        );
    }
}
