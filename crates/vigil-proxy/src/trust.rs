//! OS trust-store integration for the root CA certificate.
//!
//! Installing the root into the platform trust store lets clients accept
//! intercepted TLS sessions without per-application configuration. All
//! operations here shell out to the platform certificate tooling; they are
//! best-effort and revoke is idempotent (absence is not an error).

use std::path::Path;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use std::process::Command;

use crate::error::TrustStoreError;

/// Capability to install, revoke, and query a root certificate in the
/// platform trust store.
pub trait TrustStore: Send + Sync {
    /// Installs the certificate at `cert_path` as a trusted root.
    fn install(&self, cert_path: &Path) -> Result<(), TrustStoreError>;

    /// Removes every trusted root whose common name matches, including
    /// leftovers from earlier runs of this program.
    fn revoke(&self, common_name: &str) -> Result<(), TrustStoreError>;

    /// Whether a root with this common name is currently trusted.
    fn is_installed(&self, common_name: &str) -> bool;
}

/// Trust store that does nothing. Used in tests and in deployments where
/// trust is provisioned out of band.
pub struct NullTrustStore;

impl TrustStore for NullTrustStore {
    fn install(&self, _cert_path: &Path) -> Result<(), TrustStoreError> {
        Ok(())
    }

    fn revoke(&self, _common_name: &str) -> Result<(), TrustStoreError> {
        Ok(())
    }

    fn is_installed(&self, _common_name: &str) -> bool {
        false
    }
}

/// Returns the trust store for the running platform.
pub fn native_trust_store() -> Box<dyn TrustStore> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsTrustStore)
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(MacTrustStore)
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxTrustStore)
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Box::new(UnsupportedTrustStore)
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
struct UnsupportedTrustStore;

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
impl TrustStore for UnsupportedTrustStore {
    fn install(&self, _cert_path: &Path) -> Result<(), TrustStoreError> {
        Err(TrustStoreError::Unsupported)
    }

    fn revoke(&self, _common_name: &str) -> Result<(), TrustStoreError> {
        Err(TrustStoreError::Unsupported)
    }

    fn is_installed(&self, _common_name: &str) -> bool {
        false
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Windows trust store backed by `certutil` against the current-user Root
/// store.
#[cfg(target_os = "windows")]
pub struct WindowsTrustStore;

#[cfg(target_os = "windows")]
impl TrustStore for WindowsTrustStore {
    fn install(&self, cert_path: &Path) -> Result<(), TrustStoreError> {
        let cert_path = cert_path.to_string_lossy();
        let output = Command::new("certutil")
            .args(["-addstore", "-user", "Root", &cert_path])
            .output()
            .map_err(|e| TrustStoreError::ToolUnavailable(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TrustStoreError::InstallFailed(stderr.trim().to_string()))
        }
    }

    fn revoke(&self, common_name: &str) -> Result<(), TrustStoreError> {
        // certutil exits nonzero when the name is absent; absence is fine.
        Command::new("certutil")
            .args(["-delstore", "-user", "Root", common_name])
            .output()
            .map_err(|e| TrustStoreError::ToolUnavailable(e.to_string()))?;
        Ok(())
    }

    fn is_installed(&self, common_name: &str) -> bool {
        Command::new("certutil")
            .args(["-store", "-user", "Root"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(common_name))
            .unwrap_or(false)
    }
}

// ============================================================================
// macOS
// ============================================================================

/// macOS trust store backed by `security` against the login keychain.
#[cfg(target_os = "macos")]
pub struct MacTrustStore;

#[cfg(target_os = "macos")]
impl MacTrustStore {
    fn login_keychain() -> String {
        format!(
            "{}/Library/Keychains/login.keychain-db",
            std::env::var("HOME").unwrap_or_default()
        )
    }
}

#[cfg(target_os = "macos")]
impl TrustStore for MacTrustStore {
    fn install(&self, cert_path: &Path) -> Result<(), TrustStoreError> {
        let cert_path = cert_path.to_string_lossy();
        let output = Command::new("security")
            .args([
                "add-trusted-cert",
                "-r",
                "trustRoot",
                "-k",
                &Self::login_keychain(),
                &cert_path,
            ])
            .output()
            .map_err(|e| TrustStoreError::ToolUnavailable(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TrustStoreError::InstallFailed(stderr.trim().to_string()))
        }
    }

    fn revoke(&self, common_name: &str) -> Result<(), TrustStoreError> {
        // -t also removes the trust setting; repeat until the name is gone
        // so stale roots from previous runs are cleared as well.
        for _ in 0..16 {
            let output = Command::new("security")
                .args(["delete-certificate", "-c", common_name, "-t"])
                .output()
                .map_err(|e| TrustStoreError::ToolUnavailable(e.to_string()))?;
            if !output.status.success() {
                break;
            }
        }
        Ok(())
    }

    fn is_installed(&self, common_name: &str) -> bool {
        Command::new("security")
            .args(["find-certificate", "-c", common_name])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

// ============================================================================
// Linux
// ============================================================================

/// Linux trust store writing into the distro CA anchor directory and
/// refreshing the bundle with the matching update tool.
#[cfg(target_os = "linux")]
pub struct LinuxTrustStore;

#[cfg(target_os = "linux")]
impl LinuxTrustStore {
    // (anchor dir, update command) per distro family.
    const ANCHORS: &'static [(&'static str, &'static [&'static str])] = &[
        ("/usr/local/share/ca-certificates", &["update-ca-certificates"]),
        ("/etc/pki/ca-trust/source/anchors", &["update-ca-trust", "extract"]),
        ("/etc/ca-certificates/trust-source/anchors", &["trust", "extract-compat"]),
    ];

    fn anchor_name(common_name: &str) -> String {
        let slug: String = common_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        format!("{slug}.crt")
    }

    fn run_update(update: &[&str]) -> Result<(), TrustStoreError> {
        let output = Command::new(update[0])
            .args(&update[1..])
            .output()
            .map_err(|e| TrustStoreError::ToolUnavailable(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TrustStoreError::InstallFailed(stderr.trim().to_string()))
        }
    }
}

#[cfg(target_os = "linux")]
impl TrustStore for LinuxTrustStore {
    fn install(&self, cert_path: &Path) -> Result<(), TrustStoreError> {
        let common_name = cert_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        for (anchors, update) in Self::ANCHORS {
            if !Path::new(anchors).exists() {
                continue;
            }
            let dest = Path::new(anchors).join(Self::anchor_name(&common_name));
            std::fs::copy(cert_path, &dest)
                .map_err(|e| TrustStoreError::InstallFailed(e.to_string()))?;
            return Self::run_update(update);
        }
        Err(TrustStoreError::InstallFailed(
            "no CA anchor directory found".to_string(),
        ))
    }

    fn revoke(&self, common_name: &str) -> Result<(), TrustStoreError> {
        let name = Self::anchor_name(common_name);
        for (anchors, update) in Self::ANCHORS {
            let anchor = Path::new(anchors).join(&name);
            if anchor.exists() && std::fs::remove_file(&anchor).is_ok() {
                Self::run_update(update)?;
            }
        }
        Ok(())
    }

    fn is_installed(&self, common_name: &str) -> bool {
        let name = Self::anchor_name(common_name);
        Self::ANCHORS
            .iter()
            .any(|(anchors, _)| Path::new(anchors).join(&name).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_store_accepts_everything() {
        let store = NullTrustStore;
        assert!(store.install(Path::new("/nonexistent.pem")).is_ok());
        assert!(store.revoke("Vigil Root CA").is_ok());
        assert!(!store.is_installed("Vigil Root CA"));
    }

    #[test]
    fn native_store_is_constructible() {
        // Just exercises platform dispatch; no OS state is touched.
        let _ = native_trust_store();
    }
}
