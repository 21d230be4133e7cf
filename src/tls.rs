//! In-memory TLS secret store and certificate verification
//!
//! TLS material for the HAProxy sidecar arrives as labelled Kubernetes
//! Secrets (`tls.crt` / `tls.key` / `ca.crt`). The store keeps the bytes in
//! memory, mirrors them to disk as a combined bundle plus a CA file when the
//! configurator rebuilds, and tears the files down again when a secret is
//! deleted. Certificates are verified against their own CA and the target
//! hostname before HAProxy is ever pointed at them.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::Secret;
use tracing::{info, warn};
use x509_parser::prelude::{GeneralName, X509Certificate};

use crate::haproxy::PendingSignal;

/// Secret keys holding the certificate material
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";
const TLS_CA_KEY: &str = "ca.crt";

/// TLS handling errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// PEM or DER data could not be parsed
    #[error("failed to parse {what}: {reason}")]
    Parse {
        /// Which artifact failed
        what: &'static str,
        /// Parser detail
        reason: String,
    },

    /// Certificate failed verification
    #[error("failed to verify certificate: {0}")]
    Verification(String),

    /// Certificate files could not be written or removed
    #[error("certificate file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate material for one secret, plus its on-disk locations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsEntry {
    /// Server certificate PEM bytes
    pub cert: Vec<u8>,
    /// Private key PEM bytes
    pub key: Vec<u8>,
    /// CA certificate PEM bytes
    pub ca: Vec<u8>,
    /// Path of the cert+key bundle file
    pub bundle_path: PathBuf,
    /// Path of the CA file
    pub ca_path: PathBuf,
}

impl TlsEntry {
    /// Write the bundle and CA files, mode 0600.
    ///
    /// The bundle is the certificate followed by the key; a newline is
    /// inserted between them when the certificate does not end with one.
    pub fn write(&self) -> Result<(), TlsError> {
        let mut bundle = open_private(&self.bundle_path)?;
        bundle.write_all(&self.cert)?;
        if !self.cert.ends_with(b"\n") {
            bundle.write_all(b"\n")?;
        }
        bundle.write_all(&self.key)?;

        let mut ca = open_private(&self.ca_path)?;
        ca.write_all(&self.ca)?;
        Ok(())
    }

    /// Remove both files; missing files are not an error
    fn remove_files(&self, secret_name: &str) {
        for path in [&self.bundle_path, &self.ca_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(secret = %secret_name, path = %path.display(), error = %e,
                        "Failed to delete certificate file");
                }
            }
        }
    }
}

/// Open a file for writing with owner-only permissions
fn open_private(path: &Path) -> Result<std::fs::File, TlsError> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(path)?)
}

/// TLS secrets keyed by secret name
pub struct TlsStore {
    certs_dir: PathBuf,
    entries: Mutex<HashMap<String, TlsEntry>>,
    pending: PendingSignal,
}

impl TlsStore {
    /// Create the store, ensuring the certs directory exists
    pub fn new(certs_dir: PathBuf, pending: PendingSignal) -> Result<Self, TlsError> {
        std::fs::create_dir_all(&certs_dir)?;
        Ok(Self {
            certs_dir,
            entries: Mutex::new(HashMap::new()),
            pending,
        })
    }

    /// Load or update an entry from a Secret. Signals the configurator only
    /// when the material actually changed.
    pub fn load(&self, secret: &Secret) -> bool {
        let Some(name) = secret.metadata.name.as_deref() else {
            warn!("Ignoring TLS secret without a name");
            return false;
        };

        let entry = self.entry_from_secret(name, secret);
        let mut entries = self.entries.lock().unwrap();
        if entries.get(name) == Some(&entry) {
            return false;
        }
        entries.insert(name.to_string(), entry);
        drop(entries);

        info!(secret = %name, "Loaded HAProxy certificate");
        self.pending.signal();
        true
    }

    /// Remove an entry and its files after the Secret was deleted
    pub fn delete(&self, secret: &Secret) {
        let Some(name) = secret.metadata.name.as_deref() else {
            return;
        };

        let removed = self.entries.lock().unwrap().remove(name);
        if let Some(entry) = removed {
            // The map entry is what keeps a target alive; files are cleaned
            // up best-effort since the next rebuild no longer references
            // them.
            entry.remove_files(name);
            info!(secret = %name, "Removed TLS config");
            self.pending.signal();
        }
    }

    /// Lock the entry map. The configurator takes this lock *after* the
    /// TCP-target lock; nothing else may nest them.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, TlsEntry>> {
        self.entries.lock().unwrap()
    }

    fn entry_from_secret(&self, name: &str, secret: &Secret) -> TlsEntry {
        let get = |key: &str| -> Vec<u8> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|bytes| bytes.0.clone())
                .unwrap_or_default()
        };
        TlsEntry {
            cert: get(TLS_CERT_KEY),
            key: get(TLS_KEY_KEY),
            ca: get(TLS_CA_KEY),
            bundle_path: self.certs_dir.join(format!("{}-bundle.pem", name)),
            ca_path: self.certs_dir.join(format!("{}-ca.pem", name)),
        }
    }
}

/// Verify a server certificate against its CA and the hostname it will
/// serve.
///
/// Checks, in order: both PEMs parse, the leaf is signed by the CA, the
/// validity window covers now, any extended-key-usage extension includes
/// serverAuth, and the hostname is covered by a SAN DNS name (wildcards
/// match one label) or, absent SANs, the subject CN.
pub fn verify_server_cert(
    cert_pem: &[u8],
    ca_pem: &[u8],
    hostname: &str,
) -> Result<(), TlsError> {
    let (_, ca_doc) = x509_parser::pem::parse_x509_pem(ca_pem).map_err(|e| TlsError::Parse {
        what: "CA certificate",
        reason: e.to_string(),
    })?;
    let ca = ca_doc.parse_x509().map_err(|e| TlsError::Parse {
        what: "CA certificate",
        reason: e.to_string(),
    })?;

    let (_, cert_doc) =
        x509_parser::pem::parse_x509_pem(cert_pem).map_err(|e| TlsError::Parse {
            what: "server certificate",
            reason: e.to_string(),
        })?;
    let cert = cert_doc.parse_x509().map_err(|e| TlsError::Parse {
        what: "server certificate",
        reason: e.to_string(),
    })?;

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|_| TlsError::Verification("not signed by the configured CA".to_string()))?;

    if !cert.validity().is_valid() {
        return Err(TlsError::Verification(
            "certificate is outside its validity window".to_string(),
        ));
    }

    if let Ok(Some(eku)) = cert.extended_key_usage() {
        if !eku.value.server_auth && !eku.value.any {
            return Err(TlsError::Verification(
                "certificate is not valid for server authentication".to_string(),
            ));
        }
    }

    if !cert_covers_hostname(&cert, hostname) {
        return Err(TlsError::Verification(format!(
            "certificate is not valid for {}",
            hostname
        )));
    }

    Ok(())
}

/// Whether the certificate's DNS names (or CN, when no SANs exist) cover the
/// hostname
fn cert_covers_hostname(cert: &X509Certificate<'_>, hostname: &str) -> bool {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        return san.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(pattern) => dns_name_matches(pattern, hostname),
            _ => false,
        });
    }
    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| dns_name_matches(cn, hostname))
}

/// Case-insensitive DNS name match; `*.` wildcards cover exactly one label
fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let hostname = hostname.to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return hostname
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix);
    }
    pattern == hostname
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
        ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    };
    use tokio::sync::mpsc;

    struct TestCa {
        key: KeyPair,
        cert_pem: String,
    }

    fn test_ca(common_name: &str) -> TestCa {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate().unwrap();
        let cert_pem = params.self_signed(&key).unwrap().pem();
        TestCa { key, cert_pem }
    }

    fn server_cert(ca: &TestCa, hostname: &str) -> String {
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca.key).unwrap();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![hostname.to_string()]).unwrap();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.signed_by(&key, &issuer).unwrap().pem()
    }

    fn store_with_signal() -> (TlsStore, mpsc::Receiver<()>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (pending, rx) = PendingSignal::channel();
        let store = TlsStore::new(dir.path().join("certs"), pending).unwrap();
        (store, rx, dir)
    }

    fn secret(name: &str, cert: &[u8], key: &[u8], ca: &[u8]) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_string());
        secret.data = Some(
            [
                ("tls.crt".to_string(), ByteString(cert.to_vec())),
                ("tls.key".to_string(), ByteString(key.to_vec())),
                ("ca.crt".to_string(), ByteString(ca.to_vec())),
            ]
            .into_iter()
            .collect(),
        );
        secret
    }

    #[test]
    fn valid_certificate_verifies_for_its_hostname() {
        let ca = test_ca("Saturn Test CA");
        let cert = server_cert(&ca, "s.ex");

        verify_server_cert(cert.as_bytes(), ca.cert_pem.as_bytes(), "s.ex").unwrap();
    }

    #[test]
    fn certificate_fails_for_another_hostname() {
        let ca = test_ca("Saturn Test CA");
        let cert = server_cert(&ca, "s.ex");

        let err = verify_server_cert(cert.as_bytes(), ca.cert_pem.as_bytes(), "other.ex")
            .unwrap_err();
        assert!(matches!(err, TlsError::Verification(_)));
    }

    #[test]
    fn certificate_fails_against_a_different_ca() {
        let ca = test_ca("Saturn Test CA");
        let other_ca = test_ca("Imposter CA");
        let cert = server_cert(&ca, "s.ex");

        let err = verify_server_cert(cert.as_bytes(), other_ca.cert_pem.as_bytes(), "s.ex")
            .unwrap_err();
        assert!(matches!(err, TlsError::Verification(_)));
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        let ca = test_ca("Saturn Test CA");
        let err =
            verify_server_cert(b"not a pem", ca.cert_pem.as_bytes(), "s.ex").unwrap_err();
        assert!(matches!(err, TlsError::Parse { .. }));
    }

    #[test]
    fn wildcards_cover_exactly_one_label() {
        assert!(dns_name_matches("*.ex.com", "app.ex.com"));
        assert!(dns_name_matches("S.EX", "s.ex"));
        assert!(!dns_name_matches("*.ex.com", "a.b.ex.com"));
        assert!(!dns_name_matches("*.ex.com", "ex.com"));
    }

    #[test]
    fn bundle_is_cert_newline_key_with_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let entry = TlsEntry {
            cert: b"CERT-NO-NEWLINE".to_vec(),
            key: b"KEY\n".to_vec(),
            ca: b"CA\n".to_vec(),
            bundle_path: dir.path().join("x-bundle.pem"),
            ca_path: dir.path().join("x-ca.pem"),
        };
        entry.write().unwrap();

        let bundle = std::fs::read(&entry.bundle_path).unwrap();
        assert_eq!(bundle, b"CERT-NO-NEWLINE\nKEY\n");
        assert_eq!(std::fs::read(&entry.ca_path).unwrap(), b"CA\n");

        let mode = std::fs::metadata(&entry.bundle_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn newline_terminated_cert_is_not_doubled() {
        let dir = tempfile::tempdir().unwrap();
        let entry = TlsEntry {
            cert: b"CERT\n".to_vec(),
            key: b"KEY\n".to_vec(),
            ca: Vec::new(),
            bundle_path: dir.path().join("y-bundle.pem"),
            ca_path: dir.path().join("y-ca.pem"),
        };
        entry.write().unwrap();
        assert_eq!(std::fs::read(&entry.bundle_path).unwrap(), b"CERT\nKEY\n");
    }

    #[test]
    fn unchanged_secret_neither_logs_nor_signals() {
        let (store, mut rx, _dir) = store_with_signal();
        let secret = secret("sch-tls", b"cert", b"key", b"ca");

        assert!(store.load(&secret));
        assert!(rx.try_recv().is_ok());

        // Resync re-delivers the identical payload.
        assert!(!store.load(&secret));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn changed_material_signals_again() {
        let (store, mut rx, _dir) = store_with_signal();
        store.load(&secret("sch-tls", b"cert", b"key", b"ca"));
        rx.try_recv().unwrap();

        assert!(store.load(&secret("sch-tls", b"cert-2", b"key", b"ca")));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn delete_removes_entry_and_files() {
        let (store, mut rx, _dir) = store_with_signal();
        let secret = secret("sch-tls", b"cert", b"key", b"ca");
        store.load(&secret);
        rx.try_recv().unwrap();

        // Materialize the files, then delete the secret.
        let (bundle_path, ca_path) = {
            let entries = store.lock();
            let entry = entries.get("sch-tls").unwrap();
            entry.write().unwrap();
            (entry.bundle_path.clone(), entry.ca_path.clone())
        };
        assert!(bundle_path.exists());

        store.delete(&secret);
        assert!(!bundle_path.exists());
        assert!(!ca_path.exists());
        assert!(store.lock().get("sch-tls").is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn deleting_an_unknown_secret_is_a_no_op() {
        let (store, mut rx, _dir) = store_with_signal();
        let secret = secret("never-loaded", b"c", b"k", b"a");
        store.delete(&secret);
        assert!(rx.try_recv().is_err());
    }
}
