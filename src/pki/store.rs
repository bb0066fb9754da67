//! File-backed registry of certificate authorities and issued pairs.
//!
//! # Layout
//!
//! One directory holds every file.  A store is scoped by its *active*
//! authority, and each name it manages maps to
//!
//! ```text
//! <dir>/<authority>-<name>.crt
//! <dir>/<authority>-<name>.key
//! ```
//!
//! The authority's own material uses the reserved pair name `ca`, so the
//! `apiserver` CA lives in `apiserver-ca.crt` / `apiserver-ca.key`.  Several
//! stores can share one directory without their names colliding.
//!
//! # Lifecycle
//!
//! A store is populated during startup ([`CertStore::init_ca`],
//! [`CertStore::load_ca`], issuance, [`CertStore::write`]) and is read-only
//! afterwards.  Every mutating operation takes `&mut self`, so issuing while
//! another component reads the store requires exclusive access.
//!
//! Files are written to a temp file and renamed into place, key before
//! certificate, so a CA certificate on disk always has its key.  Names are
//! plain file names; anything with a path separator or `..` is refused.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::authority::{AltNames, CertificateAuthority, IssuedPair, KeyRole};
use crate::config::PkiConfig;
use crate::{Error, Result};

/// Reserved pair name for CA material.
pub const CA_PAIR_NAME: &str = "ca";

const CERT_EXT: &str = "crt";
const KEY_EXT: &str = "key";

/// Certificate and key paths of one persisted pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairPaths {
    /// PEM certificate path.
    pub cert: PathBuf,
    /// PEM private key path.
    pub key: PathBuf,
}

/// Named, file-backed registry of CAs and issued certificate/key pairs.
#[derive(Debug)]
pub struct CertStore {
    dir: PathBuf,
    pki: PkiConfig,
    authorities: HashMap<String, CertificateAuthority>,
    active: Option<String>,
    persisted: HashMap<String, PairPaths>,
}

impl CertStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, pki: PkiConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::Config(format!("Cannot create cert dir '{}': {e}", dir.display()))
        })?;

        Ok(Self {
            dir,
            pki,
            authorities: HashMap::new(),
            active: None,
            persisted: HashMap::new(),
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authorities
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the CA `name`, or load it if its files already exist.
    ///
    /// Loading instead of regenerating is what keeps every leaf previously
    /// issued by `name` valid across restarts.  The authority becomes active.
    ///
    /// # Errors
    ///
    /// Returns an error if existing material cannot be read or parsed, or if
    /// generation or persistence fails.
    pub fn init_ca(&mut self, name: &str) -> Result<&CertificateAuthority> {
        validate_name(name)?;
        let paths = self.paths_for(name, CA_PAIR_NAME);

        let authority = if paths.cert.exists() {
            if !paths.key.exists() {
                return Err(Error::Pki(format!(
                    "CA '{name}' has a certificate at '{}' but no key at '{}'",
                    paths.cert.display(),
                    paths.key.display()
                )));
            }
            let authority = read_authority(name, &paths, true)?;
            info!(ca = %name, path = %paths.cert.display(), "Loaded existing CA");
            authority
        } else {
            let authority = CertificateAuthority::generate(name, self.pki.ca_validity_days)?;
            let key_pem = authority.key_pem().unwrap_or_default();
            write_pem_pair(&paths, authority.cert_pem(), key_pem)?;
            info!(ca = %name, path = %paths.cert.display(), "Created CA");
            authority
        };

        Ok(self.activate(authority, paths))
    }

    /// Load the existing CA `name` from disk.
    ///
    /// The key is loaded when present; a CA whose key file is absent is
    /// loaded verify-only.  The authority becomes active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the CA certificate does not exist.
    pub fn load_ca(&mut self, name: &str) -> Result<&CertificateAuthority> {
        validate_name(name)?;
        let paths = self.paths_for(name, CA_PAIR_NAME);
        if !paths.cert.exists() {
            return Err(Error::NotFound(format!(
                "CA '{name}' ({})",
                paths.cert.display()
            )));
        }

        let with_key = paths.key.exists();
        let authority = read_authority(name, &paths, with_key)?;
        debug!(ca = %name, can_sign = with_key, "Loaded CA");

        Ok(self.activate(authority, paths))
    }

    /// The active authority, if any.
    #[must_use]
    pub fn active(&self) -> Option<&CertificateAuthority> {
        self.active.as_ref().and_then(|n| self.authorities.get(n))
    }

    /// A loaded authority by name.
    #[must_use]
    pub fn authority(&self, name: &str) -> Option<&CertificateAuthority> {
        self.authorities.get(name)
    }

    /// PEM bytes of the active CA certificate, for a peer's trust pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveAuthority`] before `init_ca` / `load_ca`.
    pub fn ca_cert_bytes(&self) -> Result<Vec<u8>> {
        self.active()
            .map(|ca| ca.cert_pem().as_bytes().to_vec())
            .ok_or(Error::NoActiveAuthority)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Issuance
    // ─────────────────────────────────────────────────────────────────────────

    /// Issue a `serverAuth` leaf from the active CA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveAuthority`] before `init_ca` / `load_ca`, or
    /// any issuance error from [`CertificateAuthority::issue`].
    pub fn new_server_cert_pair(&self, alt_names: &AltNames) -> Result<IssuedPair> {
        self.issue(KeyRole::Server, alt_names)
    }

    /// Issue a `clientAuth` leaf from the active CA.
    ///
    /// # Errors
    ///
    /// See [`CertStore::new_server_cert_pair`].
    pub fn new_client_cert_pair(&self, alt_names: &AltNames) -> Result<IssuedPair> {
        self.issue(KeyRole::Client, alt_names)
    }

    fn issue(&self, role: KeyRole, alt_names: &AltNames) -> Result<IssuedPair> {
        let ca = self.active().ok_or(Error::NoActiveAuthority)?;
        ca.issue(role, alt_names, self.pki.leaf_validity_days)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a PEM certificate and key under `name`.
    ///
    /// Overwrites any existing pair of the same name in the active scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedName`] for `ca`, [`Error::Config`] for a name
    /// that is not a plain file name, and an I/O error if either file cannot
    /// be written.
    pub fn write(&mut self, name: &str, cert_pem: &str, key_pem: &str) -> Result<PairPaths> {
        validate_name(name)?;
        if name == CA_PAIR_NAME {
            return Err(Error::ReservedName(name.to_owned()));
        }

        let paths = PairPaths {
            cert: self.cert_file(name),
            key: self.key_file(name),
        };
        if paths.cert.exists() || paths.key.exists() {
            warn!(name = %name, path = %paths.cert.display(), "Overwriting existing certificate pair");
        }

        write_pem_pair(&paths, cert_pem, key_pem)?;
        info!(name = %name, cert = %paths.cert.display(), "Wrote certificate pair");

        self.persisted.insert(name.to_owned(), paths.clone());
        Ok(paths)
    }

    /// Persist an [`IssuedPair`] under `name`.
    ///
    /// # Errors
    ///
    /// See [`CertStore::write`].
    pub fn write_pair(&mut self, name: &str, pair: &IssuedPair) -> Result<PairPaths> {
        self.write(name, &pair.cert_pem, &pair.key_pem)
    }

    /// Certificate path for `name` in the active scope.
    ///
    /// Deterministic; the pair need not exist or be loaded.
    #[must_use]
    pub fn cert_file(&self, name: &str) -> PathBuf {
        self.path(name, CERT_EXT)
    }

    /// Key path for `name` in the active scope.
    #[must_use]
    pub fn key_file(&self, name: &str) -> PathBuf {
        self.path(name, KEY_EXT)
    }

    /// Names written through this store instance, with their paths.
    #[must_use]
    pub fn persisted(&self) -> &HashMap<String, PairPaths> {
        &self.persisted
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn activate(&mut self, authority: CertificateAuthority, paths: PairPaths) -> &CertificateAuthority {
        let name = authority.name().to_owned();
        self.persisted.insert(format!("{name}/{CA_PAIR_NAME}"), paths);
        self.active = Some(name.clone());
        self.authorities.entry(name).insert_entry(authority).into_mut()
    }

    fn path(&self, name: &str, ext: &str) -> PathBuf {
        match &self.active {
            Some(scope) => self.dir.join(format!("{scope}-{name}.{ext}")),
            None => self.dir.join(format!("{name}.{ext}")),
        }
    }

    fn paths_for(&self, scope: &str, name: &str) -> PairPaths {
        PairPaths {
            cert: self.dir.join(format!("{scope}-{name}.{CERT_EXT}")),
            key: self.dir.join(format!("{scope}-{name}.{KEY_EXT}")),
        }
    }
}

fn read_authority(name: &str, paths: &PairPaths, with_key: bool) -> Result<CertificateAuthority> {
    let cert_pem = fs::read_to_string(&paths.cert)?;
    let key_pem = if with_key {
        Some(fs::read_to_string(&paths.key)?)
    } else {
        None
    };
    CertificateAuthority::from_pem(name, &cert_pem, key_pem.as_deref())
}

/// Names become part of a file name inside the store directory.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(Error::Config(format!(
            "Invalid certificate name '{name}': must be a plain file name"
        )));
    }
    Ok(())
}

/// Key first: a certificate on disk always has its key next to it.
fn write_pem_pair(paths: &PairPaths, cert_pem: &str, key_pem: &str) -> Result<()> {
    write_replacing(&paths.key, key_pem.as_bytes(), true)?;
    if let Err(e) = write_replacing(&paths.cert, cert_pem.as_bytes(), false) {
        let _ = fs::remove_file(&paths.key);
        return Err(e.into());
    }
    Ok(())
}

/// Write `contents` to a sibling temp file and rename it over `path`.
///
/// Private files are created owner read/write only.
fn write_replacing(path: &Path, contents: &[u8], private: bool) -> io::Result<()> {
    let mut tmp: OsString = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    match fs::remove_file(&tmp) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let result = create_file(&tmp, private)
        .and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(unix)]
fn create_file(path: &Path, private: bool) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    if private {
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(not(unix))]
fn create_file(path: &Path, _private: bool) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
