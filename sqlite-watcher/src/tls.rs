use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio_native_tls::TlsAcceptor;

/// PEM certificate chain and PKCS#8 private key on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Where generated certificates live: `<config dir>/sqlite-relay/tls`.
pub fn default_tls_dir() -> Result<PathBuf> {
    let config = dirs::config_dir().ok_or_else(|| anyhow!("unable to determine config directory"))?;
    Ok(config.join("sqlite-relay").join("tls"))
}

/// Write a fresh self-signed certificate for localhost into `dir`.
pub fn generate_self_signed(dir: &Path) -> Result<TlsFiles> {
    fs::create_dir_all(dir)
        .with_context(|| format!("unable to create tls directory {}", dir.display()))?;
    #[cfg(unix)]
    set_owner_perms(dir, 0o700)?;

    let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let generated =
        rcgen::generate_simple_self_signed(names).context("failed to generate certificate")?;

    let files = TlsFiles {
        cert: dir.join("cert.pem"),
        key: dir.join("key.pem"),
    };
    fs::write(&files.cert, generated.cert.pem())
        .with_context(|| format!("failed to write {}", files.cert.display()))?;
    fs::write(&files.key, generated.key_pair.serialize_pem())
        .with_context(|| format!("failed to write {}", files.key.display()))?;
    #[cfg(unix)]
    set_owner_perms(&files.key, 0o600)?;

    Ok(files)
}

/// Build a TLS acceptor from the PEM files.
pub fn load_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let cert = fs::read(&files.cert)
        .with_context(|| format!("failed to read certificate {}", files.cert.display()))?;
    let key = fs::read(&files.key)
        .with_context(|| format!("failed to read private key {}", files.key.display()))?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .context("certificate and key do not form a usable identity")?;
    let acceptor = native_tls::TlsAcceptor::new(identity).context("failed to build tls acceptor")?;
    Ok(TlsAcceptor::from(acceptor))
}

#[cfg(unix)]
fn set_owner_perms(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}
