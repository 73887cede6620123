//! Home-directory layout and persisted settings domains.
//!
//! `$GOSUHOME` (default `~/.gosu`) holds everything the daemon owns: the
//! single-instance lockfile, the `log/` and `db/` subdirectories, and one
//! `<name>.config.json` per settings domain. Settings files are written
//! atomically (temp file + rename) and created with defaults on first use.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, OnceLock, RwLock};

use base64::Engine;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The gosu home directory: `$GOSUHOME`, falling back to `~/.gosu`.
pub fn home() -> &'static Path {
    static HOME: OnceLock<PathBuf> = OnceLock::new();
    HOME.get_or_init(|| {
        if let Ok(home) = std::env::var("GOSUHOME") {
            return PathBuf::from(home);
        }
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".gosu"))
            .unwrap_or_else(|| PathBuf::from(".gosu"))
    })
}

fn subdir(name: &str) -> PathBuf {
    let path = home().join(name);
    std::fs::create_dir_all(&path).ok();
    path
}

pub fn log_dir() -> PathBuf {
    subdir("log")
}

pub fn data_dir() -> PathBuf {
    subdir("db")
}

/// One persisted settings domain, cached after first load.
pub struct SettingsFile<T> {
    path: PathBuf,
    defaults: fn() -> T,
    cached: RwLock<Option<Arc<T>>>,
    write_lock: Mutex<()>,
}

impl<T: Serialize + DeserializeOwned> SettingsFile<T> {
    pub fn new(name: &str, defaults: fn() -> T) -> SettingsFile<T> {
        SettingsFile {
            path: home().join(format!("{name}.config.json")),
            defaults,
            cached: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Arc<T> {
        if let Some(value) = self.cached.read().unwrap().as_ref() {
            return value.clone();
        }
        self.reload()
    }

    /// Re-read from disk; on a missing or corrupt file, write defaults back.
    pub fn reload(&self) -> Arc<T> {
        let loaded = std::fs::read(&self.path)
            .ok()
            .and_then(|data| serde_json::from_slice::<T>(&data).ok());
        let value = Arc::new(match loaded {
            Some(value) => value,
            None => {
                let value = (self.defaults)();
                self.write(&value).ok();
                value
            }
        });
        *self.cached.write().unwrap() = Some(value.clone());
        value
    }

    pub fn save(&self, value: T) -> std::io::Result<()> {
        self.write(&value)?;
        *self.cached.write().unwrap() = Some(Arc::new(value));
        Ok(())
    }

    fn write(&self, value: &T) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)
    }
}

fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::STANDARD.encode(buf)
}

/// RPC endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    pub local_address: String,
    #[serde(rename = "remote_list", default)]
    pub remote_addresses: Vec<String>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub seed: String,
}

impl RpcSettings {
    pub fn addresses(&self) -> Vec<String> {
        let mut out = vec![self.local_address.clone()];
        out.extend(self.remote_addresses.iter().cloned());
        out
    }

    /// AES key for the secure transport: `SHA256(seed || secret)`.
    /// None when no seed is configured, meaning plaintext transport.
    pub fn cipher_key(&self) -> Option<[u8; 32]> {
        if self.seed.is_empty() {
            return None;
        }
        let mut sha = Sha256::new();
        sha.update(self.seed.as_bytes());
        sha.update(self.secret.as_bytes());
        Some(sha.finalize().into())
    }
}

/// Daemon service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Keep the job store in memory instead of on disk.
    pub ephemeral: bool,
}

pub static RPC: LazyLock<SettingsFile<RpcSettings>> = LazyLock::new(|| {
    SettingsFile::new("rpc", || RpcSettings {
        local_address: "http://localhost:24511".into(),
        remote_addresses: Vec::new(),
        secret: random_token(),
        seed: random_token(),
    })
});

pub static SERVICE: LazyLock<SettingsFile<ServiceSettings>> =
    LazyLock::new(|| SettingsFile::new("service", ServiceSettings::default));

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        port: u16,
    }

    #[test]
    fn writes_defaults_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = SettingsFile {
            path: dir.path().join("probe.config.json"),
            defaults: || Probe {
                name: "default".into(),
                port: 8080,
            },
            cached: RwLock::new(None),
            write_lock: Mutex::new(()),
        };
        let v = file.get();
        assert_eq!(v.name, "default");
        assert!(file.path().exists());
    }

    #[test]
    fn save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = SettingsFile {
            path: dir.path().join("probe.config.json"),
            defaults: || Probe {
                name: "default".into(),
                port: 8080,
            },
            cached: RwLock::new(None),
            write_lock: Mutex::new(()),
        };
        file.save(Probe {
            name: "saved".into(),
            port: 9000,
        })
        .unwrap();
        let v = file.reload();
        assert_eq!(v.name, "saved");
        assert_eq!(v.port, 9000);
    }

    #[test]
    fn cipher_key_requires_seed() {
        let mut s = RpcSettings {
            local_address: String::new(),
            remote_addresses: vec![],
            secret: "secret".into(),
            seed: String::new(),
        };
        assert!(s.cipher_key().is_none());
        s.seed = "seed".into();
        let key = s.cipher_key().unwrap();
        let mut sha = Sha256::new();
        sha.update(b"seed");
        sha.update(b"secret");
        assert_eq!(key, <[u8; 32]>::from(sha.finalize()));
    }
}
