use std::fs;
use std::path::{Path, PathBuf};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{derive_public_key, KeystoreError, Keystores, ScryptKeystore};
use crate::config::KeystoresConfig;

const KEYSTORE_PREFIX: &str = "keystore";
const KEYSTORE_SUFFIX: &str = ".json";

/// Keystore file with its resolved password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreFile {
    pub name: String,
    pub path: PathBuf,
    pub password: String,
}

struct LoadedKey {
    position: usize,
    file: String,
    public_key: String,
    secret: Vec<u8>,
}

/// Lists `keystore*.json` files in name order and resolves their passwords.
///
/// A `<name>.txt` file in the password directory wins over the directory-wide
/// password file.
pub fn list_keystore_files(config: &KeystoresConfig) -> Result<Vec<KeystoreFile>, KeystoreError> {
    let dir = &config.keystores_dir;
    let entries = fs::read_dir(dir).map_err(|source| KeystoreError::Io {
        path: dir.clone(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| KeystoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(KEYSTORE_PREFIX)
            && name.ends_with(KEYSTORE_SUFFIX)
            && entry.path().is_file()
        {
            names.push(name);
        }
    }
    names.sort();

    // read on first fallback only
    let mut default_password: Option<String> = None;

    let mut files = Vec::with_capacity(names.len());
    for name in names {
        let stem = name.strip_suffix(KEYSTORE_SUFFIX).unwrap_or(&name);
        let sidecar = config.password_dir().join(format!("{}.txt", stem));

        let password = if sidecar.is_file() {
            read_password(&sidecar)?
        } else if let Some(password_file) = config.password_file.as_deref() {
            match &default_password {
                Some(password) => password.clone(),
                None => {
                    let password = read_password(password_file)?;
                    default_password = Some(password.clone());
                    password
                }
            }
        } else {
            return Err(KeystoreError::MissingPassword { file: name });
        };

        files.push(KeystoreFile {
            path: dir.join(&name),
            name,
            password,
        });
    }
    Ok(files)
}

/// Decrypts every keystore on a bounded blocking pool.
///
/// The first failure stops further dispatch; units already running are
/// drained and any failure fails the whole load.
pub async fn load_keystores(config: &KeystoresConfig) -> Result<Keystores, KeystoreError> {
    let files = list_keystore_files(config)?;
    let total = files.len();
    let pool_size = config.pool_size.max(1);
    info!(
        total,
        pool_size,
        "Loading keystores from {}...",
        config.keystores_dir.display()
    );

    let mut pending = files.into_iter().enumerate();
    let mut workers = JoinSet::new();
    let mut stop_dispatch = false;
    let mut dispatched = 0;
    let mut loaded = Vec::with_capacity(total);
    let mut errors = Vec::new();

    loop {
        while !stop_dispatch && workers.len() < pool_size {
            let Some((position, file)) = pending.next() else {
                break;
            };
            dispatched += 1;
            workers.spawn_blocking(move || load_keystore(position, file));
        }

        let Some(joined) = workers.join_next().await else {
            break;
        };
        match joined {
            Ok(Ok(key)) => {
                debug!(file = %key.file, public_key = %key.public_key, "keystore decrypted");
                loaded.push(key);
            }
            Ok(Err(err)) => {
                error!("Failed to load keystore: {}", err);
                stop_dispatch = true;
                errors.push(err);
            }
            Err(join_err) => {
                error!("Keystore worker failed: {}", join_err);
                stop_dispatch = true;
                errors.push(KeystoreError::Worker(join_err.to_string()));
            }
        }
    }

    if !errors.is_empty() {
        return Err(KeystoreError::LoadFailed {
            dispatched,
            total,
            errors,
        });
    }

    // file order keeps duplicate resolution independent of completion order
    loaded.sort_by_key(|key| key.position);
    let mut keystores = Keystores::default();
    for key in loaded {
        if keystores.insert(key.public_key.clone(), key.secret).is_some() {
            warn!(
                file = %key.file,
                public_key = %key.public_key,
                "Duplicate public key, replacing previously loaded keystore"
            );
        }
    }

    info!("Loaded {} keystores", keystores.len());
    Ok(keystores)
}

fn load_keystore(position: usize, file: KeystoreFile) -> Result<LoadedKey, KeystoreError> {
    let json = fs::read_to_string(&file.path).map_err(|source| KeystoreError::Io {
        path: file.path.clone(),
        source,
    })?;

    let keystore = ScryptKeystore::from_json(&json)
        .map_err(|e| KeystoreError::from_container(&file.name, e))?;
    let secret = keystore
        .decrypt(&file.password)
        .map_err(|e| KeystoreError::from_container(&file.name, e))?;
    let public_key = derive_public_key(&secret).ok_or_else(|| KeystoreError::InvalidSecretKey {
        file: file.name.clone(),
    })?;

    Ok(LoadedKey {
        position,
        file: file.name,
        public_key,
        secret,
    })
}

fn read_password(path: &Path) -> Result<String, KeystoreError> {
    let contents = fs::read_to_string(path).map_err(|source| KeystoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::keystores::ScryptCost;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    const FAST: ScryptCost = ScryptCost { n: 16, r: 8, p: 1 };

    fn write_keystore(dir: &Path, name: &str, secret_byte: u8, password: &str) {
        let mut secret = [0u8; 32];
        secret[31] = secret_byte;
        let mut rng = StdRng::seed_from_u64(secret_byte as u64);
        let keystore = ScryptKeystore::encrypt(&secret, password, FAST, &mut rng).unwrap();
        fs::write(dir.join(name), keystore.to_json().unwrap()).unwrap();
    }

    #[test]
    fn test_discovery_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["keystore-b.json", "keystore-a.json", "deposit_data.json", "keystore-c.txt"] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        fs::write(dir.path().join("password.txt"), "secret\n").unwrap();

        let mut config = KeystoresConfig::new(dir.path());
        config.password_file = Some(dir.path().join("password.txt"));

        let files = list_keystore_files(&config).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["keystore-a.json", "keystore-b.json"]);
        assert!(files.iter().all(|f| f.password == "secret"));
    }

    #[test]
    fn test_missing_password() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keystore-1.json"), "{}").unwrap();

        let config = KeystoresConfig::new(dir.path());
        assert!(matches!(
            list_keystore_files(&config),
            Err(KeystoreError::MissingPassword { file }) if file == "keystore-1.json"
        ));
    }

    #[test]
    fn test_sidecar_in_password_dir() {
        let keys = TempDir::new().unwrap();
        let secrets = TempDir::new().unwrap();
        fs::write(keys.path().join("keystore-1.json"), "{}").unwrap();
        fs::write(secrets.path().join("keystore-1.txt"), "  sidecar  \n").unwrap();

        let mut config = KeystoresConfig::new(keys.path());
        config.password_dir = Some(secrets.path().to_path_buf());

        let files = list_keystore_files(&config).unwrap();
        assert_eq!(files[0].password, "sidecar");
    }

    #[test]
    fn test_password_file_only_read_when_needed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keystore-1.json"), "{}").unwrap();
        fs::write(dir.path().join("keystore-1.txt"), "sidecar").unwrap();

        let mut config = KeystoresConfig::new(dir.path());
        config.password_file = Some(dir.path().join("absent.txt"));

        let files = list_keystore_files(&config).unwrap();
        assert_eq!(files[0].password, "sidecar");

        fs::write(dir.path().join("keystore-2.json"), "{}").unwrap();
        assert!(matches!(
            list_keystore_files(&config),
            Err(KeystoreError::Io { path, .. }) if path == dir.path().join("absent.txt")
        ));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_dispatch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keystore-0.json"), "not json").unwrap();
        for i in 1..=4u8 {
            write_keystore(dir.path(), &format!("keystore-{}.json", i), i, "pw");
        }
        fs::write(dir.path().join("password.txt"), "pw").unwrap();

        let mut config = KeystoresConfig::new(dir.path());
        config.password_file = Some(dir.path().join("password.txt"));
        config.pool_size = 1;

        match load_keystores(&config).await {
            Err(KeystoreError::LoadFailed {
                dispatched,
                total,
                errors,
            }) => {
                assert_eq!(dispatched, 1);
                assert_eq!(total, 5);
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    &errors[0],
                    KeystoreError::InvalidFormat { file, .. } if file == "keystore-0.json"
                ));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_secret_key() {
        let dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let keystore = ScryptKeystore::encrypt(&[0u8; 32], "pw", FAST, &mut rng).unwrap();
        fs::write(dir.path().join("keystore-zero.json"), keystore.to_json().unwrap()).unwrap();
        fs::write(dir.path().join("keystore-zero.txt"), "pw").unwrap();

        let config = KeystoresConfig::new(dir.path());
        match load_keystores(&config).await {
            Err(KeystoreError::LoadFailed { errors, .. }) => {
                assert!(matches!(&errors[0], KeystoreError::InvalidSecretKey { .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let keystores = load_keystores(&KeystoresConfig::new(dir.path())).await.unwrap();
        assert!(keystores.is_empty());
    }
}
