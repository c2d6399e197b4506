//! Credential storage: a narrow `UserStore` trait consumed by the session
//! router, plus a file-backed implementation matching the persisted
//! `username:password_hash:registration_ms:last_login_ms` line format.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use parking_lot::Mutex;
use rand_core::OsRng;

use crate::error::EngineError;
use crate::UserId;

/// Everything the session router needs from a credential store. Kept
/// independent of the on-disk representation so tests can swap in an
/// in-memory double.
pub trait UserStore: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Result<UserId, EngineError>;
    fn register(&self, username: &str, password: &str) -> Result<UserId, EngineError>;
}

#[derive(Clone)]
struct UserRecord {
    password_hash: String,
    registered_at_ms: u64,
    last_login_ms: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// File-backed `UserStore`. Holds the parsed records in memory behind a
/// mutex and rewrites the whole file on every mutation — the same discipline
/// the on-disk document store uses for its blobs, appropriate at this scale.
pub struct FileUserStore {
    path: PathBuf,
    records: Mutex<HashMap<String, UserRecord>>,
    hasher: Argon2<'static>,
}

impl FileUserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let records = Mutex::new(load_records(&path)?);
        Ok(Self {
            path,
            records,
            hasher: Argon2::default(),
        })
    }

    fn persist(&self, records: &HashMap<String, UserRecord>) -> Result<(), EngineError> {
        let mut out = String::new();
        let mut usernames: Vec<&String> = records.keys().collect();
        usernames.sort();
        for username in usernames {
            let record = &records[username];
            out.push_str(&format!(
                "{username}:{}:{}:{}\n",
                record.password_hash, record.registered_at_ms, record.last_login_ms
            ));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&self.path)?;
        file.write_all(out.as_bytes())?;
        Ok(())
    }

    fn hash_password(&self, password: &str) -> Result<String, EngineError> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| crate::error::internal(format!("password hashing failed: {e}")))
    }

    fn verify_password(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self.hasher.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }
}

impl UserStore for FileUserStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<UserId, EngineError> {
        let mut records = self.records.lock();
        let record = records.get(username).ok_or_else(|| EngineError::InvalidCredentials {
            username: username.to_string(),
        })?;
        if !self.verify_password(password, &record.password_hash) {
            return Err(EngineError::InvalidCredentials {
                username: username.to_string(),
            });
        }
        let updated = UserRecord {
            password_hash: record.password_hash.clone(),
            registered_at_ms: record.registered_at_ms,
            last_login_ms: now_millis(),
        };
        records.insert(username.to_string(), updated);
        self.persist(&records)?;
        Ok(username.to_string())
    }

    fn register(&self, username: &str, password: &str) -> Result<UserId, EngineError> {
        let mut records = self.records.lock();
        if records.contains_key(username) {
            return Err(EngineError::AlreadyRegistered {
                username: username.to_string(),
            });
        }
        let password_hash = self.hash_password(password)?;
        let now = now_millis();
        records.insert(
            username.to_string(),
            UserRecord {
                password_hash,
                registered_at_ms: now,
                last_login_ms: now,
            },
        );
        self.persist(&records)?;
        Ok(username.to_string())
    }
}

fn load_records(path: &Path) -> Result<HashMap<String, UserRecord>, EngineError> {
    let mut records = HashMap::new();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.splitn(4, ':').collect();
        if parts.len() != 4 {
            continue;
        }
        let (username, password_hash, registered_at_ms, last_login_ms) = (parts[0], parts[1], parts[2], parts[3]);
        records.insert(
            username.to_string(),
            UserRecord {
                password_hash: password_hash.to_string(),
                registered_at_ms: registered_at_ms.parse().unwrap_or(0),
                last_login_ms: last_login_ms.parse().unwrap_or(0),
            },
        );
    }
    Ok(records)
}
