//! Authenticated, redundant configuration store.
//!
//! The document is serialized with stable key order and written alongside a
//! detached HMAC-SHA256 signature; the three critical session fields are
//! mirrored into the platform shadow on every successful save. A config
//! that fails authentication is reconstructed from the shadow where
//! possible, otherwise reported as [`Error::Corrupt`].
//!
//! Both the UI host and the agent write the same file; all cross-process
//! coordination happens through [`Store::update_atomic`].

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use focus_lock_common::{Config, Error, Result};
use focus_lock_platform::{OsPlatform, ShadowState};

type HmacSha256 = Hmac<Sha256>;

const LOAD_RETRIES: u32 = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct Store {
    platform: Arc<dyn OsPlatform>,
    path: PathBuf,
    sig_path: PathBuf,
    secret: Vec<u8>,
    document: Mutex<Config>,
}

impl Store {
    /// Open the per-user store, creating the config directory and the HMAC
    /// secret on first run. The secret lives only in the shadow; when the
    /// shadow is unusable we fall back to a process-local secret so the
    /// agent keeps working with reduced tamper protection.
    pub fn new(platform: Arc<dyn OsPlatform>) -> Result<Self> {
        let dir = platform.config_root().join("FocusLock");
        fs::create_dir_all(&dir)?;

        let secret = match platform.get_or_create_secret() {
            Ok(secret) => secret,
            Err(err) => {
                warn!("shadow secret unavailable ({err}); using in-memory secret");
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes.to_vec()
            }
        };

        let path = dir.join("config.json");
        let sig_path = dir.join("config.json.sig");
        Ok(Self {
            platform,
            path,
            sig_path,
            secret,
            document: Mutex::new(Config::default()),
        })
    }

    /// Reload the document from disk and return a snapshot of it.
    pub fn load(&self) -> Result<Config> {
        let mut document = self.lock();
        self.load_locked(&mut document)?;
        Ok(document.clone())
    }

    /// Snapshot of the in-memory document without touching the disk.
    pub fn snapshot(&self) -> Config {
        self.lock().clone()
    }

    /// Persist the in-memory document.
    pub fn save(&self) -> Result<()> {
        let document = self.lock();
        self.save_locked(&document)
    }

    /// Read-modify-write under the store lock: reload the latest on-disk
    /// state, apply the mutator, persist. The only safe mutation path when
    /// the UI and the agent are both running.
    pub fn update_atomic<F>(&self, mutate: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut document = self.lock();
        // A load failure must not block the write: recovery data (or
        // defaults) are already in memory at this point.
        if let Err(err) = self.load_locked(&mut document) {
            debug!("update proceeding without fresh load: {err}");
        }
        mutate(&mut document);
        self.save_locked(&document)?;
        Ok(document.clone())
    }

    pub fn increment_kill_count(&self, exe_name: &str) -> Result<()> {
        self.update_atomic(|config| {
            *config.stats.kill_counts.entry(exe_name.to_string()).or_insert(0) += 1;
        })
        .map(|_| ())
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_locked(&self, document: &mut Config) -> Result<()> {
        let bytes = match self.read_with_retry() {
            Ok(bytes) => bytes,
            Err(err) => {
                // A transient lock held past the retries; keep enforcing
                // with the in-memory document rather than resetting it.
                warn!("config unreadable, keeping in-memory state: {err}");
                return Ok(());
            }
        };

        let mut corrupt = false;
        if let Some(bytes) = &bytes {
            match fs::read_to_string(&self.sig_path) {
                Ok(stored) if stored.trim() == self.compute_hmac(bytes) => {
                    match serde_json::from_slice::<Config>(bytes) {
                        Ok(parsed) => {
                            *document = parsed;
                            return Ok(());
                        }
                        Err(err) => {
                            warn!("config unreadable despite valid signature: {err}");
                            corrupt = true;
                        }
                    }
                }
                Ok(_) => {
                    warn!("config signature mismatch, treating as tampered");
                    corrupt = true;
                }
                Err(_) => {
                    warn!("config signature missing, treating as tampered");
                    corrupt = true;
                }
            }
        }

        // Disk is missing or untrusted: try the shadow.
        if let Ok(shadow) = self.platform.read_shadow() {
            if shadow.holds_active_session(Utc::now()) {
                warn!("restoring critical session state from shadow");
                *document = Config {
                    lock_end_time: shadow.lock_end_time(),
                    remaining_duration: shadow.remaining(),
                    paused_until: shadow.paused_until(),
                    ..Config::default()
                };
                return Ok(());
            }
        }

        if corrupt {
            return Err(Error::Corrupt);
        }
        // Absent file and nothing to restore: fresh start.
        *document = Config::default();
        Ok(())
    }

    fn save_locked(&self, document: &Config) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;

        // The rename keeps concurrent readers from ever seeing a torn
        // document; the signature is written after the document it signs.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        fs::write(&self.sig_path, self.compute_hmac(&bytes))?;

        let shadow = ShadowState::from_fields(
            document.lock_end_time,
            document.remaining_duration,
            document.paused_until,
        );
        if let Err(err) = self.platform.write_shadow(&shadow) {
            warn!("shadow update failed: {err}");
        }
        Ok(())
    }

    /// `Ok(None)` means the file does not exist; transient errors are
    /// retried with a short pause to ride out locks held by the UI.
    fn read_with_retry(&self) -> std::io::Result<Option<Vec<u8>>> {
        let mut last_error = None;
        for attempt in 0..LOAD_RETRIES {
            match fs::read(&self.path) {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    debug!("config read attempt {} failed: {err}", attempt + 1);
                    last_error = Some(err);
                    std::thread::sleep(LOAD_RETRY_DELAY);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "config read failed")))
    }

    fn compute_hmac(&self, bytes: &[u8]) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return String::new();
        };
        mac.update(bytes);
        hex::encode(mac.finalize().into_bytes())
    }
}
