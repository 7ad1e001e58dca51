use anyhow::{anyhow, Context, Result};
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::models::VisitorIdentity;

/// Attempt markers keyed by (day, identity), persisted as a flat JSON set.
/// At most one scored attempt per (day, ip) and per (day, device) as this
/// store observes it. Advisory gating only: nothing here is enforced
/// globally, and racing requests can both pass the check before either
/// marker lands.
#[derive(Clone, Debug)]
pub struct MarkerStore {
    path: PathBuf,
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl MarkerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<MarkerStore> {
        let path = path.as_ref().to_path_buf();
        // Missing file means no attempts yet; any other read error
        // propagates rather than silently dropping recorded markers.
        let inner = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()))
            }
        };

        Ok(MarkerStore {
            path,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn any(&self, day: u32, identity: &VisitorIdentity) -> Result<bool> {
        let inner = self.lock()?;
        Ok(keys(day, identity).iter().any(|key| inner.contains(key)))
    }

    /// Records both markers for this identity. Idempotent: both keys
    /// describe the same attempt, so re-recording is safe.
    pub fn record(&self, day: u32, identity: &VisitorIdentity) -> Result<()> {
        let mut inner = self.lock()?;
        for key in keys(day, identity) {
            inner.insert(key);
        }
        fs::write(&self.path, serde_json::to_string_pretty(&*inner)?)?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeSet<String>>> {
        self.inner
            .lock()
            .map_err(|_err| anyhow!("couldn't lock marker store"))
    }
}

fn keys(day: u32, identity: &VisitorIdentity) -> Vec<String> {
    let mut keys = vec![format!("attempt:{}:{}", day, identity.ip)];
    if let Some(device) = &identity.device {
        keys.push(format!("attempt:{}:device:{}", day, device));
    }
    keys
}
