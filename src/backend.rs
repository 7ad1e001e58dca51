use anyhow::{anyhow, ensure, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::models::{Entry, Winner};

/// Entry and winner storage. One capability set, two adapters, chosen at
/// startup. Idempotency of `set_winner` is not part of the contract; the
/// next `winner` read is the source of truth.
#[derive(Clone, Debug)]
pub enum Backend {
    Local(LocalStore),
    Remote(RemoteStore),
}

impl Backend {
    pub async fn entries(&self, day: u32) -> Result<Vec<Entry>> {
        match self {
            Backend::Local(store) => store.entries(day),
            Backend::Remote(store) => store.entries(day).await,
        }
    }

    pub async fn add_entry(&self, day: u32, name: &str, ip: &str) -> Result<()> {
        match self {
            Backend::Local(store) => store.add_entry(day, name, ip),
            Backend::Remote(store) => store.add_entry(day, name, ip).await,
        }
    }

    pub async fn winner(&self, day: u32) -> Result<Option<Winner>> {
        match self {
            Backend::Local(store) => store.winner(day),
            Backend::Remote(store) => store.winner(day).await,
        }
    }

    pub async fn set_winner(&self, day: u32, winner: &Winner) -> Result<()> {
        match self {
            Backend::Local(store) => store.set_winner(day, winner),
            Backend::Remote(store) => store.set_winner(day, winner).await,
        }
    }

    pub async fn winners_archive(&self, total_days: u32) -> Result<Vec<(u32, Winner)>> {
        match self {
            Backend::Local(store) => store.winners_archive(total_days),
            Backend::Remote(store) => store.winners_archive(total_days).await,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct StoreData {
    #[serde(default)]
    entries: BTreeMap<u32, Vec<Entry>>,
    #[serde(default)]
    winners: BTreeMap<u32, Winner>,
}

/// Flat-file adapter: the whole store is one JSON document, rewritten on
/// each mutation. Single-writer per process via the mutex.
#[derive(Clone, Debug)]
pub struct LocalStore {
    path: PathBuf,
    inner: Arc<Mutex<StoreData>>,
}

impl LocalStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<LocalStore> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("store.json");
        // Only a missing file means a fresh store. Any other read error
        // must not be papered over: the next persist would clobber data.
        let data = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoreData::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()))
            }
        };

        Ok(LocalStore {
            path,
            inner: Arc::new(Mutex::new(data)),
        })
    }

    fn entries(&self, day: u32) -> Result<Vec<Entry>> {
        let inner = self.lock()?;
        Ok(inner.entries.get(&day).cloned().unwrap_or_default())
    }

    fn add_entry(&self, day: u32, name: &str, ip: &str) -> Result<()> {
        let mut inner = self.lock()?;
        // Stage the mutation; memory only advances once the write lands.
        let mut next = inner.clone();
        next.entries.entry(day).or_default().push(Entry {
            name: name.trim().to_owned(),
            ip: ip.to_owned(),
            ts: Utc::now(),
        });
        self.persist(&next)?;
        *inner = next;

        Ok(())
    }

    fn winner(&self, day: u32) -> Result<Option<Winner>> {
        let inner = self.lock()?;
        Ok(inner.winners.get(&day).cloned())
    }

    fn set_winner(&self, day: u32, winner: &Winner) -> Result<()> {
        let mut inner = self.lock()?;
        let mut next = inner.clone();
        next.winners.insert(day, winner.clone());
        self.persist(&next)?;
        *inner = next;

        Ok(())
    }

    fn winners_archive(&self, total_days: u32) -> Result<Vec<(u32, Winner)>> {
        let inner = self.lock()?;
        Ok(inner
            .winners
            .iter()
            .filter(|(day, _winner)| **day < total_days)
            .map(|(day, winner)| (*day, winner.clone()))
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.inner
            .lock()
            .map_err(|_err| anyhow!("couldn't lock store"))
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(data)?)?;
        Ok(())
    }
}

/// Remote adapter: every operation is a POST of `{ action, payload }` to
/// one endpoint, matching the hosted-script protocol. No timeout is set;
/// a hung backend stalls that render path.
#[derive(Clone, Debug)]
pub struct RemoteStore {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteReply {
    #[serde(default)]
    entries: Option<Vec<Entry>>,
    #[serde(default)]
    winner: Option<Winner>,
    #[serde(default)]
    archive: Option<Vec<ArchiveRow>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ArchiveRow {
    #[serde(rename = "dayIndex")]
    day_index: u32,
    winner: Winner,
}

impl RemoteStore {
    pub fn new(endpoint: String) -> RemoteStore {
        RemoteStore {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, action: &str, payload: serde_json::Value) -> Result<RemoteReply> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "action": action, "payload": payload }))
            .send()
            .await
            .with_context(|| format!("calling backend action {}", action))?;
        ensure!(
            res.status().is_success(),
            "backend action {} returned {}",
            action,
            res.status()
        );
        Ok(res.json().await?)
    }

    async fn entries(&self, day: u32) -> Result<Vec<Entry>> {
        let reply = self.call("getEntries", json!({ "dayIndex": day })).await?;
        Ok(reply.entries.unwrap_or_default())
    }

    async fn add_entry(&self, day: u32, name: &str, ip: &str) -> Result<()> {
        self.call("addEntry", json!({ "dayIndex": day, "name": name, "ip": ip }))
            .await?;
        Ok(())
    }

    async fn winner(&self, day: u32) -> Result<Option<Winner>> {
        let reply = self.call("getWinner", json!({ "dayIndex": day })).await?;
        Ok(reply.winner)
    }

    async fn set_winner(&self, day: u32, winner: &Winner) -> Result<()> {
        self.call("setWinner", json!({ "dayIndex": day, "winner": winner }))
            .await?;
        Ok(())
    }

    async fn winners_archive(&self, total_days: u32) -> Result<Vec<(u32, Winner)>> {
        let reply = self
            .call("getWinnersArchive", json!({ "totalDays": total_days }))
            .await?;
        Ok(reply
            .archive
            .unwrap_or_default()
            .into_iter()
            .map(|row| (row.day_index, row.winner))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("daily-draw-store-{}-{:x}", tag, rand::random::<u64>()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn entries_default_to_empty() {
        let store = LocalStore::open(temp_dir("empty")).unwrap();
        assert!(store.entries(0).unwrap().is_empty());
        assert!(store.winner(0).unwrap().is_none());
    }

    #[test]
    fn add_entry_trims_and_appends() {
        let store = LocalStore::open(temp_dir("append")).unwrap();
        store.add_entry(3, "  Alice  ", "203.0.113.7").unwrap();
        store.add_entry(3, "Bob", "198.51.100.1").unwrap();

        let entries = store.entries(3).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Alice");
        assert_eq!(entries[0].ip, "203.0.113.7");
        assert_eq!(entries[1].name, "Bob");
        assert!(store.entries(4).unwrap().is_empty());
    }

    #[test]
    fn winner_round_trip_and_archive_bound() {
        let store = LocalStore::open(temp_dir("winner")).unwrap();
        let alice = Winner {
            name: "Alice".into(),
            ts: Utc::now(),
        };
        store.set_winner(2, &alice).unwrap();
        store.set_winner(30, &alice).unwrap();

        assert_eq!(store.winner(2).unwrap(), Some(alice.clone()));

        // Archive only reports days inside the configured run.
        let archive = store.winners_archive(24).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].0, 2);
        assert_eq!(archive[0].1, alice);
    }

    #[test]
    fn unreadable_store_file_is_an_error_not_a_fresh_store() {
        let dir = temp_dir("unreadable");
        // A directory at the data file's path fails the read with
        // something other than NotFound; that must not become an
        // empty store ready to clobber the real one.
        fs::create_dir_all(dir.join("store.json")).unwrap();
        assert!(LocalStore::open(&dir).is_err());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = temp_dir("reopen");
        {
            let store = LocalStore::open(&dir).unwrap();
            store.add_entry(1, "Alice", "203.0.113.7").unwrap();
            store
                .set_winner(
                    0,
                    &Winner {
                        name: "Bob".into(),
                        ts: Utc::now(),
                    },
                )
                .unwrap();
        }

        let store = LocalStore::open(&dir).unwrap();
        assert_eq!(store.entries(1).unwrap()[0].name, "Alice");
        assert_eq!(store.winner(0).unwrap().unwrap().name, "Bob");
    }
}
