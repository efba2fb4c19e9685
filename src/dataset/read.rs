use std::collections::BTreeMap;

use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::tensor::{TensorLedger, decode_f32_le_blob};

use super::write::{NEXT_ID_KEY, map_sql_error};
use super::{ClassKey, ClassRecord, DatasetStore, MODEL_ARTIFACT_NAME, StoreError};

/// Rebuild the in-memory mirror and key counter from the database.
pub(super) fn load_mirror(
    conn: &Connection,
    ledger: &TensorLedger,
) -> Result<(BTreeMap<ClassKey, ClassRecord>, u32), StoreError> {
    let mut cards = BTreeMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT card_key, name FROM cards ORDER BY card_key")
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(map_sql_error)?;
        for row in rows {
            let (raw_key, name) = row.map_err(map_sql_error)?;
            let key = key_from_sql(raw_key)?;
            cards.insert(
                key,
                ClassRecord {
                    name,
                    features: Vec::new(),
                },
            );
        }
    }
    {
        let mut stmt = conn
            .prepare("SELECT card_key, vector FROM card_features ORDER BY card_key, position")
            .map_err(map_sql_error)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))
            .map_err(map_sql_error)?;
        for row in rows {
            let (raw_key, blob) = row.map_err(map_sql_error)?;
            let key = key_from_sql(raw_key)?;
            let values = decode_f32_le_blob(&blob)
                .map_err(|reason| StoreError::CorruptRecord { key, reason })?;
            let record = cards.get_mut(&key).ok_or_else(|| StoreError::CorruptRecord {
                key,
                reason: "features without a class row".into(),
            })?;
            record.features.push(ledger.track(values));
        }
    }
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [NEXT_ID_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sql_error)?;
    let stored = stored.and_then(|value| value.parse::<u32>().ok()).unwrap_or(0);
    let max_key = cards.keys().next_back().map(|key| key.0).unwrap_or(0);
    Ok((cards, stored.max(max_key)))
}

fn key_from_sql(raw: i64) -> Result<ClassKey, StoreError> {
    u32::try_from(raw)
        .map(ClassKey)
        .map_err(|_| StoreError::CorruptRecord {
            key: ClassKey(0),
            reason: format!("class key {raw} is out of range"),
        })
}

impl DatasetStore {
    /// Number of classes.
    pub fn len(&self) -> usize {
        self.lock().cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().cards.is_empty()
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Vec<ClassKey> {
        self.lock().cards.keys().copied().collect()
    }

    pub fn contains(&self, key: ClassKey) -> bool {
        self.lock().cards.contains_key(&key)
    }

    /// Snapshot of one class. Feature buffers are shared, not copied.
    pub fn get_card(&self, key: ClassKey) -> Option<ClassRecord> {
        self.lock().cards.get(&key).cloned()
    }

    /// Snapshot of every class in key order.
    pub fn records(&self) -> Vec<(ClassKey, ClassRecord)> {
        self.lock()
            .cards
            .iter()
            .map(|(key, record)| (*key, record.clone()))
            .collect()
    }

    /// Number of feature vectors stored for `key`; zero when absent.
    pub fn sample_count(&self, key: ClassKey) -> usize {
        self.lock()
            .cards
            .get(&key)
            .map(|record| record.features.len())
            .unwrap_or(0)
    }

    /// A uniformly chosen existing key.
    pub fn get_random(&self) -> Result<ClassKey, StoreError> {
        self.get_random_with(&mut rand::rng())
    }

    pub fn get_random_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ClassKey, StoreError> {
        let inner = self.lock();
        if inner.cards.is_empty() {
            return Err(StoreError::EmptyDataset);
        }
        let index = rng.random_range(0..inner.cards.len());
        inner
            .cards
            .keys()
            .nth(index)
            .copied()
            .ok_or(StoreError::EmptyDataset)
    }

    /// Restore the persisted classifier model.
    pub fn load_model<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let inner = self.lock();
        let payload: Option<String> = inner
            .conn
            .prepare_cached("SELECT payload FROM model_artifacts WHERE name = ?1")
            .map_err(map_sql_error)?
            .query_row([MODEL_ARTIFACT_NAME], |row| row.get(0))
            .optional()
            .map_err(map_sql_error)?;
        let payload =
            payload.ok_or_else(|| StoreError::ModelNotFound(MODEL_ARTIFACT_NAME.to_string()))?;
        Ok(serde_json::from_str(&payload)?)
    }

    pub fn has_model(&self) -> Result<bool, StoreError> {
        let inner = self.lock();
        let count: i64 = inner
            .conn
            .prepare_cached("SELECT COUNT(*) FROM model_artifacts WHERE name = ?1")
            .map_err(map_sql_error)?
            .query_row([MODEL_ARTIFACT_NAME], |row| row.get(0))
            .map_err(map_sql_error)?;
        Ok(count > 0)
    }
}
