use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Transaction, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::tensor::FeatureVector;

use super::{ClassKey, ClassRecord, DatasetStore, MODEL_ARTIFACT_NAME, StoreError, StoreEvent};

pub(super) const NEXT_ID_KEY: &str = "next_id";

pub(super) fn map_sql_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(sql_err, _)
            if sql_err.extended_code == rusqlite::ffi::SQLITE_BUSY =>
        {
            StoreError::Busy
        }
        other => StoreError::Transaction(other),
    }
}

fn write_next_id(tx: &Transaction<'_>, value: u32) -> Result<(), StoreError> {
    tx.prepare_cached(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .map_err(map_sql_error)?
    .execute(params![NEXT_ID_KEY, value.to_string()])
    .map_err(map_sql_error)?;
    Ok(())
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

impl DatasetStore {
    /// Issue a fresh key. Keys strictly increase and survive restarts.
    pub fn allocate_key(&self) -> Result<ClassKey, StoreError> {
        let mut inner = self.lock();
        let next = inner.next_id.checked_add(1).ok_or_else(|| {
            StoreError::CorruptRecord {
                key: ClassKey(inner.next_id),
                reason: "class key counter exhausted".into(),
            }
        })?;
        let tx = inner.conn.transaction().map_err(map_sql_error)?;
        write_next_id(&tx, next)?;
        tx.commit().map_err(map_sql_error)?;
        inner.next_id = next;
        Ok(ClassKey(next))
    }

    /// Insert a class, or rename it if the key exists. Features are kept on rename.
    pub fn add_card(&self, key: ClassKey, name: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.lock();
            let bump = key.0 > inner.next_id;
            let tx = inner.conn.transaction().map_err(map_sql_error)?;
            tx.prepare_cached(
                "INSERT INTO cards (card_key, name) VALUES (?1, ?2)
                 ON CONFLICT(card_key) DO UPDATE SET name = excluded.name",
            )
            .map_err(map_sql_error)?
            .execute(params![i64::from(key.0), name])
            .map_err(map_sql_error)?;
            if bump {
                write_next_id(&tx, key.0)?;
            }
            tx.commit().map_err(map_sql_error)?;

            if bump {
                inner.next_id = key.0;
            }
            let event = match inner.cards.get_mut(&key) {
                Some(record) => {
                    record.name = name.to_string();
                    StoreEvent::ChangeCard { key }
                }
                None => {
                    inner.cards.insert(
                        key,
                        ClassRecord {
                            name: name.to_string(),
                            features: Vec::new(),
                        },
                    );
                    StoreEvent::AddCard { key }
                }
            };
            debug!(%key, name, "Stored class");
            self.enqueue(event);
        }
        self.flush_events();
        Ok(())
    }

    /// Replace every feature vector of an existing class.
    pub fn set_training_inputs(
        &self,
        key: ClassKey,
        features: Vec<FeatureVector>,
    ) -> Result<(), StoreError> {
        let superseded = {
            let mut inner = self.lock();
            if !inner.cards.contains_key(&key) {
                return Err(StoreError::UnknownKey(key));
            }
            let tx = inner.conn.transaction().map_err(map_sql_error)?;
            tx.prepare_cached("DELETE FROM card_features WHERE card_key = ?1")
                .map_err(map_sql_error)?
                .execute([i64::from(key.0)])
                .map_err(map_sql_error)?;
            {
                let mut insert = tx
                    .prepare_cached(
                        "INSERT INTO card_features (card_key, position, vector) VALUES (?1, ?2, ?3)",
                    )
                    .map_err(map_sql_error)?;
                for (position, vector) in features.iter().enumerate() {
                    insert
                        .execute(params![i64::from(key.0), position as i64, vector.to_le_blob()])
                        .map_err(map_sql_error)?;
                }
            }
            tx.commit().map_err(map_sql_error)?;

            let count = features.len();
            let superseded = inner
                .cards
                .get_mut(&key)
                .map(|record| std::mem::replace(&mut record.features, features));
            info!(%key, samples = count, "Stored training inputs");
            self.enqueue(StoreEvent::ChangeCard { key });
            superseded
        };
        drop(superseded);
        self.flush_events();
        Ok(())
    }

    /// Delete a class and its samples. Absent keys are ignored.
    pub fn remove_card(&self, key: ClassKey) -> Result<(), StoreError> {
        let removed = {
            let mut inner = self.lock();
            if !inner.cards.contains_key(&key) {
                return Ok(());
            }
            let tx = inner.conn.transaction().map_err(map_sql_error)?;
            tx.prepare_cached("DELETE FROM card_features WHERE card_key = ?1")
                .map_err(map_sql_error)?
                .execute([i64::from(key.0)])
                .map_err(map_sql_error)?;
            tx.prepare_cached("DELETE FROM cards WHERE card_key = ?1")
                .map_err(map_sql_error)?
                .execute([i64::from(key.0)])
                .map_err(map_sql_error)?;
            tx.commit().map_err(map_sql_error)?;

            let removed = inner.cards.remove(&key);
            info!(%key, "Removed class");
            self.enqueue(StoreEvent::DeleteCard { key });
            removed
        };
        drop(removed);
        self.flush_events();
        Ok(())
    }

    /// Drop every class, reset the key counter and delete the saved model.
    pub fn clear(&self) -> Result<(), StoreError> {
        let removed = {
            let mut inner = self.lock();
            let tx = inner.conn.transaction().map_err(map_sql_error)?;
            tx.execute_batch(
                "DELETE FROM card_features;
                 DELETE FROM cards;
                 DELETE FROM model_artifacts;",
            )
            .map_err(map_sql_error)?;
            tx.prepare_cached("DELETE FROM metadata WHERE key = ?1")
                .map_err(map_sql_error)?
                .execute([NEXT_ID_KEY])
                .map_err(map_sql_error)?;
            tx.commit().map_err(map_sql_error)?;

            inner.next_id = 0;
            let removed = std::mem::take(&mut inner.cards);
            info!(classes = removed.len(), "Cleared dataset");
            self.enqueue(StoreEvent::Reset);
            removed
        };
        drop(removed);
        self.flush_events();
        Ok(())
    }

    /// Persist the classifier model, replacing any previous one.
    pub fn save_model<T: Serialize>(&self, model: &T) -> Result<(), StoreError> {
        let payload = serde_json::to_string(model)?;
        let mut inner = self.lock();
        let tx = inner.conn.transaction().map_err(map_sql_error)?;
        tx.prepare_cached(
            "INSERT INTO model_artifacts (name, payload, saved_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET payload = excluded.payload,
                                             saved_at = excluded.saved_at",
        )
        .map_err(map_sql_error)?
        .execute(params![MODEL_ARTIFACT_NAME, payload, unix_seconds()])
        .map_err(map_sql_error)?;
        tx.commit().map_err(map_sql_error)?;
        debug!(bytes = payload.len(), "Saved classifier model");
        Ok(())
    }

    /// Delete the persisted classifier model. Returns whether one existed.
    pub fn remove_model(&self) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let tx = inner.conn.transaction().map_err(map_sql_error)?;
        let deleted = tx
            .prepare_cached("DELETE FROM model_artifacts WHERE name = ?1")
            .map_err(map_sql_error)?
            .execute([MODEL_ARTIFACT_NAME])
            .map_err(map_sql_error)?;
        tx.commit().map_err(map_sql_error)?;
        Ok(deleted > 0)
    }
}
