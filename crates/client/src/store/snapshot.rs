//! Reference-data snapshots (products, categories, customers).

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{LocalStore, StoreError, decode_time, encode_time};
use crate::types::{CachedEntity, Collection, entity_key};

impl LocalStore {
    /// Upsert every record by primary key.
    ///
    /// Idempotent: saving the same snapshot twice leaves the store unchanged.
    /// A record without an `id` aborts the whole batch.
    pub async fn save_many(
        &self,
        collection: Collection,
        records: &[Value],
    ) -> Result<usize, StoreError> {
        ensure_reference(collection)?;

        let mut tx = self.pool.begin().await?;
        let saved = upsert_all(&mut tx, collection, records).await?;
        tx.commit().await?;

        Ok(saved)
    }

    /// Replace the whole collection with `records` in one transaction.
    ///
    /// Records the server no longer returns disappear locally.
    pub async fn replace_snapshot(
        &self,
        collection: Collection,
        records: &[Value],
    ) -> Result<usize, StoreError> {
        ensure_reference(collection)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_entities WHERE collection = ?1")
            .bind(collection.as_str())
            .execute(&mut *tx)
            .await?;
        let saved = upsert_all(&mut tx, collection, records).await?;
        tx.commit().await?;

        tracing::debug!(%collection, records = saved, "snapshot replaced");
        Ok(saved)
    }

    pub async fn get_entity(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<CachedEntity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT collection, entity_id, data, cached_at
            FROM cached_entities
            WHERE collection = ?1 AND entity_id = ?2
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_entity(collection, row)).transpose()
    }

    /// All records of a collection, in the order they were first saved.
    pub async fn list_entities(&self, collection: Collection) -> Result<Vec<CachedEntity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT collection, entity_id, data, cached_at
            FROM cached_entities
            WHERE collection = ?1
            ORDER BY rowid ASC
            "#,
        )
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row_to_entity(collection, row))
            .collect()
    }

    pub async fn put_entity(&self, collection: Collection, record: &Value) -> Result<(), StoreError> {
        self.save_many(collection, std::slice::from_ref(record)).await.map(|_| ())
    }

    /// Returns `true` if a record was removed.
    pub async fn delete_entity(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cached_entities WHERE collection = ?1 AND entity_id = ?2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn product_by_barcode(&self, barcode: &str) -> Result<Option<CachedEntity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT collection, entity_id, data, cached_at
            FROM cached_entities
            WHERE collection = ?1 AND barcode = ?2
            ORDER BY rowid ASC
            LIMIT 1
            "#,
        )
        .bind(Collection::Products.as_str())
        .bind(barcode)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_entity(Collection::Products, row)).transpose()
    }
}

fn ensure_reference(collection: Collection) -> Result<(), StoreError> {
    if collection.is_reference() {
        Ok(())
    } else {
        Err(StoreError::NotReferenceCollection(collection))
    }
}

async fn upsert_all(
    tx: &mut Transaction<'_, Sqlite>,
    collection: Collection,
    records: &[Value],
) -> Result<usize, StoreError> {
    let now = encode_time(Utc::now());

    for record in records {
        let id = record
            .get("id")
            .and_then(entity_key)
            .ok_or(StoreError::MissingKey { collection })?;
        let barcode = match collection {
            Collection::Products => record.get("barcode").and_then(entity_key),
            _ => None,
        };
        let data = serde_json::to_string(record)?;

        sqlx::query(
            r#"
            INSERT INTO cached_entities (collection, entity_id, barcode, data, cached_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(collection, entity_id)
            DO UPDATE SET
                barcode = excluded.barcode,
                data = excluded.data,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(collection.as_str())
        .bind(&id)
        .bind(barcode)
        .bind(&data)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }

    Ok(records.len())
}

fn row_to_entity(collection: Collection, row: SqliteRow) -> Result<CachedEntity, StoreError> {
    let id: String = row.try_get("entity_id")?;
    let data: String = row.try_get("data")?;
    let cached_at: String = row.try_get("cached_at")?;

    Ok(CachedEntity {
        collection,
        id,
        data: serde_json::from_str(&data)?,
        cached_at: decode_time(collection, &cached_at)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::test_support::temp_store;

    fn products() -> Vec<Value> {
        vec![
            json!({"id": 1, "name": "Cola", "barcode": "5449000000996", "price": 1.5}),
            json!({"id": 2, "name": "Chips", "barcode": "8710398500014", "price": 2.0}),
            json!({"id": "3", "name": "Gum", "price": 0.5}),
        ]
    }

    #[tokio::test]
    async fn save_many_is_idempotent() {
        let (store, _dir) = temp_store().await;

        store.save_many(Collection::Products, &products()).await.unwrap();
        let first: Vec<Value> = store
            .list_entities(Collection::Products)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.data)
            .collect();

        store.save_many(Collection::Products, &products()).await.unwrap();
        let second: Vec<Value> = store
            .list_entities(Collection::Products)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.data)
            .collect();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn save_many_overwrites_by_key() {
        let (store, _dir) = temp_store().await;
        store.save_many(Collection::Products, &products()).await.unwrap();

        store
            .put_entity(Collection::Products, &json!({"id": 2, "name": "Chips XL", "price": 3.0}))
            .await
            .unwrap();

        let chips = store.get_entity(Collection::Products, "2").await.unwrap().unwrap();
        assert_eq!(chips.data["name"], "Chips XL");
        assert_eq!(store.list_entities(Collection::Products).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_key_rolls_back_batch() {
        let (store, _dir) = temp_store().await;

        let err = store
            .save_many(Collection::Customers, &[json!({"id": 1, "name": "Ann"}), json!({"name": "Bob"})])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::MissingKey { collection: Collection::Customers }));
        assert!(store.list_entities(Collection::Customers).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_snapshot_drops_stale_records() {
        let (store, _dir) = temp_store().await;
        store.save_many(Collection::Products, &products()).await.unwrap();

        store
            .replace_snapshot(Collection::Products, &[json!({"id": 2, "name": "Chips"})])
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list_entities(Collection::Products)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let (store, _dir) = temp_store().await;
        store.save_many(Collection::Products, &products()).await.unwrap();
        store
            .save_many(Collection::Categories, &[json!({"id": 1, "name": "Drinks"})])
            .await
            .unwrap();

        let category = store.get_entity(Collection::Categories, "1").await.unwrap().unwrap();
        assert_eq!(category.data["name"], "Drinks");
        assert!(store.delete_entity(Collection::Categories, "1").await.unwrap());
        assert!(!store.delete_entity(Collection::Categories, "1").await.unwrap());
        assert!(store.get_entity(Collection::Products, "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn products_are_found_by_barcode() {
        let (store, _dir) = temp_store().await;
        store.save_many(Collection::Products, &products()).await.unwrap();

        let cola = store.product_by_barcode("5449000000996").await.unwrap().unwrap();
        assert_eq!(cola.id, "1");
        assert!(store.product_by_barcode("0000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sales_are_not_a_reference_collection() {
        let (store, _dir) = temp_store().await;
        let err = store.save_many(Collection::Sales, &[json!({"id": 1})]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotReferenceCollection(Collection::Sales)));
    }

    mod properties {
        use std::collections::BTreeSet;

        use proptest::prelude::*;
        use serde_json::json;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 32,
                ..ProptestConfig::default()
            })]

            /// Refreshing twice with the same server data never grows the store.
            #[test]
            fn repeated_refresh_is_stable(ids in prop::collection::vec(0u32..50, 0..40)) {
                let records: Vec<Value> = ids
                    .iter()
                    .map(|id| json!({"id": id, "name": format!("Item {id}")}))
                    .collect();

                let rt = tokio::runtime::Runtime::new().unwrap();
                let (first, second) = rt.block_on(async {
                    let (store, _dir) = temp_store().await;
                    store.replace_snapshot(Collection::Products, &records).await.unwrap();
                    let first = store.list_entities(Collection::Products).await.unwrap();
                    store.replace_snapshot(Collection::Products, &records).await.unwrap();
                    let second = store.list_entities(Collection::Products).await.unwrap();
                    (first, second)
                });

                let distinct: BTreeSet<u32> = ids.iter().copied().collect();
                prop_assert_eq!(first.len(), distinct.len());
                prop_assert_eq!(
                    first.iter().map(|e| (&e.id, &e.data)).collect::<Vec<_>>(),
                    second.iter().map(|e| (&e.id, &e.data)).collect::<Vec<_>>()
                );
            }
        }
    }
}
