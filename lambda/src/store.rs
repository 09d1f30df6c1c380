//! Item persistence.
//!
//! [`ItemStore`] is the only way handlers touch data. [`DynamoStore`] uses
//! exactly the table actions the execution role grants; [`MemoryStore`]
//! backs local runs and tests.

use crate::errors::ApiError;
use crate::lists::{Record, RecordKind, RecordUpdate, Status};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, ReturnValue, WriteRequest};
use infra::table::{ItemKey, PARTITION_KEY, SORT_KEY};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Maximum number of requests in one `BatchWriteItem` call.
const BATCH_WRITE_LIMIT: usize = 25;
/// Attempts at flushing unprocessed batch items.
const BATCH_WRITE_ATTEMPTS: usize = 5;

const ATTR_TYPE: &str = "type";
const ATTR_LIST_ID: &str = "listID";
const ATTR_TASK_ID: &str = "taskID";
const ATTR_TITLE: &str = "title";
const ATTR_STATUS: &str = "status";
const ATTR_CREATED_AT: &str = "createdAt";
const ATTR_UPDATED_AT: &str = "updatedAt";

/// Record storage keyed by [`ItemKey`].
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Reads one record.
    async fn get(&self, key: &ItemKey) -> Result<Option<Record>, ApiError>;

    /// Writes a record, replacing any record with the same key.
    async fn put(&self, record: &Record) -> Result<(), ApiError>;

    /// Applies `update` to an existing record. Returns `None` when the record does not exist.
    async fn update(
        &self,
        key: &ItemKey,
        update: &RecordUpdate,
    ) -> Result<Option<Record>, ApiError>;

    /// Deletes a record. Returns whether it existed.
    async fn delete(&self, key: &ItemKey) -> Result<bool, ApiError>;

    /// Every record in partition `pk` whose sort key starts with `sk_prefix`, in sort key order.
    async fn query_prefix(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>, ApiError>;

    /// Deletes many records.
    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<(), ApiError>;
}

// =============================================================================
// DynamoDB
// =============================================================================

/// Store backed by the items table.
#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn key_attributes(key: &ItemKey) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (PARTITION_KEY.to_string(), AttributeValue::S(key.pk.clone())),
        (SORT_KEY.to_string(), AttributeValue::S(key.sk.clone())),
    ])
}

fn record_to_item(record: &Record) -> HashMap<String, AttributeValue> {
    let mut item = key_attributes(&record.key);
    item.insert(ATTR_TYPE.to_string(), AttributeValue::S(record.kind.as_str().to_string()));
    item.insert(ATTR_LIST_ID.to_string(), AttributeValue::S(record.list_id.clone()));
    if let Some(ref task_id) = record.task_id {
        item.insert(ATTR_TASK_ID.to_string(), AttributeValue::S(task_id.clone()));
    }
    item.insert(ATTR_TITLE.to_string(), AttributeValue::S(record.title.clone()));
    item.insert(ATTR_STATUS.to_string(), AttributeValue::S(record.status.as_str().to_string()));
    item.insert(ATTR_CREATED_AT.to_string(), AttributeValue::S(record.created_at.clone()));
    item.insert(ATTR_UPDATED_AT.to_string(), AttributeValue::S(record.updated_at.clone()));
    item
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<String, ApiError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| ApiError::Database(format!("Missing {name}")))
}

fn record_from_item(item: &HashMap<String, AttributeValue>) -> Result<Record, ApiError> {
    let key = ItemKey::new(string_attr(item, PARTITION_KEY)?, string_attr(item, SORT_KEY)?)
        .map_err(|e| ApiError::Database(e.to_string()))?;
    let status: Status = string_attr(item, ATTR_STATUS)?
        .parse()
        .map_err(|e: ApiError| ApiError::Database(e.to_string()))?;

    Ok(Record {
        key,
        kind: string_attr(item, ATTR_TYPE)?.parse::<RecordKind>()?,
        list_id: string_attr(item, ATTR_LIST_ID)?,
        task_id: string_attr(item, ATTR_TASK_ID).ok(),
        title: string_attr(item, ATTR_TITLE)?,
        status,
        created_at: string_attr(item, ATTR_CREATED_AT)?,
        updated_at: string_attr(item, ATTR_UPDATED_AT)?,
    })
}

#[async_trait]
impl ItemStore for DynamoStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<Record>, ApiError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(key_attributes(key)))
            .send()
            .await
            .map_err(|e| ApiError::Database(e.to_string()))?;

        result.item.as_ref().map(record_from_item).transpose()
    }

    async fn put(&self, record: &Record) -> Result<(), ApiError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_to_item(record)))
            .send()
            .await
            .map_err(|e| ApiError::Database(e.to_string()))?;

        debug!(pk = %record.key.pk, sk = %record.key.sk, "Stored record");
        Ok(())
    }

    async fn update(
        &self,
        key: &ItemKey,
        update: &RecordUpdate,
    ) -> Result<Option<Record>, ApiError> {
        let mut assignments = vec!["#updatedAt = :updatedAt".to_string()];
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(key_attributes(key)))
            .condition_expression("attribute_exists(#pk)")
            .expression_attribute_names("#pk", PARTITION_KEY)
            .expression_attribute_names("#updatedAt", ATTR_UPDATED_AT)
            .expression_attribute_values(":updatedAt", AttributeValue::S(update.updated_at.clone()))
            .return_values(ReturnValue::AllNew);

        if let Some(ref title) = update.title {
            assignments.push("#title = :title".to_string());
            request = request
                .expression_attribute_names("#title", ATTR_TITLE)
                .expression_attribute_values(":title", AttributeValue::S(title.clone()));
        }
        if let Some(status) = update.status {
            assignments.push("#status = :status".to_string());
            request = request
                .expression_attribute_names("#status", ATTR_STATUS)
                .expression_attribute_values(
                    ":status",
                    AttributeValue::S(status.as_str().to_string()),
                );
        }

        let result = request
            .update_expression(format!("SET {}", assignments.join(", ")))
            .send()
            .await;

        match result {
            Ok(output) => output.attributes.as_ref().map(record_from_item).transpose(),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_conditional_check_failed_exception() {
                    Ok(None)
                } else {
                    Err(ApiError::Database(service_error.to_string()))
                }
            }
        }
    }

    async fn delete(&self, key: &ItemKey) -> Result<bool, ApiError> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(key_attributes(key)))
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .map_err(|e| ApiError::Database(e.to_string()))?;

        Ok(result.attributes.is_some_and(|a| !a.is_empty()))
    }

    async fn query_prefix(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>, ApiError> {
        let mut records = Vec::new();
        let mut start_key = None;

        loop {
            let result = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("#pk = :pk AND begins_with(#sk, :prefix)")
                .expression_attribute_names("#pk", PARTITION_KEY)
                .expression_attribute_names("#sk", SORT_KEY)
                .expression_attribute_values(":pk", AttributeValue::S(pk.to_string()))
                .expression_attribute_values(":prefix", AttributeValue::S(sk_prefix.to_string()))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| ApiError::Database(e.to_string()))?;

            for item in result.items() {
                records.push(record_from_item(item)?);
            }

            match result.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<(), ApiError> {
        for chunk in keys.chunks(BATCH_WRITE_LIMIT) {
            let mut pending = chunk
                .iter()
                .map(|key| {
                    DeleteRequest::builder()
                        .set_key(Some(key_attributes(key)))
                        .build()
                        .map(|request| WriteRequest::builder().delete_request(request).build())
                        .map_err(|e| ApiError::Internal(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            for attempt in 1..=BATCH_WRITE_ATTEMPTS {
                let result = self
                    .client
                    .batch_write_item()
                    .request_items(&self.table_name, pending)
                    .send()
                    .await
                    .map_err(|e| ApiError::Database(e.to_string()))?;

                pending = result
                    .unprocessed_items
                    .and_then(|mut items| items.remove(&self.table_name))
                    .unwrap_or_default();
                if pending.is_empty() {
                    break;
                }
                warn!(attempt, remaining = pending.len(), "Retrying unprocessed batch deletes");
                tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
            }

            if !pending.is_empty() {
                return Err(ApiError::Database(format!(
                    "{} deletes left unprocessed",
                    pending.len()
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Store holding records in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<ItemKey, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every stored key, in key order.
    pub async fn keys(&self) -> Vec<ItemKey> {
        self.records.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<Record>, ApiError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, record: &Record) -> Result<(), ApiError> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn update(
        &self,
        key: &ItemKey,
        update: &RecordUpdate,
    ) -> Result<Option<Record>, ApiError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(None);
        };
        if let Some(ref title) = update.title {
            record.title = title.clone();
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        record.updated_at = update.updated_at.clone();
        Ok(Some(record.clone()))
    }

    async fn delete(&self, key: &ItemKey) -> Result<bool, ApiError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn query_prefix(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>, ApiError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.key.pk == pk && r.key.sk.starts_with(sk_prefix))
            .cloned()
            .collect())
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<(), ApiError> {
        let mut records = self.records.write().await;
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::{list_sk, task_prefix, user_pk};

    fn list(sub: &str, id: &str) -> Record {
        Record::new_list(sub, id, "List", "2026-01-01T00:00:00Z").unwrap()
    }

    fn task(sub: &str, list_id: &str, id: &str) -> Record {
        Record::new_task(sub, list_id, id, "Task", "2026-01-01T00:00:00Z").unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let record = list("u1", "l1");
        store.put(&record).await.unwrap();
        assert_eq!(store.get(&record.key).await.unwrap(), Some(record.clone()));

        let update = RecordUpdate {
            title: Some("Renamed".to_string()),
            status: Some(Status::Done),
            updated_at: "2026-01-02T00:00:00Z".to_string(),
        };
        let updated = store.update(&record.key, &update).await.unwrap().unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.status, Status::Done);
        assert_eq!(updated.created_at, "2026-01-01T00:00:00Z");

        assert!(store.delete(&record.key).await.unwrap());
        assert!(!store.delete(&record.key).await.unwrap());
        assert!(store.update(&record.key, &update).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_prefix_query_is_partitioned() {
        let store = MemoryStore::new();
        let records = [
            list("u1", "l1"),
            task("u1", "l1", "t1"),
            list("u1", "l10"),
            list("u2", "l1"),
        ];
        for record in records {
            store.put(&record).await.unwrap();
        }

        let all = store.query_prefix(&user_pk("u1"), "LIST#").await.unwrap();
        assert_eq!(all.len(), 3);

        let tasks = store.query_prefix(&user_pk("u1"), &task_prefix("l1")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id.as_deref(), Some("t1"));

        let other = store.query_prefix(&user_pk("u2"), &list_sk("l1")).await.unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_batch_delete() {
        let store = MemoryStore::new();
        let records = [list("u1", "l1"), task("u1", "l1", "t1"), task("u1", "l1", "t2")];
        for record in &records {
            store.put(record).await.unwrap();
        }
        let keys: Vec<_> = records.iter().take(2).map(|r| r.key.clone()).collect();
        store.batch_delete(&keys).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn test_item_round_trip_keeps_layout() {
        let record = task("u1", "l1", "t1");
        let item = record_to_item(&record);
        assert_eq!(item[PARTITION_KEY], AttributeValue::S("USER#u1".to_string()));
        assert_eq!(item[SORT_KEY], AttributeValue::S("LIST#l1#TASK#t1".to_string()));
        assert_eq!(item[ATTR_TYPE], AttributeValue::S("task".to_string()));
        assert_eq!(record_from_item(&item).unwrap(), record);
    }

    #[test]
    fn test_corrupt_item_is_a_database_error() {
        let mut item = record_to_item(&list("u1", "l1"));
        item.remove(ATTR_TITLE);
        assert!(matches!(record_from_item(&item), Err(ApiError::Database(_))));
    }
}
