//! DynamoDB backed lease store.
//!
//! Lease records live in one table keyed by `lease_key`, with an epoch-second
//! `expires_at` attribute that doubles as the table's TTL attribute. DynamoDB
//! deletes expired items lazily, so every read filters on `expires_at` itself.
//! Sets are stored as a string-set attribute on an item keyed `set:{name}`.

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dynomite::{
    dynamodb::{
        AttributeValue, DeleteItemInput, DynamoDb, DynamoDbClient, GetItemInput,
        PutItemError, PutItemInput, ScanInput, UpdateItemInput,
    },
    AttributeError::{self, MissingField},
    Attributes, FromAttributes, Item,
};
use futures_retry::FutureRetry;
use rusoto_core::{Region, RusotoError};

use super::store::{Entry, LeaseStore};
use crate::{error::StoreError, util::retry::FixedCountWithDelayStrategy};

const SET_PREFIX: &str = "set:";
const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Item, Debug, Clone, PartialEq)]
pub(crate) struct LeaseRecord {
    #[dynomite(partition_key)]
    pub(crate) lease_key: String,
    pub(crate) value: String,
    pub(crate) expires_at: u64,
}

impl LeaseRecord {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }

    fn into_entry(self) -> Entry {
        Entry {
            value: self.value,
            expires_at: Utc.timestamp_opt(self.expires_at as i64, 0).single(),
        }
    }
}

pub struct LeaseBroker {
    dynamo_client: DynamoDbClient,
    table: String,
}

impl LeaseBroker {
    pub fn new(dynamo_client: DynamoDbClient, table: impl Into<String>) -> Self {
        Self {
            dynamo_client,
            table: table.into(),
        }
    }

    /// Connects to `region`, or to `endpoint` when one is given (dynamodb-local).
    pub fn connect(
        table: impl Into<String>,
        region: &str,
        endpoint: Option<String>,
    ) -> Result<Self, StoreError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                name: region.to_string(),
                endpoint,
            },
            None => region
                .parse::<Region>()
                .map_err(|e| StoreError::unavailable("connect", e))?,
        };
        Ok(Self::new(DynamoDbClient::new(region), table))
    }

    fn key_of(&self, key: &str) -> Attributes {
        let mut attributes = HashMap::new();
        attributes.insert("lease_key".to_string(), string_attr(key));
        attributes
    }

    fn set_key(&self, set: &str) -> Attributes {
        self.key_of(&format!("{}{}", SET_PREFIX, set))
    }

    async fn update_set(
        &self,
        operation: &'static str,
        expression: &str,
        set: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut values = HashMap::new();
        values.insert(
            ":m".to_string(),
            AttributeValue {
                ss: Some(vec![member.to_string()]),
                ..AttributeValue::default()
            },
        );
        let input = UpdateItemInput {
            table_name: self.table.clone(),
            key: self.set_key(set),
            update_expression: Some(expression.to_string()),
            expression_attribute_values: Some(values),
            ..UpdateItemInput::default()
        };
        let client = &self.dynamo_client;
        with_retry(|| {
            let input = input.clone();
            async move {
                client
                    .update_item(input)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(operation, e))
            }
        })
        .await
    }
}

#[async_trait]
impl LeaseStore for LeaseBroker {
    async fn conditional_set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let now = epoch_seconds();
        let record = LeaseRecord {
            lease_key: key.to_string(),
            value: value.to_string(),
            expires_at: now.saturating_add(ttl.as_secs().max(1)),
        };
        let mut input = PutItemInput {
            table_name: self.table.clone(),
            item: record.into(),
            ..PutItemInput::default()
        };
        if only_if_absent {
            // An expired item still physically present counts as absent.
            input.condition_expression =
                Some("attribute_not_exists(lease_key) OR expires_at <= :now".to_string());
            input.expression_attribute_values = Some(now_value(now));
        }

        let client = &self.dynamo_client;
        with_retry(|| {
            let input = input.clone();
            async move {
                match client.put_item(input).await {
                    Ok(_) => Ok(true),
                    Err(RusotoError::Service(PutItemError::ConditionalCheckFailed(_))) => Ok(false),
                    Err(e) => Err(classify("conditional_set", e)),
                }
            }
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let input = GetItemInput {
            table_name: self.table.clone(),
            key: self.key_of(key),
            consistent_read: Some(true),
            ..GetItemInput::default()
        };
        let client = &self.dynamo_client;
        let item = with_retry(|| {
            let input = input.clone();
            async move {
                client
                    .get_item(input)
                    .await
                    .map(|output| output.item)
                    .map_err(|e| classify("get", e))
            }
        })
        .await?;

        match item {
            Some(attributes) => {
                let record = parse_record(attributes)?;
                Ok(Some(record)
                    .filter(|record| record.is_live(epoch_seconds()))
                    .map(LeaseRecord::into_entry))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let input = DeleteItemInput {
            table_name: self.table.clone(),
            key: self.key_of(key),
            return_values: Some("ALL_OLD".to_string()),
            ..DeleteItemInput::default()
        };
        let client = &self.dynamo_client;
        let old = with_retry(|| {
            let input = input.clone();
            async move {
                client
                    .delete_item(input)
                    .await
                    .map(|output| output.attributes)
                    .map_err(|e| classify("delete", e))
            }
        })
        .await?;

        match old {
            Some(attributes) if !attributes.is_empty() => {
                Ok(parse_record(attributes)?.is_live(epoch_seconds()))
            }
            _ => Ok(false),
        }
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.update_set("add_to_set", "ADD members :m", set, member)
            .await
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.update_set("remove_from_set", "DELETE members :m", set, member)
            .await
    }

    async fn members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        let input = GetItemInput {
            table_name: self.table.clone(),
            key: self.set_key(set),
            consistent_read: Some(true),
            ..GetItemInput::default()
        };
        let client = &self.dynamo_client;
        let item = with_retry(|| {
            let input = input.clone();
            async move {
                client
                    .get_item(input)
                    .await
                    .map(|output| output.item)
                    .map_err(|e| classify("members", e))
            }
        })
        .await?;

        // An emptied string set disappears from the item altogether.
        Ok(item
            .and_then(|mut attributes| attributes.remove("members"))
            .and_then(|members| members.ss)
            .map(|members| members.into_iter().collect())
            .unwrap_or_default())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut values = now_value(epoch_seconds());
        values.insert(":prefix".to_string(), string_attr(prefix));

        let client = &self.dynamo_client;
        let mut keys = Vec::new();
        let mut exclusive_start_key = None;
        loop {
            let input = ScanInput {
                table_name: self.table.clone(),
                consistent_read: Some(true),
                filter_expression: Some(
                    "begins_with(lease_key, :prefix) AND expires_at > :now".to_string(),
                ),
                expression_attribute_values: Some(values.clone()),
                projection_expression: Some("lease_key".to_string()),
                exclusive_start_key: exclusive_start_key.take(),
                ..ScanInput::default()
            };
            let output = with_retry(|| {
                let input = input.clone();
                async move { client.scan(input).await.map_err(|e| classify("scan", e)) }
            })
            .await?;

            keys.extend(
                output
                    .items
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|mut item| item.remove("lease_key"))
                    .filter_map(|key| key.s),
            );
            match output.last_evaluated_key {
                Some(last) if !last.is_empty() => exclusive_start_key = Some(last),
                _ => break,
            }
        }
        Ok(keys)
    }
}

async fn with_retry<T, F, Fut>(call: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = Result<T, StoreError>>,
{
    FutureRetry::new(
        call,
        FixedCountWithDelayStrategy::new(MAX_ATTEMPTS, RETRY_DELAY),
    )
    .await
    .map(|(value, _attempts)| value)
    .map_err(|(e, _attempts)| e)
}

fn classify<E: std::error::Error + 'static>(operation: &'static str, err: RusotoError<E>) -> StoreError {
    match err {
        RusotoError::HttpDispatch(e) => StoreError::transient(operation, e),
        RusotoError::Service(e) => {
            // Service errors are per-operation enums; the variant name is all
            // they have in common.
            let variant = format!("{:?}", e);
            if variant.starts_with("ProvisionedThroughputExceeded")
                || variant.starts_with("RequestLimitExceeded")
                || variant.starts_with("InternalServerError")
            {
                StoreError::transient(operation, e)
            } else {
                StoreError::unavailable(operation, e)
            }
        }
        other => StoreError::unavailable(operation, other),
    }
}

fn parse_record(attributes: Attributes) -> Result<LeaseRecord, StoreError> {
    LeaseRecord::from_attrs(attributes).map_err(|err| match err {
        AttributeError::InvalidFormat => {
            StoreError::Malformed("attribute contains an invalid format".to_string())
        }
        AttributeError::InvalidType => {
            StoreError::Malformed("attribute contains invalid type".to_string())
        }
        MissingField { name } => StoreError::Malformed(format!("attribute '{}' was missing", name)),
    })
}

fn string_attr(value: &str) -> AttributeValue {
    AttributeValue {
        s: Some(value.to_string()),
        ..AttributeValue::default()
    }
}

fn now_value(now: u64) -> HashMap<String, AttributeValue> {
    let mut values = HashMap::new();
    values.insert(
        ":now".to_string(),
        AttributeValue {
            n: Some(now.to_string()),
            ..AttributeValue::default()
        },
    );
    values
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
