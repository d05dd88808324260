use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType,
};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::HashMap;
use tracing::{debug, info};

use super::Database;
use super::models::Item;

pub struct DynamoDatabase {
    client: Client,
    table_prefix: String,
}

impl DynamoDatabase {
    pub async fn new(table_prefix: &str) -> Result<Self> {
        let config = aws_config::load_from_env().await;
        let client = Client::new(&config);

        info!(
            "Initialized DynamoDB client with table prefix: {}",
            table_prefix
        );

        let db = Self {
            client,
            table_prefix: table_prefix.to_string(),
        };

        db.create_main_table_if_not_exists().await?;

        Ok(db)
    }

    fn main_table(&self) -> String {
        format!("{}-main", self.table_prefix)
    }

    async fn create_main_table_if_not_exists(&self) -> Result<()> {
        let table_name = self.main_table();

        match self
            .client
            .describe_table()
            .table_name(&table_name)
            .send()
            .await
        {
            Ok(_) => {
                debug!("Table {} already exists", table_name);
                return Ok(());
            }
            Err(e) => {
                // LocalStack reports a missing table with several error shapes
                debug!(
                    "Table {} does not exist (error: {}), creating it",
                    table_name, e
                );
            }
        }

        info!("Creating DynamoDB table: {}", table_name);

        let pk_attr = AttributeDefinition::builder()
            .attribute_name("pk")
            .attribute_type(ScalarAttributeType::S)
            .build()?;
        let sk_attr = AttributeDefinition::builder()
            .attribute_name("sk")
            .attribute_type(ScalarAttributeType::S)
            .build()?;

        let pk_key = KeySchemaElement::builder()
            .attribute_name("pk")
            .key_type(KeyType::Hash)
            .build()?;
        let sk_key = KeySchemaElement::builder()
            .attribute_name("sk")
            .key_type(KeyType::Range)
            .build()?;

        self.client
            .create_table()
            .table_name(&table_name)
            .attribute_definitions(pk_attr)
            .attribute_definitions(sk_attr)
            .key_schema(pk_key)
            .key_schema(sk_key)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .context("Failed to create main table")?;

        info!("Created DynamoDB table: {}", table_name);
        Ok(())
    }

    fn av_s(s: impl Into<String>) -> AttributeValue {
        AttributeValue::S(s.into())
    }

    fn key(pk: &str, sk: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("pk".to_string(), Self::av_s(pk)),
            ("sk".to_string(), Self::av_s(sk)),
        ])
    }
}

fn json_to_av(value: &JsonValue) -> AttributeValue {
    match value {
        JsonValue::Null => AttributeValue::Null(true),
        JsonValue::Bool(b) => AttributeValue::Bool(*b),
        JsonValue::Number(n) => AttributeValue::N(n.to_string()),
        JsonValue::String(s) => AttributeValue::S(s.clone()),
        JsonValue::Array(values) => AttributeValue::L(values.iter().map(json_to_av).collect()),
        JsonValue::Object(fields) => AttributeValue::M(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_av(v)))
                .collect(),
        ),
    }
}

fn av_to_json(value: &AttributeValue) -> Result<JsonValue> {
    Ok(match value {
        AttributeValue::Null(_) => JsonValue::Null,
        AttributeValue::Bool(b) => JsonValue::Bool(*b),
        AttributeValue::S(s) => JsonValue::String(s.clone()),
        AttributeValue::N(n) => {
            let number = if let Ok(i) = n.parse::<i64>() {
                Number::from(i)
            } else if let Ok(u) = n.parse::<u64>() {
                Number::from(u)
            } else {
                n.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .ok_or_else(|| anyhow!("Unparseable number attribute: {}", n))?
            };
            JsonValue::Number(number)
        }
        AttributeValue::L(values) => {
            JsonValue::Array(values.iter().map(av_to_json).collect::<Result<_>>()?)
        }
        AttributeValue::M(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), av_to_json(v)?)))
                .collect::<Result<Map<_, _>>>()?,
        ),
        other => return Err(anyhow!("Unsupported attribute type: {:?}", other)),
    })
}

fn item_to_attributes(item: &Item) -> Result<HashMap<String, AttributeValue>> {
    let JsonValue::Object(fields) = &item.data else {
        return Err(anyhow!("Row {}/{} payload is not an object", item.pk, item.sk));
    };

    let mut attributes: HashMap<String, AttributeValue> = fields
        .iter()
        .map(|(k, v)| (k.clone(), json_to_av(v)))
        .collect();
    attributes.insert("pk".to_string(), AttributeValue::S(item.pk.clone()));
    attributes.insert("sk".to_string(), AttributeValue::S(item.sk.clone()));
    if let Some(ttl) = item.ttl {
        attributes.insert("ttl".to_string(), AttributeValue::N(ttl.to_string()));
    }
    Ok(attributes)
}

fn attributes_to_item(mut attributes: HashMap<String, AttributeValue>) -> Result<Item> {
    let pk = match attributes.remove("pk") {
        Some(AttributeValue::S(pk)) => pk,
        _ => return Err(anyhow!("Row is missing its partition key")),
    };
    let sk = match attributes.remove("sk") {
        Some(AttributeValue::S(sk)) => sk,
        _ => return Err(anyhow!("Row {} is missing its clustering key", pk)),
    };
    let ttl = attributes
        .remove("ttl")
        .and_then(|v| v.as_n().ok().and_then(|n| n.parse::<i64>().ok()));

    let data = attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), av_to_json(v)?)))
        .collect::<Result<Map<_, _>>>()
        .with_context(|| format!("Failed to decode row {}/{}", pk, sk))?;

    Ok(Item {
        pk,
        sk,
        ttl,
        data: JsonValue::Object(data),
    })
}

#[async_trait]
impl Database for DynamoDatabase {
    async fn get_item(&self, pk: &str, sk: &str) -> Result<Option<Item>> {
        let response = self
            .client
            .get_item()
            .table_name(self.main_table())
            .set_key(Some(Self::key(pk, sk)))
            .consistent_read(true)
            .send()
            .await
            .with_context(|| format!("Failed to get {}/{}", pk, sk))?;

        response.item.map(attributes_to_item).transpose()
    }

    async fn put_item(&self, item: Item) -> Result<()> {
        let attributes = item_to_attributes(&item)?;
        self.client
            .put_item()
            .table_name(self.main_table())
            .set_item(Some(attributes))
            .send()
            .await
            .with_context(|| format!("Failed to put {}/{}", item.pk, item.sk))?;
        Ok(())
    }

    async fn delete_item(&self, pk: &str, sk: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(self.main_table())
            .set_key(Some(Self::key(pk, sk)))
            .send()
            .await
            .with_context(|| format!("Failed to delete {}/{}", pk, sk))?;
        Ok(())
    }

    async fn query_partition(
        &self,
        pk: &str,
        sk_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let mut request = self
                .client
                .query()
                .table_name(self.main_table())
                .scan_index_forward(true)
                .consistent_read(true)
                .expression_attribute_values(":pk", Self::av_s(pk))
                .set_exclusive_start_key(start_key.take());

            request = match sk_prefix {
                Some(prefix) => request
                    .key_condition_expression("pk = :pk AND begins_with(sk, :prefix)")
                    .expression_attribute_values(":prefix", Self::av_s(prefix)),
                None => request.key_condition_expression("pk = :pk"),
            };
            if let Some(limit) = limit {
                request = request.limit((limit - items.len()) as i32);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("Failed to query partition {}", pk))?;

            for attributes in response.items.unwrap_or_default() {
                items.push(attributes_to_item(attributes)?);
            }

            let reached_limit = limit.is_some_and(|limit| items.len() >= limit);
            match response.last_evaluated_key {
                Some(key) if !reached_limit => start_key = Some(key),
                _ => break,
            }
        }

        Ok(items)
    }

    async fn scan_all(&self, pk_prefix: &str, limit: usize) -> Result<Vec<Item>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        // The filter applies after the page is read, so keep paging until the cap is met
        loop {
            let response = self
                .client
                .scan()
                .table_name(self.main_table())
                .filter_expression("begins_with(pk, :prefix)")
                .expression_attribute_values(":prefix", Self::av_s(pk_prefix))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .with_context(|| format!("Failed to scan rows with prefix {}", pk_prefix))?;

            for attributes in response.items.unwrap_or_default() {
                items.push(attributes_to_item(attributes)?);
                if items.len() >= limit {
                    return Ok(items);
                }
            }

            match response.last_evaluated_key {
                Some(key) => start_key = Some(key),
                None => break,
            }
        }

        Ok(items)
    }
}
