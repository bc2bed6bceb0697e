//! Persisting dynamos: snapshots, records and the type registry.
//!
//! A persisted dynamo is a JSON object carrying its portable type tag and
//! identifier next to its configuration fields:
//!
//! ```json
//! { "typeId": "trigger.http", "dynamoId": "…", "name": "Webhook" }
//! ```
//!
//! Decoding goes through a [`CodableRegistry`] that maps type tags to decoder
//! functions. The registry is an ordinary value, built once and passed to
//! every decode call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::capability::Configurable;
use crate::error::{IngressError, Result};
use crate::identifier::Identifier;

/// Key holding the portable type tag.
pub const TYPE_ID_KEY: &str = "typeId";

/// Key holding the dynamo identifier.
pub const DYNAMO_ID_KEY: &str = "dynamoId";

/// A dynamo kind that can be persisted.
pub trait Codable {
    /// Portable type tag written to disk.
    const TYPE_ID: &'static str;

    type Config: Configurable + Serialize + DeserializeOwned;
}

/// A point-in-time copy of a dynamo's configuration, not yet encoded.
#[derive(Clone)]
pub struct DynamoSnapshot {
    id: Identifier,
    type_id: String,
    config: Arc<dyn erased_serde::Serialize + Send + Sync>,
}

impl DynamoSnapshot {
    pub fn new<C>(id: Identifier, type_id: impl Into<String>, config: C) -> Self
    where
        C: Serialize + Send + Sync + 'static,
    {
        Self {
            id,
            type_id: type_id.into(),
            config: Arc::new(config),
        }
    }

    /// Capture the configuration of a [`Codable`] kind.
    pub fn capture<T: Codable>(id: Identifier, config: &T::Config) -> Self {
        Self::new(id, T::TYPE_ID, config.clone())
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Encode to pretty-printed JSON with sorted keys.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut object = match serde_json::to_value(&*self.config)? {
            Value::Object(object) => object,
            other => {
                return Err(IngressError::BadArguments(format!(
                    "configuration of '{}' must encode to an object, not {other}",
                    self.type_id
                )))
            }
        };
        object.insert(TYPE_ID_KEY.into(), Value::String(self.type_id.clone()));
        object.insert(DYNAMO_ID_KEY.into(), Value::String(self.id.to_string()));
        Ok(serde_json::to_vec_pretty(&Value::Object(object))?)
    }
}

impl fmt::Debug for DynamoSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamoSnapshot")
            .field("id", &self.id)
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

/// A persisted dynamo whose type tag and identifier have been read.
#[derive(Debug, Clone, PartialEq)]
pub struct CodableRecord {
    pub type_id: String,
    pub id: Identifier,
    fields: Map<String, Value>,
}

impl CodableRecord {
    /// Parse the envelope of an encoded dynamo.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut fields = match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(fields) => fields,
            _ => return Err(IngressError::Json("encoded dynamo is not an object".into())),
        };
        let type_id = match fields.remove(TYPE_ID_KEY) {
            Some(Value::String(type_id)) => type_id,
            _ => return Err(IngressError::Json(format!("missing field `{TYPE_ID_KEY}`"))),
        };
        let id = match fields.remove(DYNAMO_ID_KEY) {
            Some(Value::String(id)) => id.parse()?,
            _ => return Err(IngressError::Json(format!("missing field `{DYNAMO_ID_KEY}`"))),
        };
        Ok(Self {
            type_id,
            id,
            fields,
        })
    }

    /// Decode the configuration fields.
    pub fn config<C: DeserializeOwned>(&self) -> Result<C> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// Decoder registered for one type tag.
pub type Decoder<T, Ctx> = fn(CodableRecord, &Ctx) -> Result<T>;

/// Maps portable type tags to decoders producing `T` within context `Ctx`.
pub struct CodableRegistry<T, Ctx: ?Sized> {
    decoders: BTreeMap<String, Decoder<T, Ctx>>,
}

impl<T, Ctx: ?Sized> CodableRegistry<T, Ctx> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    /// Register `decoder` for `type_id`. A tag can be registered once.
    pub fn register(&mut self, type_id: impl Into<String>, decoder: Decoder<T, Ctx>) -> Result<()> {
        let type_id = type_id.into();
        if self.decoders.contains_key(&type_id) {
            return Err(IngressError::BadArguments(format!(
                "the dynamo type '{type_id}' is already registered"
            )));
        }
        self.decoders.insert(type_id, decoder);
        Ok(())
    }

    pub fn is_registered(&self, type_id: &str) -> bool {
        self.decoders.contains_key(type_id)
    }

    /// Registered type tags, in sorted order.
    pub fn type_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.decoders.keys().map(String::as_str)
    }

    /// Decode an encoded dynamo.
    ///
    /// An unregistered type tag is an [`IngressError::EngineVersionMismatch`].
    pub fn decode(&self, bytes: &[u8], ctx: &Ctx) -> Result<T> {
        let record = CodableRecord::parse(bytes)?;
        let decoder = self
            .decoders
            .get(&record.type_id)
            .ok_or_else(|| IngressError::unsupported_type(&record.type_id))?;
        decoder(record, ctx)
    }
}

impl<T, Ctx: ?Sized> Default for CodableRegistry<T, Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, Ctx: ?Sized> fmt::Debug for CodableRegistry<T, Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}
