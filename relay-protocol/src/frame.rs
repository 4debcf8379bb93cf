use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// A single column value. Sources emit scalars (text, number, bool, null);
/// json/jsonb columns travel as nested JSON.
pub type Value = serde_json::Value;

/// Column name to value mapping for one row.
pub type RowMap = serde_json::Map<String, Value>;

/// Column name plus the free-form type tag reported by the origin catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Ordered column descriptors for one table. Order drives positional row decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(Vec<ColumnDescriptor>);

impl Schema {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self(columns)
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ColumnDescriptor> for Schema {
    fn from_iter<I: IntoIterator<Item = ColumnDescriptor>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One row on the wire.
///
/// Senders always produce `Keyed` rows. `Positional` rows are accepted from
/// older peers and are interpreted through the most recent schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Row {
    Keyed(RowMap),
    Positional(Vec<Value>),
}

// Numbers keep their exact source digits, which untagged buffering would not.
impl<'de> Deserialize<'de> for Row {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Object(map) => Ok(Row::Keyed(map)),
            Value::Array(values) => Ok(Row::Positional(values)),
            other => Err(de::Error::custom(format!(
                "row must be a JSON object or array, got {}",
                other
            ))),
        }
    }
}

impl Row {
    /// Resolve this row into a column mapping.
    ///
    /// Positional rows require a schema with exactly as many columns as the row
    /// has values.
    pub fn resolve(&self, schema: Option<&Schema>) -> Result<RowMap, ProtocolError> {
        match self {
            Row::Keyed(map) => Ok(map.clone()),
            Row::Positional(values) => {
                let schema = schema.ok_or(ProtocolError::MissingSchema)?;
                if schema.len() != values.len() {
                    return Err(ProtocolError::ArityMismatch {
                        expected: schema.len(),
                        actual: values.len(),
                    });
                }
                Ok(schema
                    .column_names()
                    .map(str::to_string)
                    .zip(values.iter().cloned())
                    .collect())
            }
        }
    }
}

impl From<RowMap> for Row {
    fn from(map: RowMap) -> Self {
        Row::Keyed(map)
    }
}

/// The unit of transfer: optional schema plus rows in extraction order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    #[serde(default)]
    pub data: Vec<Row>,
}

impl Frame {
    pub fn new(schema: Option<Schema>, data: Vec<Row>) -> Self {
        Self { schema, data }
    }

    /// A frame with neither schema nor rows carries nothing and is never sent.
    pub fn is_empty(&self) -> bool {
        self.schema.is_none() && self.data.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.data.len()
    }
}
