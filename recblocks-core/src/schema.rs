//! Tabular schema with semantic tags for column selection

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bundle::TensorBundle;
use crate::error::{Error, Result};

/// Semantic label attached to a column
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Tag {
    /// Categorical (integer id) column
    Categorical,
    /// Continuous (real valued) column
    Continuous,
    /// Multi-valued column
    List,
    /// Item feature
    Item,
    /// Item identifier
    ItemId,
    /// User feature
    User,
    /// User identifier
    UserId,
    /// Context feature
    Context,
    /// Session feature
    Session,
    /// Binary classification target
    BinaryClassification,
    /// Regression target
    Regression,
    /// Generic target
    Target,
    /// Bias feature (e.g. position)
    Bias,
    /// Raw text
    Text,
    /// Any other label, stored lowercase
    Custom(String),
}

impl Tag {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &str {
        match self {
            Tag::Categorical => "categorical",
            Tag::Continuous => "continuous",
            Tag::List => "list",
            Tag::Item => "item",
            Tag::ItemId => "item_id",
            Tag::User => "user",
            Tag::UserId => "user_id",
            Tag::Context => "context",
            Tag::Session => "session",
            Tag::BinaryClassification => "binary_classification",
            Tag::Regression => "regression",
            Tag::Target => "target",
            Tag::Bias => "bias",
            Tag::Text => "text",
            Tag::Custom(name) => name,
        }
    }
}

impl FromStr for Tag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Ok(match normalized.as_str() {
            "categorical" => Tag::Categorical,
            "continuous" => Tag::Continuous,
            "list" => Tag::List,
            "item" => Tag::Item,
            "item_id" => Tag::ItemId,
            "user" => Tag::User,
            "user_id" => Tag::UserId,
            "context" => Tag::Context,
            "session" => Tag::Session,
            "binary_classification" | "binary" => Tag::BinaryClassification,
            "regression" => Tag::Regression,
            "target" => Tag::Target,
            "bias" => Tag::Bias,
            "text" => Tag::Text,
            _ => Tag::Custom(normalized),
        })
    }
}

impl From<String> for Tag {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(tag) => tag,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::from(s.to_string())
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
}

/// Inclusive bounds on a column's values (cardinality for categoricals)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    /// Smallest value
    pub min: f64,
    /// Largest value
    pub max: f64,
}

/// Range of values per row for multi-valued columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCount {
    /// Fewest values in a row
    pub min: usize,
    /// Most values in a row
    pub max: usize,
}

/// Description of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,

    /// Semantic tags
    pub tags: BTreeSet<Tag>,

    /// Storage type
    pub dtype: DataType,

    /// Value bounds
    pub domain: Option<Domain>,

    /// Values per row, set for multi-valued columns
    pub value_count: Option<ValueCount>,
}

impl ColumnSchema {
    /// Create an untagged continuous column
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tags: BTreeSet::new(),
            dtype: DataType::Float32,
            domain: None,
            value_count: None,
        }
    }

    /// Create a categorical column with ids in `0..=num_items`
    pub fn categorical(name: &str, num_items: usize) -> Self {
        let mut column = Self::new(name).with_tags([Tag::Categorical]);
        column.dtype = DataType::Int64;
        #[allow(clippy::cast_precision_loss)]
        let max = num_items as f64;
        column.domain = Some(Domain { min: 0.0, max });
        column
    }

    /// Create a continuous column bounded by `min..=max`
    pub fn continuous(name: &str, min: f64, max: f64) -> Self {
        let mut column = Self::new(name).with_tags([Tag::Continuous]);
        column.domain = Some(Domain { min, max });
        column
    }

    /// Add tags
    #[must_use]
    pub fn with_tags<T: Into<Tag>>(mut self, tags: impl IntoIterator<Item = T>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Mark as multi-valued with the given per-row value range
    #[must_use]
    pub fn with_value_count(mut self, min: usize, max: usize) -> Self {
        self.value_count = Some(ValueCount { min, max });
        self.tags.insert(Tag::List);
        self
    }

    /// Whether the column carries `tag`
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// Whether rows can hold a varying number of values
    pub fn is_ragged(&self) -> bool {
        self.value_count.is_some_and(|vc| vc.min != vc.max)
    }
}

/// An ordered set of column descriptions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,

    #[serde(skip)]
    column_indices: HashMap<String, usize>,
}

impl Schema {
    /// Create a schema from columns
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        let mut schema = Self {
            columns,
            column_indices: HashMap::new(),
        };
        schema.rebuild_index();
        schema
    }

    fn rebuild_index(&mut self) {
        self.column_indices = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| (column.name.clone(), i))
            .collect();
    }

    /// All columns
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Result<&ColumnSchema> {
        self.column_indices
            .get(name)
            .map(|&i| &self.columns[i])
            .ok_or_else(|| Error::MissingColumn(name.to_string()))
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn filtered(&self, keep: impl Fn(&ColumnSchema) -> bool) -> Self {
        Self::new(self.columns.iter().filter(|c| keep(c)).cloned().collect())
    }

    /// Columns carrying any of `tags`
    pub fn select_by_tag(&self, tags: &[Tag]) -> Self {
        self.filtered(|c| tags.iter().any(|t| c.has_tag(t)))
    }

    /// Columns carrying none of `tags`
    pub fn remove_by_tag(&self, tags: &[Tag]) -> Self {
        self.filtered(|c| !tags.iter().any(|t| c.has_tag(t)))
    }

    /// Columns with the given names, in the order given
    pub fn select_by_name(&self, names: &[&str]) -> Result<Self> {
        let columns = names
            .iter()
            .map(|name| self.column(name).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(columns))
    }

    /// Entries of `bundle` that belong to this schema
    pub fn filter_columns_from_bundle(&self, bundle: &TensorBundle) -> TensorBundle {
        bundle
            .iter()
            .filter(|(name, _)| self.column_indices.contains_key(*name))
            .map(|(name, value)| (name, value.clone()))
            .collect()
    }

    /// Maximum values per row for every multi-valued column
    pub fn max_value_counts(&self) -> HashMap<String, usize> {
        self.columns
            .iter()
            .filter_map(|c| c.value_count.map(|vc| (c.name.clone(), vc.max)))
            .collect()
    }

    /// Serialize this schema to a binary format
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::Serialization)
    }

    /// Deserialize a schema from a binary format
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut schema: Self = bincode::deserialize(data).map_err(Error::Serialization)?;
        schema.rebuild_index();
        Ok(schema)
    }
}

impl<'a> IntoIterator for &'a Schema {
    type Item = &'a ColumnSchema;
    type IntoIter = std::slice::Iter<'a, ColumnSchema>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Schema: {} columns", self.columns.len())?;
        for column in &self.columns {
            let tags: Vec<&str> = column.tags.iter().map(Tag::as_str).collect();
            writeln!(f, "  {} [{}]", column.name, tags.join(", "))?;
        }
        Ok(())
    }
}
