use super::error::GroveError;
use super::interval::Interval;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Wrapper around UUID with proper parsing and serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroveId(Uuid);

impl GroveId {
    /// Create a new random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> Result<Self, GroveError> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| GroveError::InvalidId(format!("{s:?}: {e}")))
    }
}

impl Default for GroveId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroveId {
    type Err = GroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl From<Uuid> for GroveId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<GroveId> for Uuid {
    fn from(id: GroveId) -> Self {
        id.0
    }
}

impl Serialize for GroveId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for GroveId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for GroveId {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "UUID".into()
    }

    fn json_schema(gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
        gen.subschema_for::<String>()
    }
}

/// Unique identifier for a tree
pub type TreeId = GroveId;

/// Unique identifier for a node within a tree
pub type NodeId = GroveId;

/// Unique identifier for a category
pub type CategoryId = GroveId;

/// Unique identifier for an edge
pub type EdgeId = GroveId;

// ============================================================================
// Property bag
// ============================================================================

/// Key of the sub-map holding named counters.
pub const COUNTERS_KEY: &str = "counters";

/// Key of the conventional node type attribute.
pub const TYPE_KEY: &str = "type";

/// Semi-structured JSON properties attached to trees, nodes and edges.
///
/// Always a JSON object. Named counters live under `counters`, a node's
/// kind (if any) under `type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Properties(Map<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `type` attribute, when it is a string
    pub fn node_type(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(Value::as_str)
    }

    /// The `counters` sub-map, when present and an object
    pub fn counters(&self) -> Option<&Map<String, Value>> {
        self.0.get(COUNTERS_KEY).and_then(Value::as_object)
    }

    /// Current integer value of a named counter
    pub fn counter(&self, name: &str) -> Option<i64> {
        self.counters()
            .and_then(|counters| counters.get(name))
            .and_then(Value::as_i64)
    }

    /// `self @> other`: every key of `other` is present here with a
    /// containing value. Values are compared below the top level, so
    /// `{"tags": ["a"]}` does not contain `{"tags": "a"}`.
    pub fn contains(&self, other: &Properties) -> bool {
        contains_object(&self.0, &other.0)
    }
}

impl TryFrom<Value> for Properties {
    type Error = GroveError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(GroveError::InvalidProperties(other.to_string())),
        }
    }
}

impl From<Map<String, Value>> for Properties {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Properties> for Value {
    fn from(props: Properties) -> Self {
        Value::Object(props.0)
    }
}

/// Containment between JSON values with jsonb `@>` semantics.
///
/// Objects contain objects key-wise, arrays contain every needle element
/// somewhere, scalars must be equal. Only at the top level may an array
/// contain a bare scalar it holds.
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(hay), scalar) if !scalar.is_object() && !scalar.is_array() => {
            hay.contains(scalar)
        }
        _ => contains_nested(haystack, needle),
    }
}

fn contains_nested(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(hay), Value::Object(need)) => contains_object(hay, need),
        (Value::Array(hay), Value::Array(need)) => need
            .iter()
            .all(|n| hay.iter().any(|h| contains_nested(h, n))),
        (a, b) => a == b,
    }
}

fn contains_object(hay: &Map<String, Value>, need: &Map<String, Value>) -> bool {
    need.iter()
        .all(|(k, v)| hay.get(k).is_some_and(|h| contains_nested(h, v)))
}

/// A validated property key, safe to embed in a JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct PropertyKey(String);

/// Name of a counter stored under `properties.counters`.
pub type CounterName = PropertyKey;

impl PropertyKey {
    pub fn new(name: impl Into<String>) -> Result<Self, GroveError> {
        let name = name.into();
        if name.is_empty() || name.contains(['"', '\\']) {
            return Err(GroveError::InvalidKey(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of this key at the top level of a JSON object
    pub(crate) fn path(&self) -> String {
        format!("$.\"{}\"", self.0)
    }

    /// Path of this key inside the `counters` sub-map
    pub(crate) fn counter_path(&self) -> String {
        format!("$.{}.\"{}\"", COUNTERS_KEY, self.0)
    }
}

impl TryFrom<String> for PropertyKey {
    type Error = GroveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PropertyKey> for String {
    fn from(key: PropertyKey) -> Self {
        key.0
    }
}

impl FromStr for PropertyKey {
    type Err = GroveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

/// A named root collection of nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub name: String,
    pub properties: Properties,
    /// Creation timestamp (Unix seconds)
    pub created_at: i64,
    /// Last modified timestamp (Unix seconds); bumped by every structural mutation
    pub updated_at: i64,
}

/// A vertex of a tree with its nested-set interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub tree_id: TreeId,

    /// Parent node (None for roots)
    pub parent_id: Option<NodeId>,

    pub name: String,

    /// Display order among siblings; not unique, not structural
    pub position: i64,

    pub properties: Properties,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<CategoryId>,

    /// Euler-tour enter number
    pub left: i64,

    /// Euler-tour exit number
    pub right: i64,

    /// Hops from the root (roots are 0)
    pub depth: i64,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Node {
    pub fn interval(&self) -> Interval {
        Interval {
            left: self.left,
            right: self.right,
            depth: self.depth,
        }
    }

    /// Whether `other` lies strictly inside this node's subtree
    pub fn is_ancestor_of(&self, other: &Node) -> bool {
        self.tree_id == other.tree_id && self.interval().contains(&other.interval())
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A node annotated with its distance from the origin of a traversal.
///
/// For paths the origin is the root end (`level == depth`); for subtrees
/// it is the queried node (`level == 0` for the node itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    #[serde(flatten)]
    pub node: Node,
    pub level: i64,
}

/// A classification shared across trees; forms its own parent hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CategoryId>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A typed, directed link between two nodes of the same tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub tree_id: TreeId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub edge_type: String,
    pub properties: Properties,
    pub created_at: i64,
}

// ============================================================================
// Inputs
// ============================================================================

/// Input for `create_node`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewNode {
    /// Display name
    pub name: String,

    /// Parent node; omit to create a root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,

    /// Sibling position; defaults to one past the current last sibling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,

    /// Initial properties
    #[serde(default)]
    pub properties: Properties,

    /// Category reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<CategoryId>,
}

impl NewNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn under(mut self, parent_id: NodeId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn at(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn in_category(mut self, category_id: CategoryId) -> Self {
        self.category_id = Some(category_id);
        self
    }
}

/// Non-structural node update. Reparenting goes through `move_subtree`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NodePatch {
    /// New display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// New sibling position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,

    /// Replacement properties (whole object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,

    /// `null` clears the category, a UUID sets it, absence leaves it alone
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<CategoryId>")]
    pub category_id: Option<Option<CategoryId>>,
}

/// Input for `create_tree`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NewTree {
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

/// Update of tree name and/or properties
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TreePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

/// Update of a category; `parent_id: null` detaches it
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CategoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<CategoryId>")]
    pub parent_id: Option<Option<CategoryId>>,
}

/// Input for `create_edge`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewEdge {
    pub source_id: NodeId,
    pub target_id: NodeId,
    /// Relationship kind, e.g. "depends_on"
    pub edge_type: String,
    #[serde(default)]
    pub properties: Properties,
}

/// Distinguishes an explicit `null` from an absent field.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
