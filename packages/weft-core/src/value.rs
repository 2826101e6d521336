//! The prop and output value model.
//!
//! Values are plain data with `Rc`-shared composites: cloning a list or a map
//! shares the allocation, and that shared identity is what the deployment
//! scheduler walks to derive dependencies between instances. An [`Accessor`]
//! variant carries a live reactive read; snapshotting props resolves it.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A zero-arg reactive read producing a [`Value`].
pub type ValueAccessor = Rc<dyn Fn() -> Value>;

/// A dynamically typed prop or output value.
#[derive(Clone, Default)]
pub enum Value {
    /// A prop that is not yet available. Instances with undefined props are
    /// registered but withheld from the scheduler until they fill in.
    Undefined,
    /// An explicit null.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating-point number. `NaN` compares equal to itself.
    Float(f64),
    /// A string.
    Str(Rc<str>),
    /// A list with shared identity.
    List(Rc<Vec<Value>>),
    /// An ordered map with shared identity.
    Map(Rc<IndexMap<String, Value>>),
    /// A live reactive read, resolved when props are snapshotted.
    Accessor(ValueAccessor),
}

impl Value {
    /// Build an accessor value from a closure.
    pub fn accessor(f: impl Fn() -> Value + 'static) -> Self {
        Value::Accessor(Rc::new(f))
    }

    /// Build a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    /// Build a list value.
    pub fn list(values: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Rc::new(values.into_iter().collect()))
    }

    /// Build a map value.
    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Map(Rc::new(entries.into_iter().collect()))
    }

    /// `true` for everything except `Undefined`, `Null`, `false`, `0`, `0.0`,
    /// `NaN`, and the empty string.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::List(_) | Value::Map(_) => true,
            Value::Accessor(_) => true,
        }
    }

    /// `true` if this is [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// The string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer content, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// `true` if the value contains an accessor anywhere.
    fn needs_resolution(&self) -> bool {
        match self {
            Value::Accessor(_) => true,
            Value::List(list) => list.iter().any(Value::needs_resolution),
            Value::Map(map) => map.values().any(Value::needs_resolution),
            _ => false,
        }
    }

    /// Resolve every accessor in the value. Subtrees without accessors keep
    /// their shared allocation, preserving identity for dependency walks.
    /// Accessors are invoked in the caller's tracking scope, so resolving
    /// inside a computation subscribes it to the underlying signals.
    pub fn resolved(&self) -> Value {
        match self {
            Value::Accessor(f) => f().resolved(),
            Value::List(list) if self.needs_resolution() => {
                Value::List(Rc::new(list.iter().map(Value::resolved).collect()))
            }
            Value::Map(map) if self.needs_resolution() => Value::Map(Rc::new(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.resolved()))
                    .collect(),
            )),
            other => other.clone(),
        }
    }

    /// Per-field reference equality: identity for composites and accessors,
    /// value equality for scalars.
    fn shallow_field_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Accessor(a), Value::Accessor(b)) => Rc::ptr_eq(a, b),
            (a, b) => a == b,
        }
    }

    /// Shallow equality used by output writes: reference equality for
    /// scalars, field-by-field reference equality one level into composites.
    pub fn shallow_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(a_list), Value::List(b_list)) => {
                Rc::ptr_eq(a_list, b_list)
                    || (a_list.len() == b_list.len()
                        && a_list
                            .iter()
                            .zip(b_list.iter())
                            .all(|(a, b)| Value::shallow_field_eq(a, b)))
            }
            (Value::Map(a_map), Value::Map(b_map)) => {
                Rc::ptr_eq(a_map, b_map)
                    || (a_map.len() == b_map.len()
                        && a_map.iter().all(|(key, a)| {
                            b_map
                                .get(key)
                                .is_some_and(|b| Value::shallow_field_eq(a, b))
                        }))
            }
            (a, b) => Value::shallow_field_eq(a, b),
        }
    }

    /// `true` if the two values share provenance: identity for composites,
    /// value equality for strings and numbers. Booleans and nulls carry no
    /// provenance and never match.
    pub fn provenance_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Accessor(a), Value::Accessor(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => b.fmt(f),
            Value::Int(n) => n.fmt(f),
            Value::Float(n) => n.fmt(f),
            Value::Str(s) => s.fmt(f),
            Value::List(list) => list.fmt(f),
            Value::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Accessor(_) => f.write_str("<accessor>"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(list) => {
                let mut seq = serializer.serialize_seq(Some(list.len()))?;
                for value in list.iter() {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map.iter() {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Value::Accessor(_) => Err(serde::ser::Error::custom(
                "cannot serialize an unresolved accessor; snapshot props first",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON-like value")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }
            fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }
            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
                Value::deserialize(d)
            }
            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }
            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Int(v))
            }
            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Value, E> {
                i64::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| E::custom("integer out of range"))
            }
            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Value, E> {
                Ok(Value::Float(v))
            }
            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Value, E> {
                Ok(Value::str(v))
            }
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut list = Vec::new();
                while let Some(value) = seq.next_element()? {
                    list.push(value);
                }
                Ok(Value::List(Rc::new(list)))
            }
            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut map = IndexMap::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    map.insert(key, value);
                }
                Ok(Value::Map(Rc::new(map)))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::str(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(Rc::new(v))
    }
}
impl From<IndexMap<String, Value>> for Value {
    fn from(v: IndexMap<String, Value>) -> Self {
        Value::Map(Rc::new(v))
    }
}

/// Ordered props of an element or instance.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Props(IndexMap<String, Value>);

impl Props {
    /// An empty prop set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a prop.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a prop, replacing any previous value under the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of props.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if there are no props.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve every accessor, returning a snapshot fit for diffing,
    /// persistence, and dependency walks.
    pub fn resolved(&self) -> Props {
        Props(
            self.0
                .iter()
                .map(|(key, value)| (key.clone(), value.resolved()))
                .collect(),
        )
    }

    /// `true` if no prop other than `children` is undefined.
    pub fn fully_defined(&self) -> bool {
        self.0
            .iter()
            .all(|(key, value)| key == "children" || !value.is_undefined())
    }

    /// Every value, in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }
}

impl fmt::Debug for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl FromIterator<(String, Value)> for Props {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Props(iter.into_iter().collect())
    }
}

/// Construct [`Props`] from `"key" => value` pairs.
///
/// ```
/// # use weft_core::{props, Value};
/// let props = props! {
///     "region" => "us-east-1",
///     "replicas" => 3,
/// };
/// assert_eq!(props.get("replicas"), Some(&Value::Int(3)));
/// ```
#[macro_export]
macro_rules! props {
    () => { $crate::Props::new() };
    ($($key:literal => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut props = $crate::Props::new();
        $(props.insert($key, $crate::Value::from($value));)*
        props
    }};
}
