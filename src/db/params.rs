//! Parameter sources for named queries.
//!
//! A query template references values by name (`:id`, `:ids`). The values come
//! from anything implementing [`NamedArgs`]: the [`NoParams`] marker, an
//! explicit [`Params`] record, a JSON object, or a caller-defined type.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::types::Json;
use sqlx::{Encode, Postgres, Type};
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// A single bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Never expanded by `IN` binding.
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
    /// Expanded into one positional marker per element by `IN` binding.
    List(Vec<Param>),
}

impl Param {
    /// Convert a JSON value into a parameter.
    ///
    /// Arrays become lists (eligible for `IN` expansion); objects stay JSON.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(_) => Self::Json(value.clone()),
        }
    }

    /// Convert this parameter back into JSON, used for heterogeneous lists.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => JsonValue::from(*f),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Bytes(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
            Self::Uuid(u) => JsonValue::String(u.to_string()),
            Self::Timestamp(t) => JsonValue::String(t.to_rfc3339()),
            Self::Json(v) => v.clone(),
            Self::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Like [`Param::from_json`], but strings holding a hyphenated UUID or an
    /// RFC 3339 timestamp become [`Param::Uuid`] and [`Param::Timestamp`].
    /// Serde writes both types as strings, so this restores them.
    fn from_record_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::String(s) => Self::from_record_text(s),
            JsonValue::Array(items) => {
                Self::List(items.iter().map(Self::from_record_json).collect())
            }
            other => Self::from_json(other),
        }
    }

    fn from_record_text(s: &str) -> Self {
        if s.len() == 36 {
            if let Ok(uuid) = Uuid::parse_str(s) {
                return Self::Uuid(uuid);
            }
        }
        if s.contains('T') || s.contains('t') {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Self::Timestamp(ts.with_timezone(&Utc));
            }
        }
        Self::Text(s.to_string())
    }
}

/// Printable literal used by the query renderer. Text and bytes are quoted.
impl std::fmt::Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "'{}'", String::from_utf8_lossy(b)),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Json(v) => write!(f, "{v}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! param_from {
    ($($ty:ty => |$v:ident| $body:expr),+ $(,)?) => {
        $(
            impl From<$ty> for Param {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )+
    };
}

param_from! {
    bool => |v| Param::Bool(v),
    i16 => |v| Param::Int(i64::from(v)),
    i32 => |v| Param::Int(i64::from(v)),
    i64 => |v| Param::Int(v),
    u32 => |v| Param::Int(i64::from(v)),
    f32 => |v| Param::Float(f64::from(v)),
    f64 => |v| Param::Float(v),
    &str => |v| Param::Text(v.to_string()),
    String => |v| Param::Text(v),
    &[u8] => |v| Param::Bytes(v.to_vec()),
    Uuid => |v| Param::Uuid(v),
    DateTime<Utc> => |v| Param::Timestamp(v),
    JsonValue => |v| Param::Json(v),
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or(Param::Null, Into::into)
    }
}

impl<T: Into<Param>> From<Vec<T>> for Param {
    fn from(values: Vec<T>) -> Self {
        Param::List(values.into_iter().map(Into::into).collect())
    }
}

/// A source of values for named placeholders.
pub trait NamedArgs {
    /// Resolve a placeholder name to its value.
    fn lookup(&self, name: &str) -> Option<Param>;

    /// True for sources that carry no parameters at all.
    fn is_empty(&self) -> bool {
        false
    }
}

impl<T: NamedArgs + ?Sized> NamedArgs for &T {
    fn lookup(&self, name: &str) -> Option<Param> {
        (**self).lookup(name)
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

/// Marker for statements without named placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParams;

impl NamedArgs for NoParams {
    fn lookup(&self, _name: &str) -> Option<Param> {
        None
    }

    fn is_empty(&self) -> bool {
        true
    }
}

/// Ordered name-to-value record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Param)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` to `name`, replacing any previous binding.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Param>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Param>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Build a record from any serializable struct or map.
    ///
    /// Values keep their JSON shape, except that strings holding a hyphenated
    /// UUID or an RFC 3339 timestamp bind as `uuid` and `timestamptz`. Postgres
    /// assigns both to text columns; comparing one against a text column
    /// needs a cast in the template (`:id::text`).
    pub fn from_serialize<T: Serialize + ?Sized>(record: &T) -> DbResult<Self> {
        let value = serde_json::to_value(record)
            .map_err(|e| DbError::bind(format!("failed to serialize parameters: {e}")))?;
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(map) => Ok(Self {
                entries: map
                    .iter()
                    .map(|(k, v)| (k.clone(), Param::from_record_json(v)))
                    .collect(),
            }),
            other => Err(DbError::bind(format!(
                "parameters must serialize to an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}

impl NamedArgs for Params {
    fn lookup(&self, name: &str) -> Option<Param> {
        if let Some((_, value)) = self.entries.iter().find(|(n, _)| n == name) {
            return Some(value.clone());
        }
        // Dotted names descend into JSON-valued entries.
        let (head, rest) = name.split_once('.')?;
        match self.entries.iter().find(|(n, _)| n == head)? {
            (_, Param::Json(value)) => json_path(value, rest).map(Param::from_json),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NamedArgs for JsonValue {
    fn lookup(&self, name: &str) -> Option<Param> {
        json_path(self, name).map(Param::from_json)
    }

    fn is_empty(&self) -> bool {
        match self {
            JsonValue::Null => true,
            JsonValue::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

pub(crate) type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// A NULL sent with an unspecified type OID, so the server infers the type
/// from where the placeholder appears.
#[derive(Debug, Clone, Copy)]
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_param<'q>(query: PgQuery<'q>, param: &'q Param) -> PgQuery<'q> {
    match param {
        Param::Null => query.bind(UntypedNull),
        Param::Bool(v) => query.bind(*v),
        Param::Int(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::Text(v) => query.bind(v.as_str()),
        Param::Bytes(v) => query.bind(v.as_slice()),
        Param::Uuid(v) => query.bind(*v),
        Param::Timestamp(v) => query.bind(*v),
        Param::Json(v) => query.bind(Json(v)),
        Param::List(items) => bind_list(query, items),
    }
}

/// Lists that reach the driver unexpanded bind as a native array when every
/// element has the same scalar type, and as a JSON array otherwise.
fn bind_list<'q>(query: PgQuery<'q>, items: &'q [Param]) -> PgQuery<'q> {
    macro_rules! homogeneous {
        ($variant:ident, $map:expr) => {
            if items.iter().all(|p| matches!(p, Param::$variant(_))) {
                let values: Vec<_> = items
                    .iter()
                    .filter_map(|p| match p {
                        Param::$variant(v) => Some(($map)(v)),
                        _ => None,
                    })
                    .collect();
                return query.bind(values);
            }
        };
    }

    homogeneous!(Int, |v: &i64| *v);
    homogeneous!(Text, |v: &'q String| v.as_str());
    homogeneous!(Float, |v: &f64| *v);
    homogeneous!(Bool, |v: &bool| *v);
    homogeneous!(Uuid, |v: &Uuid| *v);
    homogeneous!(Timestamp, |v: &DateTime<Utc>| *v);

    query.bind(Json(JsonValue::Array(items.iter().map(Param::to_json).collect())))
}
