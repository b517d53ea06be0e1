// Column types, schemas, and runtime values, with conformance checks and adaptation.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::json::JsonValue;

pub const MAX_DECIMAL_PRECISION: u8 = 38;
const DEFAULT_DECIMAL: (u8, u8) = (38, 18);

pub type Record = Vec<Value>;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Null,
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Char(u32),
    Varchar(u32),
    String,
    Binary,
    Timestamp,
    TimestampNtz,
    Array(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
    Struct(Vec<StructField>),
    Json,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StructField {
    pub name: String,
    pub data_type: DataType,
}

impl StructField {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
}

fn nullable_default() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
    #[serde(default)]
    pub partition_columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            partition_columns: Vec::new(),
        }
    }

    pub fn with_partition_column(mut self, column: Column) -> Self {
        self.partition_columns.push(column);
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index_of(name).map(|index| &self.columns[index])
    }

    /// Narrows the schema to `names`, in the requested order.
    pub fn project(&self, names: &[String]) -> Result<Schema, Error> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let column = self.column(name).ok_or_else(|| {
                Error::new(ErrorKind::Usage).with_message(format!("unknown column {name}"))
            })?;
            columns.push(column.clone());
        }
        Ok(Schema {
            columns,
            partition_columns: self.partition_columns.clone(),
        })
    }

    /// Compares a caller-supplied hint against this (authoritative) schema: names are
    /// compared case-insensitively, types exactly, nullability is ignored.
    pub fn conflicts_with(&self, hint: &Schema) -> Option<String> {
        if let Some(reason) = columns_conflict("column", &self.columns, &hint.columns) {
            return Some(reason);
        }
        columns_conflict(
            "partition column",
            &self.partition_columns,
            &hint.partition_columns,
        )
    }

    pub fn check_record(&self, record: &[Value]) -> Result<(), Error> {
        if record.len() != self.columns.len() {
            return Err(Error::from_code(ErrorCode::SchemaArityMismatch).with_message(format!(
                "record has {} values, schema has {} columns",
                record.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(record) {
            if value.is_null() {
                if !column.nullable {
                    return Err(Error::from_code(ErrorCode::TypeMismatch)
                        .with_message(format!("column {} is not nullable", column.name)));
                }
                continue;
            }
            value.check(&column.data_type).map_err(|err| {
                let detail = err.message().unwrap_or("type mismatch").to_string();
                Error::from_code(ErrorCode::TypeMismatch)
                    .with_message(format!("column {}: {detail}", column.name))
            })?;
        }
        Ok(())
    }

    /// Adapts one generic row (a JSON array, or an object keyed by column name).
    pub fn adapt_record(&self, row: &serde_json::Value) -> Result<Record, Error> {
        match row {
            serde_json::Value::Array(items) => {
                if items.len() != self.columns.len() {
                    return Err(Error::from_code(ErrorCode::SchemaArityMismatch).with_message(
                        format!(
                            "row has {} values, schema has {} columns",
                            items.len(),
                            self.columns.len()
                        ),
                    ));
                }
                self.columns
                    .iter()
                    .zip(items)
                    .map(|(column, item)| column.data_type.adapt(item))
                    .collect()
            }
            serde_json::Value::Object(fields) => self
                .columns
                .iter()
                .map(|column| {
                    let item = fields
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(&column.name))
                        .map(|(_, value)| value)
                        .unwrap_or(&serde_json::Value::Null);
                    column.data_type.adapt(item)
                })
                .collect(),
            _ => Err(Error::from_code(ErrorCode::TypeMismatch)
                .with_message("row must be an array or an object")),
        }
    }
}

fn columns_conflict(label: &str, actual: &[Column], hint: &[Column]) -> Option<String> {
    if actual.len() != hint.len() {
        return Some(format!(
            "{label} count differs: table has {}, hint has {}",
            actual.len(),
            hint.len()
        ));
    }
    for (index, (a, h)) in actual.iter().zip(hint).enumerate() {
        if !a.name.eq_ignore_ascii_case(&h.name) {
            return Some(format!(
                "{label} {index} is {} in the table, {} in the hint",
                a.name, h.name
            ));
        }
        if a.data_type != h.data_type {
            return Some(format!(
                "{label} {} is {} in the table, {} in the hint",
                a.name, a.data_type, h.data_type
            ));
        }
    }
    None
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Decimal {
    unscaled: i128,
    scale: u8,
}

impl Decimal {
    pub fn new(unscaled: i128, scale: u8) -> Self {
        Self { unscaled, scale }
    }

    pub fn unscaled(&self) -> i128 {
        self.unscaled
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn digits(&self) -> u32 {
        let mut magnitude = self.unscaled.unsigned_abs();
        let mut digits = 1;
        while magnitude >= 10 {
            magnitude /= 10;
            digits += 1;
        }
        digits
    }

    /// Changes the scale without losing digits; `None` when digits would be dropped
    /// or the value overflows.
    pub fn rescale(&self, scale: u8) -> Option<Decimal> {
        if scale >= self.scale {
            let factor = 10i128.checked_pow(u32::from(scale - self.scale))?;
            let unscaled = self.unscaled.checked_mul(factor)?;
            return Some(Decimal::new(unscaled, scale));
        }
        let factor = 10i128.checked_pow(u32::from(self.scale - scale))?;
        if self.unscaled % factor != 0 {
            return None;
        }
        Some(Decimal::new(self.unscaled / factor, scale))
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::from_code(ErrorCode::TypeMismatch).with_message(format!("invalid decimal {text:?}"))
        };
        let trimmed = text.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u8::try_from(fraction.len()).map_err(|_| invalid())?;
        let mut unscaled: i128 = 0;
        for c in whole.chars().chain(fraction.chars()) {
            let digit = i128::from(c as u8 - b'0');
            unscaled = unscaled
                .checked_mul(10)
                .and_then(|value| value.checked_add(digit))
                .ok_or_else(invalid)?;
        }
        if negative {
            unscaled = -unscaled;
        }
        Ok(Decimal::new(unscaled, scale))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.unscaled.unsigned_abs().to_string();
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let scale = usize::from(self.scale);
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (whole, fraction) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{whole}.{fraction}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Binary(Vec<u8>),
    /// Nanoseconds since the Unix epoch, UTC.
    Timestamp(i64),
    /// Wall-clock nanoseconds since 1970-01-01T00:00:00 with no zone attached.
    TimestampNtz(i64),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(Vec<Value>),
    Json(JsonValue),
}

impl Value {
    pub fn json(value: JsonValue) -> Self {
        Value::Json(value)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::TinyInt(_) => "tinyint",
            Value::SmallInt(_) => "smallint",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampNtz(_) => "timestamp_ntz",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Json(_) => "json",
        }
    }

    /// Verifies that this (non-null at top level) value is a valid instance of
    /// `data_type`. Nested nulls inside composites are always accepted.
    pub fn check(&self, data_type: &DataType) -> Result<(), Error> {
        let ok = match (data_type, self) {
            (_, Value::Null) => true,
            (DataType::Boolean, Value::Boolean(_))
            | (DataType::TinyInt, Value::TinyInt(_))
            | (DataType::SmallInt, Value::SmallInt(_))
            | (DataType::Int, Value::Int(_))
            | (DataType::BigInt, Value::BigInt(_))
            | (DataType::Float, Value::Float(_))
            | (DataType::Double, Value::Double(_))
            | (DataType::String, Value::String(_))
            | (DataType::Binary, Value::Binary(_))
            | (DataType::Timestamp, Value::Timestamp(_))
            | (DataType::TimestampNtz, Value::TimestampNtz(_))
            | (DataType::Json, Value::Json(_)) => true,
            (DataType::Char(limit) | DataType::Varchar(limit), Value::String(text)) => {
                let length = text.chars().count();
                if length > *limit as usize {
                    return Err(mismatch(format!(
                        "string of {length} characters exceeds {data_type}"
                    )));
                }
                true
            }
            (DataType::Decimal { precision, scale }, Value::Decimal(decimal)) => {
                if decimal.scale() != *scale {
                    return Err(mismatch(format!(
                        "decimal scale {} does not match {data_type}",
                        decimal.scale()
                    )));
                }
                if decimal.digits() > u32::from(*precision) {
                    return Err(mismatch(format!("decimal {decimal} exceeds {data_type}")));
                }
                true
            }
            (DataType::Array(element), Value::Array(items)) => {
                for item in items {
                    item.check(element)?;
                }
                true
            }
            (DataType::Map(key_type, value_type), Value::Map(entries)) => {
                for (key, value) in entries {
                    if key.is_null() {
                        return Err(mismatch("map keys must not be null".to_string()));
                    }
                    key.check(key_type)?;
                    value.check(value_type)?;
                }
                true
            }
            (DataType::Struct(fields), Value::Struct(values)) => {
                if fields.len() != values.len() {
                    return Err(mismatch(format!(
                        "struct has {} fields, {data_type} declares {}",
                        values.len(),
                        fields.len()
                    )));
                }
                for (field, value) in fields.iter().zip(values) {
                    value.check(&field.data_type)?;
                }
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(mismatch(format!(
                "{} value does not match {data_type}",
                self.type_name()
            )))
        }
    }
}

fn mismatch(message: String) -> Error {
    Error::from_code(ErrorCode::TypeMismatch).with_message(message)
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::BigInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::Json(value)
    }
}

impl DataType {
    pub fn decimal(precision: u8, scale: u8) -> Self {
        DataType::Decimal { precision, scale }
    }

    pub fn array(element: DataType) -> Self {
        DataType::Array(Box::new(element))
    }

    pub fn map(key: DataType, value: DataType) -> Self {
        DataType::Map(Box::new(key), Box::new(value))
    }

    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            DataType::String | DataType::Char(_) | DataType::Varchar(_)
        )
    }

    /// Builds a canonical value of this type from a generic in-memory tree.
    pub fn adapt(&self, candidate: &serde_json::Value) -> Result<Value, Error> {
        use serde_json::Value as Host;

        if candidate.is_null() {
            return Ok(Value::Null);
        }
        let value = match (self, candidate) {
            (DataType::Json, host) => Value::Json(JsonValue::adapt(host)?),
            (DataType::Boolean, Host::Bool(flag)) => Value::Boolean(*flag),
            (DataType::TinyInt, Host::Number(_)) => Value::TinyInt(adapt_int(self, candidate)?),
            (DataType::SmallInt, Host::Number(_)) => Value::SmallInt(adapt_int(self, candidate)?),
            (DataType::Int, Host::Number(_)) => Value::Int(adapt_int(self, candidate)?),
            (DataType::BigInt, Host::Number(_)) => Value::BigInt(adapt_int(self, candidate)?),
            (DataType::Float, Host::Number(number)) => {
                Value::Float(number.as_f64().ok_or_else(|| host_mismatch(self, candidate))? as f32)
            }
            (DataType::Double, Host::Number(number)) => {
                Value::Double(number.as_f64().ok_or_else(|| host_mismatch(self, candidate))?)
            }
            (DataType::Decimal { scale, .. }, Host::String(_) | Host::Number(_)) => {
                let text = match candidate {
                    Host::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let decimal: Decimal = text.parse()?;
                let decimal = decimal
                    .rescale(*scale)
                    .ok_or_else(|| mismatch(format!("decimal {text} does not fit {self}")))?;
                Value::Decimal(decimal)
            }
            (DataType::String | DataType::Char(_) | DataType::Varchar(_), Host::String(text)) => {
                Value::String(text.clone())
            }
            (DataType::Binary, Host::String(text)) => Value::Binary(text.as_bytes().to_vec()),
            (DataType::Binary, Host::Array(items)) => Value::Binary(
                items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|byte| u8::try_from(byte).ok())
                            .ok_or_else(|| host_mismatch(self, candidate))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (DataType::Timestamp, Host::String(text)) => {
                let parsed = OffsetDateTime::parse(text, &Rfc3339).map_err(|err| {
                    mismatch(format!("invalid timestamp {text:?}")).with_source(err)
                })?;
                Value::Timestamp(epoch_nanos(parsed)?)
            }
            (DataType::TimestampNtz, Host::String(text)) => {
                Value::TimestampNtz(parse_wall_clock(text)?)
            }
            (DataType::Timestamp, Host::Number(number)) => {
                Value::Timestamp(number.as_i64().ok_or_else(|| host_mismatch(self, candidate))?)
            }
            (DataType::TimestampNtz, Host::Number(number)) => {
                Value::TimestampNtz(number.as_i64().ok_or_else(|| host_mismatch(self, candidate))?)
            }
            (DataType::Array(element), Host::Array(items)) => Value::Array(
                items
                    .iter()
                    .map(|item| element.adapt(item))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (DataType::Map(key_type, value_type), Host::Object(fields)) => {
                let mut entries = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    entries.push((adapt_map_key(key_type, key)?, value_type.adapt(value)?));
                }
                Value::Map(entries)
            }
            (DataType::Map(key_type, value_type), Host::Array(pairs)) => {
                let mut entries = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    let Some([key, value]) = pair.as_array().map(Vec::as_slice).and_then(|p| {
                        <&[serde_json::Value; 2]>::try_from(p).ok()
                    }) else {
                        return Err(mismatch("map entries must be [key, value] pairs".to_string()));
                    };
                    entries.push((key_type.adapt(key)?, value_type.adapt(value)?));
                }
                Value::Map(entries)
            }
            (DataType::Struct(fields), Host::Object(map)) => Value::Struct(
                fields
                    .iter()
                    .map(|field| {
                        let item = map
                            .iter()
                            .find(|(key, _)| key.eq_ignore_ascii_case(&field.name))
                            .map(|(_, value)| value)
                            .unwrap_or(&Host::Null);
                        field.data_type.adapt(item)
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (DataType::Struct(fields), Host::Array(items)) if items.len() == fields.len() => {
                Value::Struct(
                    fields
                        .iter()
                        .zip(items)
                        .map(|(field, item)| field.data_type.adapt(item))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            _ => return Err(host_mismatch(self, candidate)),
        };
        value.check(self)?;
        Ok(value)
    }
}

fn host_mismatch(data_type: &DataType, candidate: &serde_json::Value) -> Error {
    mismatch(format!("{candidate} cannot be adapted to {data_type}"))
}

fn adapt_int<T>(data_type: &DataType, candidate: &serde_json::Value) -> Result<T, Error>
where
    T: TryFrom<i64>,
{
    candidate
        .as_i64()
        .and_then(|value| T::try_from(value).ok())
        .ok_or_else(|| host_mismatch(data_type, candidate))
}

fn adapt_map_key(key_type: &DataType, key: &str) -> Result<Value, Error> {
    if key_type.is_string_like() || matches!(key_type, DataType::Json) {
        return key_type.adapt(&serde_json::Value::String(key.to_string()));
    }
    let parsed: serde_json::Value = serde_json::from_str(key)
        .map_err(|err| mismatch(format!("map key {key:?} does not fit {key_type}")).with_source(err))?;
    key_type.adapt(&parsed)
}

fn epoch_nanos(at: OffsetDateTime) -> Result<i64, Error> {
    i64::try_from(at.unix_timestamp_nanos())
        .map_err(|_| mismatch("timestamp is outside the representable range".to_string()))
}

fn parse_wall_clock(text: &str) -> Result<i64, Error> {
    let description = if text.contains('.') {
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"
    } else {
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    };
    let format = time::format_description::parse(description)
        .map_err(|err| Error::new(ErrorKind::Internal).with_source(err))?;
    let parsed = PrimitiveDateTime::parse(text, &format)
        .map_err(|err| mismatch(format!("invalid timestamp_ntz {text:?}")).with_source(err))?;
    epoch_nanos(parsed.assume_utc())
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => f.write_str("null"),
            DataType::Boolean => f.write_str("boolean"),
            DataType::TinyInt => f.write_str("tinyint"),
            DataType::SmallInt => f.write_str("smallint"),
            DataType::Int => f.write_str("int"),
            DataType::BigInt => f.write_str("bigint"),
            DataType::Float => f.write_str("float"),
            DataType::Double => f.write_str("double"),
            DataType::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
            DataType::Char(length) => write!(f, "char({length})"),
            DataType::Varchar(length) => write!(f, "varchar({length})"),
            DataType::String => f.write_str("string"),
            DataType::Binary => f.write_str("binary"),
            DataType::Timestamp => f.write_str("timestamp"),
            DataType::TimestampNtz => f.write_str("timestamp_ntz"),
            DataType::Array(element) => write!(f, "array<{element}>"),
            DataType::Map(key, value) => write!(f, "map<{key},{value}>"),
            DataType::Struct(fields) => {
                f.write_str("struct<")?;
                for (index, field) in fields.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", field.name, field.data_type)?;
                }
                f.write_str(">")
            }
            DataType::Json => f.write_str("json"),
        }
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for DataType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser {
            text,
            chars: text.char_indices().peekable(),
        };
        let data_type = parser.parse_type()?;
        parser.skip_whitespace();
        if parser.chars.peek().is_some() {
            return Err(parser.error("trailing characters"));
        }
        Ok(data_type)
    }
}

struct TypeParser<'a> {
    text: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl TypeParser<'_> {
    fn parse_type(&mut self) -> Result<DataType, Error> {
        let name = self.ident()?.to_ascii_lowercase();
        let data_type = match name.as_str() {
            "null" | "void" => DataType::Null,
            "boolean" => DataType::Boolean,
            "tinyint" => DataType::TinyInt,
            "smallint" => DataType::SmallInt,
            "int" => DataType::Int,
            "bigint" => DataType::BigInt,
            "float" => DataType::Float,
            "double" => DataType::Double,
            "string" => DataType::String,
            "binary" => DataType::Binary,
            "timestamp" => DataType::Timestamp,
            "timestamp_ntz" => DataType::TimestampNtz,
            "json" => DataType::Json,
            "decimal" => {
                if self.eat('(') {
                    let precision = self.number()?;
                    let scale = if self.eat(',') { self.number()? } else { 0 };
                    self.expect(')')?;
                    let precision = u8::try_from(precision)
                        .ok()
                        .filter(|p| (1..=MAX_DECIMAL_PRECISION).contains(p))
                        .ok_or_else(|| self.error("decimal precision must be 1..=38"))?;
                    let scale = u8::try_from(scale)
                        .ok()
                        .filter(|s| *s <= precision)
                        .ok_or_else(|| self.error("decimal scale must not exceed precision"))?;
                    DataType::Decimal { precision, scale }
                } else {
                    DataType::Decimal {
                        precision: DEFAULT_DECIMAL.0,
                        scale: DEFAULT_DECIMAL.1,
                    }
                }
            }
            "char" | "varchar" => {
                self.expect('(')?;
                let length = self.number()?;
                self.expect(')')?;
                if name == "char" {
                    DataType::Char(length)
                } else {
                    DataType::Varchar(length)
                }
            }
            "array" => {
                self.expect('<')?;
                let element = self.parse_type()?;
                self.expect('>')?;
                DataType::Array(Box::new(element))
            }
            "map" => {
                self.expect('<')?;
                let key = self.parse_type()?;
                self.expect(',')?;
                let value = self.parse_type()?;
                self.expect('>')?;
                DataType::Map(Box::new(key), Box::new(value))
            }
            "struct" => {
                self.expect('<')?;
                let mut fields = Vec::new();
                loop {
                    let field_name = self.ident()?.to_string();
                    self.expect(':')?;
                    let field_type = self.parse_type()?;
                    fields.push(StructField::new(field_name, field_type));
                    if !self.eat(',') {
                        break;
                    }
                }
                self.expect('>')?;
                DataType::Struct(fields)
            }
            _ => return Err(self.error(&format!("unknown type {name}"))),
        };
        Ok(data_type)
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn ident(&mut self) -> Result<&str, Error> {
        self.skip_whitespace();
        let Some(&(start, _)) = self.chars.peek() else {
            return Err(self.error("expected a name"));
        };
        let mut end = start;
        while let Some((index, c)) = self.chars.next_if(|(_, c)| c.is_alphanumeric() || *c == '_') {
            end = index + c.len_utf8();
        }
        if end == start {
            return Err(self.error("expected a name"));
        }
        Ok(&self.text[start..end])
    }

    fn number(&mut self) -> Result<u32, Error> {
        self.skip_whitespace();
        let mut value: u32 = 0;
        let mut seen = false;
        while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_ascii_digit()) {
            seen = true;
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(c as u32 - '0' as u32))
                .ok_or_else(|| self.error("number too large"))?;
        }
        if !seen {
            return Err(self.error("expected a number"));
        }
        Ok(value)
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        self.chars.next_if(|(_, c)| *c == expected).is_some()
    }

    fn expect(&mut self, expected: char) -> Result<(), Error> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{expected}'")))
        }
    }

    fn error(&self, detail: &str) -> Error {
        Error::new(ErrorKind::Usage).with_message(format!("invalid type {:?}: {detail}", self.text))
    }
}
