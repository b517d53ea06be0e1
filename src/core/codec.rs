// Tagged tuple wire format for records, plus a streaming decoder for block bodies.
use std::io::{self, Read};

use crate::core::error::{Error, ErrorCode, ErrorKind};
use crate::core::json::JsonValue;
use crate::core::types::{DataType, Decimal, Record, Schema, Value};

pub const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;
const MAX_NESTING: usize = 128;

const JSON_NULL: u8 = 0;
const JSON_FALSE: u8 = 1;
const JSON_TRUE: u8 = 2;
const JSON_INT: u8 = 3;
const JSON_FLOAT: u8 = 4;
const JSON_STRING: u8 = 5;
const JSON_ARRAY: u8 = 6;
const JSON_OBJECT: u8 = 7;

/// Encodes one record, length prefix included.
pub fn encode(record: &[Value], schema: &Schema) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode_into(record, schema, &mut out)?;
    Ok(out)
}

/// Appends one framed record to `out`. Nothing is appended when the record does not
/// conform to `schema`.
pub fn encode_into(record: &[Value], schema: &Schema, out: &mut Vec<u8>) -> Result<(), Error> {
    schema.check_record(record)?;
    let mut body = Vec::with_capacity(16 * record.len());
    let types = schema.columns.iter().map(|column| &column.data_type);
    write_fields(types, record, &mut body);
    put_uvarint(out, body.len() as u64);
    out.extend_from_slice(&body);
    Ok(())
}

/// Decodes exactly one framed record.
pub fn decode(bytes: &[u8], schema: &Schema) -> Result<Record, Error> {
    let mut wire = Wire::new(bytes);
    let len = wire.uvarint()?;
    let len = checked_record_len(len)?;
    let body = wire.take(len)?;
    if !wire.is_empty() {
        return Err(malformed("trailing bytes after record"));
    }
    decode_body(body, schema)
}

/// Pulls framed records off a byte stream one at a time.
pub struct RecordDecoder<R> {
    reader: R,
    schema: Schema,
    body: Vec<u8>,
    decoded: u64,
}

impl<R: Read> RecordDecoder<R> {
    pub fn new(reader: R, schema: Schema) -> Self {
        Self {
            reader,
            schema,
            body: Vec::new(),
            decoded: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// `Ok(None)` only on a clean end of stream at a record boundary.
    pub fn next_record(&mut self) -> Result<Option<Record>, Error> {
        let Some(len) = read_uvarint(&mut self.reader)? else {
            return Ok(None);
        };
        let len = checked_record_len(len)?;
        self.body.clear();
        self.body.resize(len, 0);
        self.reader
            .read_exact(&mut self.body)
            .map_err(map_read_error)?;
        let record = decode_body(&self.body, &self.schema)?;
        self.decoded += 1;
        Ok(Some(record))
    }
}

/// Maps stream read failures onto the record error taxonomy.
pub fn map_read_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::from_code(ErrorCode::TruncatedRecord)
            .with_message("stream ended inside a record")
            .with_source(err),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            Error::from_code(ErrorCode::MalformedRecord)
                .with_message("record stream is not decodable")
                .with_source(err)
        }
        _ => Error::new(ErrorKind::Transport)
            .with_message("failed to read record stream")
            .with_source(err),
    }
}

fn checked_record_len(len: u64) -> Result<usize, Error> {
    usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| malformed(&format!("record length {len} exceeds limit")))
}

fn decode_body(body: &[u8], schema: &Schema) -> Result<Record, Error> {
    let types: Vec<&DataType> = schema.columns.iter().map(|column| &column.data_type).collect();
    let mut wire = Wire::new(body);
    let record = read_fields(&mut wire, &types, 0)?;
    for (column, value) in schema.columns.iter().zip(&record) {
        if value.is_null() && !column.nullable {
            return Err(malformed(&format!("null in non-nullable column {}", column.name)));
        }
        value.check(&column.data_type).map_err(|err| {
            malformed(&format!(
                "column {}: {}",
                column.name,
                err.message().unwrap_or("value does not conform")
            ))
        })?;
    }
    Ok(record)
}

fn malformed(message: &str) -> Error {
    Error::from_code(ErrorCode::MalformedRecord).with_message(message.to_string())
}

fn truncated() -> Error {
    Error::from_code(ErrorCode::TruncatedRecord).with_message("record ended inside a field")
}

fn write_fields<'a>(
    types: impl Iterator<Item = &'a DataType>,
    values: &[Value],
    out: &mut Vec<u8>,
) {
    for (ordinal, (data_type, value)) in types.zip(values).enumerate() {
        let present = !value.is_null();
        put_uvarint(out, ((ordinal as u64) << 1) | u64::from(present));
        if present {
            write_value(data_type, value, out);
        }
    }
}

// Values reaching the writer have passed `Schema::check_record`.
fn write_value(data_type: &DataType, value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => {}
        Value::Boolean(flag) => out.push(u8::from(*flag)),
        Value::TinyInt(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::SmallInt(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::BigInt(v) | Value::Timestamp(v) | Value::TimestampNtz(v) => {
            out.extend_from_slice(&v.to_le_bytes())
        }
        Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Decimal(decimal) => out.extend_from_slice(&decimal.unscaled().to_le_bytes()),
        Value::String(text) => put_bytes(out, text.as_bytes()),
        Value::Binary(bytes) => put_bytes(out, bytes),
        Value::Array(items) => {
            let element = match data_type {
                DataType::Array(element) => element.as_ref(),
                _ => &DataType::Null,
            };
            let mut payload = Vec::new();
            put_uvarint(&mut payload, items.len() as u64);
            for item in items {
                write_element(element, item, &mut payload);
            }
            put_bytes(out, &payload);
        }
        Value::Map(entries) => {
            let (key_type, value_type) = match data_type {
                DataType::Map(key, value) => (key.as_ref(), value.as_ref()),
                _ => (&DataType::Null, &DataType::Null),
            };
            let mut payload = Vec::new();
            put_uvarint(&mut payload, entries.len() as u64);
            for (key, value) in entries {
                write_element(key_type, key, &mut payload);
                write_element(value_type, value, &mut payload);
            }
            put_bytes(out, &payload);
        }
        Value::Struct(values) => {
            let mut payload = Vec::new();
            if let DataType::Struct(fields) = data_type {
                let types = fields.iter().map(|field| &field.data_type);
                write_fields(types, values, &mut payload);
            }
            put_bytes(out, &payload);
        }
        Value::Json(json) => {
            let mut payload = Vec::new();
            write_json(json, &mut payload);
            put_bytes(out, &payload);
        }
    }
}

fn write_element(data_type: &DataType, value: &Value, out: &mut Vec<u8>) {
    if value.is_null() {
        out.push(0);
    } else {
        out.push(1);
        write_value(data_type, value, out);
    }
}

fn write_json(value: &JsonValue, out: &mut Vec<u8>) {
    match value {
        JsonValue::Null => out.push(JSON_NULL),
        JsonValue::Bool(false) => out.push(JSON_FALSE),
        JsonValue::Bool(true) => out.push(JSON_TRUE),
        JsonValue::Int(v) => {
            out.push(JSON_INT);
            put_uvarint(out, zigzag(*v));
        }
        JsonValue::Float(v) => {
            out.push(JSON_FLOAT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        JsonValue::String(text) => {
            out.push(JSON_STRING);
            put_bytes(out, text.as_bytes());
        }
        JsonValue::Array(items) => {
            out.push(JSON_ARRAY);
            put_uvarint(out, items.len() as u64);
            for item in items {
                write_json(item, out);
            }
        }
        JsonValue::Object(fields) => {
            out.push(JSON_OBJECT);
            put_uvarint(out, fields.len() as u64);
            for (key, value) in fields {
                put_bytes(out, key.as_bytes());
                write_json(value, out);
            }
        }
    }
}

fn read_fields(wire: &mut Wire<'_>, types: &[&DataType], depth: usize) -> Result<Vec<Value>, Error> {
    let mut values = vec![Value::Null; types.len()];
    let mut next_ordinal = 0usize;
    while !wire.is_empty() {
        let tag = wire.uvarint()?;
        let ordinal = usize::try_from(tag >> 1).unwrap_or(usize::MAX);
        if ordinal >= types.len() {
            return Err(malformed(&format!(
                "field tag {ordinal} exceeds column count {}",
                types.len()
            )));
        }
        if ordinal < next_ordinal {
            return Err(malformed(&format!("field tag {ordinal} is out of column order")));
        }
        next_ordinal = ordinal + 1;
        if tag & 1 == 1 {
            values[ordinal] = read_value(wire, types[ordinal], depth)?;
        }
    }
    Ok(values)
}

fn read_value(wire: &mut Wire<'_>, data_type: &DataType, depth: usize) -> Result<Value, Error> {
    if depth > MAX_NESTING {
        return Err(malformed("value nesting too deep"));
    }
    let value = match data_type {
        DataType::Null => return Err(malformed("null column carries a value")),
        DataType::Boolean => match wire.byte()? {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => return Err(malformed(&format!("invalid boolean byte {other}"))),
        },
        DataType::TinyInt => Value::TinyInt(i8::from_le_bytes(wire.array()?)),
        DataType::SmallInt => Value::SmallInt(i16::from_le_bytes(wire.array()?)),
        DataType::Int => Value::Int(i32::from_le_bytes(wire.array()?)),
        DataType::BigInt => Value::BigInt(i64::from_le_bytes(wire.array()?)),
        DataType::Float => Value::Float(f32::from_le_bytes(wire.array()?)),
        DataType::Double => Value::Double(f64::from_le_bytes(wire.array()?)),
        DataType::Timestamp => Value::Timestamp(i64::from_le_bytes(wire.array()?)),
        DataType::TimestampNtz => Value::TimestampNtz(i64::from_le_bytes(wire.array()?)),
        DataType::Decimal { scale, .. } => {
            Value::Decimal(Decimal::new(i128::from_le_bytes(wire.array()?), *scale))
        }
        DataType::String | DataType::Char(_) | DataType::Varchar(_) => {
            Value::String(read_string(wire)?)
        }
        DataType::Binary => Value::Binary(wire.bytes()?.to_vec()),
        DataType::Array(element) => {
            let mut payload = Wire::new(wire.bytes()?);
            let count = payload.count()?;
            let mut items = Vec::with_capacity(count.min(payload.remaining()));
            for _ in 0..count {
                items.push(read_element(&mut payload, element, depth + 1)?);
            }
            payload.finish()?;
            Value::Array(items)
        }
        DataType::Map(key_type, value_type) => {
            let mut payload = Wire::new(wire.bytes()?);
            let count = payload.count()?;
            let mut entries = Vec::with_capacity(count.min(payload.remaining()));
            for _ in 0..count {
                let key = read_element(&mut payload, key_type, depth + 1)?;
                if key.is_null() {
                    return Err(malformed("null map key"));
                }
                let value = read_element(&mut payload, value_type, depth + 1)?;
                entries.push((key, value));
            }
            payload.finish()?;
            Value::Map(entries)
        }
        DataType::Struct(fields) => {
            let mut payload = Wire::new(wire.bytes()?);
            let types: Vec<&DataType> = fields.iter().map(|field| &field.data_type).collect();
            Value::Struct(read_fields(&mut payload, &types, depth + 1)?)
        }
        DataType::Json => {
            let mut payload = Wire::new(wire.bytes()?);
            let json = read_json(&mut payload, depth + 1)?;
            payload.finish()?;
            Value::Json(json)
        }
    };
    Ok(value)
}

fn read_element(wire: &mut Wire<'_>, data_type: &DataType, depth: usize) -> Result<Value, Error> {
    match wire.byte()? {
        0 => Ok(Value::Null),
        1 => read_value(wire, data_type, depth),
        other => Err(malformed(&format!("invalid presence byte {other}"))),
    }
}

fn read_json(wire: &mut Wire<'_>, depth: usize) -> Result<JsonValue, Error> {
    if depth > MAX_NESTING {
        return Err(malformed("json nesting too deep"));
    }
    let value = match wire.byte()? {
        JSON_NULL => JsonValue::Null,
        JSON_FALSE => JsonValue::Bool(false),
        JSON_TRUE => JsonValue::Bool(true),
        JSON_INT => JsonValue::Int(unzigzag(wire.uvarint()?)),
        JSON_FLOAT => JsonValue::Float(f64::from_le_bytes(wire.array()?)),
        JSON_STRING => JsonValue::String(read_string(wire)?),
        JSON_ARRAY => {
            let count = wire.count()?;
            let mut items = Vec::with_capacity(count.min(wire.remaining()));
            for _ in 0..count {
                items.push(read_json(wire, depth + 1)?);
            }
            JsonValue::Array(items)
        }
        JSON_OBJECT => {
            let count = wire.count()?;
            let mut fields = Vec::with_capacity(count.min(wire.remaining()));
            for _ in 0..count {
                let key = read_string(wire)?;
                fields.push((key, read_json(wire, depth + 1)?));
            }
            JsonValue::Object(fields)
        }
        other => return Err(malformed(&format!("invalid json tag {other}"))),
    };
    Ok(value)
}

fn read_string(wire: &mut Wire<'_>) -> Result<String, Error> {
    let bytes = wire.bytes()?;
    String::from_utf8(bytes.to_vec()).map_err(|err| {
        Error::from_code(ErrorCode::MalformedRecord)
            .with_message("string is not valid utf-8")
            .with_source(err)
    })
}

struct Wire<'a> {
    buf: &'a [u8],
}

impl<'a> Wire<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.buf.len() {
            return Err(truncated());
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn uvarint(&mut self) -> Result<u64, Error> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift == 63 && byte > 1 {
                return Err(malformed("varint overflows 64 bits"));
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(malformed("varint overflows 64 bits"));
            }
        }
    }

    fn count(&mut self) -> Result<usize, Error> {
        let count = self.uvarint()?;
        usize::try_from(count).map_err(|_| malformed("element count overflows"))
    }

    fn bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.count()?;
        self.take(len)
    }

    fn finish(&self) -> Result<(), Error> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(malformed("trailing bytes inside a nested value"))
        }
    }
}

pub(crate) fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_uvarint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// Reads a record length prefix; `None` on a clean end of stream before the first byte.
fn read_uvarint<R: Read>(reader: &mut R) -> Result<Option<u64>, Error> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];
    loop {
        let read = loop {
            match reader.read(&mut byte) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_read_error(err)),
            }
        };
        if read == 0 {
            if shift == 0 {
                return Ok(None);
            }
            return Err(Error::from_code(ErrorCode::TruncatedRecord)
                .with_message("stream ended inside a record length"));
        }
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift > 63 {
            return Err(malformed("record length overflows 64 bits"));
        }
    }
}
