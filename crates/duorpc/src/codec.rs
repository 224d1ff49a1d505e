//! # Body Codec
//!
//! Translation between `Value`s and bytes, driven by a named schema.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **Type Strictness**: Encoding checks the value against the schema; decoding
//!   checks wire tags against the schema and rejects trailing bytes.
//! - **Forward Compatibility**: Unknown interface fields are skipped on decode.

use std::collections::BTreeMap;

use duopack::Decoder;
use duopack::Encoder;
use duopack::Tag;

use crate::schema::Scalar;
use crate::schema::TypeCatalog;
use crate::schema::TypeSchema;
use crate::value::Value;

/// The maximum nesting depth for values before failing.
const MAX_RECURSION_DEPTH: usize = 64;

/// What went wrong while encoding or decoding a body.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecErrorKind {
    /// The underlying duopack read or write failed.
    Wire(duopack::Error),
    /// The schema name is not in the catalog.
    UnknownType(String),
    /// The value does not have the shape the schema requires.
    TypeMismatch { expected: String, found: &'static str },
    /// A number does not fit the scalar the schema requires.
    OutOfRange(String),
    /// A required interface property is absent.
    MissingField(String),
    /// The value has a property the interface does not declare.
    UnexpectedField(String),
    /// A tuple has the wrong number of elements.
    ElementCount { min: usize, max: usize, found: usize },
    /// Bytes remain after the value was decoded.
    TrailingBytes(usize),
    /// The nested depth of the value exceeded the safety limit.
    RecursionLimitExceeded,
}

/// A codec failure, with the path to the offending value.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecError {
    pub kind: CodecErrorKind,
    /// Innermost segment first.
    path: Vec<String>,
}

impl CodecError {
    pub fn new(kind: CodecErrorKind) -> Self {
        Self { kind, path: Vec::new() }
    }

    /// Prepends a path segment while the error bubbles out of a container.
    pub fn within(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    /// The path to the offending value, e.g. `$.items[2].name`.
    pub fn path(&self) -> String {
        let mut out = String::from("$");
        for segment in self.path.iter().rev() {
            out.push_str(segment);
        }
        out
    }
}

impl std::fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "{}", e),
            Self::UnknownType(name) => write!(f, "unknown type '{}'", name),
            Self::TypeMismatch { expected, found } => write!(f, "expected {}, found {}", expected, found),
            Self::OutOfRange(msg) => write!(f, "number out of range: {}", msg),
            Self::MissingField(name) => write!(f, "missing required property '{}'", name),
            Self::UnexpectedField(name) => write!(f, "unexpected property '{}'", name),
            Self::ElementCount { min, max, found } => {
                write!(f, "expected {}..={} elements, found {}", min, max, found)
            }
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after value", n),
            Self::RecursionLimitExceeded => write!(f, "value nested deeper than {}", MAX_RECURSION_DEPTH),
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} at `{}`", self.kind, self.path())
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecErrorKind> for CodecError {
    fn from(kind: CodecErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<duopack::Error> for CodecError {
    fn from(e: duopack::Error) -> Self {
        Self::new(CodecErrorKind::Wire(e))
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encodes and decodes payload bodies by schema name.
///
/// This is the seam between the runtime and whatever type system describes the
/// payloads. Implementations must be immutable after construction so one
/// instance can be shared by every connection.
pub trait BodyCodec: Send + Sync + 'static {
    /// Encodes `value` as `type_name`, failing with a descriptive error on mismatch.
    fn encode(&self, value: &Value, type_name: &str) -> Result<Vec<u8>>;

    /// Decodes `bytes` as `type_name`, failing with a descriptive error on mismatch.
    fn decode(&self, bytes: &[u8], type_name: &str) -> Result<Value>;
}

/// The default `BodyCodec`: validates against a `TypeCatalog` and writes duopack.
#[derive(Debug, Clone)]
pub struct SchemaCodec {
    types: TypeCatalog,
}

impl SchemaCodec {
    /// Creates a codec over `types`.
    ///
    /// # Errors
    /// Returns `UnknownType` if any schema references a name outside the catalog.
    pub fn new(types: TypeCatalog) -> Result<Self> {
        if let Some((owner, missing)) = types.find_dangling_reference() {
            let name = format!("{} (referenced from '{}')", missing, owner);
            return Err(CodecErrorKind::UnknownType(name).into());
        }
        Ok(Self { types })
    }

    pub fn types(&self) -> &TypeCatalog {
        &self.types
    }

    fn schema(&self, type_name: &str) -> Result<&TypeSchema> {
        self.types
            .get(type_name)
            .ok_or_else(|| CodecErrorKind::UnknownType(type_name.to_string()).into())
    }
}

impl BodyCodec for SchemaCodec {
    fn encode(&self, value: &Value, type_name: &str) -> Result<Vec<u8>> {
        encode_with_schema(value, self.schema(type_name)?, &self.types)
    }

    fn decode(&self, bytes: &[u8], type_name: &str) -> Result<Value> {
        decode_with_schema(bytes, self.schema(type_name)?, &self.types)
    }
}

/// Encodes a value against an explicit schema, resolving references in `types`.
pub fn encode_with_schema(value: &Value, schema: &TypeSchema, types: &TypeCatalog) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_impl(&mut enc, value, schema, types, 0)?;
    Ok(enc.into_bytes()?)
}

/// Decodes a value against an explicit schema. The whole input must be consumed.
pub fn decode_with_schema(bytes: &[u8], schema: &TypeSchema, types: &TypeCatalog) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let value = decode_impl(&mut dec, schema, types, 0)?;
    finish(&dec)?;
    Ok(value)
}

fn finish(dec: &Decoder) -> Result<()> {
    if dec.is_empty() {
        Ok(())
    } else {
        Err(CodecErrorKind::TrailingBytes(dec.remaining()).into())
    }
}

fn mismatch(schema: &TypeSchema, value: &Value) -> CodecError {
    CodecErrorKind::TypeMismatch { expected: schema.describe(), found: value.kind_name() }.into()
}

fn resolve<'t>(types: &'t TypeCatalog, name: &str) -> Result<&'t TypeSchema> {
    types.get(name).ok_or_else(|| CodecErrorKind::UnknownType(name.to_string()).into())
}

fn tuple_bounds(elements: &[TypeSchema], optional_start: Option<usize>) -> (usize, usize) {
    let max = elements.len();
    (optional_start.unwrap_or(max).min(max), max)
}

// ============================================================================
//  ENCODE
// ============================================================================

fn encode_impl(enc: &mut Encoder, value: &Value, schema: &TypeSchema, types: &TypeCatalog, depth: usize) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(CodecErrorKind::RecursionLimitExceeded.into());
    }

    match (schema, value) {
        (TypeSchema::Any, v) => encode_any(enc, v, depth)?,
        (TypeSchema::Reference(name), v) => {
            encode_impl(enc, v, resolve(types, name)?, types, depth + 1)?
        }
        (TypeSchema::Literal(expected), v) => {
            if !literal_matches(expected, v) {
                return Err(mismatch(schema, v));
            }
            encode_any(enc, expected, depth + 1)?
        }
        (TypeSchema::Union(members), v) => {
            // Try each member on a scratch encoder so a failed attempt leaves
            // no partial output behind.
            let member = members
                .iter()
                .find(|m| encode_impl(&mut Encoder::new(), v, m, types, depth + 1).is_ok())
                .ok_or_else(|| mismatch(schema, v))?;
            encode_impl(enc, v, member, types, depth + 1)?
        }
        (TypeSchema::Nullable(_), Value::Null) => enc.unit()?,
        (TypeSchema::Nullable(inner), v) => encode_impl(enc, v, inner, types, depth + 1)?,
        (TypeSchema::Boolean, Value::Bool(b)) => enc.bool(*b)?,
        (TypeSchema::Number(scalar), v) => encode_number(enc, *scalar, schema, v)?,
        (TypeSchema::String, Value::String(s)) => enc.str(s)?,
        (TypeSchema::Buffer, Value::Bytes(b)) => enc.bytes(b)?,
        (TypeSchema::Array(item), Value::Array(items)) => {
            enc.list_begin()?;
            for (i, v) in items.iter().enumerate() {
                encode_impl(enc, v, item, types, depth + 1).map_err(|e| e.within(format!("[{}]", i)))?;
            }
            enc.list_end()?;
        }
        (TypeSchema::Tuple { elements, optional_start }, Value::Array(items)) => {
            let (min, max) = tuple_bounds(elements, *optional_start);
            if items.len() < min || items.len() > max {
                return Err(CodecErrorKind::ElementCount { min, max, found: items.len() }.into());
            }
            enc.list_begin()?;
            for (i, (v, ty)) in items.iter().zip(elements).enumerate() {
                if i >= min && v.is_null() {
                    enc.unit()?;
                    continue;
                }
                encode_impl(enc, v, ty, types, depth + 1).map_err(|e| e.within(format!("[{}]", i)))?;
            }
            enc.list_end()?;
        }
        (TypeSchema::Interface { properties }, Value::Object(fields)) => {
            if let Some(extra) = fields.keys().find(|k| !properties.iter().any(|p| &p.name == *k)) {
                return Err(CodecErrorKind::UnexpectedField(extra.clone()).into());
            }
            enc.map_begin()?;
            for prop in properties {
                match fields.get(&prop.name) {
                    Some(v) if !(prop.optional && v.is_null()) => {
                        enc.entry_begin(&prop.name)?;
                        encode_impl(enc, v, &prop.ty, types, depth + 1)
                            .map_err(|e| e.within(format!(".{}", prop.name)))?;
                        enc.entry_end()?;
                    }
                    _ if prop.optional => {}
                    _ => return Err(CodecErrorKind::MissingField(prop.name.clone()).into()),
                }
            }
            enc.map_end()?;
        }
        (schema, v) => return Err(mismatch(schema, v)),
    }
    Ok(())
}

/// Numbers compare by value regardless of their variant.
fn literal_matches(expected: &Value, value: &Value) -> bool {
    match (expected.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => expected == value,
    }
}

fn encode_number(enc: &mut Encoder, scalar: Scalar, schema: &TypeSchema, value: &Value) -> Result<()> {
    match (scalar, value) {
        (Scalar::Double, v) => {
            let f = v.as_f64().ok_or_else(|| mismatch(schema, v))?;
            enc.f64(f)?;
        }
        (Scalar::Int, Value::Int(i)) => enc.s64(*i)?,
        (Scalar::Int, Value::UInt(u)) => {
            let i = i64::try_from(*u).map_err(|_| CodecErrorKind::OutOfRange(format!("{} is not an int", u)))?;
            enc.s64(i)?;
        }
        (Scalar::UInt, Value::UInt(u)) => enc.u64(*u)?,
        (Scalar::UInt, Value::Int(i)) => {
            let u = u64::try_from(*i).map_err(|_| CodecErrorKind::OutOfRange(format!("{} is not a uint", i)))?;
            enc.u64(u)?;
        }
        (_, v) => return Err(mismatch(schema, v)),
    }
    Ok(())
}

/// Encodes a value using only its own shape.
fn encode_any(enc: &mut Encoder, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(CodecErrorKind::RecursionLimitExceeded.into());
    }

    match value {
        Value::Null => enc.unit()?,
        Value::Bool(b) => enc.bool(*b)?,
        Value::Int(i) => enc.s64(*i)?,
        Value::UInt(u) => enc.u64(*u)?,
        Value::Float(f) => enc.f64(*f)?,
        Value::String(s) => enc.str(s)?,
        Value::Bytes(b) => enc.bytes(b)?,
        Value::Array(items) => {
            enc.list_begin()?;
            for item in items {
                encode_any(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        Value::Object(fields) => {
            enc.map_begin()?;
            for (key, item) in fields {
                enc.entry_begin(key)?;
                encode_any(enc, item, depth + 1)?;
                enc.entry_end()?;
            }
            enc.map_end()?;
        }
    }
    Ok(())
}

// ============================================================================
//  DECODE
// ============================================================================

fn decode_impl(dec: &mut Decoder, schema: &TypeSchema, types: &TypeCatalog, depth: usize) -> Result<Value> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(CodecErrorKind::RecursionLimitExceeded.into());
    }

    match schema {
        TypeSchema::Any => decode_any(dec, depth),
        TypeSchema::Reference(name) => decode_impl(dec, resolve(types, name)?, types, depth + 1),
        TypeSchema::Literal(expected) => {
            let value = decode_any(dec, depth + 1)?;
            if literal_matches(expected, &value) {
                Ok(value)
            } else {
                Err(mismatch(schema, &value))
            }
        }
        TypeSchema::Union(members) => {
            for member in members {
                let mut scratch = dec.clone();
                if let Ok(value) = decode_impl(&mut scratch, member, types, depth + 1) {
                    *dec = scratch;
                    return Ok(value);
                }
            }
            let found = dec.peek_tag().map(tag_name).unwrap_or("end of input");
            Err(CodecErrorKind::TypeMismatch { expected: schema.describe(), found }.into())
        }
        TypeSchema::Nullable(inner) => {
            if dec.peek_tag()? == Tag::Unit {
                dec.unit()?;
                Ok(Value::Null)
            } else {
                decode_impl(dec, inner, types, depth + 1)
            }
        }
        TypeSchema::Boolean => Ok(Value::Bool(dec.bool()?)),
        TypeSchema::Number(Scalar::Double) => Ok(Value::Float(dec.f64()?)),
        TypeSchema::Number(Scalar::Int) => Ok(Value::Int(dec.s64()?)),
        TypeSchema::Number(Scalar::UInt) => Ok(Value::UInt(dec.u64()?)),
        TypeSchema::String => Ok(Value::String(dec.str()?.to_string())),
        TypeSchema::Buffer => Ok(Value::Bytes(dec.bytes()?.to_vec())),

        TypeSchema::Array(item) => {
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item_dec) = iter.next()? {
                let i = items.len();
                items.push(decode_impl(&mut item_dec, item, types, depth + 1).map_err(|e| e.within(format!("[{}]", i)))?);
            }
            Ok(Value::Array(items))
        }

        TypeSchema::Tuple { elements, optional_start } => {
            let (min, max) = tuple_bounds(elements, *optional_start);
            let mut iter = dec.list()?;
            let mut items = Vec::with_capacity(max);
            while let Some(mut item_dec) = iter.next()? {
                let i = items.len();
                let Some(ty) = elements.get(i) else {
                    return Err(CodecErrorKind::ElementCount { min, max, found: i + 1 }.into());
                };
                if i >= min && item_dec.peek_tag()? == Tag::Unit {
                    item_dec.unit()?;
                    items.push(Value::Null);
                    continue;
                }
                items.push(decode_impl(&mut item_dec, ty, types, depth + 1).map_err(|e| e.within(format!("[{}]", i)))?);
            }
            if items.len() < min {
                return Err(CodecErrorKind::ElementCount { min, max, found: items.len() }.into());
            }
            Ok(Value::Array(items))
        }

        TypeSchema::Interface { properties } => {
            let mut fields = BTreeMap::new();
            let mut map = dec.map()?;
            while let Some((key, mut val)) = map.next()? {
                let Some(prop) = properties.iter().find(|p| p.name == key) else {
                    continue;
                };
                let value = decode_impl(&mut val, &prop.ty, types, depth + 1)
                    .and_then(|v| finish(&val).map(|_| v))
                    .map_err(|e| e.within(format!(".{}", key)))?;
                fields.insert(key.to_string(), value);
            }
            if let Some(missing) = properties.iter().find(|p| !p.optional && !fields.contains_key(&p.name)) {
                return Err(CodecErrorKind::MissingField(missing.name.clone()).into());
            }
            Ok(Value::Object(fields))
        }
    }
}

fn tag_name(tag: Tag) -> &'static str {
    match tag {
        Tag::BoolTrue | Tag::BoolFalse => "boolean",
        Tag::U32 | Tag::U64 | Tag::S64 | Tag::F64 => "number",
        Tag::Unit => "null",
        Tag::String => "string",
        Tag::Bytes => "buffer",
        Tag::List => "array",
        Tag::Map => "object",
        Tag::Entry => "entry",
    }
}

/// Decodes a value using only the tags on the wire.
fn decode_any(dec: &mut Decoder, depth: usize) -> Result<Value> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(CodecErrorKind::RecursionLimitExceeded.into());
    }

    match dec.peek_tag()? {
        Tag::BoolTrue | Tag::BoolFalse => Ok(Value::Bool(dec.bool()?)),
        Tag::U32 => Ok(Value::UInt(dec.u32()? as u64)),
        Tag::U64 => Ok(Value::UInt(dec.u64()?)),
        Tag::S64 => Ok(Value::Int(dec.s64()?)),
        Tag::F64 => Ok(Value::Float(dec.f64()?)),
        Tag::Unit => {
            dec.unit()?;
            Ok(Value::Null)
        }
        Tag::String => Ok(Value::String(dec.str()?.to_string())),
        Tag::Bytes => Ok(Value::Bytes(dec.bytes()?.to_vec())),
        Tag::List => {
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item_dec) = iter.next()? {
                items.push(decode_any(&mut item_dec, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        Tag::Map => {
            let mut fields = BTreeMap::new();
            let mut map = dec.map()?;
            while let Some((key, mut val)) = map.next()? {
                let value = decode_any(&mut val, depth + 1)?;
                finish(&val)?;
                fields.insert(key.to_string(), value);
            }
            Ok(Value::Object(fields))
        }
        found @ Tag::Entry => Err(duopack::Error::UnexpectedTag { expected: Tag::Map, found }.into()),
    }
}
