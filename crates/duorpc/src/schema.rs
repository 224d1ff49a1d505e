//! # Schema catalog
//!
//! Named type descriptions consumed by the schema body codec. The catalog is the
//! single source of truth for payload shape; values are validated against it at
//! encode and decode time.

use std::collections::HashMap;

use crate::value::Value;

/// Wire representation of a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    /// IEEE-754 double. Accepts any numeric value when encoding.
    Double,
    /// Signed 64-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    UInt,
}

/// Shape of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSchema {
    /// Any self-describing value.
    Any,
    Boolean,
    Number(Scalar),
    String,
    Buffer,
    Array(Box<TypeSchema>),
    /// Fixed-position elements; those at or after `optional_start` may be omitted
    /// from the end or given as null.
    Tuple { elements: Vec<TypeSchema>, optional_start: Option<usize> },
    /// Named properties.
    Interface { properties: Vec<Property> },
    /// Exactly this value.
    Literal(Value),
    /// The first member the value matches.
    Union(Vec<TypeSchema>),
    /// The inner type, or null.
    Nullable(Box<TypeSchema>),
    /// Another named type in the same catalog.
    Reference(String),
}

impl TypeSchema {
    pub fn array(item: TypeSchema) -> Self {
        TypeSchema::Array(Box::new(item))
    }

    pub fn nullable(inner: TypeSchema) -> Self {
        TypeSchema::Nullable(Box::new(inner))
    }

    pub fn reference(name: impl Into<String>) -> Self {
        TypeSchema::Reference(name.into())
    }

    pub fn interface(properties: impl IntoIterator<Item = Property>) -> Self {
        TypeSchema::Interface { properties: properties.into_iter().collect() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        TypeSchema::Literal(value.into())
    }

    pub fn union(members: impl IntoIterator<Item = TypeSchema>) -> Self {
        TypeSchema::Union(members.into_iter().collect())
    }

    pub fn tuple(elements: impl IntoIterator<Item = TypeSchema>, optional_start: Option<usize>) -> Self {
        TypeSchema::Tuple { elements: elements.into_iter().collect(), optional_start }
    }

    /// Human readable name, used in codec error messages.
    pub fn describe(&self) -> String {
        match self {
            TypeSchema::Any => "any".into(),
            TypeSchema::Boolean => "boolean".into(),
            TypeSchema::Number(Scalar::Double) => "number".into(),
            TypeSchema::Number(Scalar::Int) => "int".into(),
            TypeSchema::Number(Scalar::UInt) => "uint".into(),
            TypeSchema::String => "string".into(),
            TypeSchema::Buffer => "buffer".into(),
            TypeSchema::Array(item) => format!("{}[]", item.describe()),
            TypeSchema::Tuple { elements, .. } => format!("tuple of {}", elements.len()),
            TypeSchema::Interface { .. } => "interface".into(),
            TypeSchema::Literal(value) => format!("literal {:?}", value),
            TypeSchema::Union(members) => {
                members.iter().map(TypeSchema::describe).collect::<Vec<_>>().join(" | ")
            }
            TypeSchema::Nullable(inner) => format!("{} | null", inner.describe()),
            TypeSchema::Reference(name) => name.clone(),
        }
    }
}

/// A named field of an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub ty: TypeSchema,
    pub optional: bool,
}

impl Property {
    pub fn required(name: impl Into<String>, ty: TypeSchema) -> Self {
        Self { name: name.into(), ty, optional: false }
    }

    pub fn optional(name: impl Into<String>, ty: TypeSchema) -> Self {
        Self { name: name.into(), ty, optional: true }
    }
}

/// A set of named schemas.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: HashMap<String, TypeSchema>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named schema, replacing any previous one with the same name.
    pub fn with(mut self, name: impl Into<String>, schema: TypeSchema) -> Self {
        self.insert(name, schema);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, schema: TypeSchema) {
        self.types.insert(name.into(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&TypeSchema> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns the first reference (by schema name, then referenced name) that
    /// does not resolve inside this catalog.
    pub fn find_dangling_reference(&self) -> Option<(String, String)> {
        let mut names: Vec<_> = self.types.keys().collect();
        names.sort();
        for name in names {
            if let Some(missing) = self.dangling_in(&self.types[name]) {
                return Some((name.clone(), missing));
            }
        }
        None
    }

    fn dangling_in(&self, schema: &TypeSchema) -> Option<String> {
        match schema {
            TypeSchema::Reference(target) if !self.contains(target) => Some(target.clone()),
            TypeSchema::Array(inner) | TypeSchema::Nullable(inner) => self.dangling_in(inner),
            TypeSchema::Tuple { elements, .. } | TypeSchema::Union(elements) => {
                elements.iter().find_map(|e| self.dangling_in(e))
            }
            TypeSchema::Interface { properties } => {
                properties.iter().find_map(|p| self.dangling_in(&p.ty))
            }
            _ => None,
        }
    }
}
