use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tag of a [`PropertyValue`]. Reads name the tag they expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Integer,
    String,
    Float,
    Double,
    Object,
    Color,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::String => "string",
            Self::Float => "float",
            Self::Double => "double",
            Self::Object => "object",
            Self::Color => "color",
        };
        f.write_str(name)
    }
}

/// Handle to an object owned outside the world (an entity, an asset, ...).
///
/// The nil handle stands for "no object" and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef(pub Uuid);

impl ObjectRef {
    pub const NULL: Self = Self(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ObjectRef {
    fn default() -> Self {
        Self::NULL
    }
}

/// Linear RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Self = Self::rgba(1.0, 1.0, 1.0, 1.0);
    pub const CLEAR: Self = Self::rgba(0.0, 0.0, 0.0, 0.0);

    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

/// A tagged property value attached to one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Integer(i32),
    String(String),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
    Color(Color),
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Integer(_) => ValueKind::Integer,
            Self::String(_) => ValueKind::String,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Object(_) => ValueKind::Object,
            Self::Color(_) => ValueKind::Color,
        }
    }

    /// Whether this is the null object handle, which cannot be stored.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Object(o) if o.is_null())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Double(v) => write!(f, "{v}d"),
            Self::Object(v) => write!(f, "object {}", v.0),
            Self::Color(c) => write!(f, "rgba({}, {}, {}, {})", c.r, c.g, c.b, c.a),
        }
    }
}

/// Errors from typed property reads.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropertyError {
    #[error("property {name:?} holds a {found} value, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },
}

/// A Rust type that maps onto exactly one [`ValueKind`].
pub trait PropertyKind: Sized {
    const KIND: ValueKind;

    /// Extract the payload if `value` carries this kind. Never converts between kinds.
    fn from_value(value: &PropertyValue) -> Option<Self>;

    fn into_value(self) -> PropertyValue;
}

macro_rules! property_kind {
    ($ty:ty, $variant:ident) => {
        impl PropertyKind for $ty {
            const KIND: ValueKind = ValueKind::$variant;

            fn from_value(value: &PropertyValue) -> Option<Self> {
                match value {
                    PropertyValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            fn into_value(self) -> PropertyValue {
                PropertyValue::$variant(self)
            }
        }

        impl From<$ty> for PropertyValue {
            fn from(v: $ty) -> Self {
                PropertyValue::$variant(v)
            }
        }
    };
}

property_kind!(i32, Integer);
property_kind!(String, String);
property_kind!(f32, Float);
property_kind!(f64, Double);
property_kind!(ObjectRef, Object);
property_kind!(Color, Color);

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_owned())
    }
}
