//! Typed scalar values.
//!
//! A [`Value`] is the client-side rendering of one `VariantValue` scalar.
//! The node's declared `ValueType` picks which variant field is read or
//! written; each type maps to its corresponding field (DOUBLE to `d_value`,
//! UINT64 to `ui64_value`, and so on).

use cdp_proto::{ValueType, VariantValue};

/// The last observed (or to-be-written) scalar of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Double(f64),
    Float(f32),
    Int64(i64),
    Uint64(u64),
    Int(i32),
    Uint(u32),
    Short(i16),
    Ushort(u16),
    Char(i8),
    Uchar(u8),
    Bool(bool),
    String(String),
    /// No value observed yet and the node carries no scalar type.
    Undefined,
}

impl Value {
    /// The initial value of a node before any update arrives.
    pub fn default_for(value_type: ValueType) -> Value {
        match value_type {
            ValueType::Double => Value::Double(0.0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Int64 => Value::Int64(0),
            ValueType::Uint64 => Value::Uint64(0),
            ValueType::Int => Value::Int(0),
            ValueType::Uint => Value::Uint(0),
            ValueType::Short => Value::Short(0),
            ValueType::Ushort => Value::Ushort(0),
            ValueType::Char => Value::Char(0),
            ValueType::Uchar => Value::Uchar(0),
            ValueType::Bool => Value::Bool(false),
            ValueType::String => Value::String(String::new()),
            ValueType::Undefined => Value::Undefined,
        }
    }

    /// Decode the scalar matching `value_type` from a variant.
    ///
    /// Returns `None` when the expected field is absent.
    pub fn from_variant(value_type: ValueType, variant: &VariantValue) -> Option<Value> {
        match value_type {
            ValueType::Double => variant.d_value.map(Value::Double),
            ValueType::Float => variant.f_value.map(Value::Float),
            ValueType::Int64 => variant.i64_value.map(Value::Int64),
            ValueType::Uint64 => variant.ui64_value.map(Value::Uint64),
            ValueType::Int => variant.i_value.map(Value::Int),
            ValueType::Uint => variant.ui_value.map(Value::Uint),
            ValueType::Short => variant.s_value.map(Value::Short),
            ValueType::Ushort => variant.us_value.map(Value::Ushort),
            ValueType::Char => variant.c_value.map(Value::Char),
            ValueType::Uchar => variant.uc_value.map(Value::Uchar),
            ValueType::Bool => variant.b_value.map(Value::Bool),
            ValueType::String => variant.str_value.clone().map(Value::String),
            ValueType::Undefined => None,
        }
    }

    /// Encode this scalar into a variant, populating the field matching the
    /// value's own type.  `node_id` and `timestamp` are left for the caller.
    pub fn to_variant(&self) -> VariantValue {
        let mut variant = VariantValue::default();
        match self {
            Value::Double(v) => variant.d_value = Some(*v),
            Value::Float(v) => variant.f_value = Some(*v),
            Value::Int64(v) => variant.i64_value = Some(*v),
            Value::Uint64(v) => variant.ui64_value = Some(*v),
            Value::Int(v) => variant.i_value = Some(*v),
            Value::Uint(v) => variant.ui_value = Some(*v),
            Value::Short(v) => variant.s_value = Some(*v),
            Value::Ushort(v) => variant.us_value = Some(*v),
            Value::Char(v) => variant.c_value = Some(*v),
            Value::Uchar(v) => variant.uc_value = Some(*v),
            Value::Bool(v) => variant.b_value = Some(*v),
            Value::String(v) => variant.str_value = Some(v.clone()),
            Value::Undefined => {}
        }
        variant
    }

    /// The wire type this value encodes as.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Double(_) => ValueType::Double,
            Value::Float(_) => ValueType::Float,
            Value::Int64(_) => ValueType::Int64,
            Value::Uint64(_) => ValueType::Uint64,
            Value::Int(_) => ValueType::Int,
            Value::Uint(_) => ValueType::Uint,
            Value::Short(_) => ValueType::Short,
            Value::Ushort(_) => ValueType::Ushort,
            Value::Char(_) => ValueType::Char,
            Value::Uchar(_) => ValueType::Uchar,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
            Value::Undefined => ValueType::Undefined,
        }
    }
}
