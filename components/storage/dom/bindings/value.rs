/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The script-visible values that can be stored in an object store.
//!
//! Objects have identity: cloning a [`Value::Object`] clones the reference,
//! so graphs may share sub-objects and contain cycles.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Object(ObjectRef),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl TypedArrayKind {
    pub(crate) const ALL: [TypedArrayKind; 12] = [
        TypedArrayKind::Int8,
        TypedArrayKind::Uint8,
        TypedArrayKind::Uint8Clamped,
        TypedArrayKind::Int16,
        TypedArrayKind::Uint16,
        TypedArrayKind::Int32,
        TypedArrayKind::Uint32,
        TypedArrayKind::Float32,
        TypedArrayKind::Float64,
        TypedArrayKind::BigInt64,
        TypedArrayKind::BigUint64,
        TypedArrayKind::DataView,
    ];
}

#[derive(Clone, Debug)]
pub enum Object {
    /// Own enumerable properties, in insertion order.
    Plain(IndexMap<String, Value>),
    Array(Vec<Value>),
    /// Milliseconds since the epoch; NaN for an invalid date.
    Date(f64),
    RegExp { source: String, flags: String },
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    ArrayBuffer(Vec<u8>),
    ArrayBufferView { kind: TypedArrayKind, bytes: Vec<u8> },
}

impl Object {
    fn kind_name(&self) -> &'static str {
        match self {
            Object::Plain(_) => "Object",
            Object::Array(_) => "Array",
            Object::Date(_) => "Date",
            Object::RegExp { .. } => "RegExp",
            Object::Map(_) => "Map",
            Object::Set(_) => "Set",
            Object::ArrayBuffer(_) => "ArrayBuffer",
            Object::ArrayBufferView { .. } => "ArrayBufferView",
        }
    }
}

#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<Object>>);

impl ObjectRef {
    pub fn new(object: Object) -> Self {
        ObjectRef(Rc::new(RefCell::new(object)))
    }

    pub fn borrow(&self) -> Ref<'_, Object> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Object> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Identity of the object, for visited sets.
    pub(crate) fn as_ptr(&self) -> *const RefCell<Object> {
        Rc::as_ptr(&self.0)
    }

    /// An own property of a plain object.
    pub fn get(&self, property: &str) -> Option<Value> {
        match &*self.borrow() {
            Object::Plain(properties) => properties.get(property).cloned(),
            _ => None,
        }
    }

    /// Defines an own property on a plain object. Returns false for other objects.
    pub fn set(&self, property: &str, value: Value) -> bool {
        match &mut *self.borrow_mut() {
            Object::Plain(properties) => {
                properties.insert(property.to_owned(), value);
                true
            },
            _ => false,
        }
    }
}

impl fmt::Debug for ObjectRef {
    // Shallow, since the graph may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(object) => write!(f, "{}@{:p}", object.kind_name(), self.as_ptr()),
            Err(_) => write!(f, "Object@{:p}", self.as_ptr()),
        }
    }
}

impl Value {
    pub fn object<'a>(properties: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
        let properties = properties
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect();
        Value::Object(ObjectRef::new(Object::Plain(properties)))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Object(ObjectRef::new(Object::Array(items.into_iter().collect())))
    }

    pub fn date(time: f64) -> Value {
        Value::Object(ObjectRef::new(Object::Date(time)))
    }

    pub fn array_buffer(bytes: Vec<u8>) -> Value {
        Value::Object(ObjectRef::new(Object::ArrayBuffer(bytes)))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(string) => Some(string),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// An own property, if this is a plain object.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.as_object().and_then(|object| object.get(property))
    }

    /// Structural equality that terminates on cyclic graphs.
    pub fn deep_equals(&self, other: &Value) -> bool {
        let mut assumed = vec![];
        values_equal(self, other, &mut assumed)
    }
}

type PointerPair = (*const RefCell<Object>, *const RefCell<Object>);

fn values_equal(left: &Value, right: &Value, assumed: &mut Vec<PointerPair>) -> bool {
    match (left, right) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(*a, *b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Object(a), Value::Object(b)) => {
            let pair = (a.as_ptr(), b.as_ptr());
            if a.ptr_eq(b) || assumed.contains(&pair) {
                return true;
            }
            assumed.push(pair);
            objects_equal(&a.borrow(), &b.borrow(), assumed)
        },
        _ => false,
    }
}

fn numbers_equal(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn sequences_equal(left: &[Value], right: &[Value], assumed: &mut Vec<PointerPair>) -> bool {
    left.len() == right.len() &&
        left
            .iter()
            .zip(right)
            .all(|(a, b)| values_equal(a, b, assumed))
}

fn objects_equal(left: &Object, right: &Object, assumed: &mut Vec<PointerPair>) -> bool {
    match (left, right) {
        (Object::Plain(a), Object::Plain(b)) => {
            a.len() == b.len() &&
                a.iter().zip(b.iter()).all(|((name_a, value_a), (name_b, value_b))| {
                    name_a == name_b && values_equal(value_a, value_b, assumed)
                })
        },
        (Object::Array(a), Object::Array(b)) | (Object::Set(a), Object::Set(b)) => {
            sequences_equal(a, b, assumed)
        },
        (Object::Date(a), Object::Date(b)) => numbers_equal(*a, *b),
        (
            Object::RegExp {
                source: source_a,
                flags: flags_a,
            },
            Object::RegExp {
                source: source_b,
                flags: flags_b,
            },
        ) => source_a == source_b && flags_a == flags_b,
        (Object::Map(a), Object::Map(b)) => {
            a.len() == b.len() &&
                a.iter().zip(b.iter()).all(|((key_a, value_a), (key_b, value_b))| {
                    values_equal(key_a, key_b, assumed) && values_equal(value_a, value_b, assumed)
                })
        },
        (Object::ArrayBuffer(a), Object::ArrayBuffer(b)) => a == b,
        (
            Object::ArrayBufferView {
                kind: kind_a,
                bytes: bytes_a,
            },
            Object::ArrayBufferView {
                kind: kind_b,
                bytes: bytes_b,
            },
        ) => kind_a == kind_b && bytes_a == bytes_b,
        _ => false,
    }
}

impl From<bool> for Value {
    fn from(boolean: bool) -> Self {
        Value::Boolean(boolean)
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Number(number)
    }
}

impl From<i32> for Value {
    fn from(number: i32) -> Self {
        Value::Number(number.into())
    }
}

impl From<&str> for Value {
    fn from(string: &str) -> Self {
        Value::String(string.to_owned())
    }
}

impl From<String> for Value {
    fn from(string: String) -> Self {
        Value::String(string)
    }
}
