/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! This module implements structured cloning, as defined by [HTML](https://html.spec.whatwg.org/multipage/#safe-passing-of-structured-data).
//!
//! Every object gets an index in an arena the first time it is visited, in
//! both directions. A later visit writes a back-reference to that index, so
//! shared sub-objects stay shared and cycles terminate.

use std::cell::RefCell;
use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use log::warn;
use rustc_hash::FxHashMap;

use crate::dom::bindings::error::{Error, Fallible};
use crate::dom::bindings::value::{Object, ObjectRef, TypedArrayKind, Value};

const FORMAT_VERSION: u8 = 1;

#[repr(u8)]
enum StructuredCloneTags {
    Undefined = 0x00,
    Null = 0x01,
    False = 0x02,
    True = 0x03,
    Number = 0x04,
    String = 0x05,
    BackReference = 0x10,
    Object = 0x11,
    Array = 0x12,
    Date = 0x13,
    RegExp = 0x14,
    Map = 0x15,
    Set = 0x16,
    ArrayBuffer = 0x17,
    ArrayBufferView = 0x18,
}

impl StructuredCloneTags {
    fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x00 => StructuredCloneTags::Undefined,
            0x01 => StructuredCloneTags::Null,
            0x02 => StructuredCloneTags::False,
            0x03 => StructuredCloneTags::True,
            0x04 => StructuredCloneTags::Number,
            0x05 => StructuredCloneTags::String,
            0x10 => StructuredCloneTags::BackReference,
            0x11 => StructuredCloneTags::Object,
            0x12 => StructuredCloneTags::Array,
            0x13 => StructuredCloneTags::Date,
            0x14 => StructuredCloneTags::RegExp,
            0x15 => StructuredCloneTags::Map,
            0x16 => StructuredCloneTags::Set,
            0x17 => StructuredCloneTags::ArrayBuffer,
            0x18 => StructuredCloneTags::ArrayBufferView,
            _ => return None,
        })
    }
}

/// Serializes `value` into bytes that [`read`] turns back into an equivalent graph.
pub fn write(value: &Value) -> Fallible<Vec<u8>> {
    let mut writer = StructuredDataWriter {
        output: vec![FORMAT_VERSION],
        memory: FxHashMap::default(),
    };
    writer.write_value(value).map_err(|error| {
        warn!("Structured clone serialization failed: {error}");
        Error::DataClone
    })?;
    Ok(writer.output)
}

/// Deserializes the output of [`write`].
pub fn read(data: &[u8]) -> Fallible<Value> {
    let mut reader = StructuredDataReader {
        input: Cursor::new(data),
        memory: vec![],
    };
    let result = reader
        .check_version()
        .and_then(|_| reader.read_value());
    result.map_err(|error| {
        warn!("Structured clone deserialization failed: {error}");
        Error::DataClone
    })
}

/// <https://html.spec.whatwg.org/multipage/#structuredclone>
pub fn clone(value: &Value) -> Fallible<Value> {
    read(&write(value)?)
}

struct StructuredDataWriter {
    output: Vec<u8>,
    /// Arena index of every object written so far.
    memory: FxHashMap<*const RefCell<Object>, u32>,
}

impl StructuredDataWriter {
    fn write_tag(&mut self, tag: StructuredCloneTags) -> io::Result<()> {
        self.output.write_u8(tag as u8)
    }

    fn write_length(&mut self, length: usize) -> io::Result<()> {
        let length = u32::try_from(length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
        self.output.write_u32::<BigEndian>(length)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_length(bytes.len())?;
        self.output.write_all(bytes)
    }

    fn write_string(&mut self, string: &str) -> io::Result<()> {
        self.write_bytes(string.as_bytes())
    }

    fn write_value(&mut self, value: &Value) -> io::Result<()> {
        match value {
            Value::Undefined => self.write_tag(StructuredCloneTags::Undefined),
            Value::Null => self.write_tag(StructuredCloneTags::Null),
            Value::Boolean(false) => self.write_tag(StructuredCloneTags::False),
            Value::Boolean(true) => self.write_tag(StructuredCloneTags::True),
            Value::Number(number) => {
                self.write_tag(StructuredCloneTags::Number)?;
                self.output.write_f64::<BigEndian>(*number)
            },
            Value::String(string) => {
                self.write_tag(StructuredCloneTags::String)?;
                self.write_string(string)
            },
            Value::Object(object) => self.write_object(object),
        }
    }

    fn write_object(&mut self, object: &ObjectRef) -> io::Result<()> {
        if let Some(index) = self.memory.get(&object.as_ptr()).copied() {
            self.write_tag(StructuredCloneTags::BackReference)?;
            return self.output.write_u32::<BigEndian>(index);
        }
        let index = self.memory.len() as u32;
        self.memory.insert(object.as_ptr(), index);

        match &*object.borrow() {
            Object::Plain(properties) => {
                self.write_tag(StructuredCloneTags::Object)?;
                self.write_length(properties.len())?;
                for (name, value) in properties {
                    self.write_string(name)?;
                    self.write_value(value)?;
                }
                Ok(())
            },
            Object::Array(items) => {
                self.write_tag(StructuredCloneTags::Array)?;
                self.write_length(items.len())?;
                items.iter().try_for_each(|item| self.write_value(item))
            },
            Object::Date(time) => {
                self.write_tag(StructuredCloneTags::Date)?;
                self.output.write_f64::<BigEndian>(*time)
            },
            Object::RegExp { source, flags } => {
                self.write_tag(StructuredCloneTags::RegExp)?;
                self.write_string(source)?;
                self.write_string(flags)
            },
            Object::Map(entries) => {
                self.write_tag(StructuredCloneTags::Map)?;
                self.write_length(entries.len())?;
                for (key, value) in entries {
                    self.write_value(key)?;
                    self.write_value(value)?;
                }
                Ok(())
            },
            Object::Set(items) => {
                self.write_tag(StructuredCloneTags::Set)?;
                self.write_length(items.len())?;
                items.iter().try_for_each(|item| self.write_value(item))
            },
            Object::ArrayBuffer(bytes) => {
                self.write_tag(StructuredCloneTags::ArrayBuffer)?;
                self.write_bytes(bytes)
            },
            Object::ArrayBufferView { kind, bytes } => {
                self.write_tag(StructuredCloneTags::ArrayBufferView)?;
                let kind = TypedArrayKind::ALL
                    .iter()
                    .position(|candidate| candidate == kind)
                    .unwrap_or_default();
                self.output.write_u8(kind as u8)?;
                self.write_bytes(bytes)
            },
        }
    }
}

struct StructuredDataReader<'a> {
    input: Cursor<&'a [u8]>,
    /// Objects in the order they were first read.
    memory: Vec<ObjectRef>,
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

impl StructuredDataReader<'_> {
    fn check_version(&mut self) -> io::Result<()> {
        match self.input.read_u8()? {
            FORMAT_VERSION => Ok(()),
            _ => Err(invalid_data("unsupported format version")),
        }
    }

    fn read_length(&mut self) -> io::Result<usize> {
        Ok(self.input.read_u32::<BigEndian>()? as usize)
    }

    fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let length = self.read_length()?;
        let remaining = self.input.get_ref().len() as u64 - self.input.position();
        if length as u64 > remaining {
            return Err(invalid_data("truncated buffer"));
        }
        let mut bytes = vec![0; length];
        self.input.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_string(&mut self) -> io::Result<String> {
        String::from_utf8(self.read_bytes()?).map_err(|_| invalid_data("invalid string"))
    }

    /// Registers the object before its children are read so that they can
    /// refer back to it.
    fn allocate(&mut self, object: Object) -> ObjectRef {
        let object = ObjectRef::new(object);
        self.memory.push(object.clone());
        object
    }

    fn read_value(&mut self) -> io::Result<Value> {
        let tag = self.input.read_u8()?;
        let Some(tag) = StructuredCloneTags::from_u8(tag) else {
            return Err(invalid_data("unknown tag"));
        };
        let value = match tag {
            StructuredCloneTags::Undefined => Value::Undefined,
            StructuredCloneTags::Null => Value::Null,
            StructuredCloneTags::False => Value::Boolean(false),
            StructuredCloneTags::True => Value::Boolean(true),
            StructuredCloneTags::Number => Value::Number(self.input.read_f64::<BigEndian>()?),
            StructuredCloneTags::String => Value::String(self.read_string()?),
            StructuredCloneTags::BackReference => {
                let index = self.input.read_u32::<BigEndian>()? as usize;
                let object = self
                    .memory
                    .get(index)
                    .ok_or_else(|| invalid_data("dangling back-reference"))?;
                Value::Object(object.clone())
            },
            StructuredCloneTags::Object => {
                let object = self.allocate(Object::Plain(IndexMap::new()));
                let length = self.read_length()?;
                let mut properties = IndexMap::new();
                for _ in 0..length {
                    let name = self.read_string()?;
                    let value = self.read_value()?;
                    properties.insert(name, value);
                }
                *object.borrow_mut() = Object::Plain(properties);
                Value::Object(object)
            },
            StructuredCloneTags::Array => {
                let object = self.allocate(Object::Array(vec![]));
                let items = self.read_sequence()?;
                *object.borrow_mut() = Object::Array(items);
                Value::Object(object)
            },
            StructuredCloneTags::Date => {
                let time = self.input.read_f64::<BigEndian>()?;
                Value::Object(self.allocate(Object::Date(time)))
            },
            StructuredCloneTags::RegExp => {
                let object = self.allocate(Object::RegExp {
                    source: String::new(),
                    flags: String::new(),
                });
                let source = self.read_string()?;
                let flags = self.read_string()?;
                *object.borrow_mut() = Object::RegExp { source, flags };
                Value::Object(object)
            },
            StructuredCloneTags::Map => {
                let object = self.allocate(Object::Map(vec![]));
                let length = self.read_length()?;
                let mut entries = Vec::new();
                for _ in 0..length {
                    let key = self.read_value()?;
                    let value = self.read_value()?;
                    entries.push((key, value));
                }
                *object.borrow_mut() = Object::Map(entries);
                Value::Object(object)
            },
            StructuredCloneTags::Set => {
                let object = self.allocate(Object::Set(vec![]));
                let items = self.read_sequence()?;
                *object.borrow_mut() = Object::Set(items);
                Value::Object(object)
            },
            StructuredCloneTags::ArrayBuffer => {
                let object = self.allocate(Object::ArrayBuffer(vec![]));
                let bytes = self.read_bytes()?;
                *object.borrow_mut() = Object::ArrayBuffer(bytes);
                Value::Object(object)
            },
            StructuredCloneTags::ArrayBufferView => {
                let object = self.allocate(Object::ArrayBuffer(vec![]));
                let kind = TypedArrayKind::ALL
                    .get(self.input.read_u8()? as usize)
                    .copied()
                    .ok_or_else(|| invalid_data("unknown array buffer view"))?;
                let bytes = self.read_bytes()?;
                *object.borrow_mut() = Object::ArrayBufferView { kind, bytes };
                Value::Object(object)
            },
        };
        Ok(value)
    }

    fn read_sequence(&mut self) -> io::Result<Vec<Value>> {
        let length = self.read_length()?;
        let mut items = Vec::new();
        for _ in 0..length {
            items.push(self.read_value()?);
        }
        Ok(items)
    }
}
