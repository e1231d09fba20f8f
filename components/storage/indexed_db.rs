/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use storage_traits::indexeddb::{IndexedDBKeyRange, IndexedDBKeyType, KeyPath};

use crate::dom::bindings::error::{Error, Fallible};
use crate::dom::bindings::value::{Object, ObjectRef, Value};
use crate::dom::idbkeyrange::IDBKeyRange;

/// Largest integer a key generator can produce.
pub(crate) const MAX_KEY_GENERATOR_VALUE: u64 = 1 << 53;

/// A key, or a key range, passed as a query argument.
#[derive(Clone, Debug)]
pub enum KeyOrKeyRange {
    Key(Value),
    Range(IDBKeyRange),
}

impl From<Value> for KeyOrKeyRange {
    fn from(value: Value) -> Self {
        KeyOrKeyRange::Key(value)
    }
}

impl From<IDBKeyRange> for KeyOrKeyRange {
    fn from(range: IDBKeyRange) -> Self {
        KeyOrKeyRange::Range(range)
    }
}

impl From<i32> for KeyOrKeyRange {
    fn from(number: i32) -> Self {
        KeyOrKeyRange::Key(number.into())
    }
}

impl From<f64> for KeyOrKeyRange {
    fn from(number: f64) -> Self {
        KeyOrKeyRange::Key(number.into())
    }
}

impl From<&str> for KeyOrKeyRange {
    fn from(string: &str) -> Self {
        KeyOrKeyRange::Key(string.into())
    }
}

// https://www.w3.org/TR/IndexedDB-2/#convert-key-to-value
pub fn key_type_to_value(key: &IndexedDBKeyType) -> Value {
    match key {
        IndexedDBKeyType::Number(number) => Value::Number(*number),
        IndexedDBKeyType::String(string) => Value::String(string.clone()),
        IndexedDBKeyType::Binary(bytes) => Value::array_buffer(bytes.clone()),
        IndexedDBKeyType::Date(time) => Value::date(*time),
        IndexedDBKeyType::Array(members) => Value::array(members.iter().map(key_type_to_value)),
    }
}

// https://www.w3.org/TR/IndexedDB-2/#valid-key-path
pub fn is_valid_key_path(key_path: &KeyPath) -> bool {
    fn is_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        (first.is_alphabetic() || first == '_' || first == '$') &&
            chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
    }

    let is_valid = |path: &String| path.is_empty() || path.split('.').all(is_identifier);

    match key_path {
        KeyPath::Sequence(paths) => {
            if paths.is_empty() {
                return false;
            }

            paths.iter().all(is_valid)
        },
        KeyPath::String(path) => is_valid(path),
    }
}

pub(crate) enum ConversionResult {
    Valid(IndexedDBKeyType),
    Invalid,
}

impl ConversionResult {
    pub(crate) fn into_result(self) -> Fallible<IndexedDBKeyType> {
        match self {
            ConversionResult::Valid(key) => Ok(key),
            ConversionResult::Invalid => Err(Error::Data),
        }
    }
}

// https://www.w3.org/TR/IndexedDB-2/#convert-value-to-key
pub(crate) fn convert_value_to_key(input: &Value, seen: Option<Vec<ObjectRef>>) -> ConversionResult {
    // Step 1: If seen was not given, then let seen be a new empty set.
    let mut seen = seen.unwrap_or_default();

    match input {
        Value::Number(number) => {
            if number.is_nan() {
                return ConversionResult::Invalid;
            }
            ConversionResult::Valid(IndexedDBKeyType::Number(*number))
        },
        Value::String(string) => ConversionResult::Valid(IndexedDBKeyType::String(string.clone())),
        Value::Object(object) => {
            // Step 2: If seen contains input, then return invalid.
            if seen.iter().any(|visited| visited.ptr_eq(object)) {
                return ConversionResult::Invalid;
            }
            match &*object.borrow() {
                Object::Date(time) => {
                    if time.is_nan() {
                        return ConversionResult::Invalid;
                    }
                    ConversionResult::Valid(IndexedDBKeyType::Date(*time))
                },
                Object::ArrayBuffer(bytes) | Object::ArrayBufferView { bytes, .. } => {
                    ConversionResult::Valid(IndexedDBKeyType::Binary(bytes.clone()))
                },
                Object::Array(items) => {
                    // Append input to seen.
                    seen.push(object.clone());
                    let mut keys = Vec::with_capacity(items.len());
                    for item in items {
                        match convert_value_to_key(item, Some(seen.clone())) {
                            ConversionResult::Valid(key) => keys.push(key),
                            ConversionResult::Invalid => return ConversionResult::Invalid,
                        }
                    }
                    ConversionResult::Valid(IndexedDBKeyType::Array(keys))
                },
                _ => ConversionResult::Invalid,
            }
        },
        _ => ConversionResult::Invalid,
    }
}

// https://www.w3.org/TR/IndexedDB-2/#convert-a-value-to-a-multientry-key
pub(crate) fn convert_value_to_multi_entry_key(input: &Value) -> ConversionResult {
    let Value::Object(object) = input else {
        return convert_value_to_key(input, None);
    };
    let borrowed = object.borrow();
    let Object::Array(items) = &*borrowed else {
        return convert_value_to_key(input, None);
    };

    let seen = vec![object.clone()];
    let mut keys: Vec<IndexedDBKeyType> = vec![];
    for item in items {
        // Invalid members are skipped, and so are duplicates.
        if let ConversionResult::Valid(key) = convert_value_to_key(item, Some(seen.clone())) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    ConversionResult::Valid(IndexedDBKeyType::Array(keys))
}

/// Validates a key passed directly to an API method.
pub fn validate_key(input: &Value) -> Fallible<IndexedDBKeyType> {
    convert_value_to_key(input, None).into_result()
}

// https://www.w3.org/TR/IndexedDB-2/#convert-a-value-to-a-key-range
pub(crate) fn convert_value_to_key_range(
    input: Option<&KeyOrKeyRange>,
    null_disallowed: Option<bool>,
) -> Fallible<IndexedDBKeyRange> {
    let null_disallowed = null_disallowed.unwrap_or(false);
    match input {
        // Step 1.
        Some(KeyOrKeyRange::Range(range)) => Ok(range.inner().clone()),
        // Step 2.
        None | Some(KeyOrKeyRange::Key(Value::Undefined | Value::Null)) => {
            if null_disallowed {
                return Err(Error::Data);
            }
            Ok(IndexedDBKeyRange::unbounded())
        },
        // Step 3-4.
        Some(KeyOrKeyRange::Key(value)) => Ok(IndexedDBKeyRange::only(validate_key(value)?)),
    }
}

pub(crate) enum EvaluationResult {
    Success(Value),
    Failure,
}

// https://www.w3.org/TR/IndexedDB-2/#evaluate-a-key-path-on-a-value
pub(crate) fn evaluate_key_path_on_value(value: &Value, key_path: &KeyPath) -> EvaluationResult {
    match key_path {
        // Step 1.
        KeyPath::Sequence(paths) => {
            let mut result = Vec::with_capacity(paths.len());
            for path in paths {
                match evaluate_key_path_on_value(value, &KeyPath::String(path.clone())) {
                    EvaluationResult::Success(key) => result.push(key),
                    EvaluationResult::Failure => return EvaluationResult::Failure,
                }
            }
            EvaluationResult::Success(Value::array(result))
        },
        KeyPath::String(path) => {
            // Step 2.
            if path.is_empty() {
                return EvaluationResult::Success(value.clone());
            }

            // Step 3.
            let mut current = value.clone();
            for identifier in path.split('.') {
                let next = match (&current, identifier) {
                    (Value::String(string), "length") => {
                        Some(Value::Number(string.encode_utf16().count() as f64))
                    },
                    (Value::Object(object), identifier) => match &*object.borrow() {
                        Object::Array(items) if identifier == "length" => {
                            Some(Value::Number(items.len() as f64))
                        },
                        Object::Plain(properties) => properties.get(identifier).cloned(),
                        _ => None,
                    },
                    _ => None,
                };
                match next {
                    Some(next) if !next.is_undefined() => current = next,
                    _ => return EvaluationResult::Failure,
                }
            }
            EvaluationResult::Success(current)
        },
    }
}

pub(crate) enum ExtractionResult {
    Key(IndexedDBKeyType),
    Invalid,
    Failure,
}

// https://www.w3.org/TR/IndexedDB-2/#extract-a-key-from-a-value-using-a-key-path
pub(crate) fn extract_key(input: &Value, key_path: &KeyPath, multi_entry: Option<bool>) -> ExtractionResult {
    // Step 1-2: Evaluate key path, rethrowing failures.
    let EvaluationResult::Success(result) = evaluate_key_path_on_value(input, key_path) else {
        return ExtractionResult::Failure;
    };

    // Step 3-5.
    let conversion = if multi_entry.unwrap_or(false) {
        convert_value_to_multi_entry_key(&result)
    } else {
        convert_value_to_key(&result, None)
    };
    match conversion {
        ConversionResult::Valid(key) => ExtractionResult::Key(key),
        ConversionResult::Invalid => ExtractionResult::Invalid,
    }
}

// https://www.w3.org/TR/IndexedDB-2/#check-that-a-key-could-be-injected-into-a-value
pub(crate) fn can_inject_key_into_value(value: &Value, key_path: &str) -> bool {
    // Step 1-2.
    let mut identifiers: Vec<&str> = key_path.split('.').collect();
    if identifiers.pop().is_none() {
        return false;
    }

    // Step 3.
    let mut current = value.clone();
    for identifier in identifiers {
        let Value::Object(object) = &current else {
            return false;
        };
        let next = match &*object.borrow() {
            Object::Plain(properties) => properties.get(identifier).cloned(),
            _ => return false,
        };
        match next {
            Some(next) => current = next,
            None => return true,
        }
    }

    // Step 4.
    matches!(&current, Value::Object(object) if matches!(&*object.borrow(), Object::Plain(_)))
}

// https://www.w3.org/TR/IndexedDB-2/#inject-a-key-into-a-value-using-a-key-path
pub(crate) fn inject_key_into_value(value: &Value, key: &IndexedDBKeyType, key_path: &str) -> bool {
    // Step 1-2.
    let mut identifiers: Vec<&str> = key_path.split('.').collect();
    let Some(last) = identifiers.pop() else {
        return false;
    };

    // Step 3.
    let mut current = value.clone();
    for identifier in identifiers {
        let Value::Object(object) = &current else {
            return false;
        };
        let next = match object.get(identifier) {
            Some(next) => next,
            None => {
                let created = Value::object([]);
                if !object.set(identifier, created.clone()) {
                    return false;
                }
                created
            },
        };
        current = next;
    }

    // Step 4-6.
    match &current {
        Value::Object(object) => object.set(last, key_type_to_value(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use storage_traits::indexeddb::{IndexedDBKeyType, KeyPath};

    use super::*;

    #[test]
    fn key_paths() {
        assert!(is_valid_key_path(&KeyPath::from("")));
        assert!(is_valid_key_path(&KeyPath::from("a.b_c.$d")));
        assert!(is_valid_key_path(&KeyPath::from(vec!["a", ""])));
        assert!(!is_valid_key_path(&KeyPath::from("a..b")));
        assert!(!is_valid_key_path(&KeyPath::from("1a")));
        assert!(!is_valid_key_path(&KeyPath::Sequence(vec![])));
    }

    #[test]
    fn invalid_keys() {
        assert!(validate_key(&Value::Number(f64::NAN)).is_err());
        assert!(validate_key(&Value::Boolean(true)).is_err());
        assert!(validate_key(&Value::Undefined).is_err());
        assert!(validate_key(&Value::object([])).is_err());
        assert!(validate_key(&Value::date(f64::NAN)).is_err());

        let array = Value::array([Value::from(1)]);
        if let Object::Array(items) = &mut *array.as_object().unwrap().borrow_mut() {
            items.push(array.clone());
        }
        assert_eq!(validate_key(&array).unwrap_err(), Error::Data);
    }

    #[test]
    fn array_keys() {
        let value = Value::array([Value::from(1), Value::from("a"), Value::date(5.0)]);
        assert_eq!(
            validate_key(&value).unwrap(),
            IndexedDBKeyType::Array(vec![
                IndexedDBKeyType::Number(1.0),
                IndexedDBKeyType::String("a".into()),
                IndexedDBKeyType::Date(5.0),
            ])
        );
    }

    #[test]
    fn multi_entry_keys_skip_invalid_and_duplicates() {
        let value = Value::array([
            Value::from("a"),
            Value::Boolean(false),
            Value::from("b"),
            Value::from("a"),
        ]);
        let ConversionResult::Valid(key) = convert_value_to_multi_entry_key(&value) else {
            panic!("expected a key");
        };
        assert_eq!(
            key,
            IndexedDBKeyType::Array(vec![
                IndexedDBKeyType::String("a".into()),
                IndexedDBKeyType::String("b".into()),
            ])
        );
    }

    #[test]
    fn evaluate_nested_and_length() {
        let value = Value::object([
            ("name", Value::from("shovel")),
            ("tags", Value::array([Value::from(1), Value::from(2)])),
            ("inner", Value::object([("id", Value::from(7))])),
        ]);
        let extract = |path: KeyPath| match extract_key(&value, &path, None) {
            ExtractionResult::Key(key) => Some(key),
            _ => None,
        };
        assert_eq!(extract(KeyPath::from("inner.id")), Some(7.0.into()));
        assert_eq!(extract(KeyPath::from("name.length")), Some(6.0.into()));
        assert_eq!(extract(KeyPath::from("tags.length")), Some(2.0.into()));
        assert_eq!(extract(KeyPath::from("missing")), None);
        assert_eq!(
            extract(KeyPath::from(vec!["name", "inner.id"])),
            Some(IndexedDBKeyType::Array(vec!["shovel".into(), 7.0.into()]))
        );
    }

    #[test]
    fn inject_creates_intermediate_objects() {
        let value = Value::object([]);
        assert!(can_inject_key_into_value(&value, "a.b.c"));
        assert!(inject_key_into_value(&value, &IndexedDBKeyType::Number(3.0), "a.b.c"));
        let injected = value.get("a").and_then(|a| a.get("b")).and_then(|b| b.get("c"));
        assert_eq!(injected.and_then(|c| c.as_number()), Some(3.0));

        let primitive = Value::object([("a", Value::from(1))]);
        assert!(!can_inject_key_into_value(&primitive, "a.b"));
        assert!(!inject_key_into_value(&primitive, &IndexedDBKeyType::Number(1.0), "a.b"));
    }
}
