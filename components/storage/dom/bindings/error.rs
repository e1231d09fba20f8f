/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Errors reported by the IndexedDB API objects.

use std::fmt;

use log::warn;
use storage_traits::indexeddb::BackendError;

/// A DOMException name, or a `TypeError`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// AbortError DOMException
    Abort,
    /// ConstraintError DOMException
    Constraint,
    /// DataError DOMException
    Data,
    /// DataCloneError DOMException
    DataClone,
    /// InvalidAccessError DOMException
    InvalidAccess,
    /// InvalidStateError DOMException
    InvalidState,
    /// NotFoundError DOMException
    NotFound,
    /// QuotaExceededError DOMException
    QuotaExceeded,
    /// ReadOnlyError DOMException
    ReadOnly,
    /// SyntaxError DOMException
    Syntax,
    /// TransactionInactiveError DOMException
    TransactionInactive,
    /// UnknownError DOMException
    Unknown,
    /// VersionError DOMException
    Version,
    /// TypeError JavaScript Error
    Type(String),
}

impl Error {
    pub fn name(&self) -> &'static str {
        match self {
            Error::Abort => "AbortError",
            Error::Constraint => "ConstraintError",
            Error::Data => "DataError",
            Error::DataClone => "DataCloneError",
            Error::InvalidAccess => "InvalidAccessError",
            Error::InvalidState => "InvalidStateError",
            Error::NotFound => "NotFoundError",
            Error::QuotaExceeded => "QuotaExceededError",
            Error::ReadOnly => "ReadOnlyError",
            Error::Syntax => "SyntaxError",
            Error::TransactionInactive => "TransactionInactiveError",
            Error::Unknown => "UnknownError",
            Error::Version => "VersionError",
            Error::Type(_) => "TypeError",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Type(message) => write!(f, "TypeError: {message}"),
            _ => f.write_str(self.name()),
        }
    }
}

impl std::error::Error for Error {}

pub type Fallible<T> = Result<T, Error>;

pub type ErrorResult = Fallible<()>;

pub(crate) fn map_backend_error_to_dom_error(error: BackendError) -> Error {
    match error {
        BackendError::Constraint(_) => Error::Constraint,
        BackendError::QuotaExceeded => Error::QuotaExceeded,
        BackendError::DbNotFound | BackendError::StoreNotFound | BackendError::IndexNotFound => {
            Error::NotFound
        },
        BackendError::DbErr(reason) => {
            warn!("IndexedDB backend failure: {reason}");
            Error::Unknown
        },
    }
}
