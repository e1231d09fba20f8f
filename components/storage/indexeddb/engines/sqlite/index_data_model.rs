/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use rusqlite::Row;
use sea_query::Iden;

#[derive(Clone, Copy, Iden)]
pub enum Column {
    #[iden = "index_data"]
    Table,
    IndexId,
    Value,
    ObjectDataKey,
    ObjectStoreId,
}

/// A row selected as `value, object_data_key`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Model {
    pub value: Vec<u8>,
    pub object_data_key: Vec<u8>,
}

impl TryFrom<&Row<'_>> for Model {
    type Error = rusqlite::Error;

    fn try_from(value: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            value: value.get(0)?,
            object_data_key: value.get(1)?,
        })
    }
}
