use base64::{
    alphabet,
    engine::{general_purpose, GeneralPurpose},
    Engine,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, StoreError};

/// Opaque position in an ordered read, handed back to continue after the
/// last returned node.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone)]
pub struct CursorType(pub String);

impl From<String> for CursorType {
    fn from(val: String) -> Self {
        CursorType(val)
    }
}

impl AsRef<[u8]> for CursorType {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Keyset pagination over the columns returned by [`Cursor::keys`].
///
/// A cursor is the `|` joined serialized key values, base64 encoded. Reads
/// resume strictly after the node the cursor was taken from.
pub trait Cursor: Sized {
    fn keys() -> Vec<&'static str>;
    fn serialize(&self) -> Vec<String>;
    fn deserialize(values: Vec<&str>) -> Result<Self>;

    fn deserialize_as<D: FromStr>(field: &str, value: Option<&&str>) -> Result<D> {
        let value = value.ok_or_else(|| StoreError::Cursor(format!("missing field {field}")))?;

        value
            .parse::<D>()
            .map_err(|_| StoreError::Cursor(format!("invalid {field} `{value}`")))
    }

    fn to_cursor(&self) -> CursorType {
        let data = self.serialize().join("|");
        let engine = GeneralPurpose::new(&alphabet::URL_SAFE, general_purpose::PAD);

        CursorType(engine.encode(data))
    }

    fn from_cursor(cursor: &CursorType) -> Result<Self> {
        let engine = GeneralPurpose::new(&alphabet::URL_SAFE, general_purpose::PAD);
        let decoded = engine.decode(cursor)?;
        let data = std::str::from_utf8(&decoded)?;

        Self::deserialize(data.split('|').collect())
    }

    fn to_pg_order() -> String {
        Self::keys()
            .iter()
            .map(|key| format!("{key} ASC"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge<N> {
    pub cursor: CursorType,
    pub node: N,
}

impl<N: Cursor> From<N> for Edge<N> {
    fn from(value: N) -> Self {
        Self {
            cursor: value.to_cursor(),
            node: value,
        }
    }
}

#[derive(Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<CursorType>,
}

#[derive(Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResult<N> {
    pub edges: Vec<Edge<N>>,
    pub page_info: PageInfo,
}

impl<N: Cursor> QueryResult<N> {
    /// Builds a forward page from `first + 1` fetched nodes, the extra node
    /// only signalling that another page exists.
    pub fn forward(mut nodes: Vec<N>, first: u16) -> Self {
        let has_next_page = nodes.len() > usize::from(first);

        if has_next_page {
            nodes.truncate(usize::from(first));
        }

        let edges: Vec<Edge<N>> = nodes.into_iter().map(Edge::from).collect();
        let end_cursor = edges.last().map(|edge| edge.cursor.clone());

        Self {
            edges,
            page_info: PageInfo {
                has_next_page,
                end_cursor,
            },
        }
    }
}
