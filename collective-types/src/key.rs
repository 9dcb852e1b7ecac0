//! Tagged keys for the local store namespace.
//!
//! Application keys are stored verbatim. Engine-owned keys (map indexes, map
//! elements, internal bookkeeping) start with a reserved designator character
//! followed by a one-letter discriminator, so they can never collide with an
//! application key and can always be told apart when read back.

use crate::KeyError;
use std::fmt;

/// Designator that starts every non-plain encoded key.
pub const KEY_DESIGNATOR: char = '\u{1e}';

/// Separator between fields of a non-plain encoded key.
pub const FIELD_SEPARATOR: char = '\u{1f}';

const TAG_MAP_INDEX: char = 'm';
const TAG_MAP_ELEMENT: char = 'e';
const TAG_INTERNAL: char = 'i';

/// A key in the local store, tagged by what it holds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKey {
    /// An application key.
    Plain(String),
    /// The element-name set of a map.
    MapIndex { map: String },
    /// One element of a map.
    MapElement { map: String, element: String },
    /// Engine bookkeeping.
    Internal(String),
}

impl StoreKey {
    /// Builds a plain key, rejecting names that use reserved characters.
    pub fn plain(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        validate_name(&key)?;
        Ok(Self::Plain(key))
    }

    /// Builds the index key of `map`.
    pub fn map_index(map: impl Into<String>) -> Result<Self, KeyError> {
        let map = map.into();
        validate_name(&map)?;
        Ok(Self::MapIndex { map })
    }

    /// Builds the key of `element` inside `map`.
    pub fn map_element(
        map: impl Into<String>,
        element: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let map = map.into();
        let element = element.into();
        validate_name(&map)?;
        validate_name(&element)?;
        Ok(Self::MapElement { map, element })
    }

    /// Builds an internal key. Internal names are chosen by the engine and
    /// only checked for the separator characters.
    pub fn internal(name: impl Into<String>) -> Result<Self, KeyError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self::Internal(name))
    }

    /// Encodes the key into its on-disk string form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Plain(key) => key.clone(),
            Self::MapIndex { map } => format!("{KEY_DESIGNATOR}{TAG_MAP_INDEX}{FIELD_SEPARATOR}{map}"),
            Self::MapElement { map, element } => format!(
                "{KEY_DESIGNATOR}{TAG_MAP_ELEMENT}{FIELD_SEPARATOR}{map}{FIELD_SEPARATOR}{element}"
            ),
            Self::Internal(name) => format!("{KEY_DESIGNATOR}{TAG_INTERNAL}{FIELD_SEPARATOR}{name}"),
        }
    }

    /// Recovers a key from its encoded form.
    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let Some(rest) = encoded.strip_prefix(KEY_DESIGNATOR) else {
            validate_name(encoded)?;
            return Ok(Self::Plain(encoded.to_string()));
        };

        let mut chars = rest.chars();
        let tag = chars
            .next()
            .ok_or_else(|| KeyError::Malformed(encoded.to_string()))?;
        let body = chars
            .as_str()
            .strip_prefix(FIELD_SEPARATOR)
            .ok_or_else(|| KeyError::Malformed(encoded.to_string()))?;
        let fields: Vec<&str> = body.split(FIELD_SEPARATOR).collect();

        match (tag, fields.as_slice()) {
            (TAG_MAP_INDEX, [map]) => Self::map_index(*map),
            (TAG_MAP_ELEMENT, [map, element]) => Self::map_element(*map, *element),
            (TAG_INTERNAL, [name]) => Self::internal(*name),
            _ => Err(KeyError::Malformed(encoded.to_string())),
        }
    }

    /// Returns true if this key is an element of some map.
    #[must_use]
    pub fn is_map_element(&self) -> bool {
        matches!(self, Self::MapElement { .. })
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(key) => write!(f, "{key}"),
            Self::MapIndex { map } => write!(f, "map:{map}"),
            Self::MapElement { map, element } => write!(f, "map:{map}[{element}]"),
            Self::Internal(name) => write!(f, "internal:{name}"),
        }
    }
}

/// Checks that a user-supplied name is non-empty and free of reserved
/// characters.
pub fn validate_name(name: &str) -> Result<(), KeyError> {
    if name.is_empty() {
        return Err(KeyError::Empty);
    }
    if let Some(c) = name
        .chars()
        .find(|c| *c == KEY_DESIGNATOR || *c == FIELD_SEPARATOR)
    {
        return Err(KeyError::ReservedCharacter {
            name: name.escape_debug().to_string(),
            character: c,
        });
    }
    Ok(())
}

/// Returns the encoded prefix shared by every element key of `map`.
#[must_use]
pub fn map_element_prefix(map: &str) -> String {
    format!("{KEY_DESIGNATOR}{TAG_MAP_ELEMENT}{FIELD_SEPARATOR}{map}{FIELD_SEPARATOR}")
}
