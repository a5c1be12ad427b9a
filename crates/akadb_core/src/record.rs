//! Title records and their keys.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Placeholder stored when a record has no attributes.
pub const DEFAULT_ATTRIBUTES: &str = "N/A";

/// Composite primary key of a record: `(titleId, ordering)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    /// Title identifier (for example `tt0000001`).
    pub title_id: String,
    /// Ordering of this alternative title within the title.
    pub ordering: i32,
}

impl RecordKey {
    /// Creates a key.
    pub fn new(title_id: impl Into<String>, ordering: i32) -> Self {
        Self {
            title_id: title_id.into(),
            ordering,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.title_id, self.ordering)
    }
}

/// One row of the title table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Title identifier.
    pub title_id: String,
    /// Ordering within the title.
    pub ordering: i32,
    /// Localized title text.
    pub title: String,
    /// Region code.
    pub region: String,
    /// Language code.
    pub language: String,
    /// Title type / category.
    pub types: String,
    /// Extra attributes, `"N/A"` when absent.
    #[serde(default = "default_attributes")]
    pub attributes: String,
    /// Whether this is the original title, `0`/`1` on the wire.
    #[serde(with = "bool_as_int", default)]
    pub is_original_title: bool,
}

fn default_attributes() -> String {
    DEFAULT_ATTRIBUTES.to_string()
}

impl Record {
    /// Creates a record with default attributes and `isOriginalTitle = 0`.
    pub fn new(
        title_id: impl Into<String>,
        ordering: i32,
        title: impl Into<String>,
        region: impl Into<String>,
        language: impl Into<String>,
        types: impl Into<String>,
    ) -> Self {
        Self {
            title_id: title_id.into(),
            ordering,
            title: title.into(),
            region: region.into(),
            language: language.into(),
            types: types.into(),
            attributes: default_attributes(),
            is_original_title: false,
        }
    }

    /// Sets the attributes; an empty string stores the default.
    #[must_use]
    pub fn with_attributes(mut self, attributes: impl Into<String>) -> Self {
        self.attributes = normalize_attributes(attributes.into());
        self
    }

    /// Marks the record as the original title.
    #[must_use]
    pub fn original(mut self, is_original: bool) -> Self {
        self.is_original_title = is_original;
        self
    }

    /// Returns the record's key.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.title_id.clone(), self.ordering)
    }

    /// Checks required fields.
    pub fn validate(&self) -> CoreResult<()> {
        let required = [
            ("titleId", &self.title_id),
            ("title", &self.title),
            ("region", &self.region),
            ("language", &self.language),
            ("types", &self.types),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(CoreError::validation(format!("missing required field `{name}`")));
            }
        }
        Ok(())
    }
}

fn normalize_attributes(value: String) -> String {
    if value.trim().is_empty() {
        default_attributes()
    } else {
        value
    }
}

/// Partial update of a record's non-key fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    /// New title.
    pub title: Option<String>,
    /// New region.
    pub region: Option<String>,
    /// New language.
    pub language: Option<String>,
    /// New types.
    pub types: Option<String>,
    /// New attributes.
    pub attributes: Option<String>,
    /// New original-title flag.
    #[serde(default, deserialize_with = "bool_as_int::option::deserialize")]
    pub is_original_title: Option<bool>,
}

impl RecordPatch {
    /// A patch that only changes the title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.region.is_none()
            && self.language.is_none()
            && self.types.is_none()
            && self.attributes.is_none()
            && self.is_original_title.is_none()
    }

    /// Rejects patches that would blank a required field.
    pub fn validate(&self) -> CoreResult<()> {
        if self.is_empty() {
            return Err(CoreError::validation("update changes no fields"));
        }
        let fields = [
            ("title", &self.title),
            ("region", &self.region),
            ("language", &self.language),
            ("types", &self.types),
        ];
        for (name, value) in fields {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(CoreError::validation(format!("field `{name}` cannot be empty")));
            }
        }
        Ok(())
    }

    /// Applies the patch, producing the after-image.
    pub fn apply(&self, record: &Record) -> Record {
        let mut next = record.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(region) = &self.region {
            next.region = region.clone();
        }
        if let Some(language) = &self.language {
            next.language = language.clone();
        }
        if let Some(types) = &self.types {
            next.types = types.clone();
        }
        if let Some(attributes) = &self.attributes {
            next.attributes = normalize_attributes(attributes.clone());
        }
        if let Some(flag) = self.is_original_title {
            next.is_original_title = flag;
        }
        next
    }
}

/// Serde adapter writing booleans as `0`/`1` and reading `0`/`1`/`true`/`false`.
pub mod bool_as_int {
    use super::*;

    /// Serializes a bool as an integer.
    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    /// Deserializes a bool from an integer, boolean or numeric string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(b) => Ok(b),
            Raw::Number(0) => Ok(false),
            Raw::Number(1) => Ok(true),
            Raw::Text(s) => match s.trim() {
                "0" | "false" => Ok(false),
                "1" | "true" => Ok(true),
                other => Err(serde::de::Error::custom(format!(
                    "expected 0 or 1, got {other:?}"
                ))),
            },
            Raw::Number(n) => Err(serde::de::Error::custom(format!("expected 0 or 1, got {n}"))),
        }
    }

    /// Same as [`deserialize`] for optional fields.
    pub mod option {
        use super::*;

        /// Deserializes an optional bool-as-int.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<bool>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] bool);

            Option::<Wrapper>::deserialize(deserializer).map(|w| w.map(|Wrapper(b)| b))
        }
    }
}
