//! Element model
//!
//! Every stored element is `(package_id, id, type)` where the type is one
//! of nine closed kinds. Medias, annotations and imports carry extra
//! fields of their own; annotations, relations, views, resources and
//! queries additionally own a content row (mimetype, data, schema ref).

use crate::idref::IdRef;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The nine element kinds. An element is typed at creation and the type
/// never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// An audiovisual document, identified by its URL
    Media,
    /// A time-bounded fragment of a media
    Annotation,
    /// An ordered group of annotations
    Relation,
    /// A presentation template
    View,
    /// An opaque payload (e.g. a schema) usable by other elements
    Resource,
    /// A label associable to any element
    Tag,
    /// An ordered list of arbitrary elements
    List,
    /// A stored query
    Query,
    /// A reference to another package
    Import,
}

impl ElementType {
    /// Get the string representation stored in the `typ` column
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Media => "media",
            ElementType::Annotation => "annotation",
            ElementType::Relation => "relation",
            ElementType::View => "view",
            ElementType::Resource => "resource",
            ElementType::Tag => "tag",
            ElementType::List => "list",
            ElementType::Query => "query",
            ElementType::Import => "import",
        }
    }

    /// Get all element types
    pub fn all() -> &'static [ElementType] {
        &[
            ElementType::Media,
            ElementType::Annotation,
            ElementType::Relation,
            ElementType::View,
            ElementType::Resource,
            ElementType::Tag,
            ElementType::List,
            ElementType::Query,
            ElementType::Import,
        ]
    }

    /// Does this kind own a content row?
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            ElementType::Annotation
                | ElementType::Relation
                | ElementType::View
                | ElementType::Resource
                | ElementType::Query
        )
    }
}

impl FromStr for ElementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "media" => Ok(ElementType::Media),
            "annotation" => Ok(ElementType::Annotation),
            "relation" => Ok(ElementType::Relation),
            "view" => Ok(ElementType::View),
            "resource" => Ok(ElementType::Resource),
            "tag" => Ok(ElementType::Tag),
            "list" => Ok(ElementType::List),
            "query" => Ok(ElementType::Query),
            "import" => Ok(ElementType::Import),
            _ => Err(Error::InvalidReference(format!(
                "unknown element type: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind-specific payload of an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementData {
    Media {
        /// URL of the audiovisual document
        url: String,
    },
    Annotation {
        /// Id-ref of an own or directly imported media
        media: IdRef,
        /// Fragment begin, in the media's unit (ms)
        begin: u64,
        /// Fragment end; always ≥ begin
        end: u64,
    },
    Import {
        /// URL the imported package is fetched from
        url: String,
        /// Canonical URI of the imported package ("" if none advertised)
        uri: String,
    },
    Relation,
    View,
    Resource,
    Tag,
    List,
    Query,
}

impl ElementData {
    /// The element type this payload belongs to
    pub fn element_type(&self) -> ElementType {
        match self {
            ElementData::Media { .. } => ElementType::Media,
            ElementData::Annotation { .. } => ElementType::Annotation,
            ElementData::Import { .. } => ElementType::Import,
            ElementData::Relation => ElementType::Relation,
            ElementData::View => ElementType::View,
            ElementData::Resource => ElementType::Resource,
            ElementData::Tag => ElementType::Tag,
            ElementData::List => ElementType::List,
            ElementData::Query => ElementType::Query,
        }
    }

    /// Payload of the kinds that carry no extra fields.
    ///
    /// Returns `None` for media, annotation and import.
    pub fn simple(kind: ElementType) -> Option<ElementData> {
        match kind {
            ElementType::Relation => Some(ElementData::Relation),
            ElementType::View => Some(ElementData::View),
            ElementType::Resource => Some(ElementData::Resource),
            ElementType::Tag => Some(ElementData::Tag),
            ElementType::List => Some(ElementData::List),
            ElementType::Query => Some(ElementData::Query),
            ElementType::Media | ElementType::Annotation | ElementType::Import => None,
        }
    }
}

/// A stored element: its owning package, its id, and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub package_id: String,
    pub id: String,
    #[serde(flatten)]
    pub data: ElementData,
}

impl Element {
    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }
}

/// Content attached to an annotation, relation, view, resource or query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub mimetype: String,
    pub data: String,
    /// Id-ref of an own or directly imported resource describing the data
    pub schema: Option<IdRef>,
}

/// Exact-match or alternative-set filter on a string column.
#[derive(Debug, Clone, Copy, Default)]
pub enum Match<'a> {
    #[default]
    Any,
    Exact(&'a str),
    OneOf(&'a [&'a str]),
}

/// Filter on a reference column, expressed as absolute uri-refs so that an
/// element addressed as `import:x` by one caller and directly by another
/// both match the same stored element.
#[derive(Debug, Clone, Copy, Default)]
pub enum UriMatch<'a> {
    #[default]
    Any,
    Exact(&'a crate::idref::UriRef),
    OneOf(&'a [crate::idref::UriRef]),
}

/// Equality or range filter on a time column. `eq` is exclusive with
/// `min`/`max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub eq: Option<u64>,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl TimeRange {
    pub fn eq(value: u64) -> Self {
        Self {
            eq: Some(value),
            ..Self::default()
        }
    }

    pub fn between(min: Option<u64>, max: Option<u64>) -> Self {
        Self {
            eq: None,
            min,
            max,
        }
    }
}

/// Filter for the simple element iterators (relations, views, resources,
/// tags, lists, queries).
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementFilter<'a> {
    pub id: Match<'a>,
}

/// Filter for `iter_medias`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaFilter<'a> {
    pub id: Match<'a>,
    pub url: Match<'a>,
}

/// Filter for `iter_annotations`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationFilter<'a> {
    pub id: Match<'a>,
    pub media: UriMatch<'a>,
    pub begin: TimeRange,
    pub end: TimeRange,
}

/// Filter for `iter_imports`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportFilter<'a> {
    pub id: Match<'a>,
    pub url: Match<'a>,
    pub uri: Match<'a>,
}
