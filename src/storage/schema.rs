//! Database schema definitions

/// Version stamp written on store initialization and checked before
/// binding to an existing file.
pub const BACKEND_VERSION: &str = "0.1";

/// SQL to create the version table
pub const CREATE_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Version (
    version TEXT NOT NULL
)
"#;

/// SQL to create the packages table.
/// `uri` is the package's advertised canonical URI; `url` is the URL of
/// the in-process owner currently bound to it ("" when unbound).
pub const CREATE_PACKAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Packages (
    id TEXT PRIMARY KEY,
    uri TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT ''
)
"#;

/// SQL to create the elements table
pub const CREATE_ELEMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Elements (
    package TEXT NOT NULL,
    id TEXT NOT NULL,
    typ TEXT NOT NULL,
    PRIMARY KEY (package, id)
)
"#;

/// SQL to create the medias detail table
pub const CREATE_MEDIAS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Medias (
    package TEXT NOT NULL,
    id TEXT NOT NULL,
    url TEXT NOT NULL,
    PRIMARY KEY (package, id)
)
"#;

/// SQL to create the annotations detail table.
/// `media_p`/`media_i` are the split id-ref of the annotated media.
pub const CREATE_ANNOTATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Annotations (
    package TEXT NOT NULL,
    id TEXT NOT NULL,
    media_p TEXT NOT NULL,
    media_i TEXT NOT NULL,
    fbegin INTEGER NOT NULL,
    fend INTEGER NOT NULL,
    PRIMARY KEY (package, id)
)
"#;

/// SQL to create the imports detail table
pub const CREATE_IMPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Imports (
    package TEXT NOT NULL,
    id TEXT NOT NULL,
    url TEXT NOT NULL,
    uri TEXT NOT NULL,
    PRIMARY KEY (package, id)
)
"#;

/// SQL to create the contents table
pub const CREATE_CONTENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Contents (
    package TEXT NOT NULL,
    element TEXT NOT NULL,
    mimetype TEXT NOT NULL,
    data TEXT NOT NULL,
    schema_p TEXT NOT NULL,
    schema_i TEXT NOT NULL,
    PRIMARY KEY (package, element)
)
"#;

/// SQL to create the metadata table
pub const CREATE_META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Meta (
    package TEXT NOT NULL,
    element TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (package, element, key)
)
"#;

/// SQL to create the relation members table.
/// `ord` is a dense 0-based index, unique per relation.
pub const CREATE_RELATION_MEMBERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS RelationMembers (
    package TEXT NOT NULL,
    relation TEXT NOT NULL,
    ord INTEGER NOT NULL,
    member_p TEXT NOT NULL,
    member_i TEXT NOT NULL,
    PRIMARY KEY (package, relation, ord)
)
"#;

/// SQL to create the list items table
pub const CREATE_LIST_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ListItems (
    package TEXT NOT NULL,
    list TEXT NOT NULL,
    ord INTEGER NOT NULL,
    item_p TEXT NOT NULL,
    item_i TEXT NOT NULL,
    PRIMARY KEY (package, list, ord)
)
"#;

/// SQL to create the tag associations table.
/// The five-column primary key makes duplicate associations no-ops.
pub const CREATE_TAGGED_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Tagged (
    package TEXT NOT NULL,
    element_p TEXT NOT NULL,
    element_i TEXT NOT NULL,
    tag_p TEXT NOT NULL,
    tag_i TEXT NOT NULL,
    PRIMARY KEY (package, element_p, element_i, tag_p, tag_i)
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_elements_typ ON Elements(package, typ)",
    "CREATE INDEX IF NOT EXISTS idx_annotations_order ON Annotations(package, fbegin, fend, media_p, media_i)",
    "CREATE INDEX IF NOT EXISTS idx_annotations_media ON Annotations(package, media_p, media_i)",
    "CREATE INDEX IF NOT EXISTS idx_members_ref ON RelationMembers(package, member_p, member_i)",
    "CREATE INDEX IF NOT EXISTS idx_items_ref ON ListItems(package, item_p, item_i)",
    "CREATE INDEX IF NOT EXISTS idx_tagged_element ON Tagged(package, element_p, element_i)",
    "CREATE INDEX IF NOT EXISTS idx_tagged_tag ON Tagged(package, tag_p, tag_i)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_VERSION_TABLE,
        CREATE_PACKAGES_TABLE,
        CREATE_ELEMENTS_TABLE,
        CREATE_MEDIAS_TABLE,
        CREATE_ANNOTATIONS_TABLE,
        CREATE_IMPORTS_TABLE,
        CREATE_CONTENTS_TABLE,
        CREATE_META_TABLE,
        CREATE_RELATION_MEMBERS_TABLE,
        CREATE_LIST_ITEMS_TABLE,
        CREATE_TAGGED_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
