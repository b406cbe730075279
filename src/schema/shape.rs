use std::collections::BTreeMap;

// ============================================================================
// Shape Types
// ============================================================================

/// A shape node describing the type constraints of a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    String,
    Number,
    Boolean,
    /// ISO 8601 date string.
    Date,
    /// Non-empty string identifier.
    Id,
    /// String restricted to a fixed set of values, e.g. relationship kinds.
    OneOf(Vec<String>),
    Optional(Box<Shape>),
    Array(Box<Shape>),
    Object(BTreeMap<String, Shape>),
    /// Free-form value, accepted as-is. Used for denormalized display data.
    Any,
}

// ============================================================================
// Shape Builder API (`s` module)
// ============================================================================

/// Shape builder helpers. Usage: `s::string()`, `s::optional(s::number())`,
/// `s::one_of(["owner", "fosterer"])`, etc.
pub mod s {
    use super::Shape;
    use std::collections::BTreeMap;

    pub fn string() -> Shape {
        Shape::String
    }

    pub fn number() -> Shape {
        Shape::Number
    }

    pub fn boolean() -> Shape {
        Shape::Boolean
    }

    pub fn date() -> Shape {
        Shape::Date
    }

    pub fn id() -> Shape {
        Shape::Id
    }

    pub fn one_of<I, T>(values: I) -> Shape
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        assert!(!values.is_empty(), "one_of must have at least one value");
        Shape::OneOf(values)
    }

    pub fn optional(inner: Shape) -> Shape {
        Shape::Optional(Box::new(inner))
    }

    pub fn array(element: Shape) -> Shape {
        Shape::Array(Box::new(element))
    }

    pub fn object<I, K>(properties: I) -> Shape
    where
        I: IntoIterator<Item = (K, Shape)>,
        K: Into<String>,
    {
        let props: BTreeMap<String, Shape> =
            properties.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Shape::Object(props)
    }

    pub fn any() -> Shape {
        Shape::Any
    }
}

// ============================================================================
// Canned Shapes
// ============================================================================

/// Shape of a full relationship record payload, with `kind` restricted to the
/// collection's allowed values.
pub fn relationship_record_shape(kinds: &[&str]) -> Shape {
    s::object([
        ("id", s::id()),
        ("parent_id", s::id()),
        ("related_id", s::id()),
        ("kind", s::one_of(kinds.iter().copied())),
        ("data", s::any()),
    ])
}

/// Shape of a field-level patch payload: everything but the id is optional.
pub fn record_patch_shape(kinds: &[&str]) -> Shape {
    s::object([
        ("id", s::id()),
        ("kind", s::optional(s::one_of(kinds.iter().copied()))),
        ("related_id", s::optional(s::id())),
        ("data", s::optional(s::any())),
    ])
}
