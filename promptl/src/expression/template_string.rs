use crate::expression::Expression;

/// A string that can contain interpolated expressions.
/// Used for quoted attribute values: `name="Hello {{ user }}"`.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateString {
    pub parts: Vec<TemplateStringPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateStringPart {
    /// Literal text content.
    Literal(String),
    /// An embedded expression to be evaluated and rendered.
    Expression(Expression),
}

impl TemplateString {
    pub fn literal(s: impl Into<String>) -> Self {
        TemplateString {
            parts: vec![TemplateStringPart::Literal(s.into())],
        }
    }

    /// The literal text, if the string has no interpolations.
    pub fn as_literal(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplateStringPart::Literal(s) => out.push_str(s),
                TemplateStringPart::Expression(_) => return None,
            }
        }
        Some(out)
    }
}
