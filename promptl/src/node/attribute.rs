use std::ops::Range;

use crate::expression::Expression;
use crate::expression::template_string::TemplateString;

/// A `name=value` pair on a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// `name="text {{ interpolated }}"` or `name='text'`
    Text(TemplateString),
    /// `name={{ expr }}`
    Expression(Expression),
    /// Bare `name`, equivalent to `name={{ true }}`.
    Flag,
}

/// Find an attribute by name.
pub fn find<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
    attributes.iter().find(|a| a.name == name)
}
