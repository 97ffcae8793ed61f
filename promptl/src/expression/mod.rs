pub mod template_string;

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOperator {
    /// Arithmetic negation: -x
    Negation,
    /// Numeric identity: +x
    Plus,
    /// Logical not: !x
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Modulo,
    LogicalAnd,
    LogicalOr,
    NullishCoalescing,
    Equality,
    Inequality,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
}

/// Operator of an assignment statement: `x = ..`, `x += ..`, ...
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssignmentOperator {
    Assign,
    AddAssign,
    SubtractAssign,
    MultiplyAssign,
    DivideAssign,
    ModuloAssign,
}

impl AssignmentOperator {
    /// The binary operator applied to the current value, if this is a compound assignment.
    pub fn binary(&self) -> Option<BinaryOperator> {
        match self {
            AssignmentOperator::Assign => None,
            AssignmentOperator::AddAssign => Some(BinaryOperator::Addition),
            AssignmentOperator::SubtractAssign => Some(BinaryOperator::Subtraction),
            AssignmentOperator::MultiplyAssign => Some(BinaryOperator::Multiplication),
            AssignmentOperator::DivideAssign => Some(BinaryOperator::Division),
            AssignmentOperator::ModuloAssign => Some(BinaryOperator::Modulo),
        }
    }
}

/// An expression AST node found inside `{{ }}` or an attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    // Literals
    NullLiteral,
    BooleanLiteral(bool),
    NumberLiteral(f64),
    StringLiteral(String),
    ArrayLiteral(Vec<Expression>),
    ObjectLiteral(Vec<(String, Expression)>),

    // References
    Identifier(String, Range<usize>),
    Member {
        object: Box<Expression>,
        property: String,
        span: Range<usize>,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
        span: Range<usize>,
    },

    /// `callee(args)`; the callee must evaluate to a function value.
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
        span: Range<usize>,
    },

    // Operations
    UnaryOperation {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
    BinaryOperation {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },

    /// cond ? expr : expr
    Conditional {
        condition: Box<Expression>,
        consequent: Box<Expression>,
        alternate: Box<Expression>,
    },
}

/// The contents of a plain `{{ }}` tag: either an assignment or a value to render.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Assignment {
        target: String,
        operator: AssignmentOperator,
        value: Expression,
    },
    Expression(Expression),
}
