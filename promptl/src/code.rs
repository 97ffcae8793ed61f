/// Stable error codes shared by the parser and the compiler.
///
/// Callers branch on these, never on message text. The string form is the
/// kebab-case variant name (`MessageTagInsideMessage` ↔ `message-tag-inside-message`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    // Structural
    MessageTagInsideMessage,
    StepTagInsideStep,
    StepTagInsideMessage,
    ContentTagInsideContent,
    InvalidTagNesting,
    UnexpectedEof,
    UnexpectedToken,
    UnclosedMustache,
    UnclosedComment,
    UnclosedTag,
    UnclosedBlock,
    UnexpectedClosingTag,
    UnexpectedBlockKeyword,
    InvalidTagAttribute,
    MissingTagAttribute,
    InvalidConfig,
    ReferenceTagWithoutPath,
    ReferenceTagNotSelfClosing,
    InvalidReferencePath,

    // Scope
    VariableNotDeclared,

    // Reference
    MissingReferenceFunction,
    ReferenceNotFound,
    CircularReference,

    // Runtime / expression
    TypeError,
    DivisionByZero,
    NotAFunction,
    FunctionCallError,
    InvalidIterable,
    InvalidAssignmentTarget,
    InvalidMessageRole,

    // Chain protocol
    ChainAborted,
    ChainCompleted,
    ChainFailed,
    InvalidStepResponse,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::ErrorCode;

    #[test]
    fn codes_are_kebab_case_and_round_trip() {
        assert_eq!(
            ErrorCode::MessageTagInsideMessage.as_str(),
            "message-tag-inside-message"
        );
        assert_eq!(ErrorCode::VariableNotDeclared.to_string(), "variable-not-declared");
        for code in ErrorCode::iter() {
            assert_eq!(ErrorCode::from_str(code.as_str()), Ok(code));
        }
    }
}
