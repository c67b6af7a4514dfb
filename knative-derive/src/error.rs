use crate::REQUIRED_VARIANTS;
use proc_macro2::Span;
use std::fmt;

/// Ways a `#[derive(ConditionType)]` input can be rejected.
pub enum VerificationError {
    NotAnEnum,
    /// A `Ready` or `Succeeded` variant marked `#[dependent]`
    NotDependent(String),
    OneRequiredVariant,
    UnitVariantsOnly(String),
    UnknownDependentOption(String),
}

impl VerificationError {
    pub fn at(self, span: Span) -> syn::Error {
        syn::Error::new(span, self)
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::NotAnEnum => write!(f, "ConditionType may only be derived on enums"),
            VerificationError::NotDependent(variant) => {
                write!(f, "{variant} is the happy condition and may not be a dependent")
            }
            VerificationError::OneRequiredVariant => write!(
                f,
                "ConditionType must contain exactly one {} variant",
                REQUIRED_VARIANTS.join(" or ")
            ),
            VerificationError::UnitVariantsOnly(variant) => {
                write!(f, "ConditionType variants may not carry fields, found {variant}")
            }
            VerificationError::UnknownDependentOption(option) => {
                write!(f, "unknown dependent option `{option}`, expected `warning`")
            }
        }
    }
}

impl From<VerificationError> for syn::Error {
    fn from(err: VerificationError) -> syn::Error {
        err.at(Span::call_site())
    }
}
