//! Outgoing payload validation.
//!
//! Payload types implement [`Validate`] by feeding their fields through a
//! [`Validator`]. Validation never fails early: every violated limit is
//! reported, and the caller decides whether to abort the submission.

use std::fmt;

/// A single limit broken by an outgoing payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    AtLeastOneFieldIsRequired { names: Vec<String> },
    TooManyCharacters { name: String, max: usize },
    TooManyElements { name: String, max: usize },
    ContainsProhibitedValues {
        name: String,
        reason: String,
        values: String,
    },
    HasPrecondition { name: String, reason: String },
    CantBeEmpty { name: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtLeastOneFieldIsRequired { names } => {
                write!(f, "at least one of {} is required", names.join(", "))
            }
            Self::TooManyCharacters { name, max } => {
                write!(f, "{name} exceeds {max} characters")
            }
            Self::TooManyElements { name, max } => write!(f, "{name} exceeds {max} elements"),
            Self::ContainsProhibitedValues {
                name,
                reason,
                values,
            } => write!(f, "{name} contains prohibited values ({reason}): {values}"),
            Self::HasPrecondition { name, reason } => {
                write!(f, "{name} is not allowed here: {reason}")
            }
            Self::CantBeEmpty { name } => write!(f, "{name} can't be empty"),
        }
    }
}

/// Implemented by payloads that carry server-enforced field limits.
pub trait Validate {
    /// Returns every violated limit; empty means the payload is acceptable.
    fn validate(&self) -> Vec<Violation>;
}

/// Accumulates violations for one payload.
#[derive(Debug, Default)]
pub struct Validator {
    violations: Vec<Violation>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires that at least one of the fields is present and non-empty.
    ///
    /// Each entry is `Some(is_empty)` for a present field or `None` for an
    /// absent one.
    pub fn at_least_one_is_not_empty(
        &mut self,
        is_empties: &[Option<bool>],
        names: &[&str],
    ) -> &mut Self {
        if !is_empties.iter().any(|entry| *entry == Some(false)) {
            self.violations.push(Violation::AtLeastOneFieldIsRequired {
                names: names.iter().map(|name| name.to_string()).collect(),
            });
        }
        self
    }

    /// Character limits count Unicode scalar values.
    pub fn character_count_at_most(
        &mut self,
        value: Option<&str>,
        max: usize,
        name: &str,
    ) -> &mut Self {
        if value.map_or(0, |value| value.chars().count()) > max {
            self.violations.push(Violation::TooManyCharacters {
                name: name.to_string(),
                max,
            });
        }
        self
    }

    pub fn combined_character_count_at_most(
        &mut self,
        count: usize,
        max: usize,
        names: &[&str],
    ) -> &mut Self {
        if count > max {
            self.violations.push(Violation::TooManyCharacters {
                name: names.join("+"),
                max,
            });
        }
        self
    }

    pub fn element_count_at_most<T>(
        &mut self,
        values: Option<&[T]>,
        max: usize,
        name: &str,
    ) -> &mut Self {
        if values.map_or(0, <[T]>::len) > max {
            self.violations.push(Violation::TooManyElements {
                name: name.to_string(),
                max,
            });
        }
        self
    }

    /// Requires every element to satisfy `allowed`.
    pub fn only_contains<T, F>(
        &mut self,
        values: Option<&[T]>,
        name: &str,
        reason: &str,
        allowed: F,
    ) -> &mut Self
    where
        T: fmt::Debug,
        F: Fn(&T) -> bool,
    {
        if let Some(values) = values {
            if values.iter().any(|value| !allowed(value)) {
                self.violations.push(Violation::ContainsProhibitedValues {
                    name: name.to_string(),
                    reason: reason.to_string(),
                    values: format!("{values:?}"),
                });
            }
        }
        self
    }

    /// `condition` may only hold when `allowed_if` holds too.
    pub fn precondition(
        &mut self,
        condition: bool,
        allowed_if: bool,
        name: &str,
        reason: &str,
    ) -> &mut Self {
        if condition && !allowed_if {
            self.violations.push(Violation::HasPrecondition {
                name: name.to_string(),
                reason: reason.to_string(),
            });
        }
        self
    }

    pub fn not_empty(&mut self, is_not_empty: bool, name: &str) -> &mut Self {
        if !is_not_empty {
            self.violations.push(Violation::CantBeEmpty {
                name: name.to_string(),
            });
        }
        self
    }

    pub fn finish(self) -> Vec<Violation> {
        self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::{Validate, Validator, Violation};

    struct Message {
        content: Option<String>,
        embeds: Option<Vec<String>>,
        sticker_ids: Vec<u64>,
        flags: Vec<u8>,
    }

    impl Validate for Message {
        fn validate(&self) -> Vec<Violation> {
            let mut validator = Validator::new();
            validator
                .at_least_one_is_not_empty(
                    &[
                        self.content.as_ref().map(String::is_empty),
                        self.embeds.as_ref().map(Vec::is_empty),
                        Some(self.sticker_ids.is_empty()),
                    ],
                    &["content", "embeds", "sticker_ids"],
                )
                .character_count_at_most(self.content.as_deref(), 10, "content")
                .element_count_at_most(self.embeds.as_deref(), 2, "embeds")
                .only_contains(
                    Some(self.flags.as_slice()),
                    "flags",
                    "only 4 is allowed",
                    |flag| *flag == 4,
                );
            validator.finish()
        }
    }

    #[test]
    fn acceptable_payload_has_no_violations() {
        let message = Message {
            content: Some("hello".to_string()),
            embeds: None,
            sticker_ids: Vec::new(),
            flags: vec![4],
        };
        assert!(message.validate().is_empty());
    }

    #[test]
    fn reports_every_broken_limit() {
        let message = Message {
            content: Some("this is far too long".to_string()),
            embeds: Some(vec!["a".into(), "b".into(), "c".into()]),
            sticker_ids: Vec::new(),
            flags: vec![4, 2],
        };
        let violations = message.validate();
        assert_eq!(
            violations,
            vec![
                Violation::TooManyCharacters {
                    name: "content".to_string(),
                    max: 10
                },
                Violation::TooManyElements {
                    name: "embeds".to_string(),
                    max: 2
                },
                Violation::ContainsProhibitedValues {
                    name: "flags".to_string(),
                    reason: "only 4 is allowed".to_string(),
                    values: "[4, 2]".to_string(),
                },
            ]
        );
    }

    #[test]
    fn empty_payload_requires_one_field() {
        let message = Message {
            content: Some(String::new()),
            embeds: None,
            sticker_ids: Vec::new(),
            flags: Vec::new(),
        };
        assert_eq!(
            message.validate(),
            vec![Violation::AtLeastOneFieldIsRequired {
                names: vec![
                    "content".to_string(),
                    "embeds".to_string(),
                    "sticker_ids".to_string()
                ],
            }]
        );
    }

    #[test]
    fn characters_are_counted_not_bytes() {
        let mut validator = Validator::new();
        validator.character_count_at_most(Some("🚀🚀🚀"), 3, "emoji");
        assert!(validator.finish().is_empty());
    }

    #[test]
    fn combined_count_joins_names() {
        let mut validator = Validator::new();
        validator
            .combined_character_count_at_most(7000, 6000, &["title", "description"])
            .precondition(true, false, "ephemeral", "requires an interaction")
            .not_empty(false, "name");
        assert_eq!(
            validator.finish(),
            vec![
                Violation::TooManyCharacters {
                    name: "title+description".to_string(),
                    max: 6000
                },
                Violation::HasPrecondition {
                    name: "ephemeral".to_string(),
                    reason: "requires an interaction".to_string()
                },
                Violation::CantBeEmpty {
                    name: "name".to_string()
                },
            ]
        );
    }
}
