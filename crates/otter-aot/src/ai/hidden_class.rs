//! Hidden-class layouts recorded by the AOT compiler.

use crate::error::{AotError, Result};

/// Storage representation of one property
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Representation {
    /// Small integer
    Int = 0,
    /// Unboxed double
    Double = 1,
    /// Any tagged value
    Tagged = 2,
}

impl Representation {
    /// Whether a slot recorded as `self` can hold a value whose
    /// representation is `actual`
    pub fn can_hold(self, actual: Representation) -> bool {
        actual <= self
    }
}

impl TryFrom<i32> for Representation {
    type Error = AotError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Self::Int,
            1 => Self::Double,
            2 => Self::Tagged,
            _ => return Err(AotError::MalformedAiFile("unknown property representation")),
        })
    }
}

/// Property representations of a hidden class, in property order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HiddenClassLayout {
    representations: Vec<Representation>,
}

impl HiddenClassLayout {
    /// Layout with `representations`
    pub fn new(representations: impl Into<Vec<Representation>>) -> Self {
        Self {
            representations: representations.into(),
        }
    }

    /// Recorded representations
    pub fn representations(&self) -> &[Representation] {
        &self.representations
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.representations.len()
    }

    /// Whether the class has no properties
    pub fn is_empty(&self) -> bool {
        self.representations.is_empty()
    }

    /// Whether objects whose properties have the `actual` representations
    /// can use this layout
    pub fn matches(&self, actual: &[Representation]) -> bool {
        self.representations.len() == actual.len()
            && self
                .representations
                .iter()
                .zip(actual)
                .all(|(recorded, actual)| recorded.can_hold(*actual))
    }
}
