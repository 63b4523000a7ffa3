
use std::fmt;

use crate::string_util::base_to_char;

const KIND_SUBSTITUTION: u32 = 0;
const KIND_INSERTION: u32 = 1;
const KIND_DELETION: u32 = 2;

/// The largest position a `MutationCode` can hold, 24 bits remain after the kind and bases
pub const MAX_POSITION: usize = (1 << 24) - 1;

/// The kind of a single-base mutation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MutationKind {
    Substitution,
    Insertion,
    Deletion
}

/// A compact encoding of a single-base mutation: `position << 8 | kind << 4 | from << 2 | to`.
/// Positions are relative to whatever sequence the mutation was found against (a trimmed consensus for
/// minors, a reference for majors) and may not exceed `MAX_POSITION`. For insertions `from` is meaningless
/// and for deletions `to` is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MutationCode(u32);

impl MutationCode {
    /// Creates a substitution code.
    /// # Examples
    /// ```rust
    /// use migcall::mutation::{MutationCode, MutationKind};
    /// let code = MutationCode::substitution(25, 0, 2);
    /// assert_eq!(code.position(), 25);
    /// assert_eq!(code.from(), 0);
    /// assert_eq!(code.to(), 2);
    /// assert_eq!(code.kind(), MutationKind::Substitution);
    /// assert_eq!(code.to_string(), "S25:A>G");
    /// ```
    #[inline]
    pub fn substitution(position: usize, from: u8, to: u8) -> MutationCode {
        MutationCode::pack(position, KIND_SUBSTITUTION, from, to)
    }

    /// Creates an insertion code, `to` is the inserted base.
    #[inline]
    pub fn insertion(position: usize, to: u8) -> MutationCode {
        MutationCode::pack(position, KIND_INSERTION, 0, to)
    }

    /// Creates a deletion code, `from` is the deleted base.
    #[inline]
    pub fn deletion(position: usize, from: u8) -> MutationCode {
        MutationCode::pack(position, KIND_DELETION, from, 0)
    }

    #[inline]
    fn pack(position: usize, kind: u32, from: u8, to: u8) -> MutationCode {
        debug_assert!(from < 4 && to < 4);
        debug_assert!(position <= MAX_POSITION, "mutation position {} does not fit in 24 bits", position);
        MutationCode(((position as u32) << 8) | (kind << 4) | ((from as u32 & 0x3) << 2) | (to as u32 & 0x3))
    }

    #[inline]
    pub fn position(&self) -> usize {
        (self.0 >> 8) as usize
    }

    #[inline]
    pub fn from(&self) -> u8 {
        ((self.0 >> 2) & 0x3) as u8
    }

    #[inline]
    pub fn to(&self) -> u8 {
        (self.0 & 0x3) as u8
    }

    #[inline]
    pub fn kind(&self) -> MutationKind {
        match (self.0 >> 4) & 0xF {
            KIND_INSERTION => MutationKind::Insertion,
            KIND_DELETION => MutationKind::Deletion,
            _ => MutationKind::Substitution
        }
    }

    #[inline]
    pub fn is_substitution(&self) -> bool {
        self.kind() == MutationKind::Substitution
    }

    /// The raw packed value.
    #[inline]
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Returns the same mutation moved by `offset` positions; `None` if that would leave the coordinate space.
    /// # Examples
    /// ```rust
    /// use migcall::mutation::MutationCode;
    /// let code = MutationCode::substitution(10, 1, 3);
    /// assert_eq!(code.shift(-4).unwrap().position(), 6);
    /// assert!(code.shift(-11).is_none());
    /// ```
    pub fn shift(&self, offset: isize) -> Option<MutationCode> {
        let new_pos: isize = self.position() as isize + offset;
        if new_pos < 0 || new_pos as usize > MAX_POSITION {
            None
        } else {
            Some(MutationCode((self.0 & 0xFF) | ((new_pos as u32) << 8)))
        }
    }
}

impl fmt::Display for MutationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            MutationKind::Substitution => write!(f, "S{}:{}>{}", self.position(), base_to_char(self.from()), base_to_char(self.to())),
            MutationKind::Insertion => write!(f, "I{}:{}", self.position(), base_to_char(self.to())),
            MutationKind::Deletion => write!(f, "D{}:{}", self.position(), base_to_char(self.from()))
        }
    }
}
