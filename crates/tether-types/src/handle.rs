use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of reserved handle slots at the start of every handle table.
pub const RESERVED_HANDLES: u32 = 4;

/// Opaque capability token naming a host value.
///
/// The guest only ever sees the raw `i32`; it never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const UNDEFINED: Self = Self(0);
    pub const NULL: Self = Self(1);
    pub const TRUE: Self = Self(2);
    pub const FALSE: Self = Self(3);

    /// Reinterpret a guest `i32` as a handle.
    ///
    /// Guest integers are masked to unsigned so that handles above
    /// `i32::MAX` do not sign-extend.
    #[inline]
    pub const fn from_abi(raw: i32) -> Self {
        Self(raw as u32)
    }

    /// The `i32` passed back across the boundary.
    #[inline]
    pub const fn to_abi(self) -> i32 {
        self.0 as i32
    }

    /// Handle of the `true`/`false` sentinel.
    #[inline]
    pub const fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// Whether this handle names one of the four pre-populated sentinels.
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 < RESERVED_HANDLES
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A UTF-8 string living in guest memory: `len` bytes at `ptr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestStr {
    pub ptr: u32,
    pub len: u32,
}

impl GuestStr {
    pub const EMPTY: Self = Self { ptr: 0, len: 0 };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_roundtrip_masks_sign() {
        let h = Handle::from_abi(-1);
        assert_eq!(h.0, u32::MAX);
        assert_eq!(h.to_abi(), -1);
    }

    #[test]
    fn sentinels_are_reserved() {
        for h in [Handle::UNDEFINED, Handle::NULL, Handle::TRUE, Handle::FALSE] {
            assert!(h.is_reserved());
        }
        assert!(!Handle(RESERVED_HANDLES).is_reserved());
        assert_eq!(Handle::from_bool(true), Handle::TRUE);
        assert_eq!(Handle::from_bool(false), Handle::FALSE);
    }
}
