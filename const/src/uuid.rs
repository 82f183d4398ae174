use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU128;

use structbuf::Packer;

/// Position of the 16-bit short form within a SIG UUID.
const SHIFT: u32 = u128::BITS - u32::BITS;
/// Bluetooth Base UUID ([Vol 3] Part B, Section 2.5.1).
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
/// Bits outside of the 16-bit short form.
const SHORT_MASK: u128 = !((u16::MAX as u128) << SHIFT);

/// 128-bit UUID. Assigned SIG numbers are stored in their 128-bit form and are
/// compared against discovered attributes in that form, so a characteristic
/// reported with a 16-bit type matches the same UUID declared by a client.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// Creates a UUID from a `u128`. Returns `None` if the value is 0.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Creates a SIG UUID from its 16-bit short form.
    #[inline]
    #[must_use]
    pub(crate) const fn short(v: u16) -> Self {
        match NonZeroU128::new((v as u128) << SHIFT | BASE) {
            Some(nz) => Self(nz),
            None => unreachable!(),
        }
    }

    /// Returns the 16-bit short form of a SIG UUID.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> Option<u16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u16;
        if self.0.get() & SHORT_MASK == BASE && v != 0 {
            Some(v)
        } else {
            None
        }
    }

    /// Returns whether the UUID is transferred in its 2-byte form over ATT.
    #[inline]
    #[must_use]
    pub const fn is_short(self) -> bool {
        self.as_u16().is_some()
    }
}

impl Debug for Uuid {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(v) = self.as_u16() {
            return write!(f, "{v:#06X}");
        }
        let v = self.0.get();
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            (v & ((1 << 48) - 1)) as u64
        )
    }
}

impl Display for Uuid {
    /// Writes the assigned name of a known SIG UUID or the hexadecimal form of
    /// any other UUID.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let Some(v) = self.as_u16() else {
            return Debug::fmt(self, f);
        };
        if let Ok(s) = Service::try_from(v) {
            Debug::fmt(&s, f)
        } else if let Ok(c) = Characteristic::try_from(v) {
            Debug::fmt(&c, f)
        } else if let Ok(d) = Descriptor::try_from(v) {
            Debug::fmt(&d, f)
        } else {
            Debug::fmt(self, f)
        }
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}

/// Packer extension functions.
pub trait UuidPacker {
    fn uuid(&mut self, u: impl Into<Uuid>) -> &mut Self;
}

impl UuidPacker for Packer<'_> {
    /// Writes a 16-bit SIG UUID in its short form and any other UUID in full.
    #[inline]
    fn uuid(&mut self, u: impl Into<Uuid>) -> &mut Self {
        let u = u.into();
        match u.as_u16() {
            Some(v) => self.u16(v),
            None => self.u128(u),
        }
    }
}

/// Defines an enum of assigned 16-bit numbers that converts to and compares
/// with [`Uuid`].
macro_rules! uuid16_enum {
    (
        $(#[$outer:meta])*
        $vis:vis enum $typ:ident {
            $($item:ident = $uuid:literal,)+
        }
    ) => {
        $(#[$outer])*
        #[derive(
            Clone,
            Copy,
            Debug,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            ::num_enum::IntoPrimitive,
            ::num_enum::TryFromPrimitive,
        )]
        #[cfg_attr(test, derive(enum_iterator::Sequence))]
        #[non_exhaustive]
        #[repr(u16)]
        $vis enum $typ {
            $($item = $uuid,)+
        }

        impl $typ {
            /// Returns the 128-bit form of the assigned number.
            #[inline]
            #[must_use]
            pub const fn uuid(self) -> $crate::Uuid {
                $crate::Uuid::short(self as u16)
            }
        }

        impl ::core::fmt::Display for $typ {
            #[inline(always)]
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::Debug::fmt(self, f)
            }
        }

        impl ::core::cmp::PartialEq<$crate::Uuid> for $typ {
            #[inline(always)]
            fn eq(&self, rhs: &$crate::Uuid) -> bool {
                self.uuid() == *rhs
            }
        }

        impl ::core::cmp::PartialEq<$typ> for $crate::Uuid {
            #[inline(always)]
            fn eq(&self, rhs: &$typ) -> bool {
                *self == rhs.uuid()
            }
        }

        impl ::core::convert::From<$typ> for $crate::Uuid {
            #[inline]
            fn from(v: $typ) -> Self {
                v.uuid()
            }
        }
    }
}

include!("uuid16.rs");
