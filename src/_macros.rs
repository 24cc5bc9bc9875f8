macro_rules! define_int_type {
    ($name:ident, $ty:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name($ty);

        impl $name {
            pub const fn new(v: $ty) -> Self {
                Self(v)
            }

            pub const fn raw(&self) -> $ty {
                self.0
            }

            pub fn as_usize(&self) -> usize {
                self.0 as usize
            }
        }

        impl From<$ty> for $name {
            fn from(v: $ty) -> Self {
                Self(v)
            }
        }

        impl From<$name> for $ty {
            fn from(v: $name) -> $ty {
                v.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl core::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl core::fmt::UpperHex for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::UpperHex::fmt(&self.0, f)
            }
        }
    };
}

/// Builds an [`Error`](crate::err::Error) stamped with the invocation site.
macro_rules! err {
    ($kind:ident) => {
        $crate::err::Error::at($crate::err::ErrorKind::$kind, file!(), line!())
    };
}
