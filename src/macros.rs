//! Provides convenience macros for use in the rest of the project.

/// A non-composite enum value that assigns each `value` to the `variant`'s
/// discriminant, and as such requires only one `value` per `variant`.
///
/// Conversion from the underlying type is fallible, so not all patterns must
/// be present.
#[macro_export]
macro_rules! enum_repr_fallible {
	(
		$(#[$outer:meta])*
		$visibility:vis enum $name:ident: $typ:ty, $error_type:ty, {$error_fn:expr} {
	        $(
                $(#[doc = $doc:expr])?
	            $variant:ident = $value:literal => $string:literal,
	        )*
	    }
	) => {
		#[repr($typ)]
		$(#[$outer])*
        $visibility enum $name {
            $(
                #[doc = concat!($string, " - ", stringify!($value))]
                $(#[doc = $doc])?
                $variant = $value,
            )*
        }

        impl TryFrom<$typ> for $name {
            type Error = $error_type;

			fn try_from(value: $typ) -> Result<Self, $error_type> {
	            #[allow(clippy::redundant_closure_call)]
				match value {
					$($value => Ok(Self::$variant),)*
					_ => Err(($error_fn)(value)),
				}
			}
        }

		impl From<$name> for $typ {
			fn from(value: $name) -> Self {
				value as $typ
			}
		}

		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				f.write_str(match self {
					$(Self::$variant => $string,)*
				})
			}
		}
    };
}

