/// Generates a BACnet enumeration that keeps unknown wire values instead of
/// failing on them.
///
/// BACnet enumerations reserve a range for vendor-defined values (reject and
/// abort reasons from 64, error codes from 256, object types from 128 and so
/// on). Values inside that range decode to `Proprietary`, anything else that
/// is not a named variant decodes to `Reserved`. Conversion in both
/// directions is therefore total and a received code always survives a round
/// trip back onto the wire.
///
/// # Example
///
/// ```rust
/// use bacnet_session::generate_custom_enum;
///
/// generate_custom_enum! {
///     /// Reasons a toy service may refuse a request
///     ToyReason {
///         Other = 0,
///         Busy = 1,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(ToyReason::from(1u8), ToyReason::Busy);
/// assert_eq!(ToyReason::from(70u8), ToyReason::Proprietary(70));
/// assert_eq!(ToyReason::from(9u8), ToyReason::Reserved(9));
/// assert_eq!(u8::from(ToyReason::Proprietary(70)), 70);
/// assert_eq!(ToyReason::Busy.to_string(), "Busy");
/// ```
#[macro_export]
macro_rules! generate_custom_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:literal,)+ }, $unit:ident, $custom_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                /// Vendor-defined value
                Proprietary($unit),
                /// Value neither named nor in the vendor range
                Reserved($unit),
            }

            impl $name {
                #[doc = "Whether this " $name " is a vendor-defined value"]
                pub fn is_proprietary(&self) -> bool {
                    matches!(self, $name::Proprietary(_))
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => f.write_str(stringify!($variant)),)*
                        $name::Proprietary(value) => write!(f, "Proprietary({})", value),
                        $name::Reserved(value) => write!(f, "Reserved({})", value),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary(value) | $name::Reserved(value) => value,
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($custom_range).contains(&v) => $name::Proprietary(v),
                        v => $name::Reserved(v),
                    }
                }
            }
        }
    };
}
