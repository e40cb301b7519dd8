//! Macros for creating and returning [`crate::error::ShiftError`] values.

/// Creates a [`crate::error::ShiftError`] from a kind, a static description and an optional
/// detail.
#[macro_export]
macro_rules! shift_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::ShiftError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::ShiftError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with a [`crate::error::ShiftError`] built like [`shift_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::shift_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::shift_error!($kind, $desc, $detail))
    };
}
