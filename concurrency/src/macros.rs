// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

/// Compile the enclosed items only when the `shuttle` feature of *this* crate is enabled.
///
/// The feature flag is the one set for the concurrency crate, not for the crate that invokes the
/// macro, so downstream tests follow whatever primitives [`crate::sync`] resolves to.
///
/// # Example
/// ```
/// # use ofdp_concurrency::with_shuttle;
/// with_shuttle! {
///     fn only_compiled_with_shuttle() {}
/// }
/// ```
#[cfg(feature = "shuttle")]
#[macro_export]
macro_rules! with_shuttle {
    ($($item:item)*) => {
        $(
            $item
        )*
    };
}

/// Compile the enclosed items only when the `shuttle` feature of *this* crate is enabled.
#[cfg(not(feature = "shuttle"))]
#[macro_export]
macro_rules! with_shuttle {
    ($($item:item)*) => {};
}

/// Compile the enclosed items only when [`crate::sync`] is `std::sync`.
///
/// # Example
/// ```
/// # use ofdp_concurrency::with_std;
/// with_std! {
///     fn only_compiled_with_std() {}
/// }
/// ```
#[cfg(not(feature = "shuttle"))]
#[macro_export]
macro_rules! with_std {
    ($($item:item)*) => {
        $(
            $item
        )*
    };
}

/// Compile the enclosed items only when [`crate::sync`] is `std::sync`.
#[cfg(feature = "shuttle")]
#[macro_export]
macro_rules! with_std {
    ($($item:item)*) => {};
}
