// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of tracing targets across all linked crates

use crate::LevelFilter;
use linkme::distributed_slice;

/// A statically declared tracing target.
pub struct TargetSpec {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
    pub(crate) custom: bool,
}

impl TargetSpec {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
        custom: bool,
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
            custom,
        }
    }
}

#[distributed_slice]
pub static TRACING_TARGETS: [TargetSpec];

#[doc(hidden)]
#[macro_export]
macro_rules! trace_target_deps {
    () => {
        use linkme::distributed_slice;
        use $crate::LevelFilter;
        use $crate::targets::{TRACING_TARGETS, TargetSpec};
    };
}

/// Declare the calling module as a tracing target with a display name, default level and tags.
#[macro_export]
macro_rules! trace_target {
    // The anonymous const scope lets a crate invoke the macro from many modules without the
    // statics colliding, and keeps the imports out of the caller's namespace.
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            use $crate::trace_target_deps;
            trace_target_deps!();

            #[distributed_slice(TRACING_TARGETS)]
            static TRACE_TGT: TargetSpec =
                TargetSpec::new(module_path!(), $name, $level, $tags, false);
        };
    };
}

/// Declare a tracing target whose name is not a module path (used with `target: ...` logging).
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            use $crate::trace_target_deps;
            trace_target_deps!();

            #[distributed_slice(TRACING_TARGETS)]
            static TRACE_TGT: TargetSpec = TargetSpec::new($target, $target, $level, $tags, true);
        };
    };
}
