// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Display implementations

use crate::control::{TargetRegistry, TargetState};
use std::fmt::{Display, Formatter, Result};

const RULE: &str = "────────";

fn fmt_row(f: &mut Formatter<'_>, name: &str, target: &str, level: &str) -> Result {
    writeln!(f, "{name:>24} │ {level:>6} │ {target}")
}

impl Display for TargetState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{} ({}) at {}", self.name, self.target, self.level)
    }
}

impl Display for TargetRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        writeln!(f)?;
        writeln!(f, "{RULE:>20} Datapath log levels {RULE}")?;
        fmt_row(f, "NAME", "TARGET", "LEVEL")?;
        for target in self.targets.values() {
            let kind = if target.custom { "custom" } else { "module" };
            fmt_row(
                f,
                target.name,
                &format!("{} [{kind}]", target.target),
                &target.level.to_string(),
            )?;
        }
        fmt_row(f, "(default)", "--", &self.level.to_string())
    }
}

pub(crate) struct TargetRegistryByTag<'a>(pub(crate) &'a TargetRegistry);

impl Display for TargetRegistryByTag<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let registry = self.0;
        writeln!(f)?;
        writeln!(f, "{RULE:>20} Log targets by tag {RULE}")?;
        for tag in registry.tags.values() {
            writeln!(f, " {}:", tag.tag)?;
            for target in registry
                .targets
                .values()
                .filter(|t| tag.targets.contains(t.target))
            {
                writeln!(f, "      {:<40} : {}", target.target, target.level)?;
            }
        }
        Ok(())
    }
}
