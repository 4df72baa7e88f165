// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing runtime control.

use ordermap::OrderMap;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, filter::LevelFilter, prelude::*, reload};

use crate::display::TargetRegistryByTag;
use crate::targets::TRACING_TARGETS;
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &[]);

/// Errors produced while applying a tracing configuration string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TraceConfigError {
    /// An item did not have the `tag=level` shape.
    #[error("invalid tracing directive '{0}': expected tag=level")]
    Syntax(String),
    /// The level is not one of off, error, warn, info, debug, trace.
    #[error("invalid tracing level '{0}'")]
    Level(String),
}

/// Current configuration of a single target.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: Vec<&'static str>,
    pub(crate) custom: bool,
}

impl TargetState {
    fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
        custom: bool,
    ) -> Self {
        // a target can always be addressed through its own name
        let mut tags = tags.to_vec();
        if !tags.contains(&name) {
            tags.push(name);
        }
        Self {
            target,
            name,
            level,
            tags,
            custom,
        }
    }

    /// The `tracing` target string (module path for [`trace_target!`] declarations).
    #[must_use]
    pub fn target(&self) -> &'static str {
        self.target
    }

    /// The level this target is currently filtered at.
    #[must_use]
    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

/// A tag and the set of targets it addresses.
#[derive(Debug, Clone)]
pub struct Tag {
    pub(crate) tag: &'static str,
    pub(crate) targets: HashSet<&'static str>,
}

impl Tag {
    fn new(tag: &'static str, target: &'static str) -> Self {
        let mut targets = HashSet::with_capacity(1);
        targets.insert(target);
        Self { tag, targets }
    }

    /// The tag's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.tag
    }
}

#[derive(Debug)]
pub(crate) struct TargetRegistry {
    pub(crate) level: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetState>,
    pub(crate) tags: OrderMap<&'static str, Tag>,
}

impl TargetRegistry {
    fn new(level: LevelFilter) -> Self {
        let mut registry = Self {
            level,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for spec in TRACING_TARGETS {
            registry.register(spec.target, spec.name, spec.level, spec.tags, spec.custom);
        }
        registry
    }

    fn register(
        &mut self,
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
        custom: bool,
    ) {
        let state = TargetState::new(target, name, level, tags, custom);
        let tags = state.tags.clone();
        if let Some(previous) = self.targets.insert(target, state) {
            warn!("Target {} has been multiply defined!", previous.target);
        }
        for tag in tags {
            match self.tags.get_mut(tag) {
                Some(existing) => {
                    existing.targets.insert(target);
                }
                None => {
                    self.tags.insert(tag, Tag::new(tag, target));
                }
            }
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.level.to_string());
        for target in self.targets.values() {
            match format!("{}={}", target.target, target.level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => error!("Unusable tracing target {}: {e}", target.target),
            }
        }
        filter
    }

    fn tag_targets_mut<'a>(&'a mut self, tag: &str) -> impl Iterator<Item = &'a mut TargetState> {
        let members = self.tags.get(tag).map(|t| t.targets.clone()).unwrap_or_default();
        self.targets
            .values_mut()
            .filter(move |target| members.contains(target.target))
    }

    fn tag_targets<'a>(&'a self, tag: &str) -> impl Iterator<Item = &'a TargetState> {
        let members = self.tags.get(tag).map(|t| t.targets.clone()).unwrap_or_default();
        self.targets
            .values()
            .filter(move |target| members.contains(target.target))
    }

    /// A config string that reproduces the current levels (one entry per target, no grouping).
    pub(crate) fn as_config_string(&self) -> String {
        let mut out = format!("default={}", self.level);
        for target in self.targets.values() {
            out += format!(",{}={}", target.name, target.level).as_str();
        }
        out
    }
}

/// Handle on the global tracing subscriber and its per-target levels.
#[derive(Debug)]
pub struct LogControl {
    registry: Mutex<TargetRegistry>,
    reload_filter: reload::Handle<EnvFilter, Registry>,
}

static LOG_CONTROL: OnceLock<LogControl> = OnceLock::new();

/// Get the process-wide [`LogControl`], installing the subscriber on first use.
pub fn log_control() -> &'static LogControl {
    LOG_CONTROL.get_or_init(LogControl::new)
}

impl LogControl {
    fn new() -> Self {
        let registry = TargetRegistry::new(LevelFilter::INFO);
        let (filter, reload_filter) = reload::Layer::new(registry.env_filter());

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true)
            .with_level(true);

        // another subscriber (e.g. a test harness) may already be installed; levels are then
        // tracked here but not enforced
        if let Err(e) = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
        {
            warn!("Tracing subscriber already installed: {e}");
        }

        Self {
            registry: Mutex::new(registry),
            reload_filter,
        }
    }

    /// Install the subscriber if this has not happened yet.
    pub fn init() {
        log_control();
    }

    fn registry(&self) -> MutexGuard<'_, TargetRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reload(&self, filter: EnvFilter) {
        if let Err(e) = self.reload_filter.reload(filter) {
            error!("Failed to reload tracing filter: {e}");
        }
    }

    /// Set the level of every target carrying `tag`.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) {
        let mut registry = self.registry();
        let mut changed = 0;
        for target in registry.tag_targets_mut(tag) {
            if target.level != level {
                target.level = level;
                changed += 1;
            }
        }
        if changed > 0 {
            self.reload(registry.env_filter());
        }
        info!("Changed log level for tag '{tag}' to {level}. Targets changed: {changed}");
    }

    /// Set the level of every registered target.
    pub fn set_level_all(&self, level: LevelFilter) {
        let mut registry = self.registry();
        for target in registry.targets.values_mut() {
            target.level = level;
        }
        self.reload(registry.env_filter());
    }

    /// Set the level applied to events outside any registered target.
    pub fn set_default_level(&self, level: LevelFilter) {
        let mut registry = self.registry();
        if registry.level != level {
            registry.level = level;
            info!("Set default log level to {level}");
            self.reload(registry.env_filter());
        }
    }

    /// The level applied to events outside any registered target.
    #[must_use]
    pub fn default_level(&self) -> LevelFilter {
        self.registry().level
    }

    fn parse_config(input: &str) -> Result<OrderMap<String, LevelFilter>, TraceConfigError> {
        let mut result = OrderMap::new();
        for item in input.split(',') {
            let item = item.trim();
            let Some((tag, level)) = item.split_once('=') else {
                return Err(TraceConfigError::Syntax(item.to_string()));
            };
            let level = LevelFilter::from_str(level.trim())
                .map_err(|_| TraceConfigError::Level(level.trim().to_string()))?;
            result.insert(tag.trim().to_string(), level);
        }
        Ok(result)
    }

    /// Apply a comma separated list of `tag=level` items.
    ///
    /// `default=level` sets the default level and `all=level` sets every target; the remaining
    /// items are applied afterwards, so `default=error,all=info,flow-table=debug` works as
    /// expected.
    ///
    /// # Errors
    ///
    /// Returns a [`TraceConfigError`] (and changes nothing) if any item is malformed.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceConfigError> {
        let config = Self::parse_config(input)?;
        if let Some(level) = config.get("default") {
            self.set_default_level(*level);
        }
        if let Some(level) = config.get("all") {
            self.set_level_all(*level);
        }
        for (tag, level) in &config {
            self.set_tag_level(tag, *level);
        }
        Ok(())
    }

    /// All known tags.
    pub fn tags(&self) -> impl Iterator<Item = Tag> {
        self.registry().tags.clone().into_values()
    }

    /// Look up a tag.
    pub fn tag(&self, tag: &str) -> Option<Tag> {
        self.registry().tags.get(tag).cloned()
    }

    /// Look up a target by its target string.
    pub fn target(&self, target: &str) -> Option<TargetState> {
        self.registry().targets.get(target).cloned()
    }

    /// All targets carrying `tag`.
    pub fn targets_by_tag(&self, tag: &str) -> impl Iterator<Item = TargetState> {
        self.registry()
            .tag_targets(tag)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Log the target table grouped by tag.
    pub fn dump_targets_by_tag(&self) {
        let registry = self.registry();
        info!("{}", TargetRegistryByTag(&registry));
    }

    /// Log the target table.
    pub fn dump(&self) {
        let registry = self.registry();
        info!("{registry}");
    }

    /// A config string that reproduces the current levels.
    pub fn as_config_string(&self) -> String {
        self.registry().as_config_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::control::{LogControl, TraceConfigError, log_control};
    use crate::targets::TRACING_TARGETS;
    use crate::{LevelFilter, custom_target, trace_target};
    use serial_test::serial;

    #[test]
    #[serial]
    fn registry_contains_link_time_targets() {
        trace_target!("my-module", LevelFilter::ERROR, &["my-tag"]);
        custom_target!("flow-table-test", LevelFilter::WARN, &["datapath-test"]);

        let declared: Vec<&str> = TRACING_TARGETS.iter().map(|t| t.target).collect();
        assert!(declared.contains(&module_path!()));
        assert!(declared.contains(&"flow-table-test"));
        assert!(declared.contains(&"declared-later"));

        let ctl = log_control();
        assert!(ctl.target("flow-table-test").is_some());
        assert!(ctl.target("declared-later").is_some());
        assert!(ctl.tag("datapath-test").is_some());

        // declared after the checks, still collected by the linker
        custom_target!("declared-later", LevelFilter::OFF, &[]);
    }

    #[test]
    #[serial]
    fn tag_level_applies_to_all_members() {
        const TAG: &str = "shared-pool-tag";
        custom_target!("pool-a", LevelFilter::DEBUG, &[TAG]);
        custom_target!("pool-b", LevelFilter::ERROR, &[TAG]);

        let ctl = log_control();
        let members: Vec<_> = ctl.targets_by_tag(TAG).map(|t| t.target()).collect();
        assert!(members.contains(&"pool-a"));
        assert!(members.contains(&"pool-b"));

        ctl.set_tag_level(TAG, LevelFilter::OFF);
        assert_eq!(ctl.target("pool-a").unwrap().level(), LevelFilter::OFF);
        assert_eq!(ctl.target("pool-b").unwrap().level(), LevelFilter::OFF);
        ctl.dump_targets_by_tag();
    }

    #[test]
    #[serial]
    fn setup_from_string_sets_levels() {
        custom_target!("vport-test", LevelFilter::INFO, &["chain-test"]);
        let ctl = log_control();
        ctl.setup_from_string("default=warn, chain-test=trace").unwrap();
        assert_eq!(ctl.default_level(), LevelFilter::WARN);
        assert_eq!(ctl.target("vport-test").unwrap().level(), LevelFilter::TRACE);
        assert!(ctl.as_config_string().starts_with("default=warn"));
        ctl.set_default_level(LevelFilter::INFO);
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert_eq!(
            LogControl::parse_config("chain=loud"),
            Err(TraceConfigError::Level("loud".to_string()))
        );
        assert_eq!(
            LogControl::parse_config("chain=info, bogus"),
            Err(TraceConfigError::Syntax("bogus".to_string()))
        );
        assert!(LogControl::parse_config("default=off,all=debug").is_ok());
    }
}
