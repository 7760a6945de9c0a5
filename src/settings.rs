//! Start-up settings passed through the environment.
//!
//! A launcher fills them in with [`ShimSettings::save`] before it executes the
//! target; the preloaded shim reads them back with [`ShimSettings::from_env`]
//! before `main`.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SettingsError;
use crate::reserve::ReserveOptions;

pub const CONFIG_FILE_VAR: &str = "HPALLOC_CONFIG_FILE";
pub const DRY_RUN_VAR: &str = "HPALLOC_DRYRUN";
pub const ON_UNAVAILABLE_VAR: &str = "HPALLOC_ON_UNAVAILABLE";
pub const HEAP_SPILL_VAR: &str = "HPALLOC_HEAP_SPILL";
pub const EXTENT_SLOTS_VAR: &str = "HPALLOC_EXTENT_SLOTS";
pub const HOOKS_VAR: &str = "HPALLOC_HOOKS";
/// `env_logger` filter for the shim's own diagnostics.
pub const LOG_VAR: &str = "HPALLOC_LOG";

const DEFAULT_EXTENT_SLOTS: usize = 4096;

/// What to do when the OS can't provide the page size a rule asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnavailablePolicy {
    /// Refuse to start.
    #[default]
    Abort,
    /// Back the rule with default pages and carry on.
    Degrade,
}

/// Who serves heap growth that crosses the end of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapSpill {
    /// Everything past the boundary goes to the fallback. A following rule
    /// whose span the growth reaches gives up the covered prefix.
    #[default]
    Fallback,
    /// Each following rule serves its own span with its own page size; only
    /// the gaps between rules go to the fallback.
    Follow,
}

/// How intercepted calls reach the shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookMode {
    /// Exported symbols replace libc's wrappers.
    #[default]
    Preload,
    /// A seccomp filter turns the system calls themselves into notifications,
    /// which also catches libc's internal `__brk`.
    Seccomp,
}

impl FromStr for UnavailablePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(UnavailablePolicy::Abort),
            "degrade" => Ok(UnavailablePolicy::Degrade),
            _ => Err(()),
        }
    }
}

impl FromStr for HeapSpill {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fallback" => Ok(HeapSpill::Fallback),
            "follow" => Ok(HeapSpill::Follow),
            _ => Err(()),
        }
    }
}

impl FromStr for HookMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preload" => Ok(HookMode::Preload),
            "seccomp" => Ok(HookMode::Seccomp),
            _ => Err(()),
        }
    }
}

impl HookMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookMode::Preload => "preload",
            HookMode::Seccomp => "seccomp",
        }
    }
}

impl UnavailablePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailablePolicy::Abort => "abort",
            UnavailablePolicy::Degrade => "degrade",
        }
    }
}

impl HeapSpill {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeapSpill::Fallback => "fallback",
            HeapSpill::Follow => "follow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimSettings {
    pub config_file: PathBuf,
    pub dry_run: bool,
    pub on_unavailable: UnavailablePolicy,
    pub heap_spill: HeapSpill,
    pub extent_slots: usize,
    pub hooks: HookMode,
}

impl ShimSettings {
    /// Settings with defaults for everything but the rules file.
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            dry_run: false,
            on_unavailable: UnavailablePolicy::default(),
            heap_spill: HeapSpill::default(),
            extent_slots: DEFAULT_EXTENT_SLOTS,
            hooks: HookMode::default(),
        }
    }

    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Reads the settings through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_vars<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_file = lookup(CONFIG_FILE_VAR)
            .filter(|v| !v.is_empty())
            .ok_or(SettingsError::Missing(CONFIG_FILE_VAR))?;

        let mut settings = Self::new(config_file);

        if let Some(value) = lookup(DRY_RUN_VAR) {
            settings.dry_run = parse_bool(&value).ok_or(SettingsError::Invalid {
                name: DRY_RUN_VAR,
                value,
            })?;
        }
        if let Some(value) = lookup(ON_UNAVAILABLE_VAR) {
            settings.on_unavailable = parse_var(ON_UNAVAILABLE_VAR, value)?;
        }
        if let Some(value) = lookup(HEAP_SPILL_VAR) {
            settings.heap_spill = parse_var(HEAP_SPILL_VAR, value)?;
        }
        if let Some(value) = lookup(HOOKS_VAR) {
            settings.hooks = parse_var(HOOKS_VAR, value)?;
        }
        if let Some(value) = lookup(EXTENT_SLOTS_VAR) {
            settings.extent_slots = value
                .trim()
                .parse()
                .ok()
                .filter(|&n| n > 0)
                .ok_or(SettingsError::Invalid {
                    name: EXTENT_SLOTS_VAR,
                    value,
                })?;
        }

        Ok(settings)
    }

    /// Exports the settings so a child process started afterwards picks them up.
    ///
    /// # Safety
    ///
    /// Modifies the process environment, see [`std::env::set_var`]. No other
    /// thread may be reading or writing the environment at the same time.
    pub unsafe fn save(&self) {
        let vars = [
            (CONFIG_FILE_VAR, self.config_file.display().to_string()),
            (DRY_RUN_VAR, self.dry_run.to_string()),
            (ON_UNAVAILABLE_VAR, self.on_unavailable.as_str().to_string()),
            (HEAP_SPILL_VAR, self.heap_spill.as_str().to_string()),
            (EXTENT_SLOTS_VAR, self.extent_slots.to_string()),
            (HOOKS_VAR, self.hooks.as_str().to_string()),
        ];
        for (name, value) in vars {
            unsafe { env::set_var(name, value) };
        }
    }

    pub fn reserve_options(&self) -> ReserveOptions {
        ReserveOptions {
            dry_run: self.dry_run,
            on_unavailable: self.on_unavailable,
            extent_slots: self.extent_slots,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_var<T: FromStr>(name: &'static str, value: String) -> Result<T, SettingsError> {
    value
        .parse()
        .map_err(|_| SettingsError::Invalid { name, value })
}
