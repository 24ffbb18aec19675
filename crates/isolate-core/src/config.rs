//! Configuration resolution: merge variable-gated file/command specs into one
//! deterministic [`ConfigSettings`] for a concrete configuration.
//!
//! A parsed isolate file is a [`Configs`]: a list of `(ConfigName,
//! ConfigSettings)` pairs where each [`ConfigName`] binds some of the
//! configuration variables (e.g. `OS`) and leaves the others as wildcards.
//! Resolution walks the pairs in [`compare_config_names`] order and folds
//! every matching entry together with [`ConfigSettings::union`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IsolateError, Result};
use crate::paths;

/// Prefix of a path variable reference, e.g. `<(PRODUCT_DIR)/foo`.
pub const PATH_VARIABLE_MARKER: &str = "<(";

/// One slot of a [`ConfigName`].
///
/// Variant order matters: the derived `Ord` puts every `Bound` value before
/// `Unbound`, and compares bound values lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigValue {
    Bound(String),
    Unbound,
}

impl ConfigValue {
    /// A slot bound to `value`.
    pub fn bound(value: impl Into<String>) -> Self {
        Self::Bound(value.into())
    }

    /// False for the wildcard.
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound(_))
    }

    /// The bound value, `None` for the wildcard.
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Bound(v) => Some(v),
            Self::Unbound => None,
        }
    }
}

/// Values of the configuration variables, one slot per variable in the order
/// of [`Configs::config_variables`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigName(pub Vec<ConfigValue>);

impl ConfigName {
    /// A name where every variable is a wildcard: the unconditional entry.
    pub fn unbound(len: usize) -> Self {
        Self(vec![ConfigValue::Unbound; len])
    }

    /// Number of configuration variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no configuration variable is declared.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every slot bound on both sides carries the same value.
    pub fn matches(&self, query: &ConfigName) -> bool {
        self.0
            .iter()
            .zip(&query.0)
            .all(|(mine, theirs)| match (mine, theirs) {
                (ConfigValue::Bound(a), ConfigValue::Bound(b)) => a == b,
                _ => true,
            })
    }
}

/// Total order over equal-length names: positionally, bound before unbound,
/// bound values by string comparison.
pub fn compare_config_names(lhs: &ConfigName, rhs: &ConfigName) -> Ordering {
    for (l, r) in lhs.0.iter().zip(&rhs.0) {
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl PartialOrd for ConfigName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConfigName {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_config_names(self, other).then_with(|| self.len().cmp(&other.len()))
    }
}

/// Dependencies for a single build configuration. Immutable once built.
///
/// `isolate_dir` is absolute and uses the native separator; `files` use `/`.
/// An empty `isolate_dir` marks the empty settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSettings {
    files: Vec<String>,
    command: Vec<String>,
    read_only: Option<u8>,
    isolate_dir: PathBuf,
}

impl ConfigSettings {
    /// Validate and build settings. Files are sorted and deduplicated.
    pub fn new(
        files: Vec<String>,
        command: Vec<String>,
        read_only: Option<u8>,
        isolate_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let isolate_dir = isolate_dir.into();
        if isolate_dir.as_os_str().is_empty() {
            if !files.is_empty() || !command.is_empty() {
                return Err(IsolateError::config(
                    "settings with files or a command need an isolate directory",
                ));
            }
        } else if !isolate_dir.is_absolute() {
            return Err(IsolateError::config(format!(
                "isolate directory {} must be absolute",
                isolate_dir.display()
            )));
        }
        if let Some(level) = read_only {
            if level > 2 {
                return Err(IsolateError::config(format!(
                    "read_only must be 0, 1 or 2, got {}",
                    level
                )));
            }
        }
        let mut files = files;
        files.sort();
        files.dedup();
        Ok(Self {
            files,
            command,
            read_only,
            isolate_dir,
        })
    }

    /// The settings of a configuration with nothing declared.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for [`ConfigSettings::empty`].
    pub fn is_empty(&self) -> bool {
        self.isolate_dir.as_os_str().is_empty()
    }

    /// Sorted dependencies, relative to [`ConfigSettings::isolate_dir`].
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Command line of the target.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Read-only level 0, 1 or 2; `None` when not set.
    pub fn read_only(&self) -> Option<u8> {
        self.read_only
    }

    /// Directory of the isolate file that declared these settings.
    pub fn isolate_dir(&self) -> &Path {
        &self.isolate_dir
    }

    /// Merge two settings.
    ///
    /// `self` has priority for `command` and `read_only`. The side providing
    /// the command (or, without any command, the side with files, preferring
    /// `self`) is the base: its `isolate_dir` is kept and the other side's
    /// files are rebased onto it, except those starting with a path variable.
    pub fn union(&self, rhs: &ConfigSettings) -> Result<ConfigSettings> {
        if self.is_empty() {
            return Ok(rhs.clone());
        }
        if rhs.is_empty() {
            return Ok(self.clone());
        }

        let (use_rhs, command) = if !self.command.is_empty() {
            (false, self.command.clone())
        } else if !rhs.command.is_empty() {
            (true, rhs.command.clone())
        } else {
            (self.files.is_empty(), Vec::new())
        };

        let read_only = self.read_only.or(rhs.read_only);

        let (base, other) = if use_rhs { (rhs, self) } else { (self, rhs) };

        let offset = paths::posix_offset(&other.isolate_dir, &base.isolate_dir).ok_or_else(|| {
            IsolateError::config(format!(
                "cannot rebase {} onto {}",
                other.isolate_dir.display(),
                base.isolate_dir.display()
            ))
        })?;

        let mut files = Vec::with_capacity(base.files.len() + other.files.len());
        files.extend(base.files.iter().cloned());
        for f in &other.files {
            if f.starts_with(PATH_VARIABLE_MARKER) {
                files.push(f.clone());
            } else {
                files.push(paths::posix_join(&offset, f));
            }
        }

        ConfigSettings::new(files, command, read_only, base.isolate_dir.clone())
    }
}

/// A processed isolate file, split by configuration.
///
/// Which `isolate_dir` wins is only known once a configuration is selected,
/// so the settings keep their own directory until [`Configs::get_config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configs {
    pub file_comment: String,
    config_variables: Vec<String>,
    by_config: Vec<(ConfigName, ConfigSettings)>,
}

impl Configs {
    /// Empty set of configs over sorted, unique `config_variables`.
    pub fn new(file_comment: impl Into<String>, config_variables: Vec<String>) -> Result<Self> {
        for pair in config_variables.windows(2) {
            if pair[0] >= pair[1] {
                return Err(IsolateError::config(format!(
                    "config variables must be sorted and unique, got {:?}",
                    config_variables
                )));
            }
        }
        for var in &config_variables {
            if !is_valid_variable(var) {
                return Err(IsolateError::config(format!("invalid variable name {:?}", var)));
            }
        }
        Ok(Self {
            file_comment: file_comment.into(),
            config_variables,
            by_config: Vec::new(),
        })
    }

    /// Sorted names of the configuration variables.
    pub fn config_variables(&self) -> &[String] {
        &self.config_variables
    }

    /// Entries in [`ConfigName`] order.
    pub fn by_config(&self) -> &[(ConfigName, ConfigSettings)] {
        &self.by_config
    }

    /// Store settings under exactly `key`. Each key may only be set once.
    pub fn set_config(&mut self, key: ConfigName, value: ConfigSettings) -> Result<()> {
        if key.len() != self.config_variables.len() {
            return Err(IsolateError::config(format!(
                "config name has {} values but there are {} config variables",
                key.len(),
                self.config_variables.len()
            )));
        }
        if self.get_exact_config(&key).is_some() {
            return Err(IsolateError::config(format!(
                "configuration {:?} is defined twice",
                key
            )));
        }
        self.by_config.push((key, value));
        Ok(())
    }

    /// The entry stored under exactly `key`, wildcards included.
    pub fn get_exact_config(&self, key: &ConfigName) -> Option<&ConfigSettings> {
        self.by_config
            .iter()
            .find(|(k, _)| compare_config_names(k, key) == Ordering::Equal)
            .map(|(_, v)| v)
    }

    /// Fold every entry matching `config_name` into one settings value.
    ///
    /// Returns the empty settings when nothing applies.
    pub fn get_config(&self, config_name: &ConfigName) -> Result<ConfigSettings> {
        if config_name.len() != self.config_variables.len() {
            return Err(IsolateError::config(format!(
                "config name has {} values but there are {} config variables",
                config_name.len(),
                self.config_variables.len()
            )));
        }
        let mut sorted: Vec<&(ConfigName, ConfigSettings)> = self.by_config.iter().collect();
        sorted.sort_by(|a, b| compare_config_names(&a.0, &b.0));

        let mut out = ConfigSettings::empty();
        for (key, value) in sorted {
            if key.matches(config_name) {
                out = out.union(value)?;
            }
        }
        Ok(out)
    }

    /// Union of two parsed files, e.g. an isolate file and one it includes.
    ///
    /// The variable sets are merged (sorted) and every name is re-aligned to
    /// it; variables unknown to one side become wildcards for its entries.
    pub fn union(&self, rhs: &Configs) -> Result<Configs> {
        let comment = if self.file_comment.is_empty() {
            rhs.file_comment.clone()
        } else {
            self.file_comment.clone()
        };
        let mut out = Configs::new(comment, self.config_vars_union(rhs))?;

        let mut by_config = self.expand_config_variables(&out.config_variables);
        by_config.extend(rhs.expand_config_variables(&out.config_variables));
        if by_config.is_empty() {
            return Ok(out);
        }
        // Stable sort: for equal names the left operand's entry comes first.
        by_config.sort_by(|a, b| compare_config_names(&a.0, &b.0));

        let mut entries = by_config.into_iter();
        let Some(mut last) = entries.next() else {
            return Ok(out);
        };
        for curr in entries {
            if compare_config_names(&last.0, &curr.0) == Ordering::Equal {
                last.1 = last.1.union(&curr.1)?;
            } else {
                out.by_config.push(last);
                last = curr;
            }
        }
        out.by_config.push(last);
        Ok(out)
    }

    fn config_vars_union(&self, rhs: &Configs) -> Vec<String> {
        let mut vars: Vec<String> = self
            .config_variables
            .iter()
            .chain(&rhs.config_variables)
            .cloned()
            .collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Re-key every entry onto `new_vars`, a sorted superset of ours.
    fn expand_config_variables(&self, new_vars: &[String]) -> Vec<(ConfigName, ConfigSettings)> {
        let mut mapping: Vec<Option<usize>> = Vec::with_capacity(new_vars.len());
        let mut i = 0;
        for var in new_vars {
            if i < self.config_variables.len() && self.config_variables[i] == *var {
                mapping.push(Some(i));
                i += 1;
            } else {
                mapping.push(None);
            }
        }
        debug_assert_eq!(i, self.config_variables.len());

        self.by_config
            .iter()
            .map(|(key, value)| {
                let values = mapping
                    .iter()
                    .map(|m| match m {
                        Some(idx) => key.0[*idx].clone(),
                        None => ConfigValue::Unbound,
                    })
                    .collect();
                (ConfigName(values), value.clone())
            })
            .collect()
    }
}

/// `[A-Za-z_][A-Za-z_0-9]*`
pub fn is_valid_variable(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Bind every declared variable from `values`.
///
/// All missing variables are reported at once, sorted.
pub fn compute_config_name(
    configs: &Configs,
    values: &BTreeMap<String, String>,
) -> Result<ConfigName> {
    let mut out = Vec::with_capacity(configs.config_variables.len());
    let mut missing = Vec::new();
    for var in &configs.config_variables {
        match values.get(var) {
            Some(v) => out.push(ConfigValue::bound(v.clone())),
            None => missing.push(var.clone()),
        }
    }
    if !missing.is_empty() {
        missing.sort();
        return Err(IsolateError::MissingVariables(missing));
    }
    Ok(ConfigName(out))
}
