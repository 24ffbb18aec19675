//! Loading isolate files into [`Configs`].
//!
//! The conditional-expression grammar is not handled here: a
//! [`ConfigFileParser`] receives a file whose conditions were already
//! evaluated into per-configuration entries. [`JsonConfigParser`] reads that
//! evaluated form:
//!
//! ```json
//! {
//!   "includes": ["../base/base.isolate"],
//!   "variables": {"files": ["data/"]},
//!   "conditions": [
//!     {"config": {"OS": "linux"}, "variables": {"command": ["./run"], "files": ["run"]}}
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::{compute_config_name, ConfigName, ConfigSettings, ConfigValue, Configs};
use crate::error::{IsolateError, Result};
use crate::paths;

/// Turns the bytes of one isolate file into a [`Configs`].
pub trait ConfigFileParser: Send + Sync {
    /// `isolate_dir` is the directory containing the file; relative includes
    /// and every entry's `isolate_dir` derive from it.
    fn parse(&self, isolate_dir: &Path, content: &[u8], file_comment: &str) -> Result<Configs>;
}

/// Split the leading `#` comment block from the rest of the file.
pub fn extract_comment(content: &str) -> (String, &str) {
    let mut end = 0;
    for line in content.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            end += line.len();
        } else {
            break;
        }
    }
    (content[..end].to_string(), &content[end..])
}

/// Read an isolate file and parse it with `parser`.
pub fn load_isolate_as_config(path: &Path, parser: &dyn ConfigFileParser) -> Result<Configs> {
    let content = fs::read_to_string(path).map_err(|e| IsolateError::io(path, e))?;
    let (comment, body) = extract_comment(&content);
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    parser.parse(dir, body.as_bytes(), &comment)
}

/// Load an isolate file and resolve it for the given variable values.
pub fn load_isolate_for_config(
    path: &Path,
    parser: &dyn ConfigFileParser,
    config_variables: &BTreeMap<String, String>,
) -> Result<ConfigSettings> {
    let configs = load_isolate_as_config(path, parser)?;
    let name = compute_config_name(&configs, config_variables)?;
    configs.get_config(&name)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVariables {
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    read_only: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCondition {
    config: BTreeMap<String, String>,
    variables: RawVariables,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIsolate {
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    variables: Option<RawVariables>,
    #[serde(default)]
    conditions: Vec<RawCondition>,
}

/// Parser for pre-evaluated isolate files in JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConfigParser;

impl JsonConfigParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_with_stack(
        &self,
        isolate_dir: &Path,
        content: &[u8],
        file_comment: &str,
        stack: &mut Vec<PathBuf>,
    ) -> Result<Configs> {
        let raw: RawIsolate = if content.iter().all(u8::is_ascii_whitespace) {
            RawIsolate::default()
        } else {
            serde_json::from_slice(content).map_err(|source| IsolateError::Json {
                path: isolate_dir.to_path_buf(),
                source,
            })?
        };

        let mut out = Configs::new(file_comment, Vec::new())?;
        if let Some(vars) = raw.variables {
            let mut unconditional = Configs::new("", Vec::new())?;
            unconditional.set_config(ConfigName::unbound(0), settings(vars, isolate_dir)?)?;
            out = out.union(&unconditional)?;
        }
        for cond in raw.conditions {
            // BTreeMap keys come out sorted, matching the variable order.
            let names: Vec<String> = cond.config.keys().cloned().collect();
            let key = ConfigName(cond.config.into_values().map(ConfigValue::Bound).collect());
            let mut single = Configs::new("", names)?;
            single.set_config(key, settings(cond.variables, isolate_dir)?)?;
            out = out.union(&single)?;
        }

        for include in &raw.includes {
            let path = paths::normalize(&isolate_dir.join(paths::from_posix(include)));
            if stack.contains(&path) {
                return Err(IsolateError::config(format!(
                    "include cycle through {}",
                    path.display()
                )));
            }
            debug!("Loading include {}", path.display());
            let content = fs::read_to_string(&path).map_err(|e| IsolateError::io(&path, e))?;
            let (comment, body) = extract_comment(&content);
            let dir = path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();

            stack.push(path);
            let included = self.parse_with_stack(&dir, body.as_bytes(), &comment, stack)?;
            stack.pop();

            out = out.union(&included)?;
        }
        Ok(out)
    }
}

impl ConfigFileParser for JsonConfigParser {
    fn parse(&self, isolate_dir: &Path, content: &[u8], file_comment: &str) -> Result<Configs> {
        if !isolate_dir.is_absolute() {
            return Err(IsolateError::config(format!(
                "isolate directory {} must be absolute",
                isolate_dir.display()
            )));
        }
        self.parse_with_stack(isolate_dir, content, file_comment, &mut Vec::new())
    }
}

fn settings(vars: RawVariables, isolate_dir: &Path) -> Result<ConfigSettings> {
    for f in &vars.files {
        if f.starts_with('/') || f.contains('\\') {
            return Err(IsolateError::config(format!(
                "dependency {:?} must be a relative posix path",
                f
            )));
        }
    }
    ConfigSettings::new(vars.files, vars.command, vars.read_only, isolate_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_comment() {
        let (comment, body) = extract_comment("# Copyright\n# more\n{\"a\": 1}\n# not\n");
        assert_eq!(comment, "# Copyright\n# more\n");
        assert_eq!(body, "{\"a\": 1}\n# not\n");

        let (comment, body) = extract_comment("{}");
        assert_eq!(comment, "");
        assert_eq!(body, "{}");
    }

    #[test]
    fn test_parse_conditions() {
        let content = br#"{
            "variables": {"files": ["common/"]},
            "conditions": [
                {"config": {"OS": "linux"}, "variables": {"command": ["./run"], "files": ["run"], "read_only": 1}},
                {"config": {"OS": "mac"}, "variables": {"command": ["./run.app"], "files": ["run.app/"]}}
            ]
        }"#;
        let configs = JsonConfigParser
            .parse(Path::new("/src/tests"), content, "# comment\n")
            .unwrap();
        assert_eq!(configs.file_comment, "# comment\n");
        assert_eq!(configs.config_variables(), ["OS"]);
        assert_eq!(configs.by_config().len(), 3);

        let linux = configs
            .get_config(&compute_config_name(&configs, &vars(&[("OS", "linux")])).unwrap())
            .unwrap();
        assert_eq!(linux.command(), ["./run"]);
        assert_eq!(linux.files(), ["common/", "run"]);
        assert_eq!(linux.read_only(), Some(1));
        assert_eq!(linux.isolate_dir(), Path::new("/src/tests"));
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let content = br#"{"variables": {"filez": []}}"#;
        assert!(JsonConfigParser
            .parse(Path::new("/src"), content, "")
            .is_err());
        assert!(JsonConfigParser
            .parse(Path::new("relative"), b"{}", "")
            .is_err());
    }

    #[test]
    fn test_includes_are_rebased() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        let tests = dir.path().join("tests");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&tests).unwrap();
        fs::write(
            base.join("base.isolate"),
            r#"# base comment
{"conditions": [{"config": {"OS": "linux"}, "variables": {"files": ["libbase.so"]}}]}"#,
        )
        .unwrap();
        let main = tests.join("foo.isolate");
        fs::write(
            &main,
            r#"{"includes": ["../base/base.isolate"],
                "variables": {"command": ["./foo"], "files": ["foo"]}}"#,
        )
        .unwrap();

        let settings =
            load_isolate_for_config(&main, &JsonConfigParser, &vars(&[("OS", "linux")])).unwrap();
        assert_eq!(settings.command(), ["./foo"]);
        assert_eq!(settings.files(), ["../base/libbase.so", "foo"]);
        assert_eq!(settings.isolate_dir(), tests.as_path());

        let configs = load_isolate_as_config(&main, &JsonConfigParser).unwrap();
        assert_eq!(configs.file_comment, "# base comment\n");
        assert!(matches!(
            load_isolate_for_config(&main, &JsonConfigParser, &BTreeMap::new()),
            Err(IsolateError::MissingVariables(_))
        ));
    }

    #[test]
    fn test_include_cycle() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.isolate");
        let b = dir.path().join("b.isolate");
        fs::write(&a, r#"{"includes": ["b.isolate"]}"#).unwrap();
        fs::write(&b, r#"{"includes": ["a.isolate"]}"#).unwrap();
        let err = load_isolate_as_config(&a, &JsonConfigParser).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{}", err);
    }
}
