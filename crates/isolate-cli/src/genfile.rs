//! Gen files: `{"version": 1, "dir": "/abs/dir", "args": [...]}`, one per
//! target, written by the build. `args` are `archive` flags, resolved
//! against `dir`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::IsolateFlags;
use isolate_core::Tree;

const GEN_FILE_VERSION: u32 = 1;

/// Flags that the Python tooling writes as `--flag KEY VALUE`.
const KEY_VALUE_FLAGS: &[&str] = &["--config-variable", "--path-variable", "--extra-variable"];

#[derive(Debug, Deserialize)]
pub struct GenFile {
    pub version: u32,
    pub dir: PathBuf,
    pub args: Vec<String>,
}

#[derive(Parser)]
#[command(name = "archive", no_binary_name = true)]
struct GenArgs {
    #[command(flatten)]
    flags: IsolateFlags,
}

pub fn load_gen_file(path: &Path) -> Result<GenFile> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let gen: GenFile = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    if gen.version != GEN_FILE_VERSION {
        bail!(
            "{}: unsupported version {}, expected {}",
            path.display(),
            gen.version,
            GEN_FILE_VERSION
        );
    }
    if !gen.dir.is_absolute() {
        bail!("{}: dir {} must be absolute", path.display(), gen.dir.display());
    }
    Ok(gen)
}

/// Turn `--config-variable KEY VALUE` into `--config-variable KEY=VALUE`.
pub fn convert_py_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        out.push(arg.clone());
        if KEY_VALUE_FLAGS.contains(&arg.as_str())
            && i + 2 < args.len()
            && !args[i + 1].contains('=')
        {
            out.push(format!("{}={}", args[i + 1], args[i + 2]));
            i += 3;
            continue;
        }
        i += 1;
    }
    out
}

pub fn tree_from_gen_file(path: &Path) -> Result<Tree> {
    let gen = load_gen_file(path)?;
    let args = convert_py_args(&gen.args);
    let parsed = GenArgs::try_parse_from(&args)
        .with_context(|| format!("{}: bad args {:?}", path.display(), gen.args))?;
    parsed.flags.to_tree(&gen.dir)
}
