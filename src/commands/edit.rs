use super::{load_encrypted, write_output, Context};
use anyhow::Context as _;
use sops::path::parse_path;
use sops::stores::json::from_json;
use std::path::Path;

/// Store a JSON value at `path` and write the file back.
pub fn set(ctx: &Context, file: &Path, path: &str, value: &str) -> anyhow::Result<()> {
    let path = parse_path(path)?;
    let value: serde_json::Value =
        serde_json::from_str(value).with_context(|| format!("value {value:?} is not valid JSON"))?;

    let (store, mut tree) = load_encrypted(file)?;
    ctx.session().set(&mut tree, &path, from_json(value))?;

    let output = store.emit_encrypted_file(&tree)?;
    write_output(file, &output, true)
}

/// Remove the value at `path` and write the file back.
pub fn unset(ctx: &Context, file: &Path, path: &str) -> anyhow::Result<()> {
    let path = parse_path(path)?;

    let (store, mut tree) = load_encrypted(file)?;
    ctx.session().unset(&mut tree, &path)?;

    let output = store.emit_encrypted_file(&tree)?;
    write_output(file, &output, true)
}
