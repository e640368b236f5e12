use super::{load_encrypted, write_output, Context, KeyArgs};
use anyhow::bail;
use std::path::Path;

pub fn add_group(ctx: &Context, file: &Path, keys: &KeyArgs) -> anyhow::Result<()> {
    let group = keys.master_keys()?;
    if group.is_empty() {
        bail!("a key group needs at least one key");
    }

    let (store, mut tree) = load_encrypted(file)?;
    ctx.session().add_key_group(&mut tree, group)?;

    let output = store.emit_encrypted_file(&tree)?;
    write_output(file, &output, true)
}

pub fn delete_group(ctx: &Context, file: &Path, index: usize) -> anyhow::Result<()> {
    let (store, mut tree) = load_encrypted(file)?;
    ctx.session().delete_key_group(&mut tree, index)?;

    let output = store.emit_encrypted_file(&tree)?;
    write_output(file, &output, true)
}
