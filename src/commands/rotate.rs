use super::{load_encrypted, write_output, Context, RotateKeyArgs};
use std::path::Path;

/// Re-encrypt a file under a new data key, optionally changing its keys.
pub fn rotate(
    ctx: &Context,
    file: &Path,
    keys: &RotateKeyArgs,
    in_place: bool,
) -> anyhow::Result<()> {
    let added = keys.added()?;
    let removed = keys.removed()?;

    let (store, mut tree) = load_encrypted(file)?;
    ctx.session().rotate(&mut tree, added, &removed)?;

    let output = store.emit_encrypted_file(&tree)?;
    write_output(file, &output, in_place)
}
