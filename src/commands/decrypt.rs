use super::{load_encrypted, write_output, Context};
use sops::path::parse_path;
use sops::stores::Store;
use sops::Value;
use std::path::Path;

/// Decrypt a file, or a single value of it with `extract`.
pub fn decrypt(
    ctx: &Context,
    file: &Path,
    extract: Option<&str>,
    ignore_mac: bool,
    in_place: bool,
) -> anyhow::Result<()> {
    let (store, mut tree) = load_encrypted(file)?;
    let session = ctx.session().with_ignore_mac(ignore_mac);

    let output = match extract {
        Some(expr) => {
            let path = parse_path(expr)?;
            let value = session.extract(&mut tree, &path)?;
            emit_extracted(store.as_ref(), &value)?
        }
        None => {
            session.decrypt(&mut tree)?;
            store.emit_plain_file(&tree.branches)?
        }
    };
    write_output(file, &output, in_place)
}

/// Strings are printed as-is, branches as a document and everything else
/// in the store's value format.
fn emit_extracted(store: &dyn Store, value: &Value) -> anyhow::Result<Vec<u8>> {
    Ok(match value {
        Value::String(s) => s.clone().into_bytes(),
        Value::Branch(branch) => store.emit_plain_file(std::slice::from_ref(branch))?,
        other => store.emit_value(other)?,
    })
}
