use super::{read_file, write_output, Context, KeyArgs, RuleArgs};
use anyhow::{bail, Context as _};
use sops::metadata::Metadata;
use sops::stores::store_for_path;
use std::path::Path;

/// Encrypt a plaintext file for the keys given on the command line.
pub fn encrypt(
    ctx: &Context,
    file: &Path,
    keys: &KeyArgs,
    rules: &RuleArgs,
    threshold: usize,
    in_place: bool,
) -> anyhow::Result<()> {
    let master_keys = keys.master_keys()?;
    if master_keys.is_empty() {
        bail!(
            "no master keys given; use --age, --pgp, --kms, --gcp-kms, --azure-kv \
             or --hc-vault-transit"
        );
    }

    let store = store_for_path(file);
    let branches = store
        .load_plain_file(&read_file(file)?)
        .with_context(|| format!("loading plaintext file {}", file.display()))?;

    let mut metadata = Metadata::new(vec![master_keys])
        .with_threshold(threshold)
        .with_crypt_rule(rules.crypt_rule()?);
    metadata.mac_only_encrypted = rules.mac_only_encrypted;

    let mut tree = ctx.session().encrypt(branches, metadata)?;
    tree.file_path = Some(file.to_path_buf());
    let output = store.emit_encrypted_file(&tree)?;
    write_output(file, &output, in_place)
}
