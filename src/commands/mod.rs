mod decrypt;
mod edit;
mod encrypt;
mod groups;
mod rotate;

pub use decrypt::decrypt;
pub use edit::{set, unset};
pub use encrypt::encrypt;
pub use groups::{add_group, delete_group};
pub use rotate::rotate;

use anyhow::Context as _;
use clap::Args;
use sops::audit::TracingAuditor;
use sops::config::Settings;
use sops::keys::cloud::parse_encryption_context;
use sops::keys::{AgeKey, AzureKvKey, GcpKmsKey, KmsKey, MasterKey, PgpKey, VaultKey};
use sops::keyservice::timeout::TimeoutKeyService;
use sops::keyservice::{KeyService, LocalKeyService, TerminalPrompter};
use sops::metadata::CryptRule;
use sops::stores::{store_for_path, Store};
use sops::{Session, Tree};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Settings and key services shared by every command.
pub struct Context {
    pub settings: Settings,
    services: Vec<Arc<dyn KeyService>>,
}

impl Context {
    pub fn load(config: Option<&Path>) -> anyhow::Result<Self> {
        let settings = Settings::load(config)?;

        let mut local = LocalKeyService::new();
        if let Some(key_file) = &settings.age.key_file {
            if key_file.exists() {
                let identities = fs::read_to_string(key_file)
                    .with_context(|| format!("reading age key file {}", key_file.display()))?;
                local = local.with_age_identity(identities);
            }
        }
        if settings.keyservice.prompt {
            local = local.with_prompter(Arc::new(TerminalPrompter));
        }

        let local: Arc<dyn KeyService> = Arc::new(local);
        let service: Arc<dyn KeyService> = match settings.keyservice.timeout() {
            Some(timeout) => Arc::new(TimeoutKeyService::new(local, timeout)),
            None => local,
        };

        Ok(Self {
            settings,
            services: vec![service],
        })
    }

    pub fn session(&self) -> Session {
        Session::from_settings(&self.settings, self.services.clone())
            .with_auditor(Arc::new(TracingAuditor))
    }
}

/// Master keys given on the command line. Each flag takes a comma
/// separated list.
#[derive(Args, Debug, Default)]
pub struct KeyArgs {
    /// age recipients
    #[arg(long, value_delimiter = ',')]
    pub age: Vec<String>,

    /// PGP fingerprints
    #[arg(long, value_delimiter = ',')]
    pub pgp: Vec<String>,

    /// AWS KMS key ARNs, optionally followed by +ROLE_ARN
    #[arg(long, value_delimiter = ',')]
    pub kms: Vec<String>,

    /// GCP KMS resource ids
    #[arg(long, value_delimiter = ',')]
    pub gcp_kms: Vec<String>,

    /// Azure Key Vault key URLs
    #[arg(long, value_delimiter = ',')]
    pub azure_kv: Vec<String>,

    /// Vault transit key URIs
    #[arg(long, value_delimiter = ',')]
    pub hc_vault_transit: Vec<String>,

    /// KMS encryption context, key:value pairs separated by commas
    #[arg(long)]
    pub encryption_context: Option<String>,

    /// AWS profile used with the KMS keys
    #[arg(long, default_value = "")]
    pub aws_profile: String,
}

impl KeyArgs {
    pub fn master_keys(&self) -> anyhow::Result<Vec<MasterKey>> {
        build_keys(
            KeyLists {
                age: &self.age,
                pgp: &self.pgp,
                kms: &self.kms,
                gcp_kms: &self.gcp_kms,
                azure_kv: &self.azure_kv,
                hc_vault: &self.hc_vault_transit,
            },
            self.encryption_context.as_deref(),
            &self.aws_profile,
        )
    }
}

/// Keys to add to or remove from a document while rotating.
#[derive(Args, Debug, Default)]
pub struct RotateKeyArgs {
    #[arg(long, value_delimiter = ',')]
    pub add_age: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub rm_age: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub add_pgp: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub rm_pgp: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub add_kms: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub rm_kms: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub add_gcp_kms: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub rm_gcp_kms: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub add_azure_kv: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub rm_azure_kv: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub add_hc_vault_transit: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub rm_hc_vault_transit: Vec<String>,

    /// KMS encryption context for added KMS keys
    #[arg(long)]
    pub encryption_context: Option<String>,

    #[arg(long, default_value = "")]
    pub aws_profile: String,
}

impl RotateKeyArgs {
    pub fn added(&self) -> anyhow::Result<Vec<MasterKey>> {
        build_keys(
            KeyLists {
                age: &self.add_age,
                pgp: &self.add_pgp,
                kms: &self.add_kms,
                gcp_kms: &self.add_gcp_kms,
                azure_kv: &self.add_azure_kv,
                hc_vault: &self.add_hc_vault_transit,
            },
            self.encryption_context.as_deref(),
            &self.aws_profile,
        )
    }

    pub fn removed(&self) -> anyhow::Result<Vec<MasterKey>> {
        build_keys(
            KeyLists {
                age: &self.rm_age,
                pgp: &self.rm_pgp,
                kms: &self.rm_kms,
                gcp_kms: &self.rm_gcp_kms,
                azure_kv: &self.rm_azure_kv,
                hc_vault: &self.rm_hc_vault_transit,
            },
            None,
            &self.aws_profile,
        )
    }
}

/// Which values get encrypted. At most one flag may be given.
#[derive(Args, Debug, Default)]
pub struct RuleArgs {
    #[arg(long, group = "crypt_rule")]
    pub unencrypted_suffix: Option<String>,
    #[arg(long, group = "crypt_rule")]
    pub encrypted_suffix: Option<String>,
    #[arg(long, group = "crypt_rule")]
    pub unencrypted_regex: Option<String>,
    #[arg(long, group = "crypt_rule")]
    pub encrypted_regex: Option<String>,

    /// Only encrypted values contribute to the MAC
    #[arg(long)]
    pub mac_only_encrypted: bool,
}

impl RuleArgs {
    pub fn crypt_rule(&self) -> anyhow::Result<CryptRule> {
        Ok(CryptRule::from_options(
            self.unencrypted_suffix.as_deref(),
            self.encrypted_suffix.as_deref(),
            self.unencrypted_regex.as_deref(),
            self.encrypted_regex.as_deref(),
        )?)
    }
}

struct KeyLists<'a> {
    age: &'a [String],
    pgp: &'a [String],
    kms: &'a [String],
    gcp_kms: &'a [String],
    azure_kv: &'a [String],
    hc_vault: &'a [String],
}

fn build_keys(
    lists: KeyLists<'_>,
    encryption_context: Option<&str>,
    aws_profile: &str,
) -> anyhow::Result<Vec<MasterKey>> {
    let context = match encryption_context {
        Some(raw) => parse_encryption_context(raw)?,
        None => Default::default(),
    };

    let mut keys = Vec::new();
    for arn in lists.kms.iter().filter(|s| !s.trim().is_empty()) {
        keys.push(MasterKey::Kms(KmsKey::new(arn, context.clone(), aws_profile)));
    }
    for id in lists.gcp_kms.iter().filter(|s| !s.trim().is_empty()) {
        keys.push(MasterKey::GcpKms(GcpKmsKey::new(id.trim())));
    }
    for url in lists.azure_kv.iter().filter(|s| !s.trim().is_empty()) {
        keys.push(MasterKey::AzureKv(AzureKvKey::from_url(url.trim())?));
    }
    for uri in lists.hc_vault.iter().filter(|s| !s.trim().is_empty()) {
        keys.push(MasterKey::HcVault(VaultKey::from_uri(uri.trim())?));
    }
    for fp in lists.pgp.iter().filter(|s| !s.trim().is_empty()) {
        keys.push(MasterKey::Pgp(PgpKey::new(fp)));
    }
    for recipient in lists.age.iter().filter(|s| !s.trim().is_empty()) {
        keys.push(MasterKey::Age(AgeKey::new(recipient)?));
    }
    Ok(keys)
}

pub fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Load an encrypted document with the store matching its extension.
pub fn load_encrypted(path: &Path) -> anyhow::Result<(Box<dyn Store>, Tree)> {
    let store = store_for_path(path);
    let mut tree = store
        .load_encrypted_file(&read_file(path)?)
        .with_context(|| format!("loading encrypted file {}", path.display()))?;
    tree.file_path = Some(path.to_path_buf());
    Ok((store, tree))
}

/// Write `bytes` back to `path` when `in_place`, otherwise to stdout.
pub fn write_output(path: &Path, bytes: &[u8], in_place: bool) -> anyhow::Result<()> {
    if in_place {
        fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(file = %path.display(), "file written");
    } else {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()?;
    }
    Ok(())
}
