//! # sops
//!
//! Encrypted structured documents. Every leaf value of a document is
//! encrypted on its own, so keys and structure stay readable while values are
//! protected, and the whole document is authenticated by an encrypted MAC.
//!
//! ## How It Works
//!
//! A random 256-bit data key encrypts the values with AES-256-GCM. The data
//! key itself is never stored: each configured master key (PGP, age, AWS KMS,
//! GCP KMS, Azure Key Vault, Vault transit) wraps a copy of it, and the wraps
//! live next to the document under the reserved top-level `sops` key.
//!
//! ```text
//! plaintext → Store → Tree ─┬─ escrow: data key → master keys (or Shamir shares)
//!                           └─ walk: leaf → ENC[AES256_GCM,...], MAC → metadata
//!                                         → Store → encrypted document
//! ```
//!
//! Master keys are organised in key groups. With a single group any key can
//! recover the data key. With several groups the data key is split with
//! Shamir's scheme and a threshold of groups has to cooperate.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sops::keys::{AgeKey, MasterKey};
//! use sops::keyservice::LocalKeyService;
//! use sops::metadata::Metadata;
//! use sops::stores::{JsonStore, Store};
//! use sops::Session;
//!
//! # fn main() -> sops::Result<()> {
//! let recipient = AgeKey::new("age1ql3z7hjy54pw3hyww5ayyfg7zqgvc7w3j2elw8zmrj2kg5sfn9aqmcac8p")?;
//! let session = Session::new(vec![Arc::new(LocalKeyService::new())]);
//!
//! let branches = JsonStore.load_plain_file(br#"{"password": "hunter2"}"#)?;
//! let tree = session.encrypt(branches, Metadata::new(vec![vec![MasterKey::Age(recipient)]]))?;
//! let bytes = JsonStore.emit_encrypted_file(&tree)?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`crypto`] - value cipher and the data key
//! - [`tree`] - document tree, leaf walker, MAC and nonce stash
//! - [`path`] - `["key"][0]` path expressions
//! - [`shamir`] - secret sharing over GF(2^8)
//! - [`keys`] - master key backends
//! - [`keyservice`] - the wrap/unwrap boundary, local and remote
//! - [`metadata`] - document metadata, crypt rules, key group changes
//! - [`escrow`] - wrapping and recovering the data key
//! - [`stores`] - JSON and binary formats, wire metadata
//! - [`session`] - top-level operations
//! - [`audit`] - operation events
//! - [`config`] - runtime settings
//! - [`error`] - error types

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod escrow;
pub mod keys;
pub mod keyservice;
pub mod metadata;
pub mod path;
pub mod session;
pub mod shamir;
pub mod stores;
pub mod tree;

pub use crypto::DataKey;
pub use error::{Result, SopsError};
pub use keys::{KeyType, MasterKey};
pub use keyservice::{KeyService, LocalKeyService};
pub use metadata::Metadata;
pub use session::Session;
pub use tree::{Tree, TreeBranch, Value};
