use super::{JsonStore, Store};
use crate::error::{Result, SopsError};
use crate::tree::{Tree, TreeBranch, TreeItem, Value};

/// Key holding the file contents inside the document.
pub const DATA_KEY: &str = "data";

/// Opaque files: the whole content is one leaf under `data`, and the
/// encrypted document is stored as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryStore;

impl Store for BinaryStore {
    fn load_plain_file(&self, input: &[u8]) -> Result<Vec<TreeBranch>> {
        let value = match std::str::from_utf8(input) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::Bytes(input.to_vec()),
        };
        Ok(vec![TreeBranch::from(vec![TreeItem::new(DATA_KEY, value)])])
    }

    fn load_encrypted_file(&self, input: &[u8]) -> Result<Tree> {
        JsonStore.load_encrypted_file(input)
    }

    fn emit_plain_file(&self, branches: &[TreeBranch]) -> Result<Vec<u8>> {
        match branches.first().and_then(|branch| branch.get(DATA_KEY)) {
            Some(Value::String(text)) => Ok(text.clone().into_bytes()),
            Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
            Some(other) => Err(SopsError::Format(format!(
                "binary data must be a string, found {}",
                other.kind()
            ))),
            None => Err(SopsError::Format(
                "no binary data found in tree; this is likely not an encrypted binary file".into(),
            )),
        }
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>> {
        JsonStore.emit_encrypted_file(tree)
    }

    fn emit_value(&self, _value: &Value) -> Result<Vec<u8>> {
        Err(SopsError::Format(
            "binary files are not structured and extracting a single value is not possible".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_raw_bytes_round_trip() {
        for input in [b"hello\nworld\n".to_vec(), vec![0xff, 0x00, 0xfe]] {
            let branches = BinaryStore.load_plain_file(&input).unwrap();
            assert_eq!(branches[0].len(), 1);
            assert_eq!(BinaryStore.emit_plain_file(&branches).unwrap(), input);
        }
    }

    #[test]
    fn test_emit_without_data_fails() {
        let branches = vec![TreeBranch::from(vec![TreeItem::new("other", "x".into())])];
        assert!(matches!(
            BinaryStore.emit_plain_file(&branches),
            Err(SopsError::Format(_))
        ));
        assert!(BinaryStore.emit_value(&Value::Int(1)).is_err());
    }
}
