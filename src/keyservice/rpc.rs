//! Transport-agnostic key service protocol.
//!
//! Requests and responses are JSON documents. A [`KeyServiceServer`] answers
//! them with any [`KeyService`]; a [`RemoteKeyService`] sends them through a
//! [`Transport`] and turns error statuses back into typed errors, so a
//! remote service is interchangeable with a local one.

use super::{KeyDescriptor, KeyService};
use crate::error::{Result, SopsError};
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptRequest {
    pub key: KeyDescriptor,
    #[serde(with = "b64")]
    pub plaintext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptRequest {
    pub key: KeyDescriptor,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Encrypt(EncryptRequest),
    Decrypt(DecryptRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Error {
        code: Code,
        message: String,
    },
}

impl Response {
    fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(data) => Response::Ok { data },
            Err(err) => {
                let code = match &err {
                    SopsError::PermissionDenied(_) => Code::PermissionDenied,
                    SopsError::UnsupportedKeyType(_) => Code::NotFound,
                    SopsError::Timeout(_) => Code::DeadlineExceeded,
                    _ => Code::Internal,
                };
                Response::Error {
                    code,
                    message: err.to_string(),
                }
            }
        }
    }

    fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Response::Ok { data } => Ok(data),
            Response::Error { code, message } => Err(match code {
                Code::PermissionDenied => SopsError::PermissionDenied(message),
                Code::NotFound => SopsError::UnsupportedKeyType(message),
                _ => SopsError::KeyService(message),
            }),
        }
    }
}

/// Answers encoded requests with a wrapped service.
pub struct KeyServiceServer {
    service: Arc<dyn KeyService>,
}

impl KeyServiceServer {
    pub fn new(service: Arc<dyn KeyService>) -> Self {
        Self { service }
    }

    pub fn handle(&self, request: Request) -> Response {
        let result = match &request {
            Request::Encrypt(req) => self.service.encrypt(&req.key, &req.plaintext),
            Request::Decrypt(req) => self.service.decrypt(&req.key, &req.ciphertext),
        };
        if let Err(err) = &result {
            tracing::warn!(%err, "key service request failed");
        }
        Response::from_result(result)
    }

    /// Decode a request, answer it and encode the response.
    pub fn handle_bytes(&self, request: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<Request>(request) {
            Ok(request) => self.handle(request),
            Err(err) => Response::Error {
                code: Code::InvalidArgument,
                message: format!("malformed request: {err}"),
            },
        };
        match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(%err, "failed to encode key service response");
                ENCODE_FAILURE.to_vec()
            }
        }
    }
}

/// Sent in place of a response that could not be encoded.
const ENCODE_FAILURE: &[u8] =
    br#"{"status":"error","code":"internal","message":"failed to encode response"}"#;

/// Carries an encoded request to a server and returns the encoded response.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Calls a server in the same process.
pub struct LoopbackTransport {
    server: Arc<KeyServiceServer>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<KeyServiceServer>) -> Self {
        Self { server }
    }
}

impl Transport for LoopbackTransport {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>> {
        Ok(self.server.handle_bytes(request))
    }
}

/// A [`KeyService`] backed by a remote server.
pub struct RemoteKeyService {
    transport: Box<dyn Transport>,
}

impl RemoteKeyService {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    fn call(&self, request: Request) -> Result<Vec<u8>> {
        let encoded = serde_json::to_vec(&request)?;
        let raw = self
            .transport
            .round_trip(&encoded)
            .map_err(|e| SopsError::KeyService(format!("transport failure: {e}")))?;
        let response: Response = serde_json::from_slice(&raw)
            .map_err(|e| SopsError::KeyService(format!("malformed response: {e}")))?;
        response.into_result()
    }
}

impl KeyService for RemoteKeyService {
    fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.call(Request::Encrypt(EncryptRequest {
            key: key.clone(),
            plaintext: plaintext.to_vec(),
        }))
    }

    fn decrypt(&self, key: &KeyDescriptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.call(Request::Decrypt(DecryptRequest {
            key: key.clone(),
            ciphertext: ciphertext.to_vec(),
        }))
    }
}

mod b64 {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::cloud::KmsClient;
    use crate::keys::KeyType;
    use crate::keyservice::testing::ScriptedKeyService;
    use crate::keyservice::{LocalKeyService, Prompter};

    struct Deny;

    impl Prompter for Deny {
        fn approve(&self, _operation: &str, _key: &KeyDescriptor) -> bool {
            false
        }
    }

    struct Reverse;

    impl KmsClient for Reverse {
        fn encrypt(&self, _key: &KeyDescriptor, plaintext: &[u8]) -> Result<String> {
            Ok(hex::encode(plaintext.iter().rev().copied().collect::<Vec<_>>()))
        }

        fn decrypt(&self, _key: &KeyDescriptor, ciphertext: &str) -> Result<Vec<u8>> {
            let mut bytes =
                hex::decode(ciphertext).map_err(|e| SopsError::KeyService(e.to_string()))?;
            bytes.reverse();
            Ok(bytes)
        }
    }

    fn remote(service: Arc<dyn KeyService>) -> RemoteKeyService {
        let server = Arc::new(KeyServiceServer::new(service));
        RemoteKeyService::new(Box::new(LoopbackTransport::new(server)))
    }

    fn kms_key() -> KeyDescriptor {
        KeyDescriptor::Kms {
            arn: "arn:aws:kms:us-east-1:1:key/k".into(),
            role: String::new(),
            context: Default::default(),
            aws_profile: String::new(),
        }
    }

    #[test]
    fn test_remote_matches_local() {
        let local: Arc<dyn KeyService> =
            Arc::new(LocalKeyService::new().with_kms_client(KeyType::Kms, Arc::new(Reverse)));
        let remote = remote(local.clone());

        let via_local = local.encrypt(&kms_key(), b"abc").unwrap();
        let via_remote = remote.encrypt(&kms_key(), b"abc").unwrap();
        assert_eq!(via_local, via_remote);
        assert_eq!(remote.decrypt(&kms_key(), &via_local).unwrap(), b"abc");
    }

    #[test]
    fn test_permission_denied_survives_the_wire() {
        let local = Arc::new(
            LocalKeyService::new()
                .with_kms_client(KeyType::Kms, Arc::new(Reverse))
                .with_prompter(Arc::new(Deny)),
        );
        let err = remote(local).encrypt(&kms_key(), b"abc").unwrap_err();
        assert!(matches!(err, SopsError::PermissionDenied(_)));
    }

    #[test]
    fn test_unknown_backend_maps_to_not_found() {
        let err = remote(Arc::new(LocalKeyService::new()))
            .decrypt(&kms_key(), b"00")
            .unwrap_err();
        assert!(matches!(err, SopsError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_internal_errors_become_key_service_errors() {
        let err = remote(Arc::new(ScriptedKeyService::failing(&["arn:aws:kms:us-east-1:1:key/k"])))
            .encrypt(&kms_key(), b"abc")
            .unwrap_err();
        assert!(matches!(err, SopsError::KeyService(m) if m.contains("scripted failure")));
    }

    #[test]
    fn test_malformed_request_is_invalid_argument() {
        let server = KeyServiceServer::new(Arc::new(ScriptedKeyService::new()));
        let raw = server.handle_bytes(b"{not json");
        let response: Response = serde_json::from_slice(&raw).unwrap();
        assert!(matches!(
            response,
            Response::Error {
                code: Code::InvalidArgument,
                ..
            }
        ));
    }

    #[test]
    fn test_encode_failure_frame_is_an_internal_error() {
        let response: Response = serde_json::from_slice(ENCODE_FAILURE).unwrap();
        assert_eq!(
            response,
            Response::Error {
                code: Code::Internal,
                message: "failed to encode response".into(),
            }
        );
    }

    #[test]
    fn test_request_encoding_is_tagged() {
        let encoded = serde_json::to_value(Request::Encrypt(EncryptRequest {
            key: KeyDescriptor::Age {
                recipient: "age1x".into(),
            },
            plaintext: b"hi".to_vec(),
        }))
        .unwrap();
        assert_eq!(encoded["method"], "encrypt");
        assert_eq!(encoded["plaintext"], "aGk=");
        assert_eq!(encoded["key"]["type"], "age");
    }
}
