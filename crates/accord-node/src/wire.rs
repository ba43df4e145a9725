//! Newline-delimited JSON frames exchanged between nodes.
//!
//! ```text
//! {"type":"request","id":7,"kind":"get_core","body":{}}
//! {"type":"response","id":7,"body":{...}}
//! {"type":"error","id":7,"message":"unknown kind"}
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use accord_catchup::NodeId;
use accord_identity::canonical_bytes;
use accord_subjectivity::{now_millis, NodeIdentity};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

pub const HELLO: &str = "hello";
pub const NOTIFY: &str = "notify";
pub const GET_NEIGHBORS: &str = "get_neighbors";

/// Largest accepted clock difference on a hello.
pub const HELLO_MAX_SKEW: Duration = Duration::from_secs(10 * 60);

/// Longest accepted frame line, newline included.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        kind: String,
        body: serde_json::Value,
    },
    Response {
        id: u64,
        body: serde_json::Value,
    },
    Error {
        id: u64,
        message: String,
    },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Frame::Request { id, .. } | Frame::Response { id, .. } | Frame::Error { id, .. } => *id,
        }
    }

    /// One line of JSON, newline included.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Read one frame line into `line`. Returns `false` at end of stream.
///
/// Never buffers more than [`MAX_FRAME_BYTES`]; a longer line is a
/// protocol error.
pub async fn read_frame_line<R>(reader: &mut R, line: &mut String) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader)
        .take(MAX_FRAME_BYTES as u64)
        .read_line(line)
        .await?;
    if read == 0 {
        return Ok(false);
    }
    if read >= MAX_FRAME_BYTES && !line.ends_with('\n') {
        return Err(Error::Protocol(format!(
            "frame longer than {MAX_FRAME_BYTES} bytes"
        )));
    }
    Ok(true)
}

/// Signed self-introduction. The signature covers the canonical encoding
/// of the whole identity followed by the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub identity: NodeIdentity,
    /// Unix millis.
    pub timestamp: u64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

fn signed_message(identity: &NodeIdentity, timestamp: u64) -> Result<Vec<u8>> {
    Ok(canonical_bytes(&(identity, timestamp))?)
}

impl Hello {
    pub fn sign(identity: NodeIdentity, key: &SigningKey) -> Result<Self> {
        Self::sign_at(identity, key, now_millis())
    }

    pub fn sign_at(identity: NodeIdentity, key: &SigningKey, timestamp: u64) -> Result<Self> {
        let signature = key.sign(&signed_message(&identity, timestamp)?);
        Ok(Self {
            identity,
            timestamp,
            signature: signature.to_bytes().to_vec(),
        })
    }

    /// Check the key binds to the node id, the signature and the timestamp.
    pub fn verify(&self, now: u64) -> Result<()> {
        let identity = &self.identity;
        if identity.node != NodeId::from_public_key(&identity.public_key) {
            return Err(Error::Protocol("hello node id does not match key".into()));
        }
        if now.abs_diff(self.timestamp) > HELLO_MAX_SKEW.as_millis() as u64 {
            return Err(Error::Protocol("hello timestamp outside allowed skew".into()));
        }
        let key = VerifyingKey::from_bytes(&identity.public_key)
            .map_err(|e| Error::Protocol(format!("bad hello key: {e}")))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| Error::Protocol(format!("bad hello signature: {e}")))?;
        key.verify(&signed_message(identity, self.timestamp)?, &signature)
            .map_err(|_| Error::Protocol("hello signature does not verify".into()))
    }
}

/// Reply to a hello: the responder's own hello plus how it saw the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAck {
    pub hello: Hello,
    pub observed_addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_identity::Id;

    fn identity(key: &SigningKey) -> NodeIdentity {
        let public_key = key.verifying_key().to_bytes();
        NodeIdentity {
            node: NodeId::from_public_key(&public_key),
            public_key,
            node_number: 1,
            administrator: Id(0),
            addr: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    #[test]
    fn test_frame_json_shape() {
        let frame = Frame::Request {
            id: 7,
            kind: "get_core".into(),
            body: serde_json::json!({}),
        };
        let line = frame.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["kind"], "get_core");
        assert_eq!(frame.id(), 7);

        let parsed: Frame =
            serde_json::from_str(r#"{"type":"error","id":3,"message":"nope"}"#).unwrap();
        assert_eq!(
            parsed,
            Frame::Error {
                id: 3,
                message: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn test_read_frame_line_limits_length() {
        let input = b"{\"a\":1}\n{\"b\":2}\n".to_vec();
        let mut reader = tokio::io::BufReader::new(&input[..]);
        let mut line = String::new();
        assert!(read_frame_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, "{\"a\":1}\n");
        assert!(read_frame_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, "{\"b\":2}\n");
        assert!(!read_frame_line(&mut reader, &mut line).await.unwrap());

        let huge = vec![b'a'; MAX_FRAME_BYTES + 10];
        let mut reader = tokio::io::BufReader::new(&huge[..]);
        let outcome = read_frame_line(&mut reader, &mut line).await;
        assert!(matches!(outcome, Err(Error::Protocol(_))));
        assert_eq!(line.len(), MAX_FRAME_BYTES);
    }

    #[test]
    fn test_hello_verifies() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let hello = Hello::sign_at(identity(&key), &key, 1_000_000).unwrap();
        hello.verify(1_000_500).unwrap();
    }

    #[test]
    fn test_hello_rejects_tampering() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let other = SigningKey::from_bytes(&[10; 32]);

        let mut hello = Hello::sign_at(identity(&key), &key, 1_000_000).unwrap();
        hello.timestamp += 1;
        assert!(hello.verify(1_000_000).is_err());

        // Signed by a different key than the one claimed.
        let forged = Hello::sign_at(identity(&key), &other, 1_000_000).unwrap();
        assert!(forged.verify(1_000_000).is_err());

        // Key swapped without updating the node id.
        let mut swapped = Hello::sign_at(identity(&key), &key, 1_000_000).unwrap();
        swapped.identity.public_key = other.verifying_key().to_bytes();
        assert!(swapped.verify(1_000_000).is_err());
    }

    #[test]
    fn test_hello_covers_whole_identity() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let hello = Hello::sign_at(identity(&key), &key, 1_000_000).unwrap();

        let mut admin = hello.clone();
        admin.identity.administrator = Id(42);
        assert!(admin.verify(1_000_000).is_err());

        let mut moved = hello.clone();
        moved.identity.addr = "10.1.2.3:9000".parse().unwrap();
        assert!(moved.verify(1_000_000).is_err());

        let mut renumbered = hello.clone();
        renumbered.identity.node_number = 2;
        assert!(renumbered.verify(1_000_000).is_err());

        hello.verify(1_000_000).unwrap();
    }

    #[test]
    fn test_hello_rejects_stale_timestamp() {
        let key = SigningKey::from_bytes(&[9; 32]);
        let hello = Hello::sign_at(identity(&key), &key, 0).unwrap();
        let later = HELLO_MAX_SKEW.as_millis() as u64 + 1;
        assert!(hello.verify(later).is_err());
    }
}
