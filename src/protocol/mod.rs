//! Object-store wire messages
//!
//! Request/response schema spoken by the object-store service built on top
//! of the allocator: object put/get/remove, replica listings, and segment
//! mount bookkeeping. The allocator core never parses or emits these
//! messages; they define the boundary the surrounding service programs
//! against.
//!
//! Every response carries a `status_code` whose meaning is defined by the
//! service.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// State of one registered buffer within a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufStatus {
    Init,
    Complete,
    Failed,
    Unregistered,
}

/// State of one object replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Undefined,
    Initialized,
    Processing,
    Complete,
    Removed,
    Failed,
}

/// A buffer registered in a mounted segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufHandle {
    pub segment_name: String,
    pub size: u64,
    /// Address of the buffer within the segment, as seen by the service
    pub buffer: u64,
    pub status: BufStatus,
}

/// The buffers making up one replica of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub handles: Vec<BufHandle>,
    pub status: ReplicaStatus,
}

/// Replication settings for a put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateConfig {
    pub replica_num: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistKeyRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistKeyResponse {
    pub status_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReplicaListRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReplicaListResponse {
    pub status_code: i32,
    pub replica_list: Vec<ReplicaInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStartRequest {
    pub key: String,
    pub value_length: u64,
    pub config: ReplicateConfig,
    pub slice_lengths: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStartResponse {
    pub status_code: i32,
    pub replica_list: Vec<ReplicaInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEndRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEndResponse {
    pub status_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRevokeRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRevokeResponse {
    pub status_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub status_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSegmentRequest {
    pub buffer: u64,
    pub size: u64,
    pub segment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSegmentResponse {
    pub status_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountSegmentRequest {
    pub segment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountSegmentResponse {
    pub status_code: i32,
}

/// Serialize a message to its wire bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message)
        .map_err(|e| Error::SerializationError(format!("failed to encode message: {}", e)))
}

/// Deserialize a message from its wire bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::SerializationError(format!("failed to decode message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_start_roundtrip() -> Result<()> {
        let request = PutStartRequest {
            key: "object-1".to_string(),
            value_length: 4096,
            config: ReplicateConfig { replica_num: 2 },
            slice_lengths: vec![2048, 2048],
        };

        let bytes = encode(&request)?;
        let decoded: PutStartRequest = decode(&bytes)?;
        assert_eq!(decoded, request);
        Ok(())
    }

    #[test]
    fn test_replica_list_response() -> Result<()> {
        let response = GetReplicaListResponse {
            status_code: 0,
            replica_list: vec![ReplicaInfo {
                handles: vec![BufHandle {
                    segment_name: "segment-a".to_string(),
                    size: 1 << 20,
                    buffer: 0x7f00_0000,
                    status: BufStatus::Complete,
                }],
                status: ReplicaStatus::Complete,
            }],
        };

        let bytes = encode(&response)?;
        let decoded: GetReplicaListResponse = decode(&bytes)?;
        assert_eq!(decoded.replica_list.len(), 1);
        assert_eq!(decoded.replica_list[0].handles[0].status, BufStatus::Complete);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_malformed_bytes() {
        let result: Result<RemoveRequest> = decode(b"not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_mount_segment_fields() -> Result<()> {
        let request = MountSegmentRequest {
            buffer: 0xdead_beef,
            size: 64 << 20,
            segment_name: "node-3/segment-0".to_string(),
        };
        let json = String::from_utf8(encode(&request)?).unwrap();
        assert!(json.contains("\"segment_name\""));
        assert!(json.contains("\"buffer\""));
        Ok(())
    }
}
