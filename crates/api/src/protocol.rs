//! Ferry wire protocol types.
//!
//! Chunk request/response correlation only requires: a content identifier,
//! a byte offset, a byte length, a small integer slot index, an end-of-data
//! flag, and a return-address descriptor for responses. No further wire
//! format is fixed by this core.

use crate::*;
use bytes::{Bytes, BytesMut};
use prost::Message;

/// Framing envelope routing a message to a named module handler
/// registered on the receiving pipe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PipeEnvelope {
    /// The module handler this message is addressed to.
    #[prost(string, tag = "1")]
    pub module: ::prost::alloc::string::String,

    /// The module-specific payload.
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

/// Discriminates chunk protocol messages.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ChunkMessageType {
    /// Unset message type.
    Unspecified = 0,
    /// A chunk request.
    Request = 1,
    /// A chunk response.
    Response = 2,
}

/// Top-level chunk protocol message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkMessage {
    /// The type of the enclosed message.
    #[prost(enumeration = "ChunkMessageType", tag = "1")]
    pub chunk_message_type: i32,

    /// The encoded [ChunkRequest] or [ChunkResponse].
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

/// A request for one byte range of a piece of content.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkRequest {
    /// The content the range is requested from.
    #[prost(bytes = "bytes", tag = "1")]
    pub content_id: Bytes,

    /// Starting byte offset of the requested range.
    #[prost(uint64, tag = "2")]
    pub offset: u64,

    /// Number of bytes requested.
    #[prost(uint32, tag = "3")]
    pub length: u32,

    /// The requester's slot index, doubling as the correlation id.
    #[prost(uint32, tag = "4")]
    pub slot: u32,

    /// Url of the pipe the response should be sent to.
    #[prost(string, tag = "5")]
    pub respond_to_url: ::prost::alloc::string::String,

    /// Module name of the requester's response inbox.
    #[prost(string, tag = "6")]
    pub respond_to_module: ::prost::alloc::string::String,
}

/// A response carrying one byte range of a piece of content.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkResponse {
    /// The content the range belongs to.
    #[prost(bytes = "bytes", tag = "1")]
    pub content_id: Bytes,

    /// Starting byte offset of the carried range.
    #[prost(uint64, tag = "2")]
    pub offset: u64,

    /// Declared number of bytes carried. Must equal `data.len()`.
    #[prost(uint32, tag = "3")]
    pub length: u32,

    /// The requester's slot index, echoed for correlation.
    #[prost(uint32, tag = "4")]
    pub slot: u32,

    /// True if the end of the content lies at `offset + length`.
    #[prost(bool, tag = "5")]
    pub eof: bool,

    /// The carried bytes.
    #[prost(bytes = "bytes", tag = "6")]
    pub data: Bytes,
}

/// Serialize a chunk request to a chunk protocol message.
pub fn serialize_request_message(value: ChunkRequest) -> Bytes {
    let mut data = BytesMut::new();
    value.encode(&mut data).expect("failed to encode request");
    let mut out = BytesMut::new();
    ChunkMessage {
        chunk_message_type: ChunkMessageType::Request.into(),
        data: data.freeze(),
    }
    .encode(&mut out)
    .expect("failed to encode chunk request message");
    out.freeze()
}

/// Serialize a chunk response to a chunk protocol message.
pub fn serialize_response_message(value: ChunkResponse) -> Bytes {
    let mut data = BytesMut::new();
    value.encode(&mut data).expect("failed to encode response");
    let mut out = BytesMut::new();
    ChunkMessage {
        chunk_message_type: ChunkMessageType::Response.into(),
        data: data.freeze(),
    }
    .encode(&mut out)
    .expect("failed to encode chunk response message");
    out.freeze()
}

/// Serialize a module payload into a pipe envelope frame.
pub fn serialize_envelope(module: String, data: Bytes) -> Bytes {
    let mut out = BytesMut::new();
    PipeEnvelope { module, data }
        .encode(&mut out)
        .expect("failed to encode pipe envelope");
    out.freeze()
}

impl ChunkRequest {
    /// The content id carried by this request.
    pub fn content_id(&self) -> ContentId {
        ContentId::from(self.content_id.clone())
    }
}

impl ChunkResponse {
    /// The content id carried by this response.
    pub fn content_id(&self) -> ContentId {
        ContentId::from(self.content_id.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn happy_request_encode_decode() {
        let request = ChunkRequest {
            content_id: Bytes::from_static(b"some_content_id"),
            offset: 150_000,
            length: 50_000,
            slot: 2,
            respond_to_url: "ws://a.b:80/1".into(),
            respond_to_module: "ChunkResp/abc".into(),
        };

        let enc = serialize_request_message(request.clone());
        let msg = ChunkMessage::decode(enc).unwrap();
        assert_eq!(
            i32::from(ChunkMessageType::Request),
            msg.chunk_message_type,
        );
        let dec = ChunkRequest::decode(msg.data).unwrap();
        assert_eq!(request, dec);
    }

    #[test]
    fn happy_response_encode_decode() {
        let response = ChunkResponse {
            content_id: Bytes::from_static(b"some_content_id"),
            offset: 150_000,
            length: 5,
            slot: 2,
            eof: true,
            data: Bytes::from_static(b"hello"),
        };

        let enc = serialize_response_message(response.clone());
        let msg = ChunkMessage::decode(enc).unwrap();
        assert_eq!(
            i32::from(ChunkMessageType::Response),
            msg.chunk_message_type,
        );
        let dec = ChunkResponse::decode(msg.data).unwrap();
        assert_eq!(response, dec);
    }

    #[test]
    fn envelope_encode_decode() {
        let enc = serialize_envelope(
            "ChunkReq".into(),
            Bytes::from_static(b"payload"),
        );
        let dec = PipeEnvelope::decode(enc).unwrap();
        assert_eq!("ChunkReq", dec.module);
        assert_eq!(Bytes::from_static(b"payload"), dec.data);
    }

    #[test]
    fn garbage_does_not_decode() {
        ChunkMessage::decode(Bytes::from_static(
            b"this is not a chunk message",
        ))
        .unwrap_err();
    }
}
