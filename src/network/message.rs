use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crawler::task::CrawlOutcome;
use crate::network::error::ProtocolError;

/// Largest payload a peer may announce in a frame header
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Size of the little-endian length prefix
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Ok,
    Join,
    Reject,
    Accept,
    StatusCheck,
    ResultsReady,
    Disconnect,
    Work,
    ConfigUpdate,
    WorkLimitUpdate,
    SendResults,
    ResultsReceived,
    FileCheck,
    FileTransfer,
    FileAccept,
    FileChunk,
    FileReject,
    FileChunkAccept,
    CrawledWorks,
}

/// Join payload: `[passwordHash, previousClientId]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest(pub Option<String>, pub Option<String>);

impl JoinRequest {
    pub fn password_hash(&self) -> Option<&str> {
        self.0.as_deref().filter(|hash| !hash.is_empty())
    }

    pub fn previous_id(&self) -> Option<&str> {
        self.1.as_deref().filter(|id| !id.is_empty())
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub payload: Value,
}

impl NetworkMessage {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Value::Null)
    }

    pub fn ok() -> Self {
        Self::empty(MessageType::Ok)
    }

    pub fn join(password_hash: Option<String>, previous_id: Option<String>) -> Self {
        let payload = serde_json::json!([password_hash, previous_id]);
        Self::new(MessageType::Join, payload)
    }

    pub fn accept(client_id: &str) -> Self {
        Self::new(MessageType::Accept, Value::String(client_id.to_string()))
    }

    pub fn reject(reason: &str) -> Self {
        Self::new(MessageType::Reject, Value::String(reason.to_string()))
    }

    pub fn work(url: &str) -> Self {
        Self::new(MessageType::Work, Value::String(url.to_string()))
    }

    pub fn disconnect() -> Self {
        Self::empty(MessageType::Disconnect)
    }

    pub fn results_ready(outcome: &CrawlOutcome) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::ResultsReady, serde_json::to_value(outcome)?))
    }

    pub fn results_received(url: &str) -> Self {
        Self::new(MessageType::ResultsReceived, Value::String(url.to_string()))
    }

    pub fn is(&self, kind: MessageType) -> bool {
        self.kind == kind
    }

    /// Payload as a plain string, if it is one
    pub fn text(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Decode the payload into a typed value
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|_| ProtocolError::UnexpectedPayload(self.kind))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(writer: &mut W, message: &NetworkMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.encode()?;
    let len = payload.len() as u64;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<NetworkMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut len_bytes).await?;

    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    NetworkMessage::decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_carry_an_eight_byte_length_prefix() {
        let message = NetworkMessage::work("https://example.com/");
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &message).await.unwrap();

        let payload_len = u64::from_le_bytes(buffer[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(payload_len as usize, buffer.len() - HEADER_SIZE);

        let mut reader = buffer.as_slice();
        let decoded = read_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, message);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn consecutive_frames_are_read_in_order() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &NetworkMessage::ok()).await.unwrap();
        write_frame(&mut buffer, &NetworkMessage::disconnect()).await.unwrap();

        let mut reader = buffer.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap().kind, MessageType::Ok);
        assert_eq!(read_frame(&mut reader).await.unwrap().kind, MessageType::Disconnect);
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let mut buffer = (MAX_FRAME_SIZE + 1).to_le_bytes().to_vec();
        buffer.extend_from_slice(b"{}");

        let mut reader = buffer.as_slice();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let mut buffer = 100u64.to_le_bytes().to_vec();
        buffer.extend_from_slice(b"{\"type\"");

        let mut reader = buffer.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn join_payload_is_a_two_element_array() {
        let message = NetworkMessage::join(Some("abc".to_string()), None);
        assert_eq!(message.payload, serde_json::json!(["abc", null]));

        let request: JoinRequest = message.payload_as().unwrap();
        assert_eq!(request.password_hash(), Some("abc"));
        assert_eq!(request.previous_id(), None);
    }

    #[test]
    fn empty_strings_in_join_count_as_absent() {
        let message = NetworkMessage::join(Some(String::new()), Some(String::new()));
        let request: JoinRequest = message.payload_as().unwrap();
        assert_eq!(request.password_hash(), None);
        assert_eq!(request.previous_id(), None);
    }

    #[test]
    fn results_payload_decodes_to_outcome() {
        let outcome = CrawlOutcome {
            url: "https://example.com/".to_string(),
            success: true,
            found_urls: vec!["https://example.com/a".to_string()],
        };
        let message = NetworkMessage::results_ready(&outcome).unwrap();
        assert_eq!(message.payload_as::<CrawlOutcome>().unwrap(), outcome);

        let wrong = NetworkMessage::work("https://example.com/");
        assert!(matches!(
            wrong.payload_as::<CrawlOutcome>(),
            Err(ProtocolError::UnexpectedPayload(MessageType::Work))
        ));
    }

    #[test]
    fn message_type_is_serialized_by_name() {
        let json = serde_json::to_string(&NetworkMessage::ok()).unwrap();
        assert_eq!(json, r#"{"type":"Ok","payload":null}"#);
    }
}
