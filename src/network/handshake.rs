use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::network::error::HandshakeError;
use crate::network::handler::MessageHandler;
use crate::network::message::{JoinRequest, MessageType, NetworkMessage};

pub const CLIENT_ID_LENGTH: usize = 12;

/// SHA-256 hex digest of a password, the only form that crosses the wire
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Random alphanumeric client id
pub fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Client side: Join, wait for Accept, acknowledge with OK.
///
/// The handler must already be started. Returns the id assigned by the host.
pub async fn join_host(
    handler: &Arc<MessageHandler>,
    password: Option<&str>,
    previous_id: Option<&str>,
    timeout: Duration,
) -> Result<String, HandshakeError> {
    let join = NetworkMessage::join(password.map(hash_password), previous_id.map(str::to_string));
    let response = handler.request(&join, timeout).await?;

    match response.kind {
        MessageType::Accept => {}
        MessageType::Reject => {
            let reason = response.text().unwrap_or("no reason given").to_string();
            return Err(HandshakeError::Rejected(reason));
        }
        other => return Err(HandshakeError::Rejected(format!("unexpected {:?} response", other))),
    }

    let client_id = response
        .text()
        .filter(|id| !id.is_empty())
        .ok_or(HandshakeError::MissingClientId)?
        .to_string();

    handler.send(&NetworkMessage::ok()).await?;
    debug!("Joined {} as {}", handler.peer(), client_id);

    Ok(client_id)
}

/// Result of a successful server-side handshake
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedClient {
    pub client_id: String,
    pub resumed: bool,
}

/// Server side: wait for Join, authenticate, resolve the client id, send
/// Accept and wait for OK.
///
/// The handler must not be started yet; the response slot is armed first so
/// the Join cannot slip past. On error the caller should send a Reject and
/// close the connection.
pub async fn accept_client<R, E>(
    handler: &Arc<MessageHandler>,
    password_hash: Option<&str>,
    timeout: Duration,
    can_resume: R,
    exists: E,
) -> Result<AcceptedClient, HandshakeError>
where
    R: Fn(&str) -> bool,
    E: Fn(&str) -> bool,
{
    let pending = handler.expect_response()?;
    handler.start();

    let join = pending.wait(timeout).await?;
    if !join.is(MessageType::Join) {
        return Err(HandshakeError::ProtocolViolation(format!(
            "expected Join, got {:?}",
            join.kind
        )));
    }

    let request: JoinRequest = join
        .payload_as()
        .map_err(|_| HandshakeError::ProtocolViolation("malformed Join payload".to_string()))?;

    if let Some(expected) = password_hash {
        let presented = request.password_hash().unwrap_or_default();
        if !presented.eq_ignore_ascii_case(expected) {
            return Err(HandshakeError::IncorrectPassword);
        }
    }

    let (client_id, resumed) = match request.previous_id() {
        Some(id) if can_resume(id) => (id.to_string(), true),
        _ => {
            let mut id = generate_client_id();
            while exists(&id) {
                id = generate_client_id();
            }
            (id, false)
        }
    };

    let pending = handler.expect_response()?;
    handler.send(&NetworkMessage::accept(&client_id)).await?;

    let ack = pending.wait(timeout).await?;
    if !ack.is(MessageType::Ok) {
        return Err(HandshakeError::ProtocolViolation(format!(
            "expected OK, got {:?}",
            ack.kind
        )));
    }

    Ok(AcceptedClient { client_id, resumed })
}
