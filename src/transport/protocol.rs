use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

use super::frame::{CommandId, Frame};
use super::{Result, Transport, TransportError};

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_REJECTED: u8 = 0x01;
pub const STATUS_CONFIRMATION_REQUIRED: u8 = 0x02;
pub const STATUS_PENDING: u8 = 0x03;

/// Device answer to a request, classified by its leading status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Accepted; carries the command-specific body.
    Ok(Vec<u8>),
    /// The device refused the step. Never retried.
    Rejected(u8),
    /// The device needs an external decision before it can continue.
    ConfirmationRequired(u8),
    /// Still working; ask again after the given delay in milliseconds.
    Pending(u16),
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let status = reader.read_u8()?;
        let reply = match status {
            STATUS_OK => Reply::Ok(reader.remaining().to_vec()),
            STATUS_REJECTED => Reply::Rejected(reader.read_u8()?),
            STATUS_CONFIRMATION_REQUIRED => Reply::ConfirmationRequired(reader.read_u8()?),
            STATUS_PENDING => Reply::Pending(reader.read_u16()?),
            other => {
                return Err(TransportError::Frame(format!(
                    "Unknown reply status 0x{:02X}",
                    other
                )))
            }
        };
        Ok(reply)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Ok(body) => {
                let mut out = Vec::with_capacity(body.len() + 1);
                out.push(STATUS_OK);
                out.extend_from_slice(body);
                out
            }
            Reply::Rejected(code) => vec![STATUS_REJECTED, *code],
            Reply::ConfirmationRequired(kind) => vec![STATUS_CONFIRMATION_REQUIRED, *kind],
            Reply::Pending(ms) => {
                let mut out = vec![STATUS_PENDING];
                out.extend_from_slice(&ms.to_be_bytes());
                out
            }
        }
    }
}

/// Big-endian cursor over a reply body.
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() - self.pos < len {
            return Err(TransportError::Frame(format!(
                "Payload truncated: wanted {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.bytes.len() - self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Length-prefixed (u8) UTF-8 string.
    pub fn read_short_string(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| TransportError::Frame(format!("Invalid UTF-8 string: {}", e)))
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Request/response layer over one [`Transport`].
///
/// One instance exists per connected device and is shared behind a mutex, so
/// exchanges to the same device never interleave.
pub struct DeviceProtocol {
    link: Box<dyn Transport>,
    timeout: Duration,
}

pub type SharedProtocol = Arc<Mutex<DeviceProtocol>>;

impl DeviceProtocol {
    pub fn new(link: Box<dyn Transport>, timeout: Duration) -> Self {
        Self { link, timeout }
    }

    pub fn shared(self) -> SharedProtocol {
        Arc::new(Mutex::new(self))
    }

    /// Send a request and wait for its response.
    ///
    /// Frames that do not answer this request (late replies to an exchange
    /// that already timed out) are discarded.
    pub async fn exchange(&mut self, command: CommandId, payload: Vec<u8>) -> Result<Reply> {
        let frame = Frame::request(command, payload);
        let limit = self.timeout;
        let link = &mut self.link;

        let outcome = timeout(limit, async {
            link.send(&frame.encode()).await?;
            next_reply(link, command).await
        })
        .await;
        timed_out(outcome, command, limit)
    }

    /// Wait for another response to `command` without sending anything.
    ///
    /// Used after a reply turned out to answer an earlier request.
    pub async fn await_reply(&mut self, command: CommandId) -> Result<Reply> {
        let limit = self.timeout;
        let outcome = timeout(limit, next_reply(&mut self.link, command)).await;
        timed_out(outcome, command, limit)
    }

    pub async fn reconnect(&mut self) -> Result<()> {
        self.link.reconnect().await
    }

    pub fn disconnect(&mut self) {
        self.link.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn link_state(&self) -> watch::Receiver<bool> {
        self.link.link_state()
    }
}

async fn next_reply(link: &mut Box<dyn Transport>, command: CommandId) -> Result<Reply> {
    loop {
        let response = link.receive().await?;
        if response.command == command.response_code() {
            return Reply::parse(&response.payload);
        }
        log::debug!(
            "Discarding unexpected frame 0x{:04X} while waiting for {:?}",
            response.command,
            command
        );
    }
}

fn timed_out(
    outcome: std::result::Result<Result<Reply>, tokio::time::error::Elapsed>,
    command: CommandId,
    limit: Duration,
) -> Result<Reply> {
    match outcome {
        Ok(result) => result,
        Err(_) => {
            log::warn!("{:?} exchange timed out after {:?}", command, limit);
            Err(TransportError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_parsing() {
        assert_eq!(Reply::parse(&[0x00, 1, 2]).unwrap(), Reply::Ok(vec![1, 2]));
        assert_eq!(Reply::parse(&[0x01, 0x42]).unwrap(), Reply::Rejected(0x42));
        assert_eq!(
            Reply::parse(&[0x02, 0x04]).unwrap(),
            Reply::ConfirmationRequired(0x04)
        );
        assert_eq!(Reply::parse(&[0x03, 0x01, 0x00]).unwrap(), Reply::Pending(256));
        assert!(Reply::parse(&[]).is_err());
        assert!(Reply::parse(&[0x09]).is_err());
        assert!(Reply::parse(&[0x01]).is_err());
    }

    #[test]
    fn test_reply_encode_matches_parse() {
        for reply in [
            Reply::Ok(vec![9, 8, 7]),
            Reply::Rejected(3),
            Reply::ConfirmationRequired(1),
            Reply::Pending(1500),
        ] {
            assert_eq!(Reply::parse(&reply.encode()).unwrap(), reply);
        }
    }

    #[tokio::test]
    async fn test_await_reply_picks_up_queued_response() {
        use crate::transport::mock::{MockBehavior, MockDevice};

        let device = MockDevice::with_behavior(MockBehavior {
            duplicate_ack_at_chunk: Some(1),
            ..MockBehavior::default()
        });
        let mut protocol = DeviceProtocol::new(Box::new(device.link()), Duration::from_millis(50));

        let data = [7u8; 16];
        let mut payload = 1u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&crc32fast::hash(&data).to_be_bytes());
        payload.extend_from_slice(&data);

        let first = protocol.exchange(CommandId::UpgradeData, payload).await.unwrap();
        assert_eq!(first, Reply::Ok(0u32.to_be_bytes().to_vec()));
        let second = protocol.await_reply(CommandId::UpgradeData).await.unwrap();
        assert_eq!(second, Reply::Ok(1u32.to_be_bytes().to_vec()));
        assert!(matches!(
            protocol.await_reply(CommandId::UpgradeData).await,
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_payload_reader() {
        let bytes = [0x00, 0x00, 0x01, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0xAA];
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 256);
        assert_eq!(reader.read_short_string().unwrap(), "hello");
        assert_eq!(reader.read_u8().unwrap(), 0xAA);
        assert!(reader.is_empty());
        assert!(reader.read_u8().is_err());
    }
}
