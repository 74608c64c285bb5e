//! Newline-delimited JSON framing between the simulator and its clients.

use crate::command::RoverCommand;
use crate::telemetry::TelemetryFrame;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 256;
pub const MAX_RESPONSE_SIZE: usize = 256;
pub const MAX_TELEMETRY_SIZE: usize = 2048;

pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;
pub type TelemetryBuffer = ArrayString<MAX_TELEMETRY_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub id: u32,
    pub command: RoverCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Executed, or queued for the next poll.
    Acknowledged,
    /// Rejected; `message` says why.
    NegativeAck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ack(id: u32) -> Self {
        Self {
            id,
            status: ResponseStatus::Acknowledged,
            message: None,
        }
    }

    pub fn nack(id: u32, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::NegativeAck,
            message: Some(reason.into()),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.status == ResponseStatus::Acknowledged
    }
}

/// Everything the simulator writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(CommandResponse),
    Telemetry(TelemetryFrame),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message exceeds {0} bytes")]
    MessageTooLarge(usize),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Reusable encode buffers for the JSON line protocol.
pub struct ProtocolHandler {
    next_id: u32,
    response_buffer: ResponseBuffer,
    telemetry_buffer: TelemetryBuffer,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            response_buffer: ArrayString::new(),
            telemetry_buffer: ArrayString::new(),
        }
    }

    pub fn parse_command(&self, line: &str) -> Result<CommandFrame, ProtocolError> {
        let line = line.trim();
        if line.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge(MAX_COMMAND_SIZE));
        }
        Ok(serde_json::from_str(line)?)
    }

    /// Wrap `command` in a frame with a fresh id.
    pub fn frame(&mut self, command: RoverCommand) -> CommandFrame {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        CommandFrame { id, command }
    }

    pub fn serialize_response(&mut self, response: &CommandResponse) -> Result<&str, ProtocolError> {
        let json = serde_json::to_string(&ServerMessage::Response(response.clone()))?;
        Self::fill(&mut self.response_buffer, &json)?;
        Ok(&self.response_buffer)
    }

    pub fn serialize_telemetry(&mut self, frame: &TelemetryFrame) -> Result<&str, ProtocolError> {
        let json = serde_json::to_string(&ServerMessage::Telemetry(*frame))?;
        Self::fill(&mut self.telemetry_buffer, &json)?;
        Ok(&self.telemetry_buffer)
    }

    pub fn parse_server_message(&self, line: &str) -> Result<ServerMessage, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    fn fill<const CAP: usize>(buffer: &mut ArrayString<CAP>, json: &str) -> Result<(), ProtocolError> {
        buffer.clear();
        buffer
            .try_push_str(json)
            .map_err(|_| ProtocolError::MessageTooLarge(CAP))
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TankCommand;

    #[test]
    fn test_parse_command_frame() {
        let handler = ProtocolHandler::new();
        let frame = handler
            .parse_command(r#"{"id":3,"command":{"type":"halt"}}"#)
            .unwrap();
        assert_eq!(frame.id, 3);
        assert_eq!(frame.command, RoverCommand::Halt);
    }

    #[test]
    fn test_oversized_command_rejected() {
        let handler = ProtocolHandler::new();
        let line = "x".repeat(MAX_COMMAND_SIZE + 1);
        assert!(matches!(
            handler.parse_command(&line),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let handler = ProtocolHandler::new();
        assert!(matches!(
            handler.parse_command(r#"{"id":1,"command":{"type":"fly"}}"#),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_frame_ids_increment() {
        let mut handler = ProtocolHandler::new();
        let first = handler.frame(RoverCommand::Noop);
        let second = handler.frame(RoverCommand::Tank(TankCommand::speed(0.2, 0.2)));
        assert_eq!(second.id, first.id + 1);
    }

    #[test]
    fn test_response_serializes_as_server_message() {
        let mut handler = ProtocolHandler::new();
        let json = handler
            .serialize_response(&CommandResponse::nack(9, "command queue is full"))
            .unwrap()
            .to_string();
        match handler.parse_server_message(&json).unwrap() {
            ServerMessage::Response(response) => {
                assert_eq!(response.id, 9);
                assert!(!response.is_ack());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
