//! Blocking client for the inference protocol
//!
//! A connection carries a single request, so [`InferenceClient::infer`]
//! consumes the client.

use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;

use crate::framer::{read_frame, write_frame, FrameError};
use crate::protocol::{
    argmax, Command, DecodeError, Envelope, InferenceInput, CLASS_COUNT, DIGIT_LEN,
    RESPONSE_FRAME_LEN,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Frame(FrameError),

    #[error("Malformed reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("Expected INFERENCE_OUTPUT reply, got {0:?}")]
    UnexpectedReply(Command),

    #[error("Server closed the connection without responding")]
    NoResponse,
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Incomplete { received: 0, .. } => ClientError::NoResponse,
            other => ClientError::Frame(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Decoded server reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceReply {
    pub scores: [f32; CLASS_COUNT],
    /// Backend time reported by the server
    pub timer_ms: f32,
}

impl InferenceReply {
    pub fn predicted_class(&self) -> usize {
        argmax(&self.scores)
    }
}

pub struct InferenceClient {
    stream: TcpStream,
}

impl InferenceClient {
    /// Connect with `timeout` applied to the connect and to each read and write.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one digit and wait for its scores.
    pub fn infer(mut self, digit: &[u8; DIGIT_LEN]) -> Result<InferenceReply> {
        let request = Envelope::InferenceInput(InferenceInput::new(*digit)).encode();
        write_frame(&mut self.stream, &request)?;

        let frame = read_frame(&mut self.stream, RESPONSE_FRAME_LEN)?;
        match Envelope::decode(&frame)? {
            Envelope::InferenceOutput(out) => Ok(InferenceReply {
                scores: out.scores,
                timer_ms: out.timer_ms,
            }),
            other => Err(ClientError::UnexpectedReply(other.command())),
        }
    }

    /// Write raw bytes and report how many bytes came back before close.
    ///
    /// Used to check how the server treats malformed requests.
    pub fn send_raw(mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        write_frame(&mut self.stream, bytes)?;
        self.stream.shutdown(Shutdown::Write)?;
        let mut reply = Vec::new();
        self.stream.read_to_end(&mut reply)?;
        Ok(reply)
    }
}
