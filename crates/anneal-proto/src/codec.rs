//! Typed-dictionary message codec
//!
//! Messages are binary plists framed by a big-endian u32 length. A receive
//! timeout is an empty tick for the caller, not an error; the restore
//! daemon is often silent for long stretches while it works.

use std::io::Cursor;
use std::time::Duration;

use plist::{Dictionary, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::transport::{DeviceSocket, ProtoError};

pub struct MessageCodec {
    stream: DeviceSocket,
}

impl MessageCodec {
    pub fn new(stream: DeviceSocket) -> Self {
        Self { stream }
    }

    /// Send one dictionary message.
    pub async fn send(&mut self, message: &Dictionary) -> Result<(), ProtoError> {
        let mut payload = Vec::new();
        Value::Dictionary(message.clone()).to_writer_binary(&mut payload)?;
        trace!(len = payload.len(), "Sending message");
        self.stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        self.stream.write_all(&payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive one dictionary message, or `None` if nothing arrived within
    /// `timeout`.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Dictionary>, ProtoError> {
        let mut len_buf = [0u8; 4];
        match tokio::time::timeout(timeout, self.stream.read_exact(&mut len_buf)).await {
            Err(_) => return Ok(None),
            Ok(read) => {
                read?;
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        trace!(len, "Received message");

        let value: Value = Value::from_reader(Cursor::new(&payload))?;
        value
            .into_dictionary()
            .map(Some)
            .ok_or(ProtoError::NotADictionary)
    }
}
