//! Serial transport via tokio-serial.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::{ByteSink, ByteSource, TransportPair};
use crate::config::SerialSettings;
use crate::error::TransportError;

pub(crate) fn open(settings: &SerialSettings) -> Result<TransportPair, TransportError> {
    let stream = tokio_serial::new(&settings.port, settings.baud_rate)
        .open_native_async()
        .map_err(|e| TransportError::Closed {
            reason: format!("cannot open {}: {e}", settings.port),
            source: None,
        })?;
    debug!(port = %settings.port, baud = settings.baud_rate, "serial port opened");

    let (read, write) = tokio::io::split(stream);
    let port = settings.port.clone();
    Ok(TransportPair {
        source: Box::new(SerialSource { read, port: port.clone() }),
        sink: Box::new(SerialSink { write, port }),
    })
}

struct SerialSource {
    read: ReadHalf<SerialStream>,
    port: String,
}

#[async_trait]
impl ByteSource for SerialSource {
    async fn recv_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self
            .read
            .read(buf)
            .await
            .map_err(|e| TransportError::from_io(&self.port, e))?;
        if n == 0 {
            return Err(TransportError::closed("serial port closed"));
        }
        Ok(n)
    }
}

struct SerialSink {
    write: WriteHalf<SerialStream>,
    port: String,
}

#[async_trait]
impl ByteSink for SerialSink {
    async fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::from_io(&self.port, e))?;
        self.write.flush().await.map_err(|e| TransportError::from_io(&self.port, e))
    }
}
