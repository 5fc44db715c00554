//! Framed packet transport over TCP.
//!
//! Every frame is a 4-byte big-endian length prefix followed by the bincode
//! encoding of one [`Packet`]. The length prefix gives reliable message
//! boundaries on the stream and lets a reader reject runaway frames before
//! allocating for them.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::protocol::Packet;

/// Upper bound on a single frame. Full-grid snapshots stay far below this.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Packet>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        // Clean close between frames.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    bincode::deserialize(&data)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let data =
        bincode::serialize(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await
}

/// A TCP stream speaking length-prefixed packets.
pub struct PacketStream {
    stream: TcpStream,
}

impl PacketStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Reads the next packet; `Ok(None)` means the peer closed cleanly.
    pub async fn read_packet(&mut self) -> io::Result<Option<Packet>> {
        read_frame(&mut self.stream).await
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> io::Result<()> {
        write_frame(&mut self.stream, packet).await
    }

    /// Splits into independently owned read and write halves so one task can
    /// read while another writes.
    pub fn into_split(self) -> (PacketReader, PacketWriter) {
        let (read, write) = self.stream.into_split();
        (PacketReader { half: read }, PacketWriter { half: write })
    }

    /// Unwraps the underlying stream, e.g. to hand a classified connection
    /// over to a long-lived link.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

pub struct PacketReader {
    half: OwnedReadHalf,
}

impl PacketReader {
    pub async fn read_packet(&mut self) -> io::Result<Option<Packet>> {
        read_frame(&mut self.half).await
    }
}

pub struct PacketWriter {
    half: OwnedWriteHalf,
}

impl PacketWriter {
    pub async fn write_packet(&mut self, packet: &Packet) -> io::Result<()> {
        write_frame(&mut self.half, packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (PacketStream, PacketStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (PacketStream::new(client), PacketStream::new(server))
    }

    #[test]
    fn frames_cross_a_real_socket() {
        tokio_test::block_on(async {
            let (mut a, mut b) = connected_pair().await;
            a.write_packet(&Packet::ClientHello).await.unwrap();
            a.write_packet(&Packet::Welcome { client_id: 5 })
                .await
                .unwrap();

            assert!(matches!(
                b.read_packet().await.unwrap(),
                Some(Packet::ClientHello)
            ));
            match b.read_packet().await.unwrap() {
                Some(Packet::Welcome { client_id }) => assert_eq!(client_id, 5),
                other => panic!("unexpected packet {:?}", other),
            }
        });
    }

    #[test]
    fn clean_close_reads_as_none() {
        tokio_test::block_on(async {
            let (a, mut b) = connected_pair().await;
            drop(a);
            assert!(b.read_packet().await.unwrap().is_none());
        });
    }

    #[test]
    fn oversized_frame_is_rejected() {
        tokio_test::block_on(async {
            let (a, mut b) = connected_pair().await;
            let mut raw = a.stream;
            let len = (MAX_FRAME_BYTES as u32) + 1;
            raw.write_all(&len.to_be_bytes()).await.unwrap();

            let err = b.read_packet().await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        });
    }

    #[test]
    fn split_halves_carry_packets() {
        tokio_test::block_on(async {
            let (a, b) = connected_pair().await;
            let (_a_read, mut a_write) = a.into_split();
            let (mut b_read, _b_write) = b.into_split();

            a_write
                .write_packet(&Packet::Ping { seq: 1 })
                .await
                .unwrap();
            assert!(matches!(
                b_read.read_packet().await.unwrap(),
                Some(Packet::Ping { seq: 1 })
            ));
        });
    }
}
