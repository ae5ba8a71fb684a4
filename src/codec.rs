//! Framed reader: turns a byte stream into one decoded packet at a time.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketType};
use crate::varint;

/// Read exactly one MQTT 5 packet from `reader`, using `read_buf` as
/// scratch space across calls (bytes left over from a previous short
/// read are not discarded).
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, read_buf: &mut BytesMut) -> Result<Packet> {
    let header = read_fixed_header(reader, read_buf).await?;
    let payload = read_exact(reader, read_buf, header.remaining_length).await?;
    Packet::decode(header.packet_type, header.flags, payload)
}

struct FixedHeader {
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
}

async fn read_fixed_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    read_buf: &mut BytesMut,
) -> Result<FixedHeader> {
    fill(reader, read_buf, 1).await?;
    let first = read_buf[0];
    let packet_type = PacketType::from_u8(first >> 4)?;
    let flags = first & 0x0F;

    // The remaining-length field is 1-4 bytes; read one at a time until
    // the continuation bit clears, growing read_buf as needed.
    let mut probe_len = 2;
    let remaining_length = loop {
        fill(reader, read_buf, probe_len).await?;
        let mut cursor = &read_buf[1..probe_len];
        match varint::read(&mut cursor)? {
            Some(len) => break len as usize,
            None => {
                if probe_len - 1 >= 4 {
                    return Err(Error::Malformed("remaining length longer than 4 bytes".into()));
                }
                probe_len += 1;
            }
        }
    };

    let header_len = probe_len - cursor_consumed(read_buf, probe_len);
    read_buf.advance(header_len);
    Ok(FixedHeader { packet_type, flags, remaining_length })
}

/// How many bytes of `read_buf[1..probe_len]` the variable-length integer
/// actually consumed (it may be shorter than the probe window).
fn cursor_consumed(read_buf: &BytesMut, probe_len: usize) -> usize {
    let mut cursor = &read_buf[1..probe_len];
    let before = cursor.remaining();
    let _ = varint::read(&mut cursor);
    let after = cursor.remaining();
    1 + (before - after)
}

/// Ensure at least `n` bytes are available at the front of `read_buf`,
/// reading more from `reader` as needed.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, read_buf: &mut BytesMut, n: usize) -> Result<()> {
    while read_buf.len() < n {
        let mut tmp = [0u8; 4096];
        let read = reader.read(&mut tmp).await?;
        if read == 0 {
            return Err(Error::ConnectionClosed);
        }
        read_buf.extend_from_slice(&tmp[..read]);
    }
    Ok(())
}

async fn read_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    read_buf: &mut BytesMut,
    len: usize,
) -> Result<Bytes> {
    fill(reader, read_buf, len).await?;
    Ok(read_buf.split_to(len).freeze())
}

/// Encode and write one packet, flushing the writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialized length a packet would occupy on the wire, used to enforce
/// a session's outbound `MaximumPacketSize`.
pub fn encoded_len(packet: &Packet) -> Result<usize> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf)?;
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Connect;
    use crate::properties::Properties;

    #[tokio::test]
    async fn reads_packet_split_across_several_reads() {
        let packet = Packet::Connect(Connect {
            clean_start: true,
            keep_alive: 10,
            client_id: "split".into(),
            will: None,
            user_name: None,
            password: None,
            properties: Properties::new(),
        });
        let mut encoded = BytesMut::new();
        packet.encode(&mut encoded).unwrap();

        // Feed the bytes through a reader that only yields them one at a time.
        struct OneByteAtATime(Vec<u8>, usize);
        impl AsyncRead for OneByteAtATime {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                if self.1 < self.0.len() {
                    buf.put_slice(&[self.0[self.1]]);
                    self.1 += 1;
                }
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut reader = OneByteAtATime(encoded.to_vec(), 0);
        let mut read_buf = BytesMut::new();
        let decoded = read_packet(&mut reader, &mut read_buf).await.unwrap();
        match decoded {
            Packet::Connect(c) => assert_eq!(c.client_id, "split"),
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_packet_is_connection_closed() {
        let mut reader: &[u8] = &[0x10]; // CONNECT header byte, nothing else
        let mut read_buf = BytesMut::new();
        let err = read_packet(&mut reader, &mut read_buf).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
