//! UDP send/receive helpers. TCP is out of scope: this resolver never
//! falls back to TCP, and never retries a truncated (TC-flagged)
//! response.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// Writes a serialised message to a UDP socket, setting or clearing
/// the TC flag depending on whether it fits in a single 512-octet
/// datagram.
pub async fn send_udp_bytes(sock: &UdpSocket, bytes: &mut [u8]) -> Result<(), io::Error> {
    set_tc_flag_and_truncate(bytes);
    sock.send(trimmed(bytes)).await?;
    Ok(())
}

/// Like [`send_udp_bytes`] but sends to a specific address, for
/// replying on a socket bound to the wildcard address.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
) -> Result<(), io::Error> {
    set_tc_flag_and_truncate(bytes);
    sock.send_to(trimmed(bytes), target).await?;
    Ok(())
}

fn set_tc_flag_and_truncate(bytes: &mut [u8]) {
    if bytes.len() > 512 {
        bytes[2] |= 0b0000_0010;
    } else {
        bytes[2] &= 0b1111_1101;
    }
}

fn trimmed(bytes: &[u8]) -> &[u8] {
    if bytes.len() > 512 {
        &bytes[..512]
    } else {
        bytes
    }
}
