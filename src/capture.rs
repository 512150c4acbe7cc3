//! Link-layer frames to TCP segments.

use crate::error::CaptureError;
use crate::protocol::types::{FlowKey, Segment};
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use std::net::Ipv4Addr;

/// Decodes an Ethernet II frame carrying IPv4/TCP.
pub fn segment_from_ethernet(frame: &[u8]) -> Result<Segment, CaptureError> {
    let headers =
        PacketHeaders::from_ethernet_slice(frame).map_err(|e| CaptureError::Malformed(e.to_string()))?;
    segment_from_headers(headers)
}

/// Decodes a raw IP packet (no link header), as delivered by raw sockets.
pub fn segment_from_ip(packet: &[u8]) -> Result<Segment, CaptureError> {
    let headers = PacketHeaders::from_ip_slice(packet).map_err(|e| CaptureError::Malformed(e.to_string()))?;
    segment_from_headers(headers)
}

fn segment_from_headers(headers: PacketHeaders<'_>) -> Result<Segment, CaptureError> {
    // 1. IPv4 only
    let Some(NetHeaders::Ipv4(ipv4, _extensions)) = headers.net else {
        return Err(CaptureError::UnsupportedNetwork);
    };

    // 2. TCP only
    let Some(TransportHeader::Tcp(tcp)) = headers.transport else {
        return Err(CaptureError::UnsupportedProtocol(ipv4.protocol.0));
    };

    Ok(Segment {
        flow: FlowKey {
            src_ip: Ipv4Addr::from(ipv4.source),
            src_port: tcp.source_port,
            dst_ip: Ipv4Addr::from(ipv4.destination),
            dst_port: tcp.destination_port,
        },
        seq: tcp.sequence_number,
        payload: headers.payload.slice().to_vec(),
    })
}
