use std::io::Read;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use surelink_protocol::{cobs, crc16, LinkEvent, LinkLayer, PacketType};

/// Inspector for SureLink wire captures.
#[derive(Parser, Debug)]
#[command(name = "linkspect", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Parse a hex byte stream (arguments or stdin) into frames and
    /// transport packets.
    Decode {
        /// Hex bytes, e.g. "02 31 01 04 ..." or "023101...". Reads stdin
        /// when omitted.
        hex: Vec<String>,
    },
    /// Show the raw layering of a single payload: frame bytes, CRC and
    /// the COBS-encoded wire image.
    Frame {
        /// Hex payload to wrap.
        hex: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Decode { hex } => decode(&gather_bytes(hex)?),
        Cmd::Frame { hex } => frame(&gather_bytes(hex)?),
    }
}

fn gather_bytes(args: Vec<String>) -> Result<Vec<u8>> {
    let text = if args.is_empty() {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading stdin")?;
        buffer
    } else {
        args.join(" ")
    };

    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }

    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .with_context(|| format!("bad hex at offset {i}"))
        })
        .collect()
}

fn decode(bytes: &[u8]) -> Result<()> {
    println!("{} bytes of capture", bytes.len());

    let mut link = LinkLayer::new();
    // Feed in chunks the link buffer can absorb, parsing as we go.
    let mut frames = 0usize;
    for chunk in bytes.chunks(256) {
        if link.on_receive(chunk).is_err() {
            bail!("incoming buffer overflow; capture is not frame-aligned");
        }
        loop {
            while let Some(event) = link.poll_event() {
                if event == LinkEvent::CrcError {
                    println!("frame ?: CRC error, dropped");
                }
            }
            let Some(payload) = link.process_incoming_data() else {
                break;
            };
            frames += 1;
            println!("frame {}: {} byte payload", frames, payload.len());
            describe_packet(&payload);
        }
    }
    while let Some(event) = link.poll_event() {
        if event == LinkEvent::CrcError {
            println!("frame ?: CRC error, dropped");
        }
    }
    if frames == 0 {
        println!("no complete frames in capture");
    }
    Ok(())
}

fn describe_packet(packet: &[u8]) {
    let Some(ptype) = packet.first().and_then(|&b| PacketType::from_wire(b)) else {
        println!("  invalid packet type {:02x?}", packet.first());
        return;
    };

    if ptype == PacketType::Datagram {
        let length = packet.get(1).copied().unwrap_or(0) as usize;
        println!(
            "  DATAGRAM length {} payload {:02x?}",
            length,
            &packet[2.min(packet.len())..]
        );
        return;
    }

    if packet.len() < 4 {
        println!("  runt {:?} packet {:02x?}", ptype, packet);
        return;
    }
    println!(
        "  {:?} conn {:#04x} seq {:#04x} length {}{}",
        ptype,
        packet[1],
        packet[2],
        packet[3],
        if packet.len() > 4 {
            format!(" payload {:02x?}", &packet[4..])
        } else {
            String::new()
        }
    );
}

fn frame(payload: &[u8]) -> Result<()> {
    if payload.len() > 250 {
        bail!("payload exceeds the 250 byte link maximum");
    }

    let mut raw = Vec::with_capacity(payload.len() + 4);
    raw.push(0x01);
    raw.push(payload.len() as u8);
    raw.extend_from_slice(payload);
    let crc = crc16::calculate(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());

    println!("frame  {}", hex(&raw));
    println!("crc    {:#06x}", crc);

    let mut encoded = vec![0u8; raw.len() + raw.len() / 254 + 2];
    let len = cobs::encode(&raw, &mut encoded).map_err(|e| anyhow::anyhow!("{e:?}"))?;
    encoded.truncate(len);
    encoded.push(0x00);
    println!("wire   {}", hex(&encoded));
    println!("{} payload bytes -> {} on the wire", payload.len(), encoded.len());

    // The transport-level reading of this payload, if it parses as one.
    describe_packet(payload);
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
