use surelink_protocol::{
    cobs, crc16, LinkLayer, PhysicalError, PhysicalLink, COBS_MAX_BLOCK_SIZE, FRAME_DELIMITER,
};

/// Captures everything the link pushes down, so we can look at the wire.
struct Capture(Vec<u8>);

impl PhysicalLink for Capture {
    fn send(&mut self, data: &[u8]) -> Result<usize, PhysicalError> {
        self.0.extend_from_slice(data);
        Ok(data.len())
    }

    fn max_payload_size(&self) -> usize {
        256
    }
}

fn main() {
    let payload = [0xDE, 0xAD, 0x00, 0xBE, 0xEF];

    let mut link = LinkLayer::new();
    link.send(&payload).unwrap();

    let mut phy = Capture(Vec::new());
    link.process_outgoing_data(&mut phy).unwrap();
    let wire = phy.0;

    println!("payload {:02x?}", payload);
    println!("on-wire frame ({} bytes):", wire.len());
    for (i, byte) in wire.iter().enumerate() {
        print!("{:02x} ", byte);
        if (i + 1) % 16 == 0 {
            println!();
        }
    }
    println!();
    println!(
        "delimiters inside the body: {}",
        wire[..wire.len() - 1]
            .iter()
            .filter(|&&b| b == FRAME_DELIMITER)
            .count()
    );

    // Take it apart by hand to show the layering. A block-sized output is
    // enough for any well-formed frame, maximum payload included.
    let mut decoded = [0u8; COBS_MAX_BLOCK_SIZE];
    let result = cobs::decode(&wire, &mut decoded).unwrap();
    let frame = &decoded[..result.written];
    let crc = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
    println!(
        "type {:02x}, length {}, crc {:04x} (computed {:04x})",
        frame[0],
        frame[1],
        crc,
        crc16::calculate(&frame[..frame.len() - 2])
    );

    // And the same thing through the parser.
    let mut rx = LinkLayer::new();
    rx.on_receive(&wire).unwrap();
    let recovered = rx.process_incoming_data().expect("frame recovered");
    println!("recovered payload {:02x?}", &recovered[..]);
    assert_eq!(&recovered[..], &payload[..]);
}
