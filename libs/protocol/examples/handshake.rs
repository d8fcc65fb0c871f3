//! Two stacks talking over an in-memory wire: connect, exchange data,
//! disconnect. Prints every event both sides observe.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use surelink_protocol::{PhysicalError, PhysicalLink, Stack, StackEvent, TimeSource};

#[derive(Clone)]
struct Wire(Rc<RefCell<Vec<u8>>>);

impl PhysicalLink for Wire {
    fn send(&mut self, data: &[u8]) -> Result<usize, PhysicalError> {
        self.0.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }

    fn max_payload_size(&self) -> usize {
        512
    }
}

struct HostClock(Instant);

impl TimeSource for HostClock {
    fn now_ms(&mut self) -> u32 {
        self.0.elapsed().as_millis() as u32
    }
}

fn drain(label: &str, stack: &mut Stack<Wire, HostClock>) {
    while let Some(event) = stack.poll_event() {
        match event {
            StackEvent::DataReceived(payload) => {
                println!("{label}: data {:02x?}", &payload[..])
            }
            StackEvent::DatagramReceived(payload) => {
                println!("{label}: datagram {:02x?}", &payload[..])
            }
            other => println!("{label}: {other:?}"),
        }
    }
}

fn shuttle(
    from: &mut Stack<Wire, HostClock>,
    wire: &Wire,
    to: &mut Stack<Wire, HostClock>,
) {
    from.process_outgoing_data().unwrap();
    let bytes = std::mem::take(&mut *wire.0.borrow_mut());
    if !bytes.is_empty() {
        println!("wire: {:02x?}", bytes);
        to.queue_incoming(&bytes).unwrap();
        to.process_incoming_data().unwrap();
    }
}

fn main() {
    let client_wire = Wire(Rc::new(RefCell::new(Vec::new())));
    let server_wire = Wire(Rc::new(RefCell::new(Vec::new())));

    let epoch = Instant::now();
    let mut client = Stack::new(client_wire.clone(), HostClock(epoch));
    let mut server = Stack::new(server_wire.clone(), HostClock(epoch));
    client.initialize();
    server.initialize();

    server.listen().unwrap();
    client.connect().unwrap();

    for _ in 0..4 {
        shuttle(&mut client, &client_wire, &mut server);
        shuttle(&mut server, &server_wire, &mut client);
    }
    drain("client", &mut client);
    drain("server", &mut server);
    assert!(client.is_connected() && server.is_connected());

    client.send(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    server.send_datagram(b"hello").unwrap();
    for _ in 0..4 {
        shuttle(&mut client, &client_wire, &mut server);
        shuttle(&mut server, &server_wire, &mut client);
    }
    drain("client", &mut client);
    drain("server", &mut server);

    client.disconnect().unwrap();
    for _ in 0..4 {
        shuttle(&mut client, &client_wire, &mut server);
        shuttle(&mut server, &server_wire, &mut client);
    }
    drain("client", &mut client);
    drain("server", &mut server);

    println!("client state {:?}, server state {:?}", client.state(), server.state());
}
