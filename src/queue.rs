//! PDU Queue and Receive Slot
//!
//! Two handoff structures sit between the upper network layer and the master
//! state machine. Outbound PDUs wait in a fixed-capacity FIFO ring: the
//! upper layer enqueues from any thread, the master task drains while it
//! holds the token. Inbound application PDUs land in a one-slot mailbox
//! guarded by a condition variable; the upper layer blocks on it in
//! `receive`. A single slot is sufficient because the BACnet layer above
//! keeps one outstanding request per MS/TP segment; a frame arriving while
//! the slot is still occupied is dropped and counted.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::address::BacnetAddress;
use crate::frame::{self, FrameType};
use crate::npdu;

/// Outbound ring capacity, in PDUs.
pub const PDU_PACKET_COUNT: usize = 8;

/// One queued outbound PDU.
#[derive(Debug, Clone)]
struct PduPacket {
    destination_mac: u8,
    data_expecting_reply: bool,
    buffer: Vec<u8>,
}

/// Fixed-capacity outbound PDU ring.
///
/// Multi-producer, single-consumer: any thread may enqueue, only the master
/// task dequeues. `get_reply` may remove a mid-queue element; the remaining
/// elements keep their order.
#[derive(Debug, Default)]
pub struct PduQueue {
    packets: Mutex<VecDeque<PduPacket>>,
}

impl PduQueue {
    pub fn new() -> Self {
        Self {
            packets: Mutex::new(VecDeque::with_capacity(PDU_PACKET_COUNT)),
        }
    }

    /// Enqueue a PDU for `destination_mac`.
    ///
    /// The data-expecting-reply flag is derived from bit 2 of the NPDU
    /// control octet. Returns the number of octets accepted, or 0 when the
    /// ring is full or the PDU cannot fit in a frame. Never blocks.
    pub fn push(&self, destination_mac: u8, pdu: &[u8]) -> usize {
        if pdu.is_empty() || pdu.len() > frame::MAX_DATA_LENGTH {
            return 0;
        }
        let mut packets = self.packets.lock().unwrap();
        if packets.len() >= PDU_PACKET_COUNT {
            return 0;
        }
        packets.push_back(PduPacket {
            destination_mac,
            data_expecting_reply: npdu::pdu_expects_reply(pdu),
            buffer: pdu.to_vec(),
        });
        pdu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().unwrap().is_empty()
    }

    /// Encode the head PDU into `out` as a data frame from `this_station`
    /// and pop it. Returns the frame length, or 0 when the queue is empty.
    pub fn get_send(&self, this_station: u8, out: &mut [u8]) -> usize {
        let mut packets = self.packets.lock().unwrap();
        let Some(packet) = packets.front() else {
            return 0;
        };
        let frame_len = frame::create_frame(
            out,
            data_frame_type(packet.data_expecting_reply),
            packet.destination_mac,
            this_station,
            &packet.buffer,
        );
        packets.pop_front();
        frame_len
    }

    /// Find a queued PDU answering the Data-Expecting-Reply request in
    /// `request`, encode it into `out` and remove it from the ring, wherever
    /// it sits. Returns the frame length, or 0 when nothing matches.
    pub fn get_reply(
        &self,
        request: &[u8],
        request_source: u8,
        this_station: u8,
        out: &mut [u8],
    ) -> usize {
        let mut packets = self.packets.lock().unwrap();
        let matched = packets.iter().position(|packet| {
            npdu::is_reply_to_data_expecting_reply(
                request,
                request_source,
                &packet.buffer,
                packet.destination_mac,
            )
        });
        let Some(index) = matched else {
            return 0;
        };
        let packet = &packets[index];
        let frame_len = frame::create_frame(
            out,
            data_frame_type(packet.data_expecting_reply),
            packet.destination_mac,
            this_station,
            &packet.buffer,
        );
        packets.remove(index);
        frame_len
    }
}

fn data_frame_type(data_expecting_reply: bool) -> FrameType {
    if data_expecting_reply {
        FrameType::BacnetDataExpectingReply
    } else {
        FrameType::BacnetDataNotExpectingReply
    }
}

/// One received application PDU, as surfaced to the upper layer.
#[derive(Debug, Clone, Default)]
struct ReceivePacket {
    ready: bool,
    address: BacnetAddress,
    pdu: Vec<u8>,
}

/// Single-slot inbound mailbox.
#[derive(Debug, Default)]
pub struct ReceiveSlot {
    packet: Mutex<ReceivePacket>,
    available: Condvar,
}

impl ReceiveSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a received PDU and wake the consumer.
    ///
    /// Returns false, leaving the slot untouched, when the previous PDU has
    /// not been consumed yet; the frame is lost and the caller counts it.
    pub fn put(&self, source_station: u8, pdu: &[u8]) -> bool {
        let mut packet = self.packet.lock().unwrap();
        if packet.ready {
            return false;
        }
        packet.ready = true;
        packet.address = BacnetAddress::from_mstp_station(source_station);
        packet.pdu.clear();
        packet.pdu.extend_from_slice(pdu);
        self.available.notify_one();
        true
    }

    /// Block until a PDU is available or `timeout` elapses, then take it.
    pub fn take(&self, timeout: Duration) -> Option<(BacnetAddress, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut packet = self.packet.lock().unwrap();
        while !packet.ready {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self.available.wait_timeout(packet, remaining).unwrap();
            packet = guard;
            if result.timed_out() && !packet.ready {
                return None;
            }
        }
        packet.ready = false;
        Some((packet.address, std::mem::take(&mut packet.pdu)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn der_request(invoke_id: u8, service: u8) -> Vec<u8> {
        vec![0x01, 0x04, 0x00, 0x05, invoke_id, service]
    }

    fn simple_ack(invoke_id: u8, service: u8) -> Vec<u8> {
        vec![0x01, 0x00, 0x20, invoke_id, service]
    }

    #[test]
    fn test_push_until_full() {
        let queue = PduQueue::new();
        let pdu = simple_ack(1, 2);
        for _ in 0..PDU_PACKET_COUNT {
            assert_eq!(queue.push(9, &pdu), pdu.len());
        }
        assert_eq!(queue.push(9, &pdu), 0);
    }

    #[test]
    fn test_push_rejects_oversize() {
        let queue = PduQueue::new();
        assert_eq!(queue.push(9, &[0u8; frame::MAX_DATA_LENGTH + 1]), 0);
        assert_eq!(queue.push(9, &[]), 0);
    }

    #[test]
    fn test_get_send_frames_head_in_fifo_order() {
        let queue = PduQueue::new();
        queue.push(3, &simple_ack(1, 2));
        queue.push(4, &der_request(7, 8));
        let mut out = [0u8; frame::MAX_FRAME_SIZE];

        let len = queue.get_send(0, &mut out);
        assert!(len > 0);
        assert_eq!(out[2], FrameType::BacnetDataNotExpectingReply.to_u8());
        assert_eq!(out[3], 3);

        let len = queue.get_send(0, &mut out);
        assert!(len > 0);
        assert_eq!(out[2], FrameType::BacnetDataExpectingReply.to_u8());
        assert_eq!(out[3], 4);

        assert_eq!(queue.get_send(0, &mut out), 0);
    }

    #[test]
    fn test_get_reply_pulls_mid_queue_element() {
        let queue = PduQueue::new();
        queue.push(9, &simple_ack(0x11, 0x0C)); // not the reply
        queue.push(5, &simple_ack(0x42, 0x0F)); // the reply
        let request = der_request(0x42, 0x0F);

        let mut out = [0u8; frame::MAX_FRAME_SIZE];
        let len = queue.get_reply(&request, 5, 1, &mut out);
        assert!(len > 0);
        assert_eq!(out[3], 5);
        assert_eq!(out[4], 1);

        // FIFO order of the remainder is preserved
        let len = queue.get_send(1, &mut out);
        assert!(len > 0);
        assert_eq!(out[3], 9);
    }

    #[test]
    fn test_get_reply_without_match() {
        let queue = PduQueue::new();
        queue.push(5, &simple_ack(0x41, 0x0F));
        let request = der_request(0x42, 0x0F);
        let mut out = [0u8; frame::MAX_FRAME_SIZE];
        assert_eq!(queue.get_reply(&request, 5, 1, &mut out), 0);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_receive_slot_drops_while_ready() {
        let slot = ReceiveSlot::new();
        assert!(slot.put(3, &[1, 2, 3]));
        assert!(!slot.put(4, &[4, 5, 6]));

        let (address, pdu) = slot.take(Duration::from_millis(10)).unwrap();
        assert_eq!(address.mstp_station(), Some(3));
        assert_eq!(pdu, vec![1, 2, 3]);

        // drained, so the next put succeeds
        assert!(slot.put(4, &[4, 5, 6]));
    }

    #[test]
    fn test_receive_slot_timeout() {
        let slot = ReceiveSlot::new();
        assert!(slot.take(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_receive_slot_wakes_blocked_consumer() {
        let slot = Arc::new(ReceiveSlot::new());
        let producer = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.put(7, &[0xAB]);
        });
        let (address, pdu) = slot.take(Duration::from_millis(500)).unwrap();
        assert_eq!(address.mstp_station(), Some(7));
        assert_eq!(pdu, vec![0xAB]);
        handle.join().unwrap();
    }
}
