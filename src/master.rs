//! Master Node State Machine
//!
//! The token-passing discipline of ASHRAE 135 Clause 9. A master node waits
//! for the token, transmits up to `Nmax_info_frames` queued PDUs while it
//! holds it, passes it to its successor, and periodically polls for new
//! masters so stations joining the bus are folded into the ring. The machine
//! must converge from any disturbance: a lost token regenerates after a
//! station-specific silence slot, an unanswered successor is replaced by
//! polling, and a sole master keeps the ring alive by passing the token to
//! itself.
//!
//! Each invocation performs one state action. The return value reports an
//! immediate transition: the driving task keeps invoking the machine until
//! it returns false, then goes back to waiting on octets and timeouts.
//!
//! Slave nodes (addresses 128-254) run the much smaller
//! [`MstpPort::slave_node_fsm`]: they only ever answer requests addressed to
//! them.

use log::{debug, trace, warn};

use crate::frame::{self, FrameType, BROADCAST_ADDRESS, HEADER_SIZE};
use crate::port::{MstpPort, MstpStatistics};
use crate::queue::{PduQueue, ReceiveSlot};
use crate::rs485::Rs485Port;

/// Silence after which the token is presumed lost (ms).
pub const TNO_TOKEN_MS: u32 = 500;

/// Width of one station's token-claim slot (ms).
pub const TSLOT_MS: u32 = 10;

/// Budget for producing a reply to a Data-Expecting-Reply frame (ms).
pub const TREPLY_DELAY_MS: u32 = 250;

/// Token tenures between maintenance Poll-For-Master cycles.
pub const NPOLL: u8 = 50;

/// Times a token pass is retried before finding a new successor.
pub const NRETRY_TOKEN: u8 = 1;

/// Octets of bus activity that count as "someone is using the token".
pub const NMIN_OCTETS: u16 = 4;

/// Master machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Initialize,
    Idle,
    UseToken,
    WaitForReply,
    DoneWithToken,
    PassToken,
    NoToken,
    PollForMaster,
    AnswerDataRequest,
}

impl MstpPort {
    /// Run one step of the master node machine.
    ///
    /// Returns true when the machine should be invoked again immediately,
    /// without waiting for another octet or timeout.
    pub fn master_node_fsm(
        &mut self,
        rs485: &mut Rs485Port,
        queue: &PduQueue,
        slot: &ReceiveSlot,
    ) -> bool {
        match self.master_state {
            MasterState::Initialize => self.master_initialize(),
            MasterState::Idle => self.master_idle(rs485, slot),
            MasterState::UseToken => self.master_use_token(rs485, queue),
            MasterState::WaitForReply => self.master_wait_for_reply(slot),
            MasterState::DoneWithToken => self.master_done_with_token(rs485),
            MasterState::PassToken => self.master_pass_token(rs485),
            MasterState::NoToken => self.master_no_token(rs485),
            MasterState::PollForMaster => self.master_poll_for_master(rs485),
            MasterState::AnswerDataRequest => self.master_answer_data_request(rs485, queue),
        }
    }

    fn master_initialize(&mut self) -> bool {
        self.received_valid_frame = false;
        self.received_valid_frame_not_for_us = false;
        self.received_invalid_frame = false;
        self.next_station = self.this_station;
        self.poll_station = self.this_station;
        self.token_count = 0;
        self.frame_count = 0;
        self.retry_count = 0;
        self.event_count = 0;
        self.sole_master = false;
        self.master_state = MasterState::Idle;
        true
    }

    fn master_idle(&mut self, rs485: &mut Rs485Port, slot: &ReceiveSlot) -> bool {
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
        } else if self.received_valid_frame_not_for_us {
            self.received_valid_frame_not_for_us = false;
        } else if self.received_valid_frame {
            let source = self.source_address;
            let broadcast = self.destination_address == BROADCAST_ADDRESS;
            match FrameType::from_u8(self.frame_type) {
                Some(FrameType::Token) => {
                    self.received_valid_frame = false;
                    if !broadcast {
                        trace!("master {}: token from {}", self.this_station, source);
                        self.frame_count = 0;
                        self.sole_master = false;
                        self.master_state = MasterState::UseToken;
                        return true;
                    }
                }
                Some(FrameType::PollForMaster) => {
                    self.received_valid_frame = false;
                    if !broadcast {
                        self.send_short_frame(rs485, FrameType::ReplyToPollForMaster, source);
                    }
                }
                Some(FrameType::TestRequest) => {
                    self.received_valid_frame = false;
                    if !broadcast {
                        self.send_input_echo(rs485, FrameType::TestResponse, source);
                    }
                }
                Some(FrameType::BacnetDataExpectingReply) => {
                    if broadcast {
                        self.put_receive(slot);
                        self.received_valid_frame = false;
                    } else {
                        // hand the request up while the reply window runs;
                        // it stays in the input buffer for reply matching,
                        // so the frame flag is cleared once resolved
                        self.put_receive(slot);
                        self.master_state = MasterState::AnswerDataRequest;
                        return true;
                    }
                }
                Some(FrameType::BacnetDataNotExpectingReply)
                | Some(FrameType::Proprietary(_)) => {
                    if self.data_length > 0 {
                        self.put_receive(slot);
                    }
                    self.received_valid_frame = false;
                }
                _ => {
                    // Test-Response, Reply-Postponed, reserved types
                    self.received_valid_frame = false;
                }
            }
        } else if self.silence.elapsed_ms() >= TNO_TOKEN_MS {
            debug!("master {}: token lost", self.this_station);
            self.event_count = 0;
            self.master_state = MasterState::NoToken;
            return true;
        }
        false
    }

    fn master_use_token(&mut self, rs485: &mut Rs485Port, queue: &PduQueue) -> bool {
        let frame_len = queue.get_send(self.this_station, &mut self.output_buffer);
        if frame_len == 0 {
            // nothing to send this tenure
            self.frame_count = self.nmax_info_frames;
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        let frame_type = self.output_buffer[2];
        let destination = self.output_buffer[3];
        rs485.send_frame(&self.output_buffer[..frame_len]);
        MstpStatistics::count(&mut self.statistics.frames_transmitted);
        self.frame_count = self.frame_count.saturating_add(1);
        if frame_type == FrameType::BacnetDataExpectingReply.to_u8()
            && destination != BROADCAST_ADDRESS
        {
            self.master_state = MasterState::WaitForReply;
        } else {
            self.master_state = MasterState::DoneWithToken;
        }
        true
    }

    fn master_wait_for_reply(&mut self, slot: &ReceiveSlot) -> bool {
        if self.silence.elapsed_ms() >= self.reply_timeout_ms {
            warn!("master {}: reply timeout", self.this_station);
            MstpStatistics::count(&mut self.statistics.reply_timeouts);
            self.frame_count = self.nmax_info_frames;
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        if self.received_invalid_frame {
            self.received_invalid_frame = false;
            self.master_state = MasterState::DoneWithToken;
            return true;
        }
        if self.received_valid_frame_not_for_us {
            // the reply went to somebody else; rejoin the ring
            self.received_valid_frame_not_for_us = false;
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.received_valid_frame {
            match FrameType::from_u8(self.frame_type) {
                Some(FrameType::ReplyPostponed) | Some(FrameType::TestResponse) => {
                    self.received_valid_frame = false;
                    self.master_state = MasterState::DoneWithToken;
                    return true;
                }
                Some(FrameType::BacnetDataNotExpectingReply)
                | Some(FrameType::Proprietary(_)) => {
                    if self.data_length > 0 {
                        self.put_receive(slot);
                    }
                    self.received_valid_frame = false;
                    self.master_state = MasterState::DoneWithToken;
                    return true;
                }
                _ => {
                    // not a reply at all; let IDLE sort it out
                    self.master_state = MasterState::Idle;
                    return true;
                }
            }
        }
        false
    }

    fn master_done_with_token(&mut self, rs485: &mut Rs485Port) -> bool {
        let next_after_us = self.cycle_station(self.this_station);
        if self.frame_count < self.nmax_info_frames {
            self.master_state = MasterState::UseToken;
            return true;
        }
        if !self.sole_master && self.next_station == self.this_station {
            // successor unknown; find one before the token can circulate
            self.poll_station = next_after_us;
            self.send_short_frame(rs485, FrameType::PollForMaster, self.poll_station);
            self.retry_count = 0;
            self.master_state = MasterState::PollForMaster;
            return false;
        }
        if self.token_count < NPOLL - 1 {
            if self.sole_master {
                // a sole master keeps the token between maintenance polls
                self.frame_count = 0;
                self.token_count += 1;
                self.master_state = MasterState::UseToken;
                return true;
            }
            self.token_count += 1;
            self.send_short_frame(rs485, FrameType::Token, self.next_station);
            self.retry_count = 0;
            self.event_count = 0;
            self.master_state = MasterState::PassToken;
            return false;
        }
        if self.cycle_station(self.poll_station) == self.this_station {
            if self.sole_master {
                // restart the maintenance poll from our successor
                self.poll_station = self.cycle_station(self.next_station);
                self.send_short_frame(rs485, FrameType::PollForMaster, self.poll_station);
                self.next_station = self.this_station;
                self.retry_count = 0;
                self.token_count = 1;
                self.event_count = 0;
                self.master_state = MasterState::PollForMaster;
            } else {
                // the whole address range has been polled this epoch
                self.poll_station = self.this_station;
                self.token_count = 1;
                self.send_short_frame(rs485, FrameType::Token, self.next_station);
                self.retry_count = 0;
                self.event_count = 0;
                self.master_state = MasterState::PassToken;
            }
            return false;
        }
        // maintenance poll of the next candidate address
        self.poll_station = self.cycle_station(self.poll_station);
        self.send_short_frame(rs485, FrameType::PollForMaster, self.poll_station);
        self.retry_count = 0;
        self.master_state = MasterState::PollForMaster;
        false
    }

    fn master_pass_token(&mut self, rs485: &mut Rs485Port) -> bool {
        if self.silence.elapsed_ms() < self.usage_timeout_ms {
            if self.event_count > NMIN_OCTETS {
                // the successor is using the token
                self.master_state = MasterState::Idle;
                return true;
            }
            return false;
        }
        if self.retry_count < NRETRY_TOKEN {
            self.retry_count += 1;
            self.send_short_frame(rs485, FrameType::Token, self.next_station);
            self.event_count = 0;
            return false;
        }
        // the successor is gone; look for a new one after it
        debug!(
            "master {}: successor {} unresponsive",
            self.this_station, self.next_station
        );
        self.poll_station = self.cycle_station(self.next_station);
        self.send_short_frame(rs485, FrameType::PollForMaster, self.poll_station);
        self.next_station = self.this_station;
        self.retry_count = 0;
        self.token_count = 0;
        self.event_count = 0;
        self.master_state = MasterState::PollForMaster;
        false
    }

    fn master_no_token(&mut self, rs485: &mut Rs485Port) -> bool {
        let silence = self.silence.elapsed_ms();
        let my_slot = TNO_TOKEN_MS + TSLOT_MS * self.this_station as u32;
        if silence < my_slot {
            if self.event_count > NMIN_OCTETS {
                // somebody else is restoring the bus
                self.master_state = MasterState::Idle;
                return true;
            }
            return false;
        }
        let slot_end = my_slot + TSLOT_MS;
        let all_slots_end = TNO_TOKEN_MS + TSLOT_MS * (self.nmax_master as u32 + 1);
        if silence < slot_end || silence > all_slots_end {
            // our claim slot, or every station ahead of us stayed silent
            debug!("master {}: generating token", self.this_station);
            self.poll_station = self.cycle_station(self.this_station);
            self.send_short_frame(rs485, FrameType::PollForMaster, self.poll_station);
            self.next_station = self.this_station;
            self.token_count = 0;
            self.retry_count = 0;
            self.event_count = 0;
            self.master_state = MasterState::PollForMaster;
            return false;
        }
        // a lower-address station owns the current claim slot
        if self.event_count > NMIN_OCTETS {
            self.master_state = MasterState::Idle;
            return true;
        }
        false
    }

    fn master_poll_for_master(&mut self, rs485: &mut Rs485Port) -> bool {
        if self.received_valid_frame {
            if self.destination_address == self.this_station
                && self.frame_type == FrameType::ReplyToPollForMaster.to_u8()
            {
                debug!(
                    "master {}: successor {} answered poll",
                    self.this_station, self.source_address
                );
                self.sole_master = false;
                self.next_station = self.source_address;
                self.event_count = 0;
                self.send_short_frame(rs485, FrameType::Token, self.next_station);
                self.poll_station = self.this_station;
                self.token_count = 0;
                self.retry_count = 0;
                self.received_valid_frame = false;
                self.master_state = MasterState::PassToken;
                return false;
            }
            // unexpected frame; reprocess it from IDLE
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.silence.elapsed_ms() >= self.usage_timeout_ms || self.received_invalid_frame {
            self.received_invalid_frame = false;
            if self.sole_master {
                self.frame_count = 0;
                self.master_state = MasterState::UseToken;
                return true;
            }
            if self.next_station != self.this_station {
                // maintenance poll went unanswered; resume the ring
                self.event_count = 0;
                self.send_short_frame(rs485, FrameType::Token, self.next_station);
                self.retry_count = 0;
                self.master_state = MasterState::PassToken;
                return false;
            }
            let next_poll = self.cycle_station(self.poll_station);
            if next_poll != self.this_station {
                self.poll_station = next_poll;
                self.send_short_frame(rs485, FrameType::PollForMaster, self.poll_station);
                self.retry_count = 0;
                return false;
            }
            // polled the whole address range without an answer
            debug!("master {}: sole master", self.this_station);
            self.sole_master = true;
            self.frame_count = 0;
            self.master_state = MasterState::UseToken;
            return true;
        }
        false
    }

    fn master_answer_data_request(&mut self, rs485: &mut Rs485Port, queue: &PduQueue) -> bool {
        let source = self.source_address;
        let station = self.this_station;
        let (request, output) = self.buffers_split();
        let frame_len = queue.get_reply(request, source, station, output);
        if frame_len > 0 {
            rs485.send_frame(&self.output_buffer[..frame_len]);
            MstpStatistics::count(&mut self.statistics.frames_transmitted);
            self.received_valid_frame = false;
            self.master_state = MasterState::Idle;
            return true;
        }
        if self.silence.elapsed_ms() >= TREPLY_DELAY_MS {
            debug!("master {}: postponing reply to {}", station, source);
            self.send_short_frame(rs485, FrameType::ReplyPostponed, source);
            self.received_valid_frame = false;
            self.master_state = MasterState::Idle;
            return true;
        }
        false
    }

    /// Run one step of the slave node machine (stations 128-254).
    pub fn slave_node_fsm(&mut self, rs485: &mut Rs485Port, queue: &PduQueue, slot: &ReceiveSlot) {
        match self.master_state {
            MasterState::AnswerDataRequest => {
                let source = self.source_address;
                let station = self.this_station;
                let (request, output) = self.buffers_split();
                let frame_len = queue.get_reply(request, source, station, output);
                if frame_len > 0 {
                    rs485.send_frame(&self.output_buffer[..frame_len]);
                    MstpStatistics::count(&mut self.statistics.frames_transmitted);
                    self.received_valid_frame = false;
                    self.master_state = MasterState::Idle;
                } else if self.silence.elapsed_ms() >= TREPLY_DELAY_MS {
                    // a slave that cannot reply in time stays silent
                    self.received_valid_frame = false;
                    self.master_state = MasterState::Idle;
                }
            }
            _ => {
                self.master_state = MasterState::Idle;
                if self.received_invalid_frame {
                    self.received_invalid_frame = false;
                } else if self.received_valid_frame_not_for_us {
                    self.received_valid_frame_not_for_us = false;
                } else if self.received_valid_frame {
                    let source = self.source_address;
                    let broadcast = self.destination_address == BROADCAST_ADDRESS;
                    match FrameType::from_u8(self.frame_type) {
                        Some(FrameType::BacnetDataExpectingReply) if !broadcast => {
                            self.put_receive(slot);
                            self.master_state = MasterState::AnswerDataRequest;
                        }
                        Some(FrameType::TestRequest) if !broadcast => {
                            self.received_valid_frame = false;
                            self.send_input_echo(rs485, FrameType::TestResponse, source);
                        }
                        Some(FrameType::BacnetDataNotExpectingReply)
                        | Some(FrameType::Proprietary(_)) => {
                            if self.data_length > 0 {
                                self.put_receive(slot);
                            }
                            self.received_valid_frame = false;
                        }
                        _ => {
                            self.received_valid_frame = false;
                        }
                    }
                }
            }
        }
    }

    /// Deliver the PDU in the input buffer to the receive slot.
    fn put_receive(&mut self, slot: &ReceiveSlot) {
        let source = self.source_address;
        if slot.put(source, self.input_data()) {
            MstpStatistics::count(&mut self.statistics.packets_received);
        } else {
            warn!(
                "master {}: receive slot full, dropping PDU from {}",
                self.this_station, source
            );
            MstpStatistics::count(&mut self.statistics.packets_dropped);
        }
    }

    /// Transmit a header-only frame.
    fn send_short_frame(&mut self, rs485: &mut Rs485Port, frame_type: FrameType, destination: u8) {
        let mut wire = [0u8; HEADER_SIZE];
        let len = frame::create_frame(&mut wire, frame_type, destination, self.this_station, &[]);
        rs485.send_frame(&wire[..len]);
        MstpStatistics::count(&mut self.statistics.frames_transmitted);
    }

    /// Transmit a frame echoing the data in the input buffer.
    fn send_input_echo(&mut self, rs485: &mut Rs485Port, frame_type: FrameType, destination: u8) {
        let station = self.this_station;
        let (input, output) = self.buffers_split();
        let len = frame::create_frame(output, frame_type, destination, station, input);
        if len > 0 {
            rs485.send_frame(&self.output_buffer[..len]);
            MstpStatistics::count(&mut self.statistics.frames_transmitted);
        }
    }

    /// Next station address in the polling cycle.
    fn cycle_station(&self, station: u8) -> u8 {
        (station + 1) % (self.nmax_master + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MstpConfig;
    use crate::rs485::{LoopbackLine, SerialLine};
    use std::time::Duration;

    struct TestBus {
        port: MstpPort,
        rs485: Rs485Port,
        peer: LoopbackLine,
        queue: PduQueue,
        slot: ReceiveSlot,
    }

    impl TestBus {
        fn new(config: MstpConfig) -> Self {
            let (line, peer) = LoopbackLine::pair();
            let port = MstpPort::new(&config);
            let rs485 = Rs485Port::new(Box::new(line), port.silence.clone());
            Self {
                port,
                rs485,
                peer,
                queue: PduQueue::new(),
                slot: ReceiveSlot::new(),
            }
        }

        fn master(station: u8, max_master: u8) -> Self {
            Self::new(MstpConfig {
                station_address: station,
                max_master,
                ..MstpConfig::default()
            })
        }

        /// Put a frame from `source` on the wire and decode it.
        fn wire_frame(&mut self, frame_type: FrameType, destination: u8, source: u8, data: &[u8]) {
            let mut wire = [0u8; frame::MAX_FRAME_SIZE];
            let len = frame::create_frame(&mut wire, frame_type, destination, source, data);
            self.peer.write_all(&wire[..len]).unwrap();
            while !self.port.frame_event() {
                self.rs485.check_uart_data(&mut self.port);
                self.port.receive_frame_fsm();
                if !self.rs485.data_pending(&self.port) && !self.port.frame_event() {
                    panic!("wire frame did not produce an event");
                }
            }
        }

        fn run_master(&mut self) {
            while self
                .port
                .master_node_fsm(&mut self.rs485, &self.queue, &self.slot)
            {}
        }

        /// Everything the station transmitted since the last call.
        fn transmitted(&mut self) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let n = self.peer.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        }
    }

    /// Split a capture into frames using the length field.
    fn frames_of(mut wire: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while wire.len() >= HEADER_SIZE {
            let length = ((wire[5] as usize) << 8) | wire[6] as usize;
            let total = HEADER_SIZE + if length > 0 { length + 2 } else { 0 };
            frames.push(wire[..total].to_vec());
            wire = &wire[total..];
        }
        frames
    }

    fn der_request(invoke_id: u8, service: u8) -> Vec<u8> {
        vec![0x01, 0x04, 0x00, 0x05, invoke_id, service]
    }

    fn simple_ack(invoke_id: u8, service: u8) -> Vec<u8> {
        vec![0x01, 0x00, 0x20, invoke_id, service]
    }

    #[test]
    fn test_initialize_reaches_idle() {
        let mut bus = TestBus::master(1, 127);
        assert!(bus.port.master_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot));
        assert_eq!(bus.port.master_state, MasterState::Idle);
        assert_eq!(bus.port.next_station, 1);
    }

    #[test]
    fn test_token_triggers_queued_transmission() {
        let mut bus = TestBus::master(1, 3);
        bus.run_master(); // initialize
        bus.queue.push(2, &simple_ack(9, 12));

        bus.wire_frame(FrameType::Token, 1, 0, &[]);
        bus.run_master();

        let frames = frames_of(&bus.transmitted());
        assert!(!frames.is_empty());
        let data = &frames[0];
        assert_eq!(data[2], FrameType::BacnetDataNotExpectingReply.to_u8());
        assert_eq!(data[3], 2);
        assert_eq!(data[4], 1);
        assert!(bus.port.statistics.frames_transmitted >= 1);
    }

    #[test]
    fn test_poll_for_master_is_answered() {
        let mut bus = TestBus::master(5, 127);
        bus.run_master();

        bus.wire_frame(FrameType::PollForMaster, 5, 0, &[]);
        bus.run_master();

        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::ReplyToPollForMaster.to_u8());
        assert_eq!(frames[0][3], 0);
        assert_eq!(frames[0][4], 5);
        assert_eq!(bus.port.master_state, MasterState::Idle);
    }

    #[test]
    fn test_der_with_matching_reply() {
        let mut bus = TestBus::master(1, 127);
        bus.run_master();
        bus.queue.push(3, &simple_ack(0x42, 0x0F));

        bus.wire_frame(
            FrameType::BacnetDataExpectingReply,
            1,
            3,
            &der_request(0x42, 0x0F),
        );
        bus.run_master();

        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::BacnetDataNotExpectingReply.to_u8());
        assert_eq!(frames[0][3], 3);
        assert_eq!(bus.port.master_state, MasterState::Idle);
        assert!(bus.queue.is_empty());
    }

    #[test]
    fn test_der_without_reply_postpones() {
        let mut bus = TestBus::master(1, 127);
        bus.run_master();

        bus.wire_frame(
            FrameType::BacnetDataExpectingReply,
            1,
            3,
            &der_request(0x42, 0x0F),
        );
        bus.run_master();
        assert_eq!(bus.port.master_state, MasterState::AnswerDataRequest);
        assert!(bus.transmitted().is_empty());

        std::thread::sleep(Duration::from_millis(TREPLY_DELAY_MS as u64 + 20));
        bus.run_master();

        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::ReplyPostponed.to_u8());
        assert_eq!(frames[0][3], 3);
        assert_eq!(frames[0][5], 0);
        assert_eq!(frames[0][6], 0);
        assert_eq!(bus.port.master_state, MasterState::Idle);
    }

    #[test]
    fn test_der_transmission_waits_for_reply() {
        let mut bus = TestBus::master(1, 3);
        bus.run_master();
        bus.queue.push(2, &der_request(0x07, 0x0C));

        bus.wire_frame(FrameType::Token, 1, 0, &[]);
        bus.run_master();
        assert_eq!(bus.port.master_state, MasterState::WaitForReply);

        bus.wire_frame(
            FrameType::BacnetDataNotExpectingReply,
            1,
            2,
            &simple_ack(0x07, 0x0C),
        );
        bus.run_master();

        let (address, pdu) = bus.slot.take(Duration::from_millis(10)).unwrap();
        assert_eq!(address.mstp_station(), Some(2));
        assert_eq!(pdu, simple_ack(0x07, 0x0C));
    }

    #[test]
    fn test_reply_timeout_gives_up_token() {
        let mut bus = TestBus::master(1, 3);
        bus.run_master();
        bus.queue.push(2, &der_request(0x07, 0x0C));

        bus.wire_frame(FrameType::Token, 1, 0, &[]);
        bus.run_master();
        assert_eq!(bus.port.master_state, MasterState::WaitForReply);
        bus.transmitted();

        std::thread::sleep(Duration::from_millis(
            bus.port.reply_timeout_ms as u64 + 20,
        ));
        bus.run_master();

        assert_eq!(bus.port.statistics.reply_timeouts, 1);
        assert_ne!(bus.port.master_state, MasterState::WaitForReply);
    }

    #[test]
    fn test_test_request_is_echoed() {
        let mut bus = TestBus::master(1, 127);
        bus.run_master();

        bus.wire_frame(FrameType::TestRequest, 1, 9, &[0xDE, 0xAD]);
        bus.run_master();

        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::TestResponse.to_u8());
        assert_eq!(frames[0][3], 9);
        assert_eq!(&frames[0][HEADER_SIZE..HEADER_SIZE + 2], &[0xDE, 0xAD]);
    }

    #[test]
    fn test_solo_master_boot_and_broadcast() {
        let mut bus = TestBus::master(0, 1);
        bus.run_master();
        assert_eq!(bus.port.master_state, MasterState::Idle);

        // dead bus: the token is declared lost, our claim slot passes
        std::thread::sleep(Duration::from_millis(
            (TNO_TOKEN_MS + TSLOT_MS * 2 + 30) as u64,
        ));
        bus.run_master();
        assert_eq!(bus.port.master_state, MasterState::PollForMaster);
        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::PollForMaster.to_u8());
        assert_eq!(frames[0][3], 1);

        // no reply within Tusage_timeout; the poll wraps to us
        std::thread::sleep(Duration::from_millis(bus.port.usage_timeout_ms as u64 + 10));
        let pdu = [0x01u8, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08];
        bus.queue.push(BROADCAST_ADDRESS, &pdu);
        bus.run_master();

        assert!(bus.port.sole_master);
        let frames = frames_of(&bus.transmitted());
        let data: Vec<_> = frames
            .iter()
            .filter(|f| f[2] == FrameType::BacnetDataNotExpectingReply.to_u8())
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0][3], BROADCAST_ADDRESS);
        assert_eq!(data[0][4], 0);
        assert_eq!(((data[0][5] as usize) << 8) | data[0][6] as usize, pdu.len());
        assert_eq!(&data[0][HEADER_SIZE..HEADER_SIZE + pdu.len()], &pdu);
    }

    #[test]
    fn test_single_station_ring_sole_master_keeps_token() {
        // max_master == station_address: the poll cycle wraps straight back
        // to us, so the sole master must go to UseToken without a Token or
        // Poll-For-Master on the wire
        let mut bus = TestBus::master(0, 0);
        bus.run_master();
        bus.port.sole_master = true;
        bus.port.next_station = 0;
        bus.port.frame_count = bus.port.nmax_info_frames;
        bus.port.token_count = 0;
        bus.port.master_state = MasterState::DoneWithToken;

        assert!(bus.port.master_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot));
        assert_eq!(bus.port.master_state, MasterState::UseToken);
        assert_eq!(bus.port.token_count, 1);
        assert!(bus.transmitted().is_empty());
    }

    #[test]
    fn test_poll_reply_passes_token_to_new_master() {
        let mut bus = TestBus::master(0, 1);
        bus.run_master();
        std::thread::sleep(Duration::from_millis(
            (TNO_TOKEN_MS + TSLOT_MS * 2 + 30) as u64,
        ));
        bus.run_master();
        assert_eq!(bus.port.master_state, MasterState::PollForMaster);
        bus.transmitted();

        bus.wire_frame(FrameType::ReplyToPollForMaster, 0, 1, &[]);
        bus.run_master();

        assert_eq!(bus.port.next_station, 1);
        assert!(!bus.port.sole_master);
        assert_eq!(bus.port.master_state, MasterState::PassToken);
        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::Token.to_u8());
        assert_eq!(frames[0][3], 1);
    }

    #[test]
    fn test_slave_answers_matching_der() {
        let mut bus = TestBus::new(MstpConfig {
            station_address: 200,
            ..MstpConfig::default()
        });
        bus.queue.push(3, &simple_ack(0x42, 0x0F));

        bus.wire_frame(
            FrameType::BacnetDataExpectingReply,
            200,
            3,
            &der_request(0x42, 0x0F),
        );
        bus.port.slave_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot);
        assert_eq!(bus.port.master_state, MasterState::AnswerDataRequest);
        bus.port.slave_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot);

        let frames = frames_of(&bus.transmitted());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][2], FrameType::BacnetDataNotExpectingReply.to_u8());
        assert_eq!(frames[0][4], 200);
        assert_eq!(bus.port.master_state, MasterState::Idle);
    }

    #[test]
    fn test_slave_stays_silent_without_reply() {
        let mut bus = TestBus::new(MstpConfig {
            station_address: 200,
            ..MstpConfig::default()
        });

        bus.wire_frame(
            FrameType::BacnetDataExpectingReply,
            200,
            3,
            &der_request(0x42, 0x0F),
        );
        bus.port.slave_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot);
        std::thread::sleep(Duration::from_millis(TREPLY_DELAY_MS as u64 + 20));
        bus.port.slave_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot);

        assert!(bus.transmitted().is_empty());
        assert_eq!(bus.port.master_state, MasterState::Idle);
    }

    #[test]
    fn test_slave_never_reacts_to_token() {
        let mut bus = TestBus::new(MstpConfig {
            station_address: 200,
            ..MstpConfig::default()
        });
        bus.wire_frame(FrameType::Token, 200, 3, &[]);
        bus.port.slave_node_fsm(&mut bus.rs485, &bus.queue, &bus.slot);
        assert!(bus.transmitted().is_empty());
        assert_eq!(bus.port.master_state, MasterState::Idle);
    }
}
