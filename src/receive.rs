//! Receive Frame State Machine
//!
//! A byte-paced decoder that turns the octet stream from the RS-485 line
//! into completed-frame events. Each invocation consumes at most one octet
//! from the port's data register, so a host with no background thread can
//! pump it cooperatively, and the surrounding loop can yield between octets.
//!
//! The machine keeps two running CRCs as octets arrive: the 8-bit header
//! CRC (valid when the accumulator lands on 0x55 after the check octet) and
//! the 16-bit data CRC (valid on 0xF0B8). Frames whose declared length
//! exceeds the input buffer are consumed in SKIP_DATA and reported invalid
//! without ever touching memory past the buffer.
//!
//! Completed frames raise exactly one of three events on the port:
//! `ReceivedValidFrame` (addressed to this station or broadcast),
//! `ReceivedValidFrameNotForUs`, or `ReceivedInvalidFrame`.

use log::trace;

use crate::crc::{crc_calc_data, crc_calc_header, DATA_CRC_RESIDUE, HEADER_CRC_RESIDUE};
use crate::frame::{BROADCAST_ADDRESS, PREAMBLE_55, PREAMBLE_FF};
use crate::port::{MstpPort, MstpStatistics, INPUT_BUFFER_SIZE};

/// Maximum silence between octets of one frame before it is abandoned.
pub const TFRAME_ABORT_MS: u32 = 60;

/// Receive machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    Preamble,
    Header,
    HeaderCrc,
    Data,
    DataCrc,
    SkipData,
}

impl MstpPort {
    /// Run the receive machine over at most one octet.
    ///
    /// Call after `check_uart_data` has (possibly) loaded the data register;
    /// safe to call with nothing pending, which is when the inter-octet
    /// abort fires.
    pub fn receive_frame_fsm(&mut self) {
        if !self.data_available {
            // inter-octet timeout mid-frame
            if self.receive_state != ReceiveState::Idle
                && self.silence.elapsed_ms() >= TFRAME_ABORT_MS
            {
                trace!("receive: inter-octet timeout in {:?}", self.receive_state);
                self.invalid_frame();
            }
            return;
        }

        let octet = self.data_register;
        self.data_available = false;
        self.silence.reset();
        self.event_count = self.event_count.saturating_add(1);

        match self.receive_state {
            ReceiveState::Idle => {
                if octet == PREAMBLE_55 {
                    self.receive_state = ReceiveState::Preamble;
                }
            }
            ReceiveState::Preamble => {
                if octet == PREAMBLE_FF {
                    self.header_crc = 0xFF;
                    self.index = 0;
                    self.receive_state = ReceiveState::Header;
                } else if octet != PREAMBLE_55 {
                    // a repeated 0x55 keeps the preamble window open
                    self.receive_state = ReceiveState::Idle;
                }
            }
            ReceiveState::Header => {
                self.header_crc = crc_calc_header(octet, self.header_crc);
                match self.index {
                    0 => self.frame_type = octet,
                    1 => self.destination_address = octet,
                    2 => self.source_address = octet,
                    3 => self.data_length = (octet as u16) << 8,
                    _ => {
                        self.data_length |= octet as u16;
                        self.receive_state = ReceiveState::HeaderCrc;
                    }
                }
                self.index += 1;
            }
            ReceiveState::HeaderCrc => {
                self.header_crc = crc_calc_header(octet, self.header_crc);
                if self.header_crc != HEADER_CRC_RESIDUE {
                    self.invalid_frame();
                } else if self.data_length == 0 {
                    self.complete_frame();
                } else {
                    self.data_crc = 0xFFFF;
                    self.index = 0;
                    self.receive_state = if self.data_length as usize <= INPUT_BUFFER_SIZE {
                        ReceiveState::Data
                    } else {
                        ReceiveState::SkipData
                    };
                }
            }
            ReceiveState::Data | ReceiveState::SkipData => {
                if self.receive_state == ReceiveState::Data {
                    self.input_buffer[self.index as usize] = octet;
                }
                self.data_crc = crc_calc_data(octet, self.data_crc);
                self.index += 1;
                if self.index == self.data_length {
                    self.index = 0;
                    self.receive_state = ReceiveState::DataCrc;
                }
            }
            ReceiveState::DataCrc => {
                self.data_crc = crc_calc_data(octet, self.data_crc);
                self.index += 1;
                if self.index == 2 {
                    if self.data_length as usize > INPUT_BUFFER_SIZE {
                        // frame was skipped, nothing to deliver
                        self.invalid_frame();
                    } else if self.data_crc == DATA_CRC_RESIDUE {
                        self.complete_frame();
                    } else {
                        self.invalid_frame();
                    }
                }
            }
        }
    }

    fn complete_frame(&mut self) {
        let for_us = self.destination_address == self.this_station
            || self.destination_address == BROADCAST_ADDRESS;
        trace!(
            "receive: frame type {:#04x} dest {} src {} len {} {}",
            self.frame_type,
            self.destination_address,
            self.source_address,
            self.data_length,
            if for_us { "for us" } else { "not for us" },
        );
        if for_us {
            self.received_valid_frame = true;
        } else {
            self.received_valid_frame_not_for_us = true;
        }
        self.receive_state = ReceiveState::Idle;
    }

    fn invalid_frame(&mut self) {
        self.received_invalid_frame = true;
        MstpStatistics::count(&mut self.statistics.invalid_frames);
        self.receive_state = ReceiveState::Idle;
    }
}
