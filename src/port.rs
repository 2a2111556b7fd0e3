//! MS/TP Port State
//!
//! One [`MstpPort`] exists per bus. It gathers everything the two state
//! machines share: station identity, token-passing bookkeeping, the frame
//! decode scratch registers, the input and output buffers, and the silence
//! timer. The receive task and the master task both operate on the port
//! behind the datalink's lock; nothing here is synchronized on its own
//! except the silence timer, which the RS-485 transmit path also touches.

use crate::frame;
use crate::master::MasterState;
use crate::receive::ReceiveState;
use crate::timer::SilenceTimer;

/// Data octets one frame can carry, and so the size of the input buffer.
pub const INPUT_BUFFER_SIZE: usize = frame::MAX_DATA_LENGTH;

/// The output buffer holds a fully framed PDU.
pub const OUTPUT_BUFFER_SIZE: usize = frame::MAX_FRAME_SIZE;

/// Port configuration.
///
/// `station_address` 0-127 makes the port a master node, 128-254 a slave
/// node. `max_master` bounds the poll-for-master search; `max_info_frames`
/// is how many queued PDUs may be sent per token tenure.
#[derive(Debug, Clone)]
pub struct MstpConfig {
    /// This station's MAC address (0-254)
    pub station_address: u8,
    /// Highest master address polled for (0-127)
    pub max_master: u8,
    /// Frames transmitted per token tenure (>= 1)
    pub max_info_frames: u8,
    /// Line rate; one of [`crate::rs485::BAUD_RATES`]
    pub baud_rate: u32,
    /// Silence after a Data-Expecting-Reply before giving up (255-300 ms)
    pub reply_timeout_ms: u32,
    /// Silence after a Token or Poll-For-Master before assuming no taker
    /// (20-100 ms)
    pub usage_timeout_ms: u32,
}

impl Default for MstpConfig {
    fn default() -> Self {
        Self {
            station_address: 1,
            max_master: 127,
            max_info_frames: 1,
            baud_rate: 38400,
            reply_timeout_ms: 255,
            usage_timeout_ms: 50,
        }
    }
}

/// Reconfiguration requests posted by the upper layer.
///
/// Setters do not touch the port directly; the master task drains these
/// between state machine invocations, so a reconfiguration never races a
/// frame in flight. Out-of-range values have already been discarded at the
/// setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCommand {
    SetMacAddress(u8),
    SetMaxMaster(u8),
    SetMaxInfoFrames(u8),
    SetBaudRate(u32),
    SetReplyTimeout(u32),
    SetUsageTimeout(u32),
}

/// Running counters for the port. All counters saturate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MstpStatistics {
    /// Application PDUs handed to the upper layer
    pub packets_received: u64,
    /// Application PDUs lost because the receive slot was still occupied
    pub packets_dropped: u64,
    /// Frames rejected by the receive state machine
    pub invalid_frames: u64,
    /// Frames put on the wire
    pub frames_transmitted: u64,
    /// Data-Expecting-Reply transmissions that saw no reply in time
    pub reply_timeouts: u64,
}

impl MstpStatistics {
    pub(crate) fn count(counter: &mut u64) {
        *counter = counter.saturating_add(1);
    }
}

/// The state shared by the receive and master state machines of one bus.
pub struct MstpPort {
    // identity
    pub(crate) this_station: u8,
    pub(crate) nmax_master: u8,
    pub(crate) nmax_info_frames: u8,
    pub(crate) reply_timeout_ms: u32,
    pub(crate) usage_timeout_ms: u32,

    // token-passing state
    pub(crate) master_state: MasterState,
    pub(crate) next_station: u8,
    pub(crate) poll_station: u8,
    pub(crate) token_count: u8,
    pub(crate) frame_count: u8,
    pub(crate) retry_count: u8,
    pub(crate) event_count: u16,
    pub(crate) sole_master: bool,

    // receive machine state and completed-frame events
    pub(crate) receive_state: ReceiveState,
    pub(crate) received_valid_frame: bool,
    pub(crate) received_valid_frame_not_for_us: bool,
    pub(crate) received_invalid_frame: bool,

    // frame decode scratch
    pub(crate) frame_type: u8,
    pub(crate) destination_address: u8,
    pub(crate) source_address: u8,
    pub(crate) data_length: u16,
    pub(crate) header_crc: u8,
    pub(crate) data_crc: u16,
    pub(crate) index: u16,

    // one-octet handoff from the UART pump
    pub(crate) data_available: bool,
    pub(crate) data_register: u8,

    pub(crate) input_buffer: [u8; INPUT_BUFFER_SIZE],
    pub(crate) output_buffer: [u8; OUTPUT_BUFFER_SIZE],

    pub(crate) silence: SilenceTimer,
    pub(crate) statistics: MstpStatistics,
}

impl MstpPort {
    pub fn new(config: &MstpConfig) -> Self {
        Self {
            this_station: config.station_address,
            nmax_master: config.max_master,
            nmax_info_frames: config.max_info_frames.max(1),
            reply_timeout_ms: config.reply_timeout_ms,
            usage_timeout_ms: config.usage_timeout_ms,
            master_state: MasterState::Initialize,
            next_station: config.station_address,
            poll_station: config.station_address,
            token_count: 0,
            frame_count: 0,
            retry_count: 0,
            event_count: 0,
            sole_master: false,
            receive_state: ReceiveState::Idle,
            received_valid_frame: false,
            received_valid_frame_not_for_us: false,
            received_invalid_frame: false,
            frame_type: 0,
            destination_address: 0,
            source_address: 0,
            data_length: 0,
            header_crc: 0,
            data_crc: 0,
            index: 0,
            data_available: false,
            data_register: 0,
            input_buffer: [0; INPUT_BUFFER_SIZE],
            output_buffer: [0; OUTPUT_BUFFER_SIZE],
            silence: SilenceTimer::new(),
            statistics: MstpStatistics::default(),
        }
    }

    /// This station's MAC address.
    pub fn this_station(&self) -> u8 {
        self.this_station
    }

    /// True when any completed-frame event is waiting for the master machine.
    pub(crate) fn frame_event(&self) -> bool {
        self.received_valid_frame
            || self.received_valid_frame_not_for_us
            || self.received_invalid_frame
    }

    /// The data octets of the frame currently held in the input buffer.
    pub(crate) fn input_data(&self) -> &[u8] {
        let len = (self.data_length as usize).min(INPUT_BUFFER_SIZE);
        &self.input_buffer[..len]
    }

    /// The received frame's data octets alongside the writable output
    /// buffer, for building a frame out of what was just received.
    pub(crate) fn buffers_split(&mut self) -> (&[u8], &mut [u8]) {
        let len = (self.data_length as usize).min(INPUT_BUFFER_SIZE);
        (&self.input_buffer[..len], &mut self.output_buffer[..])
    }

    /// Apply a reconfiguration between state machine invocations.
    ///
    /// The interlocks mirror the datalink setter rules: the MAC must stay a
    /// valid station address and `max_master` can never exclude this
    /// station.
    pub(crate) fn apply(&mut self, command: ConfigCommand) {
        match command {
            ConfigCommand::SetMacAddress(mac) => {
                if mac < frame::BROADCAST_ADDRESS {
                    self.this_station = mac;
                    if crate::address::is_master_station(mac) && mac > self.nmax_master {
                        self.nmax_master = mac;
                    }
                }
            }
            ConfigCommand::SetMaxMaster(max_master) => {
                if max_master <= 127 && self.this_station <= max_master {
                    self.nmax_master = max_master;
                }
            }
            ConfigCommand::SetMaxInfoFrames(frames) => {
                if frames >= 1 {
                    self.nmax_info_frames = frames;
                }
            }
            ConfigCommand::SetReplyTimeout(ms) => {
                self.reply_timeout_ms = ms;
            }
            ConfigCommand::SetUsageTimeout(ms) => {
                self.usage_timeout_ms = ms;
            }
            // the line rate belongs to the RS-485 interface; handled there
            ConfigCommand::SetBaudRate(_) => {}
        }
    }
}
