//! MS/TP Datalink Port Glue
//!
//! [`MstpDataLink`] wires the pieces together and is the surface the BACnet
//! network layer consumes: best-effort `send_pdu`, blocking `receive` with a
//! timeout, and address/configuration accessors.
//!
//! # Tasks
//!
//! Opening a port spawns two threads over one shared bus state:
//!
//! - the **receive task** pumps UART octets through the receive state
//!   machine one at a time and signals a condition variable whenever a
//!   completed-frame event is raised;
//! - the **master task** waits for that signal or for the timeout relevant
//!   to the current master state (`Tno_token` in IDLE, `Treply_timeout` in
//!   WAIT_FOR_REPLY, `Tusage_timeout` in POLL_FOR_MASTER, a short tick
//!   otherwise), then drives the master or slave machine until it stops
//!   reporting immediate transitions.
//!
//! The upper layer never touches the bus state: `send_pdu` talks to the PDU
//! ring, `receive` to the receive slot, and the setters post
//! [`ConfigCommand`]s the master task applies between invocations.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::address::{is_master_station, BacnetAddress};
use crate::frame::BROADCAST_ADDRESS;
use crate::master::{MasterState, TNO_TOKEN_MS};
use crate::port::{ConfigCommand, MstpConfig, MstpPort, MstpStatistics};
use crate::queue::{PduQueue, ReceiveSlot};
use crate::rs485::{valid_baud_rate, Rs485Port, SerialLine, TtyLine};

/// Result type for datalink operations.
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Longest `receive` will block, regardless of the requested timeout.
const RECEIVE_TIMEOUT_CAP_MS: u32 = 1000;

/// Idle tick of the master task when no protocol timeout is closer.
const MASTER_TASK_TICK_MS: u64 = 5;

/// Errors that can occur while operating the datalink.
#[derive(Debug)]
pub enum DataLinkError {
    /// The serial device could not be opened or configured.
    Io(io::Error),
}

impl fmt::Display for DataLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLinkError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for DataLinkError {}

impl From<io::Error> for DataLinkError {
    fn from(e: io::Error) -> Self {
        DataLinkError::Io(e)
    }
}

/// Everything the two tasks share.
struct Shared {
    state: Mutex<Bus>,
    frame_signal: Condvar,
    queue: PduQueue,
    slot: ReceiveSlot,
    running: AtomicBool,
}

/// The bus state both state machines operate on.
struct Bus {
    port: MstpPort,
    rs485: Rs485Port,
}

/// One MS/TP datalink port.
pub struct MstpDataLink {
    shared: Arc<Shared>,
    config: Mutex<MstpConfig>,
    commands: Sender<ConfigCommand>,
    receive_task: Option<JoinHandle<()>>,
    master_task: Option<JoinHandle<()>>,
}

impl MstpDataLink {
    /// Open a serial device and start the port tasks.
    pub fn open(port_name: &str, config: MstpConfig) -> Result<Self> {
        let line = TtyLine::open(port_name, config.baud_rate)?;
        Ok(Self::with_line(Box::new(line), config))
    }

    /// Start a port over an already constructed line. This is how tests run
    /// a bus in memory and how platforms with exotic transceivers plug in.
    pub fn with_line(line: Box<dyn SerialLine>, config: MstpConfig) -> Self {
        let port = MstpPort::new(&config);
        let rs485 = Rs485Port::new(line, port.silence.clone());
        let shared = Arc::new(Shared {
            state: Mutex::new(Bus { port, rs485 }),
            frame_signal: Condvar::new(),
            queue: PduQueue::new(),
            slot: ReceiveSlot::new(),
            running: AtomicBool::new(true),
        });
        let (commands, command_feed) = channel();

        info!(
            "MS/TP: station {} max_master {} max_info_frames {}",
            config.station_address, config.max_master, config.max_info_frames
        );
        let receive_task = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mstp-receive".into())
                .spawn(move || receive_fsm_task(shared))
                .expect("spawn receive task")
        };
        let master_task = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mstp-master".into())
                .spawn(move || master_fsm_task(shared, command_feed))
                .expect("spawn master task")
        };

        Self {
            shared,
            config: Mutex::new(config),
            commands,
            receive_task: Some(receive_task),
            master_task: Some(master_task),
        }
    }

    /// Queue a PDU for transmission.
    ///
    /// Returns the number of octets accepted, or 0 when the outbound ring
    /// is full; the caller retries at its own cadence. Never blocks. The
    /// destination's MS/TP MAC is taken from the address; anything without
    /// a one-octet MAC is treated as the local broadcast.
    pub fn send_pdu(&self, dest: &BacnetAddress, pdu: &[u8]) -> usize {
        let station = dest.mstp_station().unwrap_or(BROADCAST_ADDRESS);
        self.shared.queue.push(station, pdu)
    }

    /// Wait up to `timeout_ms` (capped at 1000 ms) for an application PDU.
    ///
    /// On success the PDU is copied into `pdu` (truncated to its length),
    /// the source address into `src`, and the PDU length returned. Returns
    /// 0 on timeout.
    pub fn receive(
        &self,
        src: Option<&mut BacnetAddress>,
        pdu: &mut [u8],
        timeout_ms: u32,
    ) -> usize {
        let timeout_ms = if timeout_ms > RECEIVE_TIMEOUT_CAP_MS {
            warn!(
                "MS/TP: limited receive timeout of {}ms to {}ms",
                timeout_ms, RECEIVE_TIMEOUT_CAP_MS
            );
            RECEIVE_TIMEOUT_CAP_MS
        } else {
            timeout_ms
        };
        let Some((address, data)) = self
            .shared
            .slot
            .take(Duration::from_millis(timeout_ms as u64))
        else {
            return 0;
        };
        let n = data.len().min(pdu.len());
        pdu[..n].copy_from_slice(&data[..n]);
        if let Some(src) = src {
            *src = address;
        }
        n
    }

    /// Set this station's MAC address (0-254). Out-of-range values are
    /// ignored. Takes effect at the master task's next pass.
    pub fn set_mac_address(&self, mac: u8) {
        if mac < BROADCAST_ADDRESS {
            let mut config = self.config.lock().unwrap();
            config.station_address = mac;
            if is_master_station(mac) && mac > config.max_master {
                config.max_master = mac;
            }
            let _ = self.commands.send(ConfigCommand::SetMacAddress(mac));
        }
    }

    pub fn mac_address(&self) -> u8 {
        self.config.lock().unwrap().station_address
    }

    /// Set the highest master address polled for (0-127, and never below
    /// this station's address). Out-of-range values are ignored.
    pub fn set_max_master(&self, max_master: u8) {
        let mut config = self.config.lock().unwrap();
        if max_master <= 127 && config.station_address <= max_master {
            config.max_master = max_master;
            let _ = self.commands.send(ConfigCommand::SetMaxMaster(max_master));
        }
    }

    pub fn max_master(&self) -> u8 {
        self.config.lock().unwrap().max_master
    }

    /// Set how many frames may be sent per token tenure (>= 1).
    pub fn set_max_info_frames(&self, frames: u8) {
        if frames >= 1 {
            self.config.lock().unwrap().max_info_frames = frames;
            let _ = self.commands.send(ConfigCommand::SetMaxInfoFrames(frames));
        }
    }

    pub fn max_info_frames(&self) -> u8 {
        self.config.lock().unwrap().max_info_frames
    }

    /// Set the line rate. Rates outside the MS/TP set are ignored.
    pub fn set_baud_rate(&self, baud: u32) {
        if valid_baud_rate(baud) {
            self.config.lock().unwrap().baud_rate = baud;
            let _ = self.commands.send(ConfigCommand::SetBaudRate(baud));
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.config.lock().unwrap().baud_rate
    }

    /// Set the reply timeout (255-300 ms). Out-of-range values are ignored.
    pub fn set_reply_timeout(&self, ms: u32) {
        if (255..=300).contains(&ms) {
            self.config.lock().unwrap().reply_timeout_ms = ms;
            let _ = self.commands.send(ConfigCommand::SetReplyTimeout(ms));
        }
    }

    /// Set the token/poll usage timeout (20-100 ms). Out-of-range values
    /// are ignored.
    pub fn set_usage_timeout(&self, ms: u32) {
        if (20..=100).contains(&ms) {
            self.config.lock().unwrap().usage_timeout_ms = ms;
            let _ = self.commands.send(ConfigCommand::SetUsageTimeout(ms));
        }
    }

    /// This station's BACnet address.
    pub fn my_address(&self) -> BacnetAddress {
        BacnetAddress::from_mstp_station(self.mac_address())
    }

    /// The local broadcast BACnet address.
    pub fn broadcast_address() -> BacnetAddress {
        BacnetAddress::mstp_broadcast()
    }

    /// A snapshot of the port counters.
    pub fn statistics(&self) -> MstpStatistics {
        self.shared.state.lock().unwrap().port.statistics
    }
}

impl Drop for MstpDataLink {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.frame_signal.notify_all();
        if let Some(task) = self.receive_task.take() {
            let _ = task.join();
        }
        if let Some(task) = self.master_task.take() {
            let _ = task.join();
        }
    }
}

/// Tight loop feeding UART octets to the receive machine.
///
/// The machine is only pumped while no completed-frame event is pending;
/// the frame (and the input buffer it refers to) must survive untouched
/// until the master task has consumed it.
fn receive_fsm_task(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        {
            let mut guard = shared.state.lock().unwrap();
            let bus = &mut *guard;
            if !bus.port.frame_event() {
                loop {
                    bus.rs485.check_uart_data(&mut bus.port);
                    bus.port.receive_frame_fsm();
                    if bus.port.frame_event() {
                        shared.frame_signal.notify_all();
                        break;
                    }
                    if !bus.rs485.data_pending(&bus.port) {
                        break;
                    }
                }
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drives the master (or slave) machine off frame events and timeouts.
fn master_fsm_task(shared: Arc<Shared>, commands: Receiver<ConfigCommand>) {
    let mut guard = shared.state.lock().unwrap();
    while shared.running.load(Ordering::SeqCst) {
        {
            let bus = &mut *guard;
            for command in commands.try_iter() {
                match command {
                    ConfigCommand::SetBaudRate(baud) => bus.rs485.set_baud(baud),
                    other => bus.port.apply(other),
                }
            }
            // the peer task may be between passes; keep octets flowing
            if !bus.port.frame_event() {
                bus.rs485.check_uart_data(&mut bus.port);
                bus.port.receive_frame_fsm();
            }
            let silence = bus.port.silence.elapsed_ms();
            let run_master = bus.port.frame_event()
                || match bus.port.master_state {
                    MasterState::Idle => silence >= TNO_TOKEN_MS,
                    MasterState::WaitForReply => silence >= bus.port.reply_timeout_ms,
                    MasterState::PollForMaster => silence >= bus.port.usage_timeout_ms,
                    _ => true,
                };
            if run_master {
                let station = bus.port.this_station();
                if is_master_station(station) {
                    while bus
                        .port
                        .master_node_fsm(&mut bus.rs485, &shared.queue, &shared.slot)
                    {}
                } else if station < BROADCAST_ADDRESS {
                    bus.port.slave_node_fsm(&mut bus.rs485, &shared.queue, &shared.slot);
                }
            }
        }
        let (next, _) = shared
            .frame_signal
            .wait_timeout(guard, Duration::from_millis(MASTER_TASK_TICK_MS))
            .unwrap();
        guard = next;
    }
}
