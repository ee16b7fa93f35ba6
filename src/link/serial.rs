// Serial link to the rig's microcontroller bridge
//
// Line protocol, newline terminated in both directions:
//   host -> rig: `b<byte>` brake command, `m<speed>` motor command
//   rig -> host: `enc <e1> <e2>`, `brake <byte>`, `motor <speed>`

use serialport::{self, SerialPort};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Link, LinkError, Result, WriteSchedule};
use crate::messages::{Command, Packet};

/// Default serial configuration for the bridge
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 10;

/// Longest telemetry line accepted before the buffer is discarded
const MAX_LINE_LEN: usize = 256;

pub struct SerialLink {
    port: Box<dyn SerialPort>,
    opened_at: Instant,
    schedule: WriteSchedule,
    line_buf: Vec<u8>,
    pending: VecDeque<Packet>,
    open: bool,
}

impl SerialLink {
    /// Open a new connection to the rig
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening rig link on {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            port,
            opened_at: Instant::now(),
            schedule: WriteSchedule::new(),
            line_buf: Vec::with_capacity(MAX_LINE_LEN),
            pending: VecDeque::new(),
            open: true,
        })
    }

    fn elapsed(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    /// Send a command immediately
    fn send_command(&mut self, command: Command) -> Result<()> {
        debug!("Sending {}", command);
        self.port.write_all(format!("{}\n", command).as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Release queued writes whose pauses have elapsed
    fn pump_writes(&mut self) -> Result<()> {
        for command in self.schedule.due(self.elapsed()) {
            self.send_command(command)?;
        }
        Ok(())
    }

    /// Read whatever bytes are waiting and split them into packets
    fn fill_pending(&mut self) -> Result<()> {
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(());
        }

        let mut chunk = vec![0u8; available];
        let n = self.port.read(&mut chunk)?;
        let timestamp = self.elapsed();

        for &byte in &chunk[..n] {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.line_buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        self.pending.push_back(Packet::parse_line(line, timestamp));
                    }
                    self.line_buf.clear();
                }
                b'\r' => {}
                _ if self.line_buf.len() >= MAX_LINE_LEN => {
                    warn!("Discarding overlong telemetry line");
                    self.line_buf.clear();
                }
                _ => self.line_buf.push(byte),
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Packet>> {
        self.pump_writes()?;
        if self.pending.is_empty() {
            self.fill_pending()?;
        }
        Ok(self.pending.pop_front())
    }
}

impl Link for SerialLink {
    fn ok(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> Result<Option<Packet>> {
        if !self.open {
            return Ok(None);
        }
        match self.poll() {
            Ok(packet) => Ok(packet),
            Err(LinkError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => {
                // Disconnected: further reads report not-ok
                self.open = false;
                Err(e)
            }
        }
    }

    fn write(&mut self, command: Command) {
        self.schedule.push_command(command);
    }

    fn write_and_wait(&mut self, seconds: f64) {
        self.schedule.push_pause(seconds);
    }

    fn stop(&mut self) {
        if !self.open {
            return;
        }
        self.schedule.clear();
        for command in [Command::Motor(0), Command::Brake(0)] {
            if let Err(e) = self.send_command(command) {
                warn!("Failed to idle rig on stop: {}", e);
            }
        }
        self.open = false;
        info!("Rig link closed");
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        // Try to idle the rig when the link is dropped (safety measure)
        self.stop();
    }
}
