//! Serial link collaborator
//!
//! The connection manager talks to the sensor through [`PortOpener`] and
//! [`SerialSource`] so the lifecycle can be exercised without hardware.
//! [`SystemPortOpener`] is the `serialport`-backed implementation.

use std::io::{self, Read};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};
use tracing::debug;

use crate::error::ConnectionError;

/// Sensor link parameters (the device always speaks 8N1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Listener sleep when no bytes are waiting
    pub poll_interval: Duration,
    /// Deadline for a single open attempt
    pub open_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            poll_interval: Duration::from_millis(20),
            open_timeout: Duration::from_secs(5),
        }
    }
}

/// An open, poll-style byte source
pub trait SerialSource: Send {
    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` already-available bytes
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens serial sources by port name
///
/// `open` may block for a long time; callers run it on the blocking pool.
pub trait PortOpener: Send + Sync + 'static {
    fn open(
        &self,
        port: &str,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialSource>, ConnectionError>;
}

/// Opens real serial ports through the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

struct SystemSource {
    port: Box<dyn serialport::SerialPort>,
}

impl PortOpener for SystemPortOpener {
    fn open(
        &self,
        port: &str,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialSource>, ConnectionError> {
        if let Ok(ports) = list_ports() {
            debug!(
                "{} serial ports present: {:?}",
                ports.len(),
                ports.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
            );
        }

        // Zero timeout: reads never wait, the listener polls instead
        let handle = serialport::new(port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(Duration::ZERO)
            .open()
            .map_err(|e| ConnectionError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SystemSource { port: handle }))
    }
}

impl SerialSource for SystemSource {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }
}

/// A serial adapter present on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub is_usb: bool,
}

/// Enumerate serial adapters
pub fn list_ports() -> Result<Vec<PortInfo>, ConnectionError> {
    let ports = serialport::available_ports().map_err(|e| ConnectionError::Open {
        port: "*".to_string(),
        reason: e.to_string(),
    })?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (description, is_usb) = match &p.port_type {
                SerialPortType::UsbPort(usb) => (
                    usb.product
                        .clone()
                        .or_else(|| usb.manufacturer.clone())
                        .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
                    true,
                ),
                SerialPortType::PciPort => ("PCI".to_string(), false),
                SerialPortType::BluetoothPort => ("Bluetooth".to_string(), false),
                SerialPortType::Unknown => ("Unknown".to_string(), false),
            };
            PortInfo {
                name: p.port_name,
                description,
                is_usb,
            }
        })
        .collect())
}

/// Print available adapters for `--list-ports`
pub fn list_ports_formatted() {
    use colored::*;

    println!("\n{}", "=== Available Serial Ports ===".bold().cyan());

    match list_ports() {
        Ok(ports) if ports.is_empty() => println!("  {}", "No serial ports found".dimmed()),
        Ok(ports) => {
            for port in ports {
                let marker = if port.is_usb {
                    "[USB]".green()
                } else {
                    "[OTHER]".yellow()
                };
                println!("  {} {}: {}", marker, port.name, port.description);
            }
        }
        Err(e) => println!("  {} {}", "Enumeration failed:".red(), e),
    }

    println!();
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory serial doubles

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    pub enum Step {
        Data(Vec<u8>),
        Fail,
    }

    /// Replays scripted steps, then stays idle
    pub struct ScriptedSource {
        steps: VecDeque<Step>,
    }

    impl ScriptedSource {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl SerialSource for ScriptedSource {
        fn bytes_available(&mut self) -> io::Result<usize> {
            match self.steps.front() {
                Some(Step::Data(data)) => Ok(data.len()),
                Some(Step::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
                None => Ok(0),
            }
        }

        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.steps.push_front(Step::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(Step::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
                None => Ok(0),
            }
        }
    }

    pub enum OpenPlan {
        Ready(Vec<Step>),
        Refuse,
        /// Block until the gate fires, then succeed
        Gated(mpsc::Receiver<()>, Vec<Step>),
    }

    /// Hands out one plan per `open` call, in order
    #[derive(Default)]
    pub struct ScriptedOpener {
        plans: Mutex<VecDeque<OpenPlan>>,
        pub opened: Mutex<Vec<String>>,
    }

    impl ScriptedOpener {
        pub fn new(plans: Vec<OpenPlan>) -> Self {
            Self {
                plans: Mutex::new(plans.into()),
                opened: Mutex::new(Vec::new()),
            }
        }
    }

    impl PortOpener for ScriptedOpener {
        fn open(
            &self,
            port: &str,
            _settings: &SerialSettings,
        ) -> Result<Box<dyn SerialSource>, ConnectionError> {
            let plan = self.plans.lock().pop_front();
            let refused = || ConnectionError::Open {
                port: port.to_string(),
                reason: "refused".to_string(),
            };
            let steps = match plan {
                Some(OpenPlan::Ready(steps)) => steps,
                Some(OpenPlan::Gated(gate, steps)) => {
                    let _ = gate.recv();
                    steps
                }
                Some(OpenPlan::Refuse) | None => return Err(refused()),
            };
            self.opened.lock().push(port.to_string());
            Ok(Box::new(ScriptedSource::new(steps)))
        }
    }
}
