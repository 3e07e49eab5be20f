//! Socket construction and the production link/sink implementations
//!
//! Each socket is exclusively owned by one thread: the control socket by the
//! sync loop, the data socket by the transmit loop. socket2 configures the
//! raw sockets before they are handed to std.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::EngineConfig;
use crate::constants::{CONTROL_RECV_TIMEOUT_MILLIS, MAX_CONTROL_DATAGRAM};
use crate::engine::FrameSink;
use crate::error::{Error, NetworkError};
use crate::sync::{ControlLink, RecvOutcome};

/// UDP data socket send buffer, sized for bursts of 340-byte frames
const DATA_SEND_BUFFER: usize = 256 * 1024;

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Network(NetworkError::ConnectionFailed(format!("{host}:{port}: {e}"))))?
        .next()
        .ok_or_else(|| {
            Error::Network(NetworkError::ConnectionFailed(format!(
                "{host}:{port}: no address"
            )))
        })
}

fn udp_socket_to(remote: SocketAddr) -> Result<UdpSocket, Error> {
    let domain = Domain::for_address(remote);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Network(NetworkError::BindFailed(e.to_string())))?;
    socket
        .set_send_buffer_size(DATA_SEND_BUFFER)
        .map_err(|e| Error::Network(NetworkError::BindFailed(e.to_string())))?;
    let bind_addr: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    socket
        .bind(&bind_addr.into())
        .map_err(|e| Error::Network(NetworkError::BindFailed(e.to_string())))?;
    let socket: UdpSocket = socket.into();
    socket
        .connect(remote)
        .map_err(|e| Error::Network(NetworkError::ConnectionFailed(e.to_string())))?;
    Ok(socket)
}

/// Control link over the DAC's UDP control port
pub struct UdpControlLink {
    socket: UdpSocket,
}

impl UdpControlLink {
    /// Connect to `dac_host:data_port+100` with the standard receive timeout
    pub fn connect(config: &EngineConfig) -> Result<Self, Error> {
        let remote = resolve(&config.dac_host, config.control_port())?;
        let socket = udp_socket_to(remote)?;
        socket
            .set_read_timeout(Some(Duration::from_millis(CONTROL_RECV_TIMEOUT_MILLIS)))
            .map_err(Error::Io)?;
        tracing::info!(%remote, "control link connected");
        Ok(Self { socket })
    }
}

impl ControlLink for UdpControlLink {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }

    fn recv(&mut self) -> io::Result<RecvOutcome> {
        let mut buf = [0u8; MAX_CONTROL_DATAGRAM];
        match self.socket.recv(&mut buf) {
            Ok(len) => Ok(RecvOutcome::Data(
                String::from_utf8_lossy(&buf[..len]).into_owned(),
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(RecvOutcome::Timeout)
            }
            Err(e) => Err(e),
        }
    }
}

/// Frame sink over the DAC's UDP data port
pub struct UdpFrameSink {
    socket: UdpSocket,
}

impl UdpFrameSink {
    pub fn connect(config: &EngineConfig) -> Result<Self, Error> {
        let remote = resolve(&config.dac_host, config.data_port)?;
        let socket = udp_socket_to(remote)?;
        tracing::info!(%remote, "data link connected");
        Ok(Self { socket })
    }
}

impl FrameSink for UdpFrameSink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }
}
