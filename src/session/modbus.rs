use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ErrorKind, ModbusProto};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Transport;
use crate::models::{MetricMap, MetricValue};
use crate::registers::Register;
use super::{decode::decode, Connector, DeviceSession, SessionError};

/// Most words the inverter answers in one holding register read
const MAX_SPAN_WORDS: u32 = 64;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A contiguous block of words covering one or more registers
#[derive(Debug, PartialEq)]
pub(crate) struct Span {
    pub start: u16,
    pub count: u16,
    pub registers: Vec<Register>,
}

/// Merges adjacent registers into as few reads as possible, never reading a gap
pub(crate) fn plan_spans(registers: &[Register]) -> Vec<Span> {
    let mut sorted: Vec<Register> = registers.to_vec();
    sorted.sort_by_key(|r| r.address);

    let mut spans: Vec<Span> = Vec::new();
    for reg in sorted {
        if let Some(span) = spans.last_mut() {
            let span_end = span.start as u32 + span.count as u32;
            if reg.address as u32 <= span_end && reg.end() - span.start as u32 <= MAX_SPAN_WORDS {
                span.count = (reg.end().max(span_end) - span.start as u32) as u16;
                span.registers.push(reg);
                continue;
            }
        }
        spans.push(Span { start: reg.address, count: reg.length, registers: vec![reg] });
    }
    spans
}

/// Exception replies are complete frames, anything else may leave unread bytes behind
fn loses_framing(e: &SessionError) -> bool {
    matches!(e, SessionError::Io(_) | SessionError::Timeout(_) | SessionError::Protocol(_))
}

fn response_error(start: u16, e: ErrorKind) -> SessionError {
    match e.to_modbus_error() {
        Ok(code) if e != ErrorKind::CommunicationError => SessionError::Exception(code as u8),
        _ => SessionError::Protocol(format!("Bad response for {start}: {e:?}")),
    }
}

pub struct ModbusSession {
    stream: Option<Box<dyn Stream>>,
    proto: ModbusProto,
    unit_id: u8,
    tr_id: u16,
    timeout: Duration,
}

impl ModbusSession {
    async fn read_words(&mut self, start: u16, count: u16) -> Result<Vec<u16>, SessionError> {
        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.exchange(start, count)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        };

        if let Err(e) = &result {
            if loses_framing(e) && self.stream.take().is_some() {
                warn!("Dropping device stream after failed read of {start}: {e}");
            }
        }
        result
    }

    async fn exchange(&mut self, start: u16, count: u16) -> Result<Vec<u16>, SessionError> {
        let proto = self.proto;
        self.tr_id = self.tr_id.wrapping_add(1);
        let tr_id = self.tr_id;
        let stream = self.stream.as_mut().ok_or(SessionError::Closed)?;

        let mut mreq = ModbusRequest::new(self.unit_id, proto);
        mreq.tr_id = tr_id;
        let mut request = Vec::new();
        mreq.generate_get_holdings(start, count, &mut request)
            .map_err(|e| SessionError::Protocol(format!("Failed to build request for {start}: {e:?}")))?;

        stream.write_all(&request).await?;

        /* Enough of the frame to learn its full length */
        let header_len = match proto {
            ModbusProto::Rtu => 3,
            _ => 6,
        };
        let mut response = vec![0u8; header_len];
        stream.read_exact(&mut response).await?;

        let len = guess_response_frame_len(&response, proto)
            .map_err(|e| SessionError::Protocol(format!("Failed to determine response length for {start}: {e:?}")))?
            as usize;
        if len > header_len {
            let mut rest = vec![0u8; len - header_len];
            stream.read_exact(&mut rest).await?;
            response.extend_from_slice(&rest);
        }

        let mut data = Vec::new();
        mreq.parse_u16(&response, &mut data).map_err(|e| response_error(start, e))?;

        if data.len() < count as usize {
            return Err(SessionError::Protocol(format!("Short response for {start}: {} of {count} words", data.len())));
        }
        Ok(data)
    }
}

#[async_trait]
impl DeviceSession for ModbusSession {
    async fn read_group(&mut self, registers: &[Register]) -> Result<MetricMap, SessionError> {
        let mut values = MetricMap::new();

        for span in plan_spans(registers) {
            debug!("Reading {} words from {}", span.count, span.start);
            let words = self.read_words(span.start, span.count).await?;

            for reg in span.registers.iter() {
                let offset = (reg.address - span.start) as usize;
                let value = decode(reg, &words[offset..offset + reg.length as usize])?;
                values.insert(reg.name.to_string(), MetricValue::new(value, reg.unit));
            }
        }

        Ok(values)
    }

    async fn read_one(&mut self, register: &Register) -> Result<serde_json::Value, SessionError> {
        let words = self.read_words(register.address, register.length).await?;
        decode(register, &words)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error while closing the device stream: {e}");
            }
        }
    }
}

/// Opens Modbus RTU sessions on serial ports and Modbus TCP sessions on sockets
#[derive(Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(&self, transport: &Transport) -> Result<Box<dyn DeviceSession>, SessionError> {
        let timeout = transport.timeout();

        let (stream, proto): (Box<dyn Stream>, ModbusProto) = match transport {
            Transport::Serial { port, baudrate, .. } => {
                let builder = tokio_serial::new(port.as_str(), *baudrate).timeout(timeout);
                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    /* Bad settings will not fix themselves, a missing device might */
                    let kind = match e.kind {
                        tokio_serial::ErrorKind::InvalidInput => std::io::ErrorKind::InvalidInput,
                        _ => std::io::ErrorKind::NotFound,
                    };
                    SessionError::Io(std::io::Error::new(kind, e))
                })?;
                info!("RTU session opened: {port} @ {baudrate}bps");
                (Box::new(serial), ModbusProto::Rtu)
            }
            Transport::Network { host, port, .. } => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| SessionError::Timeout(timeout))??;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Unable to disable Nagle on the device socket: {e}");
                }
                info!("TCP session opened: {host}:{port}");
                (Box::new(stream), ModbusProto::TcpUdp)
            }
        };

        Ok(Box::new(ModbusSession {
            stream: Some(stream),
            proto,
            unit_id: transport.slave_id(),
            tr_id: 0,
            timeout,
        }))
    }
}
