use std::cell::Cell;
use std::io::{Read, Write};

use thiserror::Error;

const MBAP_HEADER_LEN: usize = 7;
const PROTOCOL_ID: u16 = 0;
const MAX_PDU_LEN: usize = 253;
const MAX_READ_REGISTERS: u16 = 125;
const MAX_WRITE_REGISTERS: u16 = 123;

#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid transaction ID: expected {expected}, received {received}")]
    InvalidTransactionId { expected: u16, received: u16 },
    #[error("Invalid protocol ID: expected 0, received {0}")]
    InvalidProtocolId(u16),
    #[error("Invalid response length: expected {expected}, received {received}")]
    InvalidResponseLength { expected: usize, received: usize },
    #[error("Invalid unit ID: expected {expected}, received {received}")]
    InvalidUnitId { expected: u8, received: u8 },
    #[error("Invalid function code: expected 0x{expected:02X}, received 0x{received:02X}")]
    InvalidFunctionCode { expected: u8, received: u8 },
    #[error(
        "Modbus exception (function 0x{function_code:02X}): {} (0x{exception_code:02X})",
        exception_name(.exception_code)
    )]
    ExceptionResponse {
        function_code: u8,
        exception_code: u8,
    },
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

fn exception_name(code: &u8) -> &'static str {
    match *code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed To Respond",
        _ => "Unknown Exception",
    }
}

impl ModbusError {
    /// True when the underlying connection is gone and the link must be reopened.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ModbusError::IoError(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

/// Wraps a PDU into a Modbus TCP application data unit (MBAP header + PDU).
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Parsed MBAP header of an incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: usize,
    pub unit_id: u8,
}

impl FrameHeader {
    pub fn parse(header: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([header[0], header[1]]),
            protocol_id: u16::from_be_bytes([header[2], header[3]]),
            length: u16::from_be_bytes([header[4], header[5]]) as usize,
            unit_id: header[6],
        }
    }

    /// Number of PDU bytes following the header.
    pub fn pdu_len(&self) -> usize {
        self.length.saturating_sub(1)
    }
}

/// Reads one complete frame (header + PDU) from the stream.
pub fn read_frame<T: Read>(stream: &mut T) -> Result<(FrameHeader, Vec<u8>), ModbusError> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut header)?;
    let header = FrameHeader::parse(&header);

    if header.length < 2 || header.pdu_len() > MAX_PDU_LEN {
        return Err(ModbusError::InvalidResponseLength {
            expected: MAX_PDU_LEN,
            received: header.pdu_len(),
        });
    }

    let mut pdu = vec![0u8; header.pdu_len()];
    stream.read_exact(&mut pdu)?;

    Ok((header, pdu))
}

/// Modbus TCP client for a single unit (device address) on a shared link.
#[derive(Debug, Clone)]
pub struct Modbus {
    id: u8,
    transaction_id: Cell<u16>,
}

impl Modbus {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            transaction_id: Cell::new(0),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn next_transaction_id(&self) -> u16 {
        let id = self.transaction_id.get().wrapping_add(1);
        self.transaction_id.set(id);
        id
    }

    fn send_receive<T: Read + Write>(
        &self,
        client: &mut T,
        pdu: &[u8],
    ) -> Result<Vec<u8>, ModbusError> {
        let transaction_id = self.next_transaction_id();
        let request = encode_frame(transaction_id, self.id, pdu);

        client.write_all(&request)?;
        client.flush()?;

        let (header, response) = read_frame(client)?;

        if header.transaction_id != transaction_id {
            return Err(ModbusError::InvalidTransactionId {
                expected: transaction_id,
                received: header.transaction_id,
            });
        }

        if header.protocol_id != PROTOCOL_ID {
            return Err(ModbusError::InvalidProtocolId(header.protocol_id));
        }

        if header.unit_id != self.id {
            return Err(ModbusError::InvalidUnitId {
                expected: self.id,
                received: header.unit_id,
            });
        }

        if response[0] & 0x80 == 0x80 {
            return Err(ModbusError::ExceptionResponse {
                function_code: response[0] & 0x7F,
                exception_code: response.get(1).copied().unwrap_or_default(),
            });
        }

        if response[0] != pdu[0] {
            return Err(ModbusError::InvalidFunctionCode {
                expected: pdu[0],
                received: response[0],
            });
        }

        Ok(response)
    }

    pub fn read_holding_registers<T: Read + Write>(
        &self,
        client: &mut T,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ModbusError::ProtocolError(
                "Invalid register count. Must be between 1 and 125".to_string(),
            ));
        }

        let mut request = Vec::with_capacity(5);
        request.push(FunctionCode::ReadHoldingRegisters as u8);
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&count.to_be_bytes());

        let response = self.send_receive(client, &request)?;

        let byte_count = (count * 2) as usize;
        if response.len() != 2 + byte_count {
            return Err(ModbusError::InvalidResponseLength {
                expected: 2 + byte_count,
                received: response.len(),
            });
        }

        if response[1] as usize != byte_count {
            return Err(ModbusError::ProtocolError(format!(
                "Unexpected byte count. Expected {}, received {}",
                byte_count, response[1]
            )));
        }

        let registers = response[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();

        Ok(registers)
    }

    pub fn read_holding_register<T: Read + Write>(
        &self,
        client: &mut T,
        address: u16,
    ) -> Result<u16, ModbusError> {
        let registers = self.read_holding_registers(client, address, 1)?;
        Ok(registers[0])
    }

    pub fn write_single_register<T: Read + Write>(
        &self,
        client: &mut T,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let mut request = Vec::with_capacity(5);
        request.push(FunctionCode::WriteSingleRegister as u8);
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&value.to_be_bytes());

        let response = self.send_receive(client, &request)?;

        if response != request {
            return Err(ModbusError::ProtocolError(format!(
                "Write echo mismatch for register {}",
                address
            )));
        }

        Ok(())
    }

    pub fn write_multiple_registers<T: Read + Write>(
        &self,
        client: &mut T,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::ProtocolError(
                "Invalid register count. Must be between 1 and 123".to_string(),
            ));
        }

        let count = values.len() as u16;
        let mut request = Vec::with_capacity(6 + values.len() * 2);
        request.push(FunctionCode::WriteMultipleRegisters as u8);
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&count.to_be_bytes());
        request.push((count * 2) as u8);
        for value in values {
            request.extend_from_slice(&value.to_be_bytes());
        }

        let response = self.send_receive(client, &request)?;

        if response.len() != 5 {
            return Err(ModbusError::InvalidResponseLength {
                expected: 5,
                received: response.len(),
            });
        }

        let resp_address = u16::from_be_bytes([response[1], response[2]]);
        if resp_address != address {
            return Err(ModbusError::ProtocolError(format!(
                "Unexpected address in response. Expected {}, received {}",
                address, resp_address
            )));
        }

        let resp_count = u16::from_be_bytes([response[3], response[4]]);
        if resp_count != count {
            return Err(ModbusError::ProtocolError(format!(
                "Unexpected register count in response. Expected {}, received {}",
                count, resp_count
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Replays a canned response and captures everything written.
    struct Scripted {
        written: Vec<u8>,
        response: Cursor<Vec<u8>>,
    }

    impl Scripted {
        fn new(response: Vec<u8>) -> Self {
            Self {
                written: Vec::new(),
                response: Cursor::new(response),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn read_request_uses_mbap_framing() {
        let response = encode_frame(1, 3, &[0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD]);
        let mut stream = Scripted::new(response);
        let modbus = Modbus::new(3);

        let registers = modbus.read_holding_registers(&mut stream, 18, 2).unwrap();

        assert_eq!(registers, vec![0x1234, 0xABCD]);
        assert_eq!(
            stream.written,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x03, 0x03, 0x00, 0x12, 0x00, 0x02]
        );
    }

    #[test]
    fn transaction_id_increments_per_request() {
        let mut response = encode_frame(1, 1, &[0x06, 0x00, 0x0E, 0x00, 0x01]);
        response.extend(encode_frame(2, 1, &[0x06, 0x00, 0x0E, 0x00, 0x00]));
        let mut stream = Scripted::new(response);
        let modbus = Modbus::new(1);

        modbus.write_single_register(&mut stream, 14, 1).unwrap();
        modbus.write_single_register(&mut stream, 14, 0).unwrap();

        assert_eq!(&stream.written[12..14], &[0x00, 0x02]);
    }

    #[test]
    fn exception_response_is_reported() {
        let response = encode_frame(1, 2, &[0x86, 0x02]);
        let mut stream = Scripted::new(response);
        let modbus = Modbus::new(2);

        let err = modbus.write_single_register(&mut stream, 999, 1).unwrap_err();

        assert!(matches!(
            err,
            ModbusError::ExceptionResponse {
                function_code: 0x06,
                exception_code: 0x02
            }
        ));
        assert!(err.to_string().contains("Illegal Data Address"));
    }

    #[test]
    fn mismatched_unit_is_rejected() {
        let response = encode_frame(1, 9, &[0x03, 0x02, 0x00, 0x01]);
        let mut stream = Scripted::new(response);
        let modbus = Modbus::new(2);

        let err = modbus.read_holding_register(&mut stream, 17).unwrap_err();

        assert!(matches!(
            err,
            ModbusError::InvalidUnitId {
                expected: 2,
                received: 9
            }
        ));
    }

    #[test]
    fn write_multiple_checks_echoed_count() {
        let response = encode_frame(1, 1, &[0x10, 0x00, 0x02, 0x00, 0x01]);
        let mut stream = Scripted::new(response);
        let modbus = Modbus::new(1);

        let err = modbus
            .write_multiple_registers(&mut stream, 2, &[0x0000, 0x3F80])
            .unwrap_err();

        assert!(matches!(err, ModbusError::ProtocolError(_)));
        assert_eq!(stream.written[7..13], [0x10, 0x00, 0x02, 0x00, 0x02, 0x04]);
    }

    #[test]
    fn truncated_response_is_an_io_error() {
        let mut stream = Scripted::new(vec![0x00, 0x01, 0x00]);
        let modbus = Modbus::new(1);

        let err = modbus.read_holding_register(&mut stream, 17).unwrap_err();

        assert!(err.is_disconnect());
        assert!(err.to_string().starts_with("IO error: "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn errors_render_readable_messages() {
        let exception = ModbusError::ExceptionResponse {
            function_code: 0x06,
            exception_code: 0x02,
        };
        assert_eq!(
            exception.to_string(),
            "Modbus exception (function 0x06): Illegal Data Address (0x02)"
        );

        let unknown = ModbusError::ExceptionResponse {
            function_code: 0x03,
            exception_code: 0x7F,
        };
        assert!(unknown.to_string().contains("Unknown Exception (0x7F)"));

        let function = ModbusError::InvalidFunctionCode {
            expected: 0x10,
            received: 0x90,
        };
        assert_eq!(
            function.to_string(),
            "Invalid function code: expected 0x10, received 0x90"
        );
        assert!(std::error::Error::source(&function).is_none());
    }
}
