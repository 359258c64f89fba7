//! Wire constants and the 8-byte message header.
//!
//! ```text
//! +0  magic   : 0xCA
//! +1  version : protocol revision (>= 1)
//! +2  flags   : bit0=control, bit4=first segment, bit5=not-first segment,
//!               bit6=server message, bit7=big endian
//! +3  command
//! +4  payload : u32, byte order per bit7
//! ```

use crate::net::buffer::{ByteBuffer, ByteOrder};

pub const MAGIC: u8 = 0xCA;
pub const HEADER_SIZE: usize = 8;
/// Protocol revision spoken by this implementation. Revision >= 2 enables
/// the receive timeout watchdog and payload-carrying echo.
pub const PROTOCOL_REVISION: u8 = 2;

pub const DEFAULT_PRIORITY: u16 = 0;
pub const MAX_CHANNEL_NAME_LENGTH: usize = 500;
pub const MAX_UDP_SEND: usize = 1440;
pub const MAX_TCP_RECV: usize = 1024 * 16;

pub const FLAG_CONTROL: u8 = 0x01;
pub const FLAG_FIRST_SEGMENT: u8 = 0x10;
pub const FLAG_NOT_FIRST_SEGMENT: u8 = 0x20;
pub const FLAG_SEGMENT_MASK: u8 = FLAG_FIRST_SEGMENT | FLAG_NOT_FIRST_SEGMENT;
pub const FLAG_SERVER: u8 = 0x40;
pub const FLAG_BIG_ENDIAN: u8 = 0x80;

/// Application command bytes.
pub mod cmd {
    pub const BEACON: u8 = 0;
    pub const CONNECTION_VALIDATION: u8 = 1;
    pub const ECHO: u8 = 2;
    pub const SEARCH: u8 = 3;
    pub const SEARCH_RESPONSE: u8 = 4;
    pub const AUTHNZ: u8 = 5;
    pub const ACL_CHANGE: u8 = 6;
    pub const CREATE_CHANNEL: u8 = 7;
    pub const DESTROY_CHANNEL: u8 = 8;
    pub const CONNECTION_VALIDATED: u8 = 9;
    pub const GET: u8 = 10;
    pub const PUT: u8 = 11;
    pub const PUT_GET: u8 = 12;
    pub const MONITOR: u8 = 13;
    pub const ARRAY: u8 = 14;
    pub const DESTROY_REQUEST: u8 = 15;
    pub const PROCESS: u8 = 16;
    pub const GET_FIELD: u8 = 17;
    pub const MESSAGE: u8 = 18;
    pub const RPC: u8 = 20;
    pub const CANCEL_REQUEST: u8 = 21;
}

/// Control command bytes (flags bit0 set).
pub mod ctrl {
    pub const MARKER: u8 = 0;
    pub const ACK_MARKER: u8 = 1;
    pub const SET_ENDIANESS: u8 = 2;
}

/// Operation subcommand bits carried after sid/ioid in operation messages.
pub mod subcmd {
    pub const DEFAULT: u8 = 0x00;
    pub const INIT: u8 = 0x08;
    pub const DESTROY: u8 = 0x10;
    pub const GET: u8 = 0x40;
    pub const ACK: u8 = 0x80;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    pub payload_size: u32,
}

impl Header {
    #[inline]
    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.flags & FLAG_SERVER != 0
    }

    #[inline]
    pub fn big_endian(&self) -> bool {
        self.flags & FLAG_BIG_ENDIAN != 0
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        if self.big_endian() {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    #[inline]
    pub fn first_segment(&self) -> bool {
        self.flags & FLAG_SEGMENT_MASK == FLAG_FIRST_SEGMENT
    }

    #[inline]
    pub fn not_first_segment(&self) -> bool {
        self.flags & FLAG_NOT_FIRST_SEGMENT != 0
    }

    /// Writes the header at the buffer's position in wire layout. The
    /// payload size is encoded in the order declared by `flags`.
    pub fn write(&self, buf: &mut ByteBuffer) {
        buf.put_u8(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u8(self.command);
        let order = buf.order();
        buf.set_order(self.byte_order());
        buf.put_u32(self.payload_size);
        buf.set_order(order);
    }
}

/// Human-readable command name for logging.
pub fn command_name(command: u8) -> &'static str {
    match command {
        cmd::BEACON => "BEACON",
        cmd::CONNECTION_VALIDATION => "CONNECTION_VALIDATION",
        cmd::ECHO => "ECHO",
        cmd::SEARCH => "SEARCH",
        cmd::SEARCH_RESPONSE => "SEARCH_RESPONSE",
        cmd::AUTHNZ => "AUTHNZ",
        cmd::ACL_CHANGE => "ACL_CHANGE",
        cmd::CREATE_CHANNEL => "CREATE_CHANNEL",
        cmd::DESTROY_CHANNEL => "DESTROY_CHANNEL",
        cmd::CONNECTION_VALIDATED => "CONNECTION_VALIDATED",
        cmd::GET => "GET",
        cmd::PUT => "PUT",
        cmd::PUT_GET => "PUT_GET",
        cmd::MONITOR => "MONITOR",
        cmd::ARRAY => "ARRAY",
        cmd::DESTROY_REQUEST => "DESTROY_REQUEST",
        cmd::PROCESS => "PROCESS",
        cmd::GET_FIELD => "GET_FIELD",
        cmd::MESSAGE => "MESSAGE",
        cmd::RPC => "RPC",
        cmd::CANCEL_REQUEST => "CANCEL_REQUEST",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_accessors() {
        let hdr = Header {
            version: PROTOCOL_REVISION,
            flags: FLAG_SERVER | FLAG_BIG_ENDIAN | FLAG_FIRST_SEGMENT,
            command: cmd::PUT,
            payload_size: 100,
        };
        assert!(!hdr.is_control());
        assert!(hdr.is_server());
        assert!(hdr.big_endian());
        assert!(hdr.first_segment());
        assert!(!hdr.not_first_segment());

        let middle = Header { flags: FLAG_SEGMENT_MASK, ..hdr };
        assert!(!middle.first_segment());
        assert!(middle.not_first_segment());
    }

    #[test]
    fn test_write_layout() {
        use crate::net::buffer::{ByteBuffer, ByteOrder};

        let mut buf = ByteBuffer::new(16, ByteOrder::Little);
        let hdr = Header {
            version: 2,
            flags: FLAG_BIG_ENDIAN,
            command: cmd::ECHO,
            payload_size: 0x0102_0304,
        };
        hdr.write(&mut buf);

        buf.flip();
        assert_eq!(buf.get_u8(), MAGIC);
        assert_eq!(buf.get_u8(), 2);
        assert_eq!(buf.get_u8(), FLAG_BIG_ENDIAN);
        assert_eq!(buf.get_u8(), cmd::ECHO);
        // big-endian payload size despite the little-endian buffer
        assert_eq!(buf.get_u8(), 0x01);
        assert_eq!(buf.get_u8(), 0x02);
        assert_eq!(buf.get_u8(), 0x03);
        assert_eq!(buf.get_u8(), 0x04);
    }

    #[test]
    fn test_command_names() {
        assert_eq!(command_name(cmd::RPC), "RPC");
        assert_eq!(command_name(19), "UNKNOWN");
        assert_eq!(command_name(200), "UNKNOWN");
    }
}
