//! The on-wire message: [`TenuredCommand`].

/// Command code reserved for the auth handshake. The range `0x0000..=0x00FF`
/// is reserved for protocol-internal codes.
pub const REQUEST_CODE_AUTH: u16 = 0x0001;

/// `flag` bit 0: this command is a response (ACK), not a request.
pub const FLAG_ACK: u8 = 0b001;
/// `flag` bit 1: this command expects no response (fire-and-forget).
pub const FLAG_ONEWAY: u8 = 0b010;
/// `flag` bit 2: this response carries an error.
pub const FLAG_ERROR: u8 = 0b100;

/// A Tenured wire message: either a REQUEST (`ack` false) or a RESPONSE
/// (`ack` true) correlated to its request by `id`.
///
/// See the frame layout in `SPEC_FULL.md` §4.1 for the byte-level encoding;
/// this type is the decoded, in-memory form the codec produces and consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenuredCommand {
    pub id: u32,
    pub code: u16,
    flag: u8,
    pub error_code: String,
    pub error_message: String,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl TenuredCommand {
    /// Build a fresh REQUEST command.
    pub fn request(id: u32, code: u16, header: Vec<u8>, body: Vec<u8>) -> Self {
        Self {
            id,
            code,
            flag: 0,
            error_code: String::new(),
            error_message: String::new(),
            header,
            body,
        }
    }

    /// Build a bare ACK (no body) for `request`, the transport fast-path
    /// sent before the handler runs (spec §4.2).
    pub fn ack(request_id: u32) -> Self {
        Self {
            id: request_id,
            code: 0,
            flag: FLAG_ACK,
            error_code: String::new(),
            error_message: String::new(),
            header: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a bare heartbeat frame sent on idle (spec §4.7). Reuses the
    /// ACK flag with id 0: idle frames are not correlated to any request.
    pub fn idle() -> Self {
        Self::ack(0)
    }

    /// Wrap `body` as a success RESPONSE to `request_id`, code preserved
    /// from the originating request so the caller can distinguish handlers.
    pub fn response(request_id: u32, code: u16, header: Vec<u8>, body: Vec<u8>) -> Self {
        Self {
            id: request_id,
            code,
            flag: FLAG_ACK,
            error_code: String::new(),
            error_message: String::new(),
            header,
            body,
        }
    }

    /// Wrap an ERROR RESPONSE to `request_id`.
    pub fn error_response(request_id: u32, code: u16, error_code: &str, error_message: &str) -> Self {
        Self {
            id: request_id,
            code,
            flag: FLAG_ACK | FLAG_ERROR,
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            header: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flag & FLAG_ACK != 0
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & FLAG_ONEWAY != 0
    }

    pub fn is_error(&self) -> bool {
        self.flag & FLAG_ERROR != 0
    }

    pub fn set_oneway(mut self, oneway: bool) -> Self {
        if oneway {
            self.flag |= FLAG_ONEWAY;
        } else {
            self.flag &= !FLAG_ONEWAY;
        }
        self
    }

    pub(crate) fn flag(&self) -> u8 {
        self.flag
    }

    pub(crate) fn from_raw_flag(
        id: u32,
        code: u16,
        flag: u8,
        error_code: String,
        error_message: String,
        header: Vec<u8>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            id,
            code,
            flag,
            error_code,
            error_message,
            header,
            body,
        }
    }
}
