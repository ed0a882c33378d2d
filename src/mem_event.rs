use crate::address;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::atomic;

/// The event was produced by writing a dirty block back toward memory.
pub const F_WRITEBACK: u32 = 1 << 0;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
pub enum Command {
    ReadReq,
    ReadResp,
    WriteReq,
    WriteResp,
    RequestData,
    SupplyData,
    Invalidate,
    RequestBus,
    CancelBusRequest,
    BusClearToSend,
}

static MEM_EVENT_UID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(1));

/// Generate a unique ID that can be used to correlate requests and responses.
pub fn generate_uid() -> u64 {
    MEM_EVENT_UID.fetch_add(1, atomic::Ordering::SeqCst)
}

/// A message exchanged between memory-hierarchy components.
///
/// Every event names the component that produced it and optionally the
/// component it is destined for (broadcasts leave `dst` empty). Responses
/// carry the id of the event they answer in `response_to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemEvent {
    pub id: u64,
    pub src: String,
    pub dst: Option<String>,
    pub cmd: Command,
    pub addr: address,
    pub size: u32,
    pub payload: Vec<u8>,
    pub flags: u32,
    pub response_to: Option<u64>,
    /// Upstream link index this event arrived on, stamped by the channel
    /// adapter of the receiving component.
    pub link: Option<usize>,
}

impl std::fmt::Display for MemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}(0x{:x} from {}", self.cmd, self.addr, self.src)?;
        if let Some(ref dst) = self.dst {
            write!(f, " to {dst}")?;
        }
        write!(f, ")")
    }
}

impl MemEvent {
    pub fn new(src: impl Into<String>, addr: address, cmd: Command) -> Self {
        Self {
            id: generate_uid(),
            src: src.into(),
            dst: None,
            cmd,
            addr,
            size: 0,
            payload: Vec::new(),
            flags: 0,
            response_to: None,
            link: None,
        }
    }

    /// Build the response to this event, issued by `responder`.
    ///
    /// Pairs the response with the originating event's id and flips the
    /// command to its reply form.
    pub fn make_response(&self, responder: &str) -> Self {
        let cmd = match self.cmd {
            Command::ReadReq => Command::ReadResp,
            Command::WriteReq => Command::WriteResp,
            Command::RequestData => Command::SupplyData,
            other => panic!("no response form for {other}"),
        };
        Self {
            id: generate_uid(),
            src: responder.to_string(),
            dst: Some(self.src.clone()),
            cmd,
            addr: self.addr,
            size: self.size,
            payload: Vec::new(),
            flags: self.flags,
            response_to: Some(self.id),
            link: None,
        }
    }

    pub fn set_payload(&mut self, data: Vec<u8>) {
        self.size = data.len() as u32;
        self.payload = data;
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn is_writeback(&self) -> bool {
        self.has_flag(F_WRITEBACK)
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, MemEvent, F_WRITEBACK};

    #[test]
    fn response_pairing() {
        let mut req = MemEvent::new("cpu0", 0x40, Command::ReadReq);
        req.size = 4;
        let resp = req.make_response("l1");
        assert_eq!(resp.cmd, Command::ReadResp);
        assert_eq!(resp.src, "l1");
        assert_eq!(resp.dst.as_deref(), Some("cpu0"));
        assert_eq!(resp.addr, req.addr);
        assert_eq!(resp.size, 4);
        assert_eq!(resp.response_to, Some(req.id));
        assert_ne!(resp.id, req.id);
    }

    #[test]
    fn write_response_form() {
        let req = MemEvent::new("cpu0", 0x80, Command::WriteReq);
        assert_eq!(req.make_response("l1").cmd, Command::WriteResp);
        let req = MemEvent::new("peer", 0x80, Command::RequestData);
        assert_eq!(req.make_response("l1").cmd, Command::SupplyData);
    }

    #[test]
    fn unique_ids() {
        let a = MemEvent::new("a", 0, Command::ReadReq);
        let b = MemEvent::new("a", 0, Command::ReadReq);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn payload_sets_size() {
        let mut ev = MemEvent::new("l1", 0, Command::SupplyData);
        ev.set_payload(vec![1, 2, 3, 4]);
        assert_eq!(ev.size, 4);
        assert!(!ev.is_writeback());
        ev.set_flag(F_WRITEBACK);
        assert!(ev.is_writeback());
    }
}
