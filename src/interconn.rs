use crate::cache::event::SelfEvent;
use crate::mem_event::MemEvent;
use crate::sim::PortId;

/// The logical channel an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum SourceKind {
    UPSTREAM,
    DOWNSTREAM,
    SNOOP,
    DIRECTORY,
    SELF,
}

/// What travels over a link.
///
/// External channels carry [`MemEvent`]s; the self channel carries scheduled
/// actions. The channel adapter narrows once, at delivery, so handlers never
/// see an untyped payload.
#[derive(Debug, Clone)]
pub enum Payload {
    Mem(MemEvent),
    Action(SelfEvent),
}

/// Port bookkeeping for one cache component.
///
/// Maps the component-local ports handed out by the simulation kernel onto
/// the five logical channels, and back. Any of the external channels may be
/// absent; the self channel always exists.
#[derive(Debug, Clone, Default)]
pub struct Channels {
    pub upstream: Vec<PortId>,
    pub downstream: Option<PortId>,
    pub snoop: Option<PortId>,
    pub directory: Option<PortId>,
    pub self_port: PortId,
}

impl Channels {
    /// Classify an incoming port: which channel is it, and (for upstream
    /// links) which one.
    pub fn classify(&self, port: PortId) -> Option<(SourceKind, Option<usize>)> {
        if port == self.self_port {
            return Some((SourceKind::SELF, None));
        }
        if let Some(idx) = self.upstream.iter().position(|&p| p == port) {
            return Some((SourceKind::UPSTREAM, Some(idx)));
        }
        if self.downstream == Some(port) {
            return Some((SourceKind::DOWNSTREAM, None));
        }
        if self.snoop == Some(port) {
            return Some((SourceKind::SNOOP, None));
        }
        if self.directory == Some(port) {
            return Some((SourceKind::DIRECTORY, None));
        }
        None
    }

    /// Resolve an outbound channel to a port. For `UPSTREAM` the link index
    /// (stamped on the event at receipt) selects among the upstream ports.
    pub fn port(&self, src: SourceKind, upstream_link: Option<usize>) -> Option<PortId> {
        match src {
            SourceKind::UPSTREAM => upstream_link.and_then(|i| self.upstream.get(i).copied()),
            SourceKind::DOWNSTREAM => self.downstream,
            SourceKind::SNOOP => self.snoop,
            SourceKind::DIRECTORY => self.directory,
            SourceKind::SELF => Some(self.self_port),
        }
    }
}
