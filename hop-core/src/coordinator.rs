//! Relay/responder decision for a fully reassembled message.

/// What to do with a completed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A response reached us: hand it to the caller, broadcast nothing.
    Deliver,
    /// We can answer (e.g. online): produce a response under the same ID.
    Respond,
    /// We cannot answer: rebroadcast the request frames verbatim.
    Relay,
}

pub fn dispose(is_response: bool, can_respond: bool) -> Disposition {
    match (is_response, can_respond) {
        (true, _) => Disposition::Deliver,
        (false, true) => Disposition::Respond,
        (false, false) => Disposition::Relay,
    }
}
