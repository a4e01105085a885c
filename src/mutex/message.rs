//! Peer protocol messages and their wire codec.
//!
//! Payloads are ASCII text with `;` separators: `reqEntry;<id>;<ts>`,
//! `respOk;<id>`, `snap;<snapId>`. The inbound boundary lifts every payload
//! into [`PeerMessage`] once; the core never branches on the strings.

use std::fmt;

/// Token identifying an entry request.
pub const REQ_ENTRY: &str = "reqEntry";
/// Token identifying a permission grant.
pub const RESP_OK: &str = "respOk";
/// Token identifying a snapshot marker.
pub const SNAP: &str = "snap";

/// A message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Peer `id` requests entry to the critical section with its request
    /// timestamp. The sender includes itself so the receiver can address
    /// the reply.
    ReqEntry { id: usize, ts: u64 },
    /// Peer `id` grants permission to enter.
    RespOk { id: usize },
    /// Snapshot marker carrying the snapshot identifier.
    Snap { snap_id: u64 },
}

impl PeerMessage {
    /// Render the wire form.
    pub fn encode(&self) -> String {
        match self {
            PeerMessage::ReqEntry { id, ts } => format!("{};{};{}", REQ_ENTRY, id, ts),
            PeerMessage::RespOk { id } => format!("{};{}", RESP_OK, id),
            PeerMessage::Snap { snap_id } => format!("{};{}", SNAP, snap_id),
        }
    }

    /// Parse a wire payload.
    ///
    /// Routing is by token containment, markers first: the three tokens are
    /// distinct, so the match is unambiguous. Anything else is an unknown
    /// payload.
    pub fn parse(payload: &str) -> Result<PeerMessage, ParseError> {
        let fields: Vec<&str> = payload.split(';').collect();
        if payload.contains(SNAP) {
            let snap_id = parse_field(payload, &fields, 1)?;
            Ok(PeerMessage::Snap { snap_id })
        } else if payload.contains(RESP_OK) {
            let id = parse_field(payload, &fields, 1)?;
            Ok(PeerMessage::RespOk { id })
        } else if payload.contains(REQ_ENTRY) {
            let id = parse_field(payload, &fields, 1)?;
            let ts = parse_field(payload, &fields, 2)?;
            Ok(PeerMessage::ReqEntry { id, ts })
        } else {
            Err(ParseError::UnknownPayload {
                payload: payload.to_string(),
            })
        }
    }
}

fn parse_field<T: std::str::FromStr>(
    payload: &str,
    fields: &[&str],
    idx: usize,
) -> Result<T, ParseError> {
    fields
        .get(idx)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| ParseError::MalformedField {
            payload: payload.to_string(),
            field: idx,
        })
}

/// A payload that could not be lifted into a [`PeerMessage`].
#[derive(Debug)]
pub enum ParseError {
    /// No known token in the payload.
    UnknownPayload { payload: String },
    /// A known token but a missing or non-numeric field.
    MalformedField { payload: String, field: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnknownPayload { payload } => {
                write!(f, "unknown payload {:?}", payload)
            }
            ParseError::MalformedField { payload, field } => {
                write!(f, "malformed field {} in payload {:?}", field, payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_forms() {
        assert_eq!(
            PeerMessage::ReqEntry { id: 0, ts: 1 }.encode(),
            "reqEntry;0;1"
        );
        assert_eq!(PeerMessage::RespOk { id: 2 }.encode(), "respOk;2");
        assert_eq!(PeerMessage::Snap { snap_id: 7 }.encode(), "snap;7");
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            PeerMessage::parse("reqEntry;1;42").unwrap(),
            PeerMessage::ReqEntry { id: 1, ts: 42 }
        );
        assert_eq!(
            PeerMessage::parse("respOk;0").unwrap(),
            PeerMessage::RespOk { id: 0 }
        );
        assert_eq!(
            PeerMessage::parse("snap;3").unwrap(),
            PeerMessage::Snap { snap_id: 3 }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            PeerMessage::parse("hello;1"),
            Err(ParseError::UnknownPayload { .. })
        ));
        assert!(matches!(
            PeerMessage::parse("reqEntry;1"),
            Err(ParseError::MalformedField { field: 2, .. })
        ));
        assert!(matches!(
            PeerMessage::parse("respOk;notanumber"),
            Err(ParseError::MalformedField { field: 1, .. })
        ));
    }
}
