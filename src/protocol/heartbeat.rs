//! `heart-beat` header handling
//!
//! Each side announces `cx,cy`: it can send a beat every `cx` ms and wants to
//! receive one every `cy` ms (`0` = never). The effective interval in each
//! direction is the larger of what one side offers and the other requests.

use super::codec::ProtocolError;
use std::time::Duration;

/// One side's heart-beat announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// How often this side can send
    pub outgoing: Duration,
    /// How often this side wants to receive
    pub incoming: Duration,
}

/// Effective intervals after negotiation, `None` when disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartBeat {
    pub send_every: Option<Duration>,
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let (cx, cy) = value
            .split_once(',')
            .ok_or_else(|| ProtocolError::InvalidHeader {
                name: "heart-beat".to_string(),
                value: value.to_string(),
            })?;
        let parse_ms = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ProtocolError::InvalidHeader {
                    name: "heart-beat".to_string(),
                    value: value.to_string(),
                })
        };
        Ok(Self {
            outgoing: parse_ms(cx)?,
            incoming: parse_ms(cy)?,
        })
    }

    pub fn to_header(&self) -> String {
        format!("{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }

    /// Negotiate from the client's point of view against the server's answer
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> NegotiatedHeartBeat {
        let effective = |offer: Duration, want: Duration| {
            if offer.is_zero() || want.is_zero() {
                None
            } else {
                Some(offer.max(want))
            }
        };
        NegotiatedHeartBeat {
            send_every: effective(client.outgoing, server.incoming),
            expect_every: effective(server.outgoing, client.incoming),
        }
    }
}
